//! Module loading boundary

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use tandem_ipc::{ErrorInfo, ErrorKind};

use crate::module::Module;

/// Resolves a module reference to its exports
pub trait ModuleLoader: Send + Sync {
    fn load(&self, src: &str) -> Result<Module, ErrorInfo>;
}

/// Builds a fresh copy of a module
pub type ModuleFactory = Arc<dyn Fn() -> Module + Send + Sync>;

/// In-process table of module factories.
///
/// Every load builds a new [`Module`], so each worker owns its own module
/// state. Clones share the same table.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: Arc<RwLock<HashMap<String, ModuleFactory>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `src`
    pub fn register<F>(&self, src: impl Into<String>, factory: F)
    where
        F: Fn() -> Module + Send + Sync + 'static,
    {
        self.factories.write().insert(src.into(), Arc::new(factory));
    }

    /// Builder form of [`ModuleRegistry::register`]
    pub fn with_module<F>(self, src: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Module + Send + Sync + 'static,
    {
        self.register(src, factory);
        self
    }

    pub fn contains(&self, src: &str) -> bool {
        self.factories.read().contains_key(src)
    }
}

impl ModuleLoader for ModuleRegistry {
    fn load(&self, src: &str) -> Result<Module, ErrorInfo> {
        let factory = self.factories.read().get(src).cloned().ok_or_else(|| {
            ErrorInfo::new(
                ErrorKind::ModuleNotFound,
                format!("Cannot find module '{}'", src),
            )
        })?;
        Ok(factory())
    }
}
