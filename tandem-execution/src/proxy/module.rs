use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tandem_runtime::{ExportShape, ModuleShape};

use super::function::ThreadedFunction;
use super::Scheduler;
use crate::error::{ExecutionError, ExecutionResult};

struct ModuleInner {
    src: String,
    shape: ModuleShape,
    scheduler: Scheduler,
    exports: Mutex<HashMap<String, ThreadedFunction>>,
}

/// A loaded module whose exports run on worker threads
#[derive(Clone)]
pub struct ModuleProxy {
    inner: Arc<ModuleInner>,
}

impl ModuleProxy {
    pub(crate) fn new(src: impl Into<String>, shape: ModuleShape, scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                src: src.into(),
                shape,
                scheduler,
                exports: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn src(&self) -> &str {
        &self.inner.src
    }

    pub fn shape(&self) -> &ModuleShape {
        &self.inner.shape
    }

    /// Names of every export, accessible or not
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.shape.exports.keys().map(String::as_str)
    }

    /// Handle for a function or class export.
    ///
    /// The same handle is returned for repeated lookups of one name.
    pub fn export(&self, name: &str) -> ExecutionResult<ThreadedFunction> {
        if let Some(cached) = self.inner.exports.lock().get(name) {
            return Ok(cached.clone());
        }

        let (statics, is_class) = match self.inner.shape.exports.get(name) {
            None => return Err(ExecutionError::ExportNotFound(name.to_string())),
            Some(ExportShape::Value { .. }) => {
                return Err(ExecutionError::NotAccessibleExport(name.to_string()))
            }
            Some(ExportShape::Function { statics }) => (statics.clone(), false),
            Some(ExportShape::Class { statics }) => (statics.clone(), true),
        };

        let function = ThreadedFunction::new(
            self.inner.src.clone(),
            name.to_string(),
            statics,
            is_class,
            self.inner.scheduler.clone(),
        );
        Ok(self
            .inner
            .exports
            .lock()
            .entry(name.to_string())
            .or_insert(function)
            .clone())
    }
}

impl fmt::Debug for ModuleProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleProxy")
            .field("src", &self.inner.src)
            .field("exports", &self.inner.shape.exports.len())
            .finish()
    }
}
