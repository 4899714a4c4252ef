//! Runtime facade
//!
//! A [`Master`] owns the configuration and lifecycle of one worker pool and
//! hands out [`ModuleProxy`] handles. It starts lazily on the first load.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use tandem_config::{
    ConcurrencyConfig, ExecutionSettings, PartialConcurrencyConfig, TandemConfig, Validatable,
};
use tandem_ipc::WorkerFactory;
use tandem_runtime::{InlineWorkerFactory, ModuleLoader, ThreadWorkerFactory};

use crate::error::{ExecutionError, ExecutionResult};
use crate::pool::ThreadPool;
use crate::proxy::{Dispatcher, ModuleProxy, Scheduler};
use crate::registry::ObjectRegistry;
use crate::thread::Thread;

/// Entry point that loads modules onto a lazily started worker pool
pub struct Master {
    loader: Arc<dyn ModuleLoader>,
    factory: Arc<dyn WorkerFactory>,
    inline_factory: Arc<dyn WorkerFactory>,
    config: Mutex<ConcurrencyConfig>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl Master {
    /// Master running each worker on its own OS thread
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        let factory = Arc::new(ThreadWorkerFactory::new(loader.clone()));
        Self::with_factory(loader, factory)
    }

    /// Master using a custom worker primitive
    pub fn with_factory(loader: Arc<dyn ModuleLoader>, factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            inline_factory: Arc::new(InlineWorkerFactory::new(loader.clone())),
            loader,
            factory,
            config: Mutex::new(ConcurrencyConfig::default()),
            dispatcher: Mutex::new(None),
        }
    }

    /// Master configured from a loaded [`TandemConfig`]
    pub fn from_config(
        loader: Arc<dyn ModuleLoader>,
        config: &TandemConfig,
    ) -> ExecutionResult<Self> {
        config.concurrency.validate()?;
        let master = Self::new(loader);
        *master.config.lock() = config.concurrency.clone();
        Ok(master)
    }

    /// Merge new settings. A running pool picks up the new limits at once;
    /// switching `disabled` takes effect on the next start.
    pub fn config(&self, partial: &PartialConcurrencyConfig) -> ExecutionResult<()> {
        let merged = self.config.lock().merged(partial);
        merged.validate()?;
        *self.config.lock() = merged;

        let dispatcher = self.dispatcher.lock().clone();
        if let Some(Dispatcher::Pool(pool)) = dispatcher {
            pool.config(partial)?;
        }
        Ok(())
    }

    pub fn settings(&self) -> ConcurrencyConfig {
        self.config.lock().clone()
    }

    pub fn is_started(&self) -> bool {
        self.dispatcher.lock().is_some()
    }

    /// The running pool, if pooling is enabled and started
    pub fn pool(&self) -> Option<ThreadPool> {
        match self.dispatcher.lock().as_ref() {
            Some(Dispatcher::Pool(pool)) => Some(pool.clone()),
            _ => None,
        }
    }

    /// Start the pool, or the inline worker when pooling is disabled
    pub fn start(&self) -> ExecutionResult<()> {
        self.dispatcher().map(|_| ())
    }

    fn dispatcher(&self) -> ExecutionResult<Dispatcher> {
        let mut dispatcher = self.dispatcher.lock();
        if let Some(running) = dispatcher.as_ref() {
            return Ok(running.clone());
        }

        let config = self.config.lock().clone();
        let started = if config.disabled {
            info!("Pooling disabled, running calls on an inline worker");
            Dispatcher::Inline {
                thread: Thread::new(self.inline_factory.clone())?,
                registry: ObjectRegistry::new(),
            }
        } else {
            Dispatcher::Pool(ThreadPool::new(self.factory.clone(), config)?)
        };
        *dispatcher = Some(started.clone());
        Ok(started)
    }

    /// Load a module and return a proxy for its exports.
    ///
    /// The module is loaded once locally to learn its shape; nothing runs
    /// remotely until an export is used.
    pub async fn load(
        &self,
        src: &str,
        settings: ExecutionSettings,
    ) -> ExecutionResult<ModuleProxy> {
        settings.validate()?;
        let shape = self.loader.load(src).map_err(ExecutionError::Load)?.shape();
        let dispatcher = self.dispatcher()?;
        Ok(ModuleProxy::new(src, shape, Scheduler::new(dispatcher, settings)))
    }

    /// Remove idle threads down to `min_threads`
    pub fn descale(&self, force: bool) -> usize {
        self.pool().map_or(0, |pool| pool.descale(force))
    }

    /// Stop every worker. Without `force` outstanding calls finish first.
    ///
    /// Proxies handed out earlier fail with `ThreadPoolTerminated`; a later
    /// load starts a fresh pool.
    pub async fn terminate(&self, force: bool) {
        let dispatcher = self.dispatcher.lock().take();
        match dispatcher {
            Some(Dispatcher::Pool(pool)) => pool.terminate(force).await,
            Some(Dispatcher::Inline { thread, registry }) => {
                if !force {
                    thread.drained().await;
                }
                thread.terminate();
                registry.clear();
            }
            None => {}
        }
    }
}
