//! Local handles for remote exports and objects
//!
//! Member access is dispatched through the member-kind maps reported by the
//! worker: data members become property tasks, methods become invocation
//! tasks, and anything else is rejected before a task is built.

mod function;
mod module;
mod object;
mod pending;

pub use function::ThreadedFunction;
pub use module::ModuleProxy;
pub use object::ThreadedObject;
pub use pending::{PendingWrite, PropertyValue};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use tandem_config::ExecutionSettings;
use tandem_ipc::{MemberKind, Task};

use crate::error::{ExecutionError, ExecutionResult};
use crate::pool::ThreadPool;
use crate::registry::{ObjectRegistry, RegistrationToken};
use crate::thread::{settle, Thread};

/// Where proxies get their threads from
#[derive(Clone, Debug)]
pub(crate) enum Dispatcher {
    Pool(ThreadPool),
    /// A single in-process worker, used when pooling is disabled
    Inline {
        thread: Thread,
        registry: ObjectRegistry,
    },
}

impl Dispatcher {
    pub(crate) async fn acquire(
        &self,
        exclusive: bool,
        timeout: Option<Duration>,
    ) -> ExecutionResult<Thread> {
        match self {
            Dispatcher::Pool(pool) => pool.get_thread_within(exclusive, timeout).await,
            // Exclusivity is meaningless with one worker
            Dispatcher::Inline { thread, .. } if !thread.is_terminated() => Ok(thread.clone()),
            Dispatcher::Inline { .. } => Err(ExecutionError::ThreadPoolTerminated),
        }
    }

    /// Reserve a thread for the life of the returned lease
    pub(crate) async fn lease(
        &self,
        exclusive: bool,
        timeout: Option<Duration>,
    ) -> ExecutionResult<ThreadLease> {
        let thread = self.acquire(exclusive, timeout).await?;
        Ok(ThreadLease {
            dispatcher: self.clone(),
            thread,
            armed: exclusive,
        })
    }

    /// A shared thread that is free right now, if any
    fn try_acquire_shared(&self) -> ExecutionResult<Option<Thread>> {
        match self {
            Dispatcher::Pool(pool) => pool.try_get_thread(false),
            Dispatcher::Inline { thread, .. } if !thread.is_terminated() => {
                Ok(Some(thread.clone()))
            }
            Dispatcher::Inline { .. } => Err(ExecutionError::ThreadPoolTerminated),
        }
    }

    pub(crate) fn release(&self, thread: &Thread) {
        if let Dispatcher::Pool(pool) = self {
            pool.release_thread(thread);
        }
    }

    fn registry(&self) -> &ObjectRegistry {
        match self {
            Dispatcher::Pool(pool) => pool.registry(),
            Dispatcher::Inline { registry, .. } => registry,
        }
    }

    pub(crate) fn register(
        &self,
        object_id: u64,
        thread: &Thread,
        exclusive: bool,
    ) -> RegistrationToken {
        self.registry().register(object_id, thread, exclusive)
    }

    pub(crate) async fn dispose(&self, token: RegistrationToken) -> ExecutionResult<()> {
        match self {
            Dispatcher::Pool(pool) => pool.dispose_object(token).await,
            Dispatcher::Inline { thread, registry } => match registry.unregister(token) {
                Some(registration) => {
                    let receiver = thread.submit(&Task::dispose_object(registration.object_id))?;
                    settle(receiver).await.map(|_| ())
                }
                None => Ok(()),
            },
        }
    }

    pub(crate) fn release_object(&self, token: RegistrationToken) {
        match self {
            Dispatcher::Pool(pool) => pool.release_object(token),
            Dispatcher::Inline { thread, registry } => {
                let Some(registration) = registry.unregister(token) else {
                    return;
                };
                if let Err(e) = thread.submit(&Task::dispose_object(registration.object_id)) {
                    debug!("Could not dispose object {}: {}", registration.object_id, e);
                }
            }
        }
    }
}

/// Reply to a task that may already be posted
pub(crate) type Reply = BoxFuture<'static, ExecutionResult<JsonValue>>;

/// A thread taken from a [`Dispatcher`].
///
/// An exclusive lease unlocks its thread when dropped, including when the
/// call holding it is abandoned.
pub(crate) struct ThreadLease {
    dispatcher: Dispatcher,
    thread: Thread,
    armed: bool,
}

impl ThreadLease {
    pub(crate) fn thread(&self) -> &Thread {
        &self.thread
    }

    /// Keep the thread reserved after the lease is gone
    pub(crate) fn keep(mut self) -> Thread {
        self.armed = false;
        self.thread.clone()
    }
}

impl Drop for ThreadLease {
    fn drop(&mut self) {
        if self.armed {
            self.dispatcher.release(&self.thread);
        }
    }
}

/// Thread placement for one loaded module.
///
/// Parallel modules reserve a thread per call. Otherwise every static call
/// goes to one shared thread so module state stays in one worker.
#[derive(Clone)]
pub(crate) struct Scheduler {
    dispatcher: Dispatcher,
    settings: ExecutionSettings,
    pinned: Arc<Mutex<Option<Thread>>>,
}

impl Scheduler {
    pub(crate) fn new(dispatcher: Dispatcher, settings: ExecutionSettings) -> Self {
        Self {
            dispatcher,
            settings,
            pinned: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn settings(&self) -> ExecutionSettings {
        self.settings
    }

    /// The module's shared thread, pinned on first use, if it is at hand
    /// without waiting
    fn ready_thread(&self) -> ExecutionResult<Option<Thread>> {
        let mut pinned = self.pinned.lock();
        if let Some(thread) = pinned.as_ref().filter(|thread| !thread.is_terminated()) {
            return Ok(Some(thread.clone()));
        }
        let thread = self.dispatcher.try_acquire_shared()?;
        if thread.is_some() {
            pinned.clone_from(&thread);
        }
        Ok(thread)
    }

    async fn shared_thread(&self) -> ExecutionResult<Thread> {
        if let Some(thread) = self.ready_thread()? {
            return Ok(thread);
        }
        let thread = self.dispatcher.acquire(false, self.settings.timeout).await?;
        *self.pinned.lock() = Some(thread.clone());
        Ok(thread)
    }

    /// Run one static task on a thread chosen by the placement rules
    pub(crate) async fn run(&self, task: Task) -> ExecutionResult<JsonValue> {
        if self.settings.parallel {
            let lease = self.dispatcher.lease(true, self.settings.timeout).await?;
            return lease.thread().run(task).await;
        }
        self.shared_thread().await?.run(task).await
    }

    /// Post `task` before returning when the shared thread is at hand, so
    /// it lands ahead of any later call on this module. Otherwise the
    /// returned future waits for a thread like [`Scheduler::run`].
    pub(crate) fn post(&self, task: Task) -> ExecutionResult<Reply> {
        if !self.settings.parallel {
            if let Some(thread) = self.ready_thread()? {
                return Ok(settle(thread.submit(&task)?).boxed());
            }
        }
        let scheduler = self.clone();
        Ok(async move { scheduler.run(task).await }.boxed())
    }
}

/// Reject access to a member by kind before anything is sent
pub(crate) fn check_member(
    members: &BTreeMap<String, MemberKind>,
    name: &str,
    expected: MemberKind,
) -> ExecutionResult<()> {
    match members.get(name) {
        None => Err(ExecutionError::MemberNotFound(name.to_string())),
        Some(kind) if *kind == expected => Ok(()),
        Some(_) => Err(ExecutionError::InvalidMemberAccess(name.to_string())),
    }
}

/// Writes only go to data members
pub(crate) fn check_writable(
    members: &BTreeMap<String, MemberKind>,
    name: &str,
) -> ExecutionResult<()> {
    match members.get(name) {
        None => Err(ExecutionError::MemberNotFound(name.to_string())),
        Some(MemberKind::Method) => Err(ExecutionError::MethodAssignment(name.to_string())),
        Some(MemberKind::Data) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFactory;
    use futures::FutureExt;
    use serde_json::json;
    use tandem_config::ConcurrencyConfig;
    use tandem_ipc::TaskKind;

    fn single_thread_pool(factory: Arc<MockFactory>) -> ThreadPool {
        let config = ConcurrencyConfig {
            max_threads: 1,
            ..ConcurrencyConfig::default()
        };
        ThreadPool::new(factory, config).unwrap()
    }

    fn parallel_scheduler(pool: &ThreadPool) -> Scheduler {
        Scheduler::new(Dispatcher::Pool(pool.clone()), ExecutionSettings::parallel())
    }

    #[tokio::test]
    async fn test_post_sends_before_returning() {
        let factory = MockFactory::silent();
        let pool = single_thread_pool(factory.clone());
        let scheduler = Scheduler::new(Dispatcher::Pool(pool), ExecutionSettings::default());

        let task = Task::set_static_property("lib", "Counter", "created", json!(1));
        let reply = scheduler.post(task).unwrap();
        assert_eq!(factory.worker(0).count_kind(TaskKind::SetStaticProperty), 1);

        // Later calls go to the same pinned thread
        let mut call = Box::pin(scheduler.run(Task::invoke_function("lib", "double", vec![])));
        assert!((&mut call).now_or_never().is_none());
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.worker(0).count_kind(TaskKind::InvokeFunction), 1);
        drop(reply);
    }

    #[tokio::test]
    async fn test_abandoned_parallel_call_unlocks_thread() {
        let factory = MockFactory::silent();
        let pool = single_thread_pool(factory.clone());
        let scheduler = parallel_scheduler(&pool);

        let mut call = Box::pin(scheduler.run(Task::invoke_function("lib", "double", vec![])));
        assert!((&mut call).now_or_never().is_none());
        assert!(pool.stats()[0].locked);

        drop(call);
        assert!(!pool.stats()[0].locked);
        assert!(pool.try_get_thread(true).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_abandoned_construct_unlocks_thread() {
        let pool = single_thread_pool(MockFactory::silent());
        let scheduler = parallel_scheduler(&pool);
        let class = ThreadedFunction::new(
            "lib".to_string(),
            "Counter".to_string(),
            BTreeMap::new(),
            true,
            scheduler,
        );

        let mut construct = Box::pin(class.construct(vec![]));
        assert!((&mut construct).now_or_never().is_none());
        assert!(pool.stats()[0].locked);

        drop(construct);
        assert!(!pool.stats()[0].locked);
    }

    #[tokio::test]
    async fn test_failed_construct_unlocks_thread() {
        // Echoed operands are not a valid instantiation reply
        let pool = single_thread_pool(MockFactory::echo());
        let scheduler = parallel_scheduler(&pool);
        let class = ThreadedFunction::new(
            "lib".to_string(),
            "Counter".to_string(),
            BTreeMap::new(),
            true,
            scheduler,
        );

        let err = class.construct(vec![]).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Call(_)));
        assert!(!pool.stats()[0].locked);
        assert!(pool.registry().is_empty());
    }
}
