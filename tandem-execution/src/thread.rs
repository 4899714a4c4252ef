//! Caller-side owner of one worker

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tandem_ipc::{
    CallResult, ErrorInfo, IpcError, MessageSink, Task, ThreadMessage, Worker, WorkerFactory,
};

use crate::coroutine::Coroutine;
use crate::error::{ExecutionError, ExecutionResult};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

struct ThreadInner {
    id: u64,
    factory: Arc<dyn WorkerFactory>,
    worker: Mutex<Option<Arc<dyn Worker>>>,
    coroutines: Mutex<HashMap<u64, Coroutine>>,
    drained: Notify,
    locked: AtomicBool,
    terminated: AtomicBool,
    last_active: Mutex<Instant>,
}

impl ThreadInner {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn post(&self, message: ThreadMessage) -> Result<(), IpcError> {
        let worker = self.worker.lock().clone();
        match worker {
            Some(worker) => worker.post_message(message),
            None => Err(IpcError::ConnectionClosed),
        }
    }

    fn take_coroutine(&self, coroutine_id: u64) -> Option<Coroutine> {
        let mut coroutines = self.coroutines.lock();
        let coroutine = coroutines.remove(&coroutine_id);
        if coroutines.is_empty() {
            self.drained.notify_waiters();
        }
        coroutine
    }

    fn drain(&self) -> Vec<Coroutine> {
        let pending: Vec<Coroutine> = self
            .coroutines
            .lock()
            .drain()
            .map(|(_, coroutine)| coroutine)
            .collect();
        self.drained.notify_waiters();
        pending
    }

    fn handle_message(&self, message: ThreadMessage) {
        match message {
            ThreadMessage::TaskCompleted {
                coroutine_id,
                result,
            } => match self.take_coroutine(coroutine_id) {
                Some(coroutine) => {
                    self.touch();
                    coroutine.done(result);
                }
                None => warn!(
                    "Thread {}: {}",
                    self.id,
                    ErrorInfo::coroutine_not_found(coroutine_id)
                ),
            },
            ThreadMessage::DirectMessage {
                coroutine_id,
                message_id,
                name,
                data,
            } => {
                let lookup = self
                    .coroutines
                    .lock()
                    .get(&coroutine_id)
                    .map(|coroutine| coroutine.channel().cloned());
                let error = match lookup {
                    Some(Some(channel)) => {
                        tokio::spawn(async move {
                            channel.handle_message(message_id, name, data).await;
                        });
                        return;
                    }
                    Some(None) => ErrorInfo::channel_not_found(coroutine_id),
                    None => ErrorInfo::coroutine_not_found(coroutine_id),
                };
                warn!("Thread {}: rejecting channel message: {}", self.id, error);
                let reply = ThreadMessage::DirectMessageReplied {
                    coroutine_id,
                    message_id,
                    result: Err(error),
                };
                if let Err(e) = self.post(reply) {
                    debug!("Thread {}: could not reject channel message: {}", self.id, e);
                }
            }
            ThreadMessage::DirectMessageReplied {
                coroutine_id,
                message_id,
                result,
            } => {
                let channel = self
                    .coroutines
                    .lock()
                    .get(&coroutine_id)
                    .and_then(|coroutine| coroutine.channel().cloned());
                let outcome = match channel {
                    Some(channel) => channel.handle_reply(message_id, result),
                    None => Err(ErrorInfo::coroutine_not_found(coroutine_id)),
                };
                if let Err(e) = outcome {
                    warn!("Thread {}: dropping channel reply: {}", self.id, e);
                }
            }
            ThreadMessage::Task { coroutine_id, .. } => {
                warn!(
                    "Thread {}: worker sent a task for coroutine {}, ignoring",
                    self.id, coroutine_id
                );
            }
        }
    }
}

fn wire(inner: &Arc<ThreadInner>, worker: &dyn Worker) {
    let weak = Arc::downgrade(inner);
    worker.on_message(Arc::new(move |message| {
        if let Some(inner) = weak.upgrade() {
            inner.handle_message(message);
        }
    }));

    let weak = Arc::downgrade(inner);
    worker.on_error(Arc::new(move |fault| {
        if let Some(inner) = weak.upgrade() {
            replace_worker(&inner, fault);
        }
    }));
}

/// Wait for the reply to a task posted with [`Thread::submit`]
pub async fn settle(receiver: oneshot::Receiver<CallResult>) -> ExecutionResult<JsonValue> {
    match receiver.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(info)) => Err(ExecutionError::Call(info)),
        Err(_) => Err(ExecutionError::ThreadTerminated),
    }
}

fn spawn_worker(inner: &Arc<ThreadInner>) -> Result<(), IpcError> {
    let worker: Arc<dyn Worker> = Arc::from(inner.factory.create()?);
    wire(inner, worker.as_ref());
    *inner.worker.lock() = Some(worker);
    Ok(())
}

/// Fail every pending call and start over with a fresh worker
fn replace_worker(inner: &Arc<ThreadInner>, fault: IpcError) {
    warn!("Thread {}: worker failed: {}", inner.id, fault);

    let message = format!("Worker failed: {}", fault);
    for coroutine in inner.drain() {
        coroutine.done(Err(ErrorInfo::internal(message.clone())));
    }

    let old = inner.worker.lock().take();
    if let Some(old) = old {
        old.terminate();
    }
    if inner.terminated.load(Ordering::SeqCst) {
        return;
    }

    match spawn_worker(inner) {
        Ok(()) => info!("Thread {}: worker replaced", inner.id),
        Err(e) => error!("Thread {}: failed to replace worker: {}", inner.id, e),
    }
}

/// Channel sink that routes through the thread's current worker
struct ThreadSink(Weak<ThreadInner>);

impl MessageSink for ThreadSink {
    fn send(&self, message: ThreadMessage) -> Result<(), IpcError> {
        let inner = self.0.upgrade().ok_or(IpcError::ConnectionClosed)?;
        inner.post(message)
    }
}

/// Owns one worker and correlates its replies with outstanding calls.
///
/// Clones share the same worker. A terminated thread is never reused.
#[derive(Clone)]
pub struct Thread {
    inner: Arc<ThreadInner>,
}

impl Thread {
    /// Start a thread with a fresh worker from `factory`
    pub fn new(factory: Arc<dyn WorkerFactory>) -> ExecutionResult<Self> {
        let inner = Arc::new(ThreadInner {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            factory,
            worker: Mutex::new(None),
            coroutines: Mutex::new(HashMap::new()),
            drained: Notify::new(),
            locked: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        });
        spawn_worker(&inner)?;
        debug!("Thread {} started", inner.id);
        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Send a task and return the receiver its result arrives on.
    ///
    /// A dropped sender means the thread went away before the call finished.
    pub fn submit(&self, task: &Task) -> ExecutionResult<oneshot::Receiver<CallResult>> {
        if self.is_terminated() {
            return Err(ExecutionError::ThreadTerminated);
        }

        let channel = match task.channels() {
            [] => None,
            [channel] => Some(channel.clone()),
            channels => return Err(ExecutionError::TooManyChannelsProvided(channels.len())),
        };
        if let Some(bound_to) = channel.as_ref().and_then(|channel| channel.coroutine_id()) {
            return Err(ExecutionError::UsedChannelProvided(bound_to));
        }

        let (coroutine, receiver) = Coroutine::new(channel.clone());
        let coroutine_id = coroutine.id();
        if let Some(channel) = &channel {
            channel.bind(coroutine_id, Arc::new(ThreadSink(Arc::downgrade(&self.inner))))?;
        }

        self.inner.coroutines.lock().insert(coroutine_id, coroutine);
        let message = ThreadMessage::Task {
            coroutine_id,
            kind: task.kind().code(),
            operands: task.wire_operands(channel.is_some()),
        };
        if let Err(e) = self.inner.post(message) {
            if let Some(coroutine) = self.inner.take_coroutine(coroutine_id) {
                coroutine.abandon();
            }
            return Err(e.into());
        }

        self.inner.touch();
        Ok(receiver)
    }

    /// Run a task to completion
    pub async fn run(&self, task: Task) -> ExecutionResult<JsonValue> {
        settle(self.submit(&task)?).await
    }

    /// Stop the worker. Pending calls fail with `ThreadTerminated`.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending = self.inner.drain();
        let dropped = pending.len();
        for coroutine in pending {
            coroutine.abandon();
        }

        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.terminate();
        }
        info!(
            "Thread {} terminated ({} pending calls dropped)",
            self.inner.id, dropped
        );
    }

    /// Wait until no call is outstanding
    pub async fn drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.pending_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Reserve the thread. Returns false if it was already reserved.
    pub fn lock(&self) -> bool {
        self.inner
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.inner.locked.store(false, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Number of calls still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.inner.coroutines.lock().len()
    }

    /// No outstanding call and not reserved
    pub fn is_idle(&self) -> bool {
        !self.is_locked() && self.pending_count() == 0
    }

    /// Time since the last call finished, zero while a call is outstanding
    pub fn idle_for(&self) -> Duration {
        if self.pending_count() > 0 {
            return Duration::ZERO;
        }
        self.inner.last_active.lock().elapsed()
    }

    pub fn downgrade(&self) -> WeakThread {
        WeakThread {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.inner.id)
            .field("pending", &self.pending_count())
            .field("locked", &self.is_locked())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Non-owning reference to a [`Thread`]
#[derive(Clone, Debug, Default)]
pub struct WeakThread {
    inner: Weak<ThreadInner>,
}

impl WeakThread {
    pub fn upgrade(&self) -> Option<Thread> {
        self.inner.upgrade().map(|inner| Thread { inner })
    }

    /// Whether this refers to `thread`
    pub fn is(&self, thread: &Thread) -> bool {
        Weak::ptr_eq(&self.inner, &Arc::downgrade(&thread.inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFactory;
    use serde_json::json;
    use tandem_ipc::{Argument, Channel, ErrorKind, TaskKind};

    fn add_task() -> Task {
        Task::invoke_function("math", "add", vec![json!(1).into(), json!(2).into()])
    }

    #[tokio::test]
    async fn test_run_resolves_by_coroutine_id() {
        let factory = MockFactory::echo();
        let thread = Thread::new(factory.clone()).unwrap();

        let value = thread.run(add_task()).await.unwrap();
        assert_eq!(value, json!(["math", "add", [1, 2], false]));
        assert_eq!(thread.pending_count(), 0);
        assert_eq!(factory.worker(0).count_kind(TaskKind::InvokeFunction), 1);
    }

    #[tokio::test]
    async fn test_terminated_thread_sends_nothing() {
        let factory = MockFactory::silent();
        let thread = Thread::new(factory.clone()).unwrap();
        thread.terminate();

        let err = thread.run(add_task()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ThreadTerminated));
        assert!(factory.worker(0).posted().is_empty());
        assert!(factory.worker(0).is_terminated());
    }

    #[tokio::test]
    async fn test_terminate_fails_pending_calls() {
        let factory = MockFactory::silent();
        let thread = Thread::new(factory).unwrap();

        let receiver = thread.submit(&add_task()).unwrap();
        assert_eq!(thread.pending_count(), 1);
        thread.terminate();

        assert!(receiver.await.is_err());
        assert_eq!(thread.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_coroutine_is_isolated() {
        let factory = MockFactory::silent();
        let thread = Thread::new(factory.clone()).unwrap();
        let worker = factory.worker(0);

        let receiver = thread.submit(&add_task()).unwrap();
        let coroutine_id = worker.posted()[0].coroutine_id();

        worker.emit(ThreadMessage::TaskCompleted {
            coroutine_id: coroutine_id + 1000,
            result: Ok(json!("stray")),
        });
        assert_eq!(thread.pending_count(), 1);

        worker.emit(ThreadMessage::TaskCompleted {
            coroutine_id,
            result: Ok(json!(3)),
        });
        assert_eq!(receiver.await.unwrap(), Ok(json!(3)));
    }

    #[tokio::test]
    async fn test_channel_preconditions() {
        let factory = MockFactory::silent();
        let thread = Thread::new(factory.clone()).unwrap();

        let two = Task::invoke_function(
            "m",
            "f",
            vec![Argument::from(Channel::new()), Argument::from(Channel::new())],
        );
        let err = thread.run(two).await.unwrap_err();
        assert!(matches!(err, ExecutionError::TooManyChannelsProvided(2)));

        let channel = Channel::new();
        let task = Task::invoke_function("m", "f", vec![channel.clone().into()]);
        let _receiver = thread.submit(&task).unwrap();
        assert!(channel.is_bound());

        let reused = Task::invoke_function("m", "f", vec![channel.into()]);
        let err = thread.run(reused).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsedChannelProvided);

        assert_eq!(factory.worker(0).posted().len(), 1);
        match &factory.worker(0).posted()[0] {
            ThreadMessage::Task { operands, .. } => assert_eq!(operands[3], json!(true)),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_direct_message_without_channel_is_rejected() {
        let factory = MockFactory::silent();
        let thread = Thread::new(factory.clone()).unwrap();
        let worker = factory.worker(0);

        let _receiver = thread.submit(&add_task()).unwrap();
        let coroutine_id = worker.posted()[0].coroutine_id();

        worker.emit(ThreadMessage::DirectMessage {
            coroutine_id,
            message_id: 1,
            name: "next".into(),
            data: vec![],
        });

        match worker.posted().last() {
            Some(ThreadMessage::DirectMessageReplied {
                result: Err(info), ..
            }) => assert_eq!(info.kind, ErrorKind::ChannelNotFound),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_worker_fault_fails_pending_and_recovers() {
        let factory = MockFactory::echo();
        let thread = Thread::new(factory.clone()).unwrap();
        factory.worker(0).hold(true);

        let receiver = thread.submit(&add_task()).unwrap();
        factory.worker(0).fault(IpcError::WorkerFault("crashed".into()));

        let result = receiver.await.unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::InternalError);
        assert!(factory.worker(0).is_terminated());
        assert_eq!(factory.created(), 2);

        let value = thread.run(add_task()).await.unwrap();
        assert_eq!(value[1], json!("add"));
        assert!(!thread.is_terminated());
    }

    #[tokio::test]
    async fn test_locking() {
        let thread = Thread::new(MockFactory::silent()).unwrap();
        assert!(thread.lock());
        assert!(!thread.lock());
        assert!(!thread.is_idle());
        thread.unlock();
        assert!(thread.is_idle());

        let weak = thread.downgrade();
        assert!(weak.is(&thread));
        assert_eq!(weak.upgrade(), Some(thread.clone()));
        drop(thread);
        assert!(weak.upgrade().is_none());
    }
}
