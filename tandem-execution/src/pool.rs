//! Thread pool
//!
//! Threads are handed out round-robin. Every request goes through a FIFO
//! queue that an allocation pass drains, both right after a request is made
//! and on a periodic timer, so requests waiting behind locked threads are
//! retried and timed out even when nothing else happens.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use tandem_config::{ConcurrencyConfig, PartialConcurrencyConfig, Validatable};
use tandem_ipc::{Task, WorkerFactory};

use crate::error::{ExecutionError, ExecutionResult};
use crate::registry::{ObjectRegistry, Registration, RegistrationToken};
use crate::thread::{settle, Thread};

struct AllocationRequest {
    requested_at: Instant,
    exclusive: bool,
    /// Per-request cap on top of the pool-wide allocation timeout
    timeout: Option<Duration>,
    callback: oneshot::Sender<ExecutionResult<Thread>>,
}

impl AllocationRequest {
    fn deadline(&self, pool_timeout: Option<Duration>) -> Option<Duration> {
        match (self.timeout, pool_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

struct PoolState {
    config: ConcurrencyConfig,
    threads: Vec<Thread>,
    cursor: usize,
    requests: VecDeque<AllocationRequest>,
    terminated: bool,
}

impl PoolState {
    /// Pick the next eligible thread round-robin from the cursor
    fn select(&mut self, exclusive: bool) -> Option<Thread> {
        let len = self.threads.len();
        if len == 0 {
            return None;
        }
        if self.cursor >= len {
            self.cursor = 0;
        }

        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            let thread = &self.threads[index];
            if thread.is_locked() || thread.is_terminated() {
                continue;
            }
            if exclusive && !thread.lock() {
                continue;
            }
            // Wraps lazily so a thread added meanwhile gets the next turn
            self.cursor = index + 1;
            return Some(thread.clone());
        }
        None
    }
}

struct PoolInner {
    factory: Arc<dyn WorkerFactory>,
    state: Mutex<PoolState>,
    registry: ObjectRegistry,
    runtime: Handle,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}

/// Snapshot of one pooled thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadStats {
    pub id: u64,
    pub pending: usize,
    pub locked: bool,
    pub idle_ms: u64,
}

/// Round-robin pool of [`Thread`]s with exclusive reservations
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Create the pool with `min_threads` threads and start its timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        factory: Arc<dyn WorkerFactory>,
        config: ConcurrencyConfig,
    ) -> ExecutionResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            ExecutionError::Internal(format!("thread pool needs a tokio runtime: {}", e))
        })?;

        let mut threads = Vec::with_capacity(config.max_threads);
        for _ in 0..config.min_threads {
            threads.push(Thread::new(factory.clone())?);
        }
        let interval = config.allocation_interval;

        let pool = Self {
            inner: Arc::new(PoolInner {
                factory,
                state: Mutex::new(PoolState {
                    config,
                    threads,
                    cursor: 0,
                    requests: VecDeque::new(),
                    terminated: false,
                }),
                registry: ObjectRegistry::new(),
                runtime,
                timer: Mutex::new(None),
            }),
        };
        pool.restart_timer(interval);

        info!(
            "Thread pool started with {} threads",
            pool.inner.state.lock().threads.len()
        );
        Ok(pool)
    }

    fn restart_timer(&self, period: Duration) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let timer = self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = ThreadPool { inner };
                pool.allocate();
                pool.descale_idle();
            }
        });

        if let Some(previous) = self.inner.timer.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Get a thread, reserving it when `exclusive`
    pub async fn get_thread(&self, exclusive: bool) -> ExecutionResult<Thread> {
        self.get_thread_within(exclusive, None).await
    }

    /// Like [`ThreadPool::get_thread`] with an extra cap on the wait
    pub async fn get_thread_within(
        &self,
        exclusive: bool,
        timeout: Option<Duration>,
    ) -> ExecutionResult<Thread> {
        let receiver = {
            let mut state = self.inner.state.lock();
            if state.terminated {
                return Err(ExecutionError::ThreadPoolTerminated);
            }
            if state.threads.len() < state.config.max_threads {
                let thread = Thread::new(self.inner.factory.clone())?;
                debug!(
                    "Added thread {} ({} of {})",
                    thread.id(),
                    state.threads.len() + 1,
                    state.config.max_threads
                );
                state.threads.push(thread);
            }

            let (callback, receiver) = oneshot::channel();
            state.requests.push_back(AllocationRequest {
                requested_at: Instant::now(),
                exclusive,
                timeout,
                callback,
            });
            receiver
        };

        self.allocate();
        receiver
            .await
            .unwrap_or(Err(ExecutionError::ThreadPoolTerminated))
    }

    /// Hand out a thread only if one is free right now.
    ///
    /// Returns `None` while earlier requests are queued, so it never jumps
    /// ahead of a waiting caller.
    pub fn try_get_thread(&self, exclusive: bool) -> ExecutionResult<Option<Thread>> {
        let mut state = self.inner.state.lock();
        if state.terminated {
            return Err(ExecutionError::ThreadPoolTerminated);
        }
        if !state.requests.is_empty() {
            return Ok(None);
        }
        if state.threads.len() < state.config.max_threads {
            let thread = Thread::new(self.inner.factory.clone())?;
            debug!("Added thread {} for an immediate request", thread.id());
            state.threads.push(thread);
        }
        Ok(state.select(exclusive))
    }

    /// One allocation pass over the request queue, in FIFO order
    pub fn allocate(&self) {
        let mut state = self.inner.state.lock();
        if state.requests.is_empty() {
            return;
        }

        let pool_timeout = state.config.thread_allocation_timeout;
        let now = Instant::now();
        let mut waiting = VecDeque::with_capacity(state.requests.len());

        while let Some(request) = state.requests.pop_front() {
            if request.callback.is_closed() {
                continue;
            }

            if let Some(timeout) = request.deadline(pool_timeout) {
                if now.duration_since(request.requested_at) > timeout {
                    warn!("Thread allocation timed out after {:?}", timeout);
                    let _ = request
                        .callback
                        .send(Err(ExecutionError::ThreadAllocationTimeout(timeout)));
                    continue;
                }
            }

            match state.select(request.exclusive) {
                Some(thread) => {
                    if let Err(Ok(thread)) = request.callback.send(Ok(thread)) {
                        // Requester went away after the pass started
                        if request.exclusive {
                            thread.unlock();
                        }
                    }
                }
                None => waiting.push_back(request),
            }
        }

        state.requests = waiting;
    }

    /// Unlock an exclusively held thread and serve waiting requests
    pub fn release_thread(&self, thread: &Thread) {
        thread.unlock();
        self.allocate();
    }

    /// Merge new limits into the pool configuration
    pub fn config(&self, partial: &PartialConcurrencyConfig) -> ExecutionResult<()> {
        let interval_changed = {
            let mut state = self.inner.state.lock();
            let merged = state.config.merged(partial);
            merged.validate()?;
            let changed = merged.allocation_interval != state.config.allocation_interval;
            state.config = merged;
            changed
        };

        if interval_changed {
            let interval = self.inner.state.lock().config.allocation_interval;
            self.restart_timer(interval);
        }
        self.allocate();
        Ok(())
    }

    pub fn current_config(&self) -> ConcurrencyConfig {
        self.inner.state.lock().config.clone()
    }

    /// Shrink the pool to `min_threads`.
    ///
    /// Without `force` only idle threads that host no registered object are
    /// removed. Returns the number of threads removed.
    pub fn descale(&self, force: bool) -> usize {
        let registry = self.inner.registry.clone();
        self.shrink(|thread| force || (thread.is_idle() && !registry.has_objects_on(thread)))
    }

    /// Timer pass: drop threads idle for longer than `thread_idle_timeout`
    fn descale_idle(&self) -> usize {
        let Some(idle_timeout) = self.inner.state.lock().config.thread_idle_timeout else {
            return 0;
        };
        let registry = self.inner.registry.clone();
        self.shrink(|thread| {
            thread.is_idle()
                && thread.idle_for() >= idle_timeout
                && !registry.has_objects_on(thread)
        })
    }

    fn shrink(&self, removable: impl Fn(&Thread) -> bool) -> usize {
        let removed = {
            let mut state = self.inner.state.lock();
            let min_threads = state.config.min_threads;
            let mut removed = Vec::new();
            let mut index = state.threads.len();
            while index > 0 && state.threads.len() > min_threads {
                index -= 1;
                if removable(&state.threads[index]) {
                    removed.push(state.threads.remove(index));
                }
            }
            if state.cursor >= state.threads.len() {
                state.cursor = 0;
            }
            removed
        };

        for thread in &removed {
            thread.terminate();
        }
        if !removed.is_empty() {
            info!("Descaled thread pool by {} threads", removed.len());
        }
        removed.len()
    }

    /// Terminate every thread and stop the timer.
    ///
    /// Without `force` outstanding calls are allowed to finish first. Queued
    /// requests fail with `ThreadPoolTerminated`.
    pub async fn terminate(&self, force: bool) {
        let threads = {
            let mut state = self.inner.state.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            for request in state.requests.drain(..) {
                let _ = request.callback.send(Err(ExecutionError::ThreadPoolTerminated));
            }
            std::mem::take(&mut state.threads)
        };

        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }

        if !force {
            for thread in &threads {
                thread.drained().await;
            }
        }
        for thread in &threads {
            thread.terminate();
        }
        self.inner.registry.clear();
        info!("Thread pool terminated ({} threads)", threads.len());
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().terminated
    }

    /// Live thread count
    pub fn thread_count(&self) -> usize {
        self.inner.state.lock().threads.len()
    }

    /// Requests waiting for a thread
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().requests.len()
    }

    pub fn stats(&self) -> Vec<ThreadStats> {
        self.inner
            .state
            .lock()
            .threads
            .iter()
            .map(|thread| ThreadStats {
                id: thread.id(),
                pending: thread.pending_count(),
                locked: thread.is_locked(),
                idle_ms: thread.idle_for().as_millis() as u64,
            })
            .collect()
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.inner.registry
    }

    /// Track a remote object hosted on `thread`
    pub fn register_object(
        &self,
        object_id: u64,
        thread: &Thread,
        exclusive: bool,
    ) -> RegistrationToken {
        self.inner.registry.register(object_id, thread, exclusive)
    }

    /// Stop tracking an object without disposing it
    pub fn unregister_object(&self, token: RegistrationToken) -> Option<Registration> {
        self.inner.registry.unregister(token)
    }

    /// Dispose a registered object and wait for the worker to confirm.
    ///
    /// Does nothing if the token was already unregistered.
    pub async fn dispose_object(&self, token: RegistrationToken) -> ExecutionResult<()> {
        let Some(registration) = self.unregister_object(token) else {
            return Ok(());
        };
        let Some(thread) = registration.thread.upgrade() else {
            return Ok(());
        };

        // Unlocked before the first await so an abandoned dispose frees it
        let submitted = thread.submit(&Task::dispose_object(registration.object_id));
        if registration.exclusive {
            self.release_thread(&thread);
        }
        settle(submitted?).await.map(|_| ())
    }

    /// Dispose a registered object without waiting, for drop paths
    pub fn release_object(&self, token: RegistrationToken) {
        let Some(registration) = self.unregister_object(token) else {
            return;
        };
        let Some(thread) = registration.thread.upgrade() else {
            return;
        };

        if let Err(e) = thread.submit(&Task::dispose_object(registration.object_id)) {
            debug!(
                "Could not dispose object {} on thread {}: {}",
                registration.object_id,
                thread.id(),
                e
            );
        }
        if registration.exclusive {
            self.release_thread(&thread);
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ThreadPool")
            .field("threads", &state.threads.len())
            .field("requests", &state.requests.len())
            .field("terminated", &state.terminated)
            .finish()
    }
}
