//! Local worker hosting
//!
//! A worker runs the [`WorkerManager`] loop behind a pair of JSON line
//! queues. [`ThreadWorkerFactory`] hosts the loop on a dedicated OS thread
//! with its own current-thread runtime; [`InlineWorkerFactory`] hosts it as a
//! task on the caller's runtime.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tandem_ipc::{
    decode_message, encode_message, ErrorHandler, IpcError, MessageHandler, MessageSink,
    ThreadMessage, Worker, WorkerFactory,
};

use crate::loader::ModuleLoader;
use crate::manager::WorkerManager;

/// Posts encoded messages into a line queue
struct LineSink(mpsc::UnboundedSender<String>);

impl MessageSink for LineSink {
    fn send(&self, message: ThreadMessage) -> Result<(), IpcError> {
        let line = encode_message(&message)?;
        self.0.send(line).map_err(|_| IpcError::ConnectionClosed)
    }
}

/// Worker main loop.
///
/// Each task runs in its own spawned task so channel replies can be routed
/// while a call is suspended. Returns when the inbox closes.
pub async fn run_worker(
    loader: Arc<dyn ModuleLoader>,
    mut inbox: mpsc::UnboundedReceiver<String>,
    outbox: mpsc::UnboundedSender<String>,
) {
    let sink: Arc<dyn MessageSink> = Arc::new(LineSink(outbox));
    let manager = Arc::new(WorkerManager::new(loader, sink.clone()));

    while let Some(line) = inbox.recv().await {
        let message = match decode_message(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable message: {}", e);
                continue;
            }
        };

        let manager = manager.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            if let Some(reply) = manager.handle_message(message).await {
                if let Err(e) = sink.send(reply) {
                    debug!("Reply dropped, caller went away: {}", e);
                }
            }
        });
    }

    debug!("Worker inbox closed");
}

#[derive(Default)]
struct Handlers {
    message: Mutex<Option<MessageHandler>>,
    error: Mutex<Option<ErrorHandler>>,
}

impl Handlers {
    fn dispatch(&self, message: ThreadMessage) {
        let handler = self.message.lock().clone();
        match handler {
            Some(handler) => handler(message),
            None => warn!(
                "No message handler installed, dropping {:?}",
                message.message_type()
            ),
        }
    }

    fn fail(&self, error: IpcError) {
        let handler = self.error.lock().clone();
        match handler {
            Some(handler) => handler(error),
            None => error!("Unhandled worker fault: {}", error),
        }
    }
}

/// Caller-side end of a locally hosted worker
pub struct LocalWorker {
    id: Uuid,
    inbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
    handlers: Arc<Handlers>,
    terminated: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl LocalWorker {
    /// Wire up a worker whose loop is already running at the far end of the
    /// two queues. Replies are pumped on `runtime`.
    fn connect(
        id: Uuid,
        inbox: mpsc::UnboundedSender<String>,
        mut outbox: mpsc::UnboundedReceiver<String>,
        runtime: &Handle,
    ) -> Self {
        let handlers = Arc::new(Handlers::default());
        let terminated = Arc::new(AtomicBool::new(false));

        let pump_handlers = handlers.clone();
        let pump_terminated = terminated.clone();
        let pump = runtime.spawn(async move {
            while let Some(line) = outbox.recv().await {
                match decode_message(&line) {
                    Ok(message) => pump_handlers.dispatch(message),
                    Err(e) => pump_handlers.fail(IpcError::WorkerFault(e.to_string())),
                }
            }
            if !pump_terminated.load(Ordering::SeqCst) {
                pump_handlers.fail(IpcError::ConnectionClosed);
            }
        });

        Self {
            id,
            inbox: Mutex::new(Some(inbox)),
            handlers,
            terminated,
            pump,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Worker for LocalWorker {
    fn post_message(&self, message: ThreadMessage) -> Result<(), IpcError> {
        let line = encode_message(&message)?;
        let inbox = self.inbox.lock();
        let sender = inbox.as_ref().ok_or(IpcError::ConnectionClosed)?;
        sender.send(line).map_err(|_| IpcError::ConnectionClosed)
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.handlers.message.lock() = Some(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        *self.handlers.error.lock() = Some(handler);
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        // Closing the inbox ends the worker loop
        self.inbox.lock().take();
        self.pump.abort();
        debug!("Worker {} terminated", self.id);
    }
}

impl Drop for LocalWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn current_runtime() -> Result<Handle, IpcError> {
    Handle::try_current()
        .map_err(|e| IpcError::WorkerCreation(format!("no tokio runtime available: {}", e)))
}

/// Hosts each worker on its own OS thread
pub struct ThreadWorkerFactory {
    loader: Arc<dyn ModuleLoader>,
}

impl ThreadWorkerFactory {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self { loader }
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    fn create(&self) -> Result<Box<dyn Worker>, IpcError> {
        let runtime = current_runtime()?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let loader = self.loader.clone();

        std::thread::Builder::new()
            .name(format!("tandem-worker-{}", id.simple()))
            .spawn(move || {
                let worker_runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(worker_runtime) => worker_runtime,
                    Err(e) => {
                        error!("Failed to start runtime for worker {}: {}", id, e);
                        return;
                    }
                };
                worker_runtime.block_on(run_worker(loader, inbox_rx, outbox_tx));
            })
            .map_err(|e| IpcError::WorkerCreation(e.to_string()))?;

        info!("Started worker {} on a dedicated thread", id);
        Ok(Box::new(LocalWorker::connect(id, inbox_tx, outbox_rx, &runtime)))
    }
}

/// Hosts each worker as a task on the caller's runtime
pub struct InlineWorkerFactory {
    loader: Arc<dyn ModuleLoader>,
}

impl InlineWorkerFactory {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self { loader }
    }
}

impl WorkerFactory for InlineWorkerFactory {
    fn create(&self) -> Result<Box<dyn Worker>, IpcError> {
        let runtime = current_runtime()?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        runtime.spawn(run_worker(self.loader.clone(), inbox_rx, outbox_tx));

        debug!("Started inline worker {}", id);
        Ok(Box::new(LocalWorker::connect(id, inbox_tx, outbox_rx, &runtime)))
    }
}
