//! In-memory workers for unit tests

use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tandem_ipc::{
    ErrorHandler, IpcError, MessageHandler, TaskKind, ThreadMessage, Worker, WorkerFactory,
};

/// Computes the reply to a posted message, if any
pub(crate) type Responder = Arc<dyn Fn(&ThreadMessage) -> Option<ThreadMessage> + Send + Sync>;

#[derive(Default)]
pub(crate) struct MockWorkerState {
    posted: Mutex<Vec<ThreadMessage>>,
    message_handler: Mutex<Option<MessageHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    holding: AtomicBool,
    terminated: AtomicBool,
}

impl MockWorkerState {
    pub fn posted(&self) -> Vec<ThreadMessage> {
        self.posted.lock().clone()
    }

    /// Number of posted tasks of `kind`
    pub fn count_kind(&self, kind: TaskKind) -> usize {
        self.posted
            .lock()
            .iter()
            .filter(|message| {
                matches!(message, ThreadMessage::Task { kind: code, .. } if *code == kind.code())
            })
            .count()
    }

    /// Stop answering automatically
    pub fn hold(&self, holding: bool) {
        self.holding.store(holding, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Deliver a message as if the worker had sent it
    pub fn emit(&self, message: ThreadMessage) {
        let handler = self.message_handler.lock().clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    /// Report a transport fault
    pub fn fault(&self, error: IpcError) {
        let handler = self.error_handler.lock().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }
}

struct MockWorker {
    state: Arc<MockWorkerState>,
    responder: Option<Responder>,
}

impl Worker for MockWorker {
    fn post_message(&self, message: ThreadMessage) -> Result<(), IpcError> {
        if self.state.is_terminated() {
            return Err(IpcError::ConnectionClosed);
        }
        self.state.posted.lock().push(message.clone());

        if self.state.holding.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(reply) = self.responder.as_ref().and_then(|respond| respond(&message)) {
            self.state.emit(reply);
        }
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.state.message_handler.lock() = Some(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        *self.state.error_handler.lock() = Some(handler);
    }

    fn terminate(&self) {
        self.state.terminated.store(true, Ordering::SeqCst);
    }
}

/// Factory whose workers answer synchronously through a [`Responder`]
pub(crate) struct MockFactory {
    responder: Option<Responder>,
    workers: Mutex<Vec<Arc<MockWorkerState>>>,
}

impl MockFactory {
    /// Workers never answer
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            responder: None,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Workers complete every task with its wire operands
    pub fn echo() -> Arc<Self> {
        Self::responding(|message| match message {
            ThreadMessage::Task {
                coroutine_id,
                operands,
                ..
            } => Some(ThreadMessage::TaskCompleted {
                coroutine_id: *coroutine_id,
                result: Ok(json!(operands)),
            }),
            _ => None,
        })
    }

    pub fn responding<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&ThreadMessage) -> Option<ThreadMessage> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Some(Arc::new(respond)),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// State of the `index`th worker created
    pub fn worker(&self, index: usize) -> Arc<MockWorkerState> {
        self.workers.lock()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.workers.lock().len()
    }
}

impl WorkerFactory for MockFactory {
    fn create(&self) -> Result<Box<dyn Worker>, IpcError> {
        let state = Arc::new(MockWorkerState::default());
        self.workers.lock().push(state.clone());
        Ok(Box::new(MockWorker {
            state,
            responder: self.responder.clone(),
        }))
    }
}
