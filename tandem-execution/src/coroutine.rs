//! Call correlation

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

use tandem_ipc::{CallResult, Channel};

static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);

/// Next process-wide coroutine id. Ids strictly increase and are never reused.
pub fn next_coroutine_id() -> u64 {
    NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed)
}

/// One outstanding remote call.
///
/// The completion is consumed by [`Coroutine::done`], so a coroutine resolves
/// at most once.
#[derive(Debug)]
pub struct Coroutine {
    id: u64,
    completion: oneshot::Sender<CallResult>,
    channel: Option<Channel>,
}

impl Coroutine {
    /// Create a coroutine and the receiver its result is delivered to
    pub fn new(channel: Option<Channel>) -> (Self, oneshot::Receiver<CallResult>) {
        let (completion, receiver) = oneshot::channel();
        let coroutine = Self {
            id: next_coroutine_id(),
            completion,
            channel,
        };
        (coroutine, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Resolve the call and close its channel
    pub fn done(self, result: CallResult) {
        if let Some(channel) = &self.channel {
            channel.close();
        }
        // The caller may have stopped waiting
        let _ = self.completion.send(result);
    }

    /// Drop the call without a result; the caller sees its sender go away
    pub fn abandon(self) {
        if let Some(channel) = &self.channel {
            channel.close();
        }
    }
}
