//! Asynchronous property writes

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use tandem_ipc::ErrorInfo;

use crate::error::{ExecutionError, ExecutionResult};

type WriteResult = Result<(), ErrorInfo>;

/// Marker for a property write still in flight.
///
/// Clones observe the same write.
#[derive(Clone)]
pub struct PendingWrite {
    id: u64,
    outcome: Shared<BoxFuture<'static, WriteResult>>,
}

impl PendingWrite {
    /// Wait for the remote write to finish
    pub async fn wait(&self) -> Result<(), ErrorInfo> {
        self.outcome.clone().await
    }

    pub fn is_done(&self) -> bool {
        self.outcome.peek().is_some()
    }
}

impl fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWrite")
            .field("id", &self.id)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Result of reading a property through a proxy
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Ready(JsonValue),
    /// A write to this property has not landed yet
    Pending(PendingWrite),
}

impl PropertyValue {
    pub fn is_pending(&self) -> bool {
        matches!(self, PropertyValue::Pending(_))
    }

    pub fn into_ready(self) -> Option<JsonValue> {
        match self {
            PropertyValue::Ready(value) => Some(value),
            PropertyValue::Pending(_) => None,
        }
    }
}

#[derive(Default)]
struct Slots {
    next_id: u64,
    writes: HashMap<String, PendingWrite>,
}

/// Shadow slots for in-flight writes, one per property
#[derive(Clone, Default)]
pub(crate) struct PendingWrites {
    slots: Arc<Mutex<Slots>>,
}

impl PendingWrites {
    pub(crate) fn get(&self, name: &str) -> Option<PendingWrite> {
        self.slots.lock().writes.get(name).cloned()
    }

    /// Wait on `write` in the background and occupy the slot for `name` until
    /// it finishes. A later write replaces the marker of an earlier one.
    ///
    /// Callers post the task first; `write` only waits for the reply.
    pub(crate) fn start<F>(&self, name: &str, write: F) -> ExecutionResult<PendingWrite>
    where
        F: Future<Output = ExecutionResult<()>> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| {
            ExecutionError::Internal(format!("property writes need a tokio runtime: {}", e))
        })?;

        let (done, outcome) = oneshot::channel::<WriteResult>();
        let outcome = outcome
            .map(|result| {
                result.unwrap_or_else(|_| Err(ErrorInfo::internal("Property write was abandoned")))
            })
            .boxed()
            .shared();

        let pending = {
            let mut slots = self.slots.lock();
            slots.next_id += 1;
            let pending = PendingWrite {
                id: slots.next_id,
                outcome,
            };
            slots.writes.insert(name.to_string(), pending.clone());
            pending
        };

        let slots = self.slots.clone();
        let name = name.to_string();
        let id = pending.id;
        runtime.spawn(async move {
            let result = write.await.map_err(|e| e.to_error_info());
            {
                let mut slots = slots.lock();
                if slots.writes.get(&name).is_some_and(|current| current.id == id) {
                    slots.writes.remove(&name);
                }
            }
            let _ = done.send(result);
        });

        Ok(pending)
    }
}
