use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use tandem_ipc::{Argument, MemberKind, Task};

use super::pending::{PendingWrite, PendingWrites, PropertyValue};
use super::{check_member, check_writable, Dispatcher};
use crate::error::{ExecutionError, ExecutionResult};
use crate::registry::RegistrationToken;
use crate::thread::{settle, Thread};

struct ObjectInner {
    dispatcher: Dispatcher,
    thread: Thread,
    object_id: u64,
    members: BTreeMap<String, MemberKind>,
    token: RegistrationToken,
    writes: PendingWrites,
    disposed: AtomicBool,
}

impl Drop for ObjectInner {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::SeqCst) {
            debug!("Releasing dropped object {}", self.object_id);
            self.dispatcher.release_object(self.token);
        }
    }
}

/// Handle for an object living in a worker.
///
/// Clones share the handle. When the last clone is dropped without an
/// explicit [`ThreadedObject::dispose`], the remote object is disposed in the
/// background.
#[derive(Clone)]
pub struct ThreadedObject {
    inner: Arc<ObjectInner>,
}

impl ThreadedObject {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        thread: Thread,
        object_id: u64,
        members: BTreeMap<String, MemberKind>,
        token: RegistrationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                dispatcher,
                thread,
                object_id,
                members,
                token,
                writes: PendingWrites::default(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Worker-side id of the object
    pub fn id(&self) -> u64 {
        self.inner.object_id
    }

    /// Members and their kinds
    pub fn members(&self) -> &BTreeMap<String, MemberKind> {
        &self.inner.members
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> ExecutionResult<()> {
        if self.is_disposed() {
            return Err(ExecutionError::ObjectNotFound(self.inner.object_id));
        }
        Ok(())
    }

    pub async fn get(&self, property: &str) -> ExecutionResult<PropertyValue> {
        self.ensure_live()?;
        check_member(&self.inner.members, property, MemberKind::Data)?;
        if let Some(pending) = self.inner.writes.get(property) {
            return Ok(PropertyValue::Pending(pending));
        }

        let task = Task::get_instance_property(self.inner.object_id, property);
        let value = self.inner.thread.run(task).await?;
        Ok(PropertyValue::Ready(value))
    }

    /// Write a data member.
    ///
    /// The write is posted before this returns, so later calls on the object
    /// observe it. Only the confirmation is awaited in the background.
    pub fn set(&self, property: &str, value: JsonValue) -> ExecutionResult<PendingWrite> {
        self.ensure_live()?;
        check_writable(&self.inner.members, property)?;

        let task = Task::set_instance_property(self.inner.object_id, property, value);
        let receiver = self.inner.thread.submit(&task)?;
        self.inner
            .writes
            .start(property, async move { settle(receiver).await.map(|_| ()) })
    }

    pub async fn call(&self, method: &str, args: Vec<Argument>) -> ExecutionResult<JsonValue> {
        self.ensure_live()?;
        check_member(&self.inner.members, method, MemberKind::Method)?;
        let task = Task::invoke_instance_method(self.inner.object_id, method, args);
        self.inner.thread.run(task).await
    }

    /// Dispose the remote object. Later calls are no-ops.
    pub async fn dispose(&self) -> ExecutionResult<()> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.dispatcher.dispose(self.inner.token).await
    }
}

impl fmt::Debug for ThreadedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedObject")
            .field("id", &self.inner.object_id)
            .field("thread", &self.inner.thread.id())
            .field("members", &self.inner.members)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
