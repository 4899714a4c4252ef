use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tandem_ipc::{Argument, ErrorInfo, MemberKind, Task};

use super::object::ThreadedObject;
use super::pending::{PendingWrite, PendingWrites, PropertyValue};
use super::{check_member, check_writable, Scheduler};
use crate::error::{ExecutionError, ExecutionResult};

struct FunctionInner {
    module: String,
    name: String,
    statics: BTreeMap<String, MemberKind>,
    is_class: bool,
    scheduler: Scheduler,
    writes: PendingWrites,
}

/// Handle for a function or class export living in a worker.
///
/// Static members are dispatched by the kinds the module reported when it
/// was loaded.
#[derive(Clone)]
pub struct ThreadedFunction {
    inner: Arc<FunctionInner>,
}

impl ThreadedFunction {
    pub(crate) fn new(
        module: String,
        name: String,
        statics: BTreeMap<String, MemberKind>,
        is_class: bool,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            inner: Arc::new(FunctionInner {
                module,
                name,
                statics,
                is_class,
                scheduler,
                writes: PendingWrites::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_class(&self) -> bool {
        self.inner.is_class
    }

    /// Static members and their kinds
    pub fn statics(&self) -> &BTreeMap<String, MemberKind> {
        &self.inner.statics
    }

    /// Call the export itself
    pub async fn invoke(&self, args: Vec<Argument>) -> ExecutionResult<JsonValue> {
        let task = Task::invoke_function(&self.inner.module, &self.inner.name, args);
        self.inner.scheduler.run(task).await
    }

    /// Read a static data member
    pub async fn get(&self, property: &str) -> ExecutionResult<PropertyValue> {
        check_member(&self.inner.statics, property, MemberKind::Data)?;
        if let Some(pending) = self.inner.writes.get(property) {
            return Ok(PropertyValue::Pending(pending));
        }

        let task = Task::get_static_property(&self.inner.module, &self.inner.name, property);
        let value = self.inner.scheduler.run(task).await?;
        Ok(PropertyValue::Ready(value))
    }

    /// Write a static data member.
    ///
    /// On a shared module thread the write is posted before this returns.
    pub fn set(&self, property: &str, value: JsonValue) -> ExecutionResult<PendingWrite> {
        check_writable(&self.inner.statics, property)?;

        let task = Task::set_static_property(&self.inner.module, &self.inner.name, property, value);
        let reply = self.inner.scheduler.post(task)?;
        self.inner
            .writes
            .start(property, async move { reply.await.map(|_| ()) })
    }

    /// Call a static method
    pub async fn call(&self, method: &str, args: Vec<Argument>) -> ExecutionResult<JsonValue> {
        check_member(&self.inner.statics, method, MemberKind::Method)?;
        let task = Task::invoke_static_method(&self.inner.module, &self.inner.name, method, args);
        self.inner.scheduler.run(task).await
    }

    /// Instantiate the export remotely.
    ///
    /// For parallel modules the object keeps its thread reserved until it is
    /// disposed.
    pub async fn construct(&self, args: Vec<JsonValue>) -> ExecutionResult<ThreadedObject> {
        let settings = self.inner.scheduler.settings();
        let dispatcher = self.inner.scheduler.dispatcher().clone();
        let exclusive = settings.parallel;

        // Released on failure or abandonment, kept once the object exists
        let lease = dispatcher.lease(exclusive, settings.timeout).await?;
        let task = Task::instantiate_object(&self.inner.module, &self.inner.name, args);
        let (object_id, members) = lease.thread().run(task).await.and_then(parse_instance)?;
        let thread = lease.keep();

        let token = dispatcher.register(object_id, &thread, exclusive);
        Ok(ThreadedObject::new(
            dispatcher, thread, object_id, members, token,
        ))
    }
}

/// `[objectId, {member: kind}]` as returned by an instantiation
fn parse_instance(reply: JsonValue) -> ExecutionResult<(u64, BTreeMap<String, MemberKind>)> {
    serde_json::from_value(reply).map_err(|e| {
        ExecutionError::Call(ErrorInfo::internal(format!(
            "Malformed instantiation reply: {}",
            e
        )))
    })
}

impl fmt::Debug for ThreadedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedFunction")
            .field("module", &self.inner.module)
            .field("name", &self.inner.name)
            .field("is_class", &self.inner.is_class)
            .finish()
    }
}
