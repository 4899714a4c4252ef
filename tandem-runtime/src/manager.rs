//! Execution side of the task protocol
//!
//! The [`WorkerManager`] decodes tasks, performs the real operation against
//! loaded modules and live objects, and turns every outcome into a
//! `TaskCompleted` reply. Failures never escape the dispatcher.

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use tandem_ipc::{
    CallResult, Channel, ErrorInfo, ErrorKind, MessageSink, TaskKind, TaskOperation,
    ThreadMessage,
};

use crate::loader::ModuleLoader;
use crate::module::{member_kinds, CallArgs, Export, Module, RemoteObject, StaticMembers};

/// Executes tasks on behalf of one thread
pub struct WorkerManager {
    loader: Arc<dyn ModuleLoader>,
    sink: Arc<dyn MessageSink>,
    modules: Mutex<HashMap<String, Arc<Module>>>,
    objects: Mutex<HashMap<u64, Arc<dyn RemoteObject>>>,
    channels: Mutex<HashMap<u64, Channel>>,
    next_object_id: AtomicU64,
}

impl WorkerManager {
    /// Create a manager that replies through `sink`
    pub fn new(loader: Arc<dyn ModuleLoader>, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            loader,
            sink,
            modules: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            next_object_id: AtomicU64::new(1),
        }
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Number of channels bound to running calls
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Handle one incoming message, returning the reply to send if any
    pub async fn handle_message(&self, message: ThreadMessage) -> Option<ThreadMessage> {
        match message {
            ThreadMessage::Task {
                coroutine_id,
                kind,
                operands,
            } => {
                let result = self.run_task(coroutine_id, kind, operands).await;
                Some(ThreadMessage::TaskCompleted {
                    coroutine_id,
                    result,
                })
            }
            ThreadMessage::DirectMessage {
                coroutine_id,
                message_id,
                name,
                data,
            } => match self.channel(coroutine_id) {
                Some(channel) => {
                    channel.handle_message(message_id, name, data).await;
                    None
                }
                None => Some(ThreadMessage::DirectMessageReplied {
                    coroutine_id,
                    message_id,
                    result: Err(ErrorInfo::channel_not_found(coroutine_id)),
                }),
            },
            ThreadMessage::DirectMessageReplied {
                coroutine_id,
                message_id,
                result,
            } => {
                let outcome = match self.channel(coroutine_id) {
                    Some(channel) => channel.handle_reply(message_id, result),
                    None => Err(ErrorInfo::channel_not_found(coroutine_id)),
                };
                if let Err(e) = outcome {
                    warn!("Dropping channel reply on coroutine {}: {}", coroutine_id, e);
                }
                None
            }
            ThreadMessage::TaskCompleted { coroutine_id, .. } => {
                warn!(
                    "Worker received a completion for coroutine {}; ignoring",
                    coroutine_id
                );
                None
            }
        }
    }

    fn channel(&self, coroutine_id: u64) -> Option<Channel> {
        self.channels.lock().get(&coroutine_id).cloned()
    }

    async fn run_task(&self, coroutine_id: u64, kind: u8, operands: Vec<JsonValue>) -> CallResult {
        let kind = TaskKind::try_from(kind)?;
        let operation = TaskOperation::decode(kind, operands)?;
        debug!("Running {:?} for coroutine {}", kind, coroutine_id);

        let channel = if operation.has_channel() {
            let channel = Channel::bound(coroutine_id, self.sink.clone());
            self.channels.lock().insert(coroutine_id, channel.clone());
            Some(channel)
        } else {
            None
        };

        let result = AssertUnwindSafe(self.execute(operation, channel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ErrorInfo::internal(panic_message(panic.as_ref()))));

        if let Some(channel) = self.channels.lock().remove(&coroutine_id) {
            channel.close();
        }

        result
    }

    async fn execute(&self, operation: TaskOperation, channel: Option<Channel>) -> CallResult {
        match operation {
            TaskOperation::InvokeFunction {
                module, function, args, ..
            } => {
                let module = self.module(&module)?;
                match export(&module, &function)? {
                    Export::Function(f) => f.call(CallArgs::with_channel(args, channel)).await,
                    other => Err(not_callable(other)),
                }
            }
            TaskOperation::GetStaticProperty {
                module,
                export: name,
                property,
            } => {
                let module = self.module(&module)?;
                statics(export(&module, &name)?)?.get(&property)
            }
            TaskOperation::SetStaticProperty {
                module,
                export: name,
                property,
                value,
            } => {
                let module = self.module(&module)?;
                statics(export(&module, &name)?)?.set(&property, value)?;
                Ok(JsonValue::Null)
            }
            TaskOperation::InvokeStaticMethod {
                module,
                export: name,
                method,
                args,
                ..
            } => {
                let module = self.module(&module)?;
                let method = statics(export(&module, &name)?)?.method(&method)?;
                method(CallArgs::with_channel(args, channel)).await
            }
            TaskOperation::InstantiateObject {
                module,
                export: name,
                args,
            } => {
                let module = self.module(&module)?;
                let object = match export(&module, &name)? {
                    Export::Class(class) => class.construct(args)?,
                    other => return Err(not_constructible(other)),
                };
                let kinds = member_kinds(object.as_ref());
                let object_id = self.next_object_id.fetch_add(1, Ordering::Relaxed);
                self.objects.lock().insert(object_id, object);
                debug!("Instantiated {} as object {}", name, object_id);
                Ok(json!([object_id, kinds]))
            }
            TaskOperation::GetInstanceProperty {
                object_id,
                property,
            } => self.object(object_id)?.get(&property),
            TaskOperation::SetInstanceProperty {
                object_id,
                property,
                value,
            } => {
                self.object(object_id)?.set(&property, value)?;
                Ok(JsonValue::Null)
            }
            TaskOperation::InvokeInstanceMethod {
                object_id,
                method,
                args,
                ..
            } => {
                let object = self.object(object_id)?;
                object
                    .invoke(&method, CallArgs::with_channel(args, channel))
                    .await
            }
            TaskOperation::DisposeObject { object_id } => {
                self.objects
                    .lock()
                    .remove(&object_id)
                    .ok_or_else(|| ErrorInfo::object_not_found(object_id))?;
                debug!("Disposed object {}", object_id);
                Ok(JsonValue::Null)
            }
        }
    }

    /// Load a module once per worker
    fn module(&self, src: &str) -> Result<Arc<Module>, ErrorInfo> {
        if let Some(module) = self.modules.lock().get(src) {
            return Ok(module.clone());
        }
        let module = Arc::new(self.loader.load(src)?);
        Ok(self
            .modules
            .lock()
            .entry(src.to_string())
            .or_insert(module)
            .clone())
    }

    fn object(&self, object_id: u64) -> Result<Arc<dyn RemoteObject>, ErrorInfo> {
        self.objects
            .lock()
            .get(&object_id)
            .cloned()
            .ok_or_else(|| ErrorInfo::object_not_found(object_id))
    }
}

fn export<'m>(module: &'m Module, name: &str) -> Result<&'m Export, ErrorInfo> {
    module.get(name).ok_or_else(|| {
        ErrorInfo::new(
            ErrorKind::ExportNotFound,
            format!("Module has no export named '{}'", name),
        )
    })
}

fn statics(export: &Export) -> Result<&StaticMembers, ErrorInfo> {
    export.statics().ok_or_else(|| not_accessible(export))
}

fn not_accessible(export: &Export) -> ErrorInfo {
    ErrorInfo::new(
        ErrorKind::NotAccessibleExport,
        format!(
            "Can't access an export of type '{}'. Only top level functions and classes are imported.",
            export.type_name()
        ),
    )
}

fn not_callable(export: &Export) -> ErrorInfo {
    match export {
        Export::Value(_) => not_accessible(export),
        _ => ErrorInfo::new(
            ErrorKind::NonFunctionLoad,
            format!("Can't invoke an export of type '{}'", export.type_name()),
        ),
    }
}

fn not_constructible(export: &Export) -> ErrorInfo {
    match export {
        Export::Value(_) => not_accessible(export),
        _ => ErrorInfo::new(
            ErrorKind::NonFunctionLoad,
            format!("Can't construct an export of type '{}'", export.type_name()),
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("Task panicked: {}", message)
    } else {
        "Task panicked".to_string()
    }
}
