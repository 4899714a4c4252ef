//! Shared fixtures for the integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

use tandem_ipc::{
    ErrorHandler, ErrorInfo, IpcError, MessageHandler, TaskKind, ThreadMessage, Worker,
    WorkerFactory,
};
use tandem_runtime::{
    CallArgs, ClassExport, DynamicObject, Fields, Module, ModuleLoader, ModuleRegistry, Prototype,
    ThreadWorkerFactory,
};

pub const SAMPLE: &str = "sample";

/// Module registry holding the `sample` module used across the tests
pub fn sample_loader() -> Arc<dyn ModuleLoader> {
    let _ = tandem_logging::init_simple_tracing("warn");
    Arc::new(ModuleRegistry::new().with_module(SAMPLE, sample_module))
}

fn sample_module() -> Module {
    Module::new()
        .function("divide", |args: CallArgs| async move {
            let (a, b) = (args.f64(0)?, args.f64(1)?);
            if b == 0.0 {
                return Err(ErrorInfo::application("Division by zero"));
            }
            Ok::<_, ErrorInfo>(json!(a / b))
        })
        .function("echo", |args: CallArgs| async move {
            Ok::<_, ErrorInfo>(args.get(0).clone())
        })
        .function("slowEcho", |args: CallArgs| async move {
            tokio::time::sleep(Duration::from_millis(args.i64(1)? as u64)).await;
            Ok::<_, ErrorInfo>(args.get(0).clone())
        })
        .function("reactiveAdd", |args: CallArgs| async move {
            let channel = args.channel()?.clone();
            let mut sum = 0;
            for i in 0..=3 {
                let value = channel.post_message("next", vec![json!(i)]).await?;
                sum += value.as_i64().unwrap_or(0);
            }
            channel.post_message("done", vec![]).await?;
            Ok::<_, ErrorInfo>(json!(sum))
        })
        .export("Store", store_class())
        .export("Record", record_class())
        .value("VERSION", json!("1.0.0"))
}

/// Object with a single `data` field starting out as `[]`
fn store_class() -> ClassExport {
    let prototype = Arc::new(
        Prototype::new()
            .method("setData", |fields: Fields, args: CallArgs| async move {
                fields.set("data", args.get(0).clone());
                Ok::<_, ErrorInfo>(JsonValue::Null)
            })
            .method("getData", |fields: Fields, _args: CallArgs| async move {
                Ok::<_, ErrorInfo>(fields.get("data"))
            }),
    );
    ClassExport::new(move |args: Vec<JsonValue>| {
        let data = args.into_iter().next().unwrap_or_else(|| json!([]));
        Ok::<_, ErrorInfo>(DynamicObject::new(prototype.clone()).with_field("data", data))
    })
}

/// Object whose data fields are taken from the first constructor argument
fn record_class() -> ClassExport {
    let prototype = Arc::new(Prototype::new());
    ClassExport::new(move |args: Vec<JsonValue>| {
        let mut object = DynamicObject::new(prototype.clone());
        if let Some(JsonValue::Object(fields)) = args.into_iter().next() {
            for (name, value) in fields {
                object = object.with_field(name, value);
            }
        }
        Ok::<_, ErrorInfo>(object)
    })
}

/// Worker wrapper that records every message posted to it
struct RecordingWorker {
    inner: Box<dyn Worker>,
    posted: Arc<Mutex<Vec<ThreadMessage>>>,
}

impl Worker for RecordingWorker {
    fn post_message(&self, message: ThreadMessage) -> Result<(), IpcError> {
        self.posted.lock().push(message.clone());
        self.inner.post_message(message)
    }

    fn on_message(&self, handler: MessageHandler) {
        self.inner.on_message(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.inner.on_error(handler);
    }

    fn terminate(&self) {
        self.inner.terminate();
    }
}

/// OS-thread worker factory that keeps a log of posted messages
pub struct RecordingFactory {
    inner: ThreadWorkerFactory,
    posted: Arc<Mutex<Vec<ThreadMessage>>>,
}

impl RecordingFactory {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Arc<Self> {
        Arc::new(Self {
            inner: ThreadWorkerFactory::new(loader),
            posted: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Number of tasks of `kind` sent to any worker so far
    pub fn count_kind(&self, kind: TaskKind) -> usize {
        self.posted
            .lock()
            .iter()
            .filter(|message| {
                matches!(message, ThreadMessage::Task { kind: code, .. } if *code == kind.code())
            })
            .count()
    }
}

impl WorkerFactory for RecordingFactory {
    fn create(&self) -> Result<Box<dyn Worker>, IpcError> {
        Ok(Box::new(RecordingWorker {
            inner: self.inner.create()?,
            posted: self.posted.clone(),
        }))
    }
}
