//! Worker-side runtime for Tandem
//!
//! This crate provides the module model exposed to remote callers, the
//! module loading boundary, the task dispatcher and the local worker hosts.

pub mod loader;
pub mod manager;
pub mod module;
pub mod worker;

// Re-export commonly used types
pub use loader::{ModuleFactory, ModuleLoader, ModuleRegistry};
pub use manager::WorkerManager;
pub use module::{
    handler, member_kinds, CallArgs, ClassExport, Constructor, DynamicObject, Export,
    ExportShape, Fields, FunctionExport, FunctionHandler, MethodHandler, Module, ModuleShape,
    Prototype, RemoteObject, StaticMembers,
};
pub use worker::{run_worker, InlineWorkerFactory, LocalWorker, ThreadWorkerFactory};
