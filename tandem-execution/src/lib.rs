//! Tandem execution engine
//!
//! This crate is the caller side of the worker boundary: call correlation
//! ([`Coroutine`]), worker ownership ([`Thread`]), scheduling
//! ([`ThreadPool`]), remote object bookkeeping ([`ObjectRegistry`]) and the
//! proxies that make remote exports look local. [`Master`] ties them together.

pub mod coroutine;
pub mod error;
pub mod master;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod thread;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use coroutine::{next_coroutine_id, Coroutine};
pub use error::{ExecutionError, ExecutionResult};
pub use master::Master;
pub use pool::{ThreadPool, ThreadStats};
pub use proxy::{ModuleProxy, PendingWrite, PropertyValue, ThreadedFunction, ThreadedObject};
pub use registry::{ObjectRegistry, Registration, RegistrationToken};
pub use thread::{Thread, WeakThread};
