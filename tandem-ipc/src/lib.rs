//! Wire protocol for Tandem
//!
//! This crate provides the task encoding, the outer thread message protocol,
//! the nested channel sub-protocol and the worker transport abstractions used
//! between a caller and its worker contexts.

pub mod channel;
pub mod error;
pub mod protocol;
pub mod task;
pub mod transport;

// Re-export commonly used types
pub use channel::{Channel, ChannelHandler};
pub use error::IpcError;
pub use protocol::{
    CallResult, ErrorInfo, ErrorKind, MemberKind, MessageEnvelope, ThreadMessage,
    ThreadMessageType, IPC_PROTOCOL_VERSION,
};
pub use task::{Argument, Task, TaskKind, TaskOperation};
pub use transport::{
    decode_message, encode_message, ErrorHandler, MessageHandler, MessageSink, Worker,
    WorkerFactory,
};
