//! Wire protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt;

use crate::error::IpcError;

/// Protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 3;

/// Result of one remote operation or channel message
pub type CallResult = Result<JsonValue, ErrorInfo>;

/// Error taxonomy shared by both sides of a worker boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InternalError,
    InvalidMessageType,
    InvalidTaskKind,
    CoroutineNotFound,
    ObjectNotFound,
    ThreadAllocationTimeout,
    MethodAssignment,
    NonFunctionLoad,
    ThreadPoolTerminated,
    ThreadTerminated,
    NotAccessibleExport,
    ExportNotFound,
    ChannelNotFound,
    MessageNotFound,
    TooManyChannelsProvided,
    UsedChannelProvided,
    ModuleNotFound,
    MemberNotFound,
    InvalidMemberAccess,
    InvalidOperands,
    /// Raised by application code running inside a worker
    Application,
}

impl ErrorKind {
    /// Numeric code for this kind
    pub fn code(&self) -> u16 {
        match self {
            ErrorKind::InternalError => 500,
            ErrorKind::InvalidMessageType => 502,
            ErrorKind::InvalidTaskKind => 503,
            ErrorKind::CoroutineNotFound => 504,
            ErrorKind::ObjectNotFound => 505,
            ErrorKind::ThreadAllocationTimeout => 508,
            ErrorKind::MethodAssignment => 509,
            ErrorKind::NonFunctionLoad => 510,
            ErrorKind::ThreadPoolTerminated => 511,
            ErrorKind::ThreadTerminated => 512,
            ErrorKind::NotAccessibleExport => 513,
            ErrorKind::ExportNotFound => 514,
            ErrorKind::ChannelNotFound => 515,
            ErrorKind::MessageNotFound => 516,
            ErrorKind::TooManyChannelsProvided => 517,
            ErrorKind::UsedChannelProvided => 518,
            ErrorKind::ModuleNotFound => 519,
            ErrorKind::MemberNotFound => 520,
            ErrorKind::InvalidMemberAccess => 521,
            ErrorKind::InvalidOperands => 522,
            ErrorKind::Application => 600,
        }
    }

    /// Protocol-level lookup misses indicate a desync between the two sides
    pub fn is_lookup_miss(&self) -> bool {
        matches!(
            self,
            ErrorKind::CoroutineNotFound
                | ErrorKind::ObjectNotFound
                | ErrorKind::ChannelNotFound
                | ErrorKind::MessageNotFound
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = serde_json::to_value(self).ok();
        match value.as_ref().and_then(JsonValue::as_str) {
            Some(name) => f.write_str(name),
            None => write!(f, "{:?}", self),
        }
    }
}

/// Serializable error carried across the worker boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// An error raised by application code
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Application, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn invalid_task_kind(code: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::InvalidTaskKind,
            format!("Task kind '{}' is not supported", code),
        )
    }

    pub fn coroutine_not_found(coroutine_id: u64) -> Self {
        Self::new(
            ErrorKind::CoroutineNotFound,
            format!("No coroutine with id '{}'", coroutine_id),
        )
    }

    pub fn object_not_found(object_id: u64) -> Self {
        Self::new(
            ErrorKind::ObjectNotFound,
            format!("No object with id '{}'", object_id),
        )
    }

    pub fn channel_not_found(coroutine_id: u64) -> Self {
        Self::new(
            ErrorKind::ChannelNotFound,
            format!("No channel bound to coroutine '{}'", coroutine_id),
        )
    }

    pub fn message_not_found(message_id: u64) -> Self {
        Self::new(
            ErrorKind::MessageNotFound,
            format!("No pending channel message with id '{}'", message_id),
        )
    }

    pub fn method_assignment(name: &str) -> Self {
        Self::new(
            ErrorKind::MethodAssignment,
            format!("Can't assign to method '{}'", name),
        )
    }

    pub fn member_not_found(name: &str) -> Self {
        Self::new(
            ErrorKind::MemberNotFound,
            format!("Member '{}' does not exist", name),
        )
    }

    pub fn invalid_operands(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperands, message)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ErrorInfo {}

impl From<&str> for ErrorInfo {
    fn from(message: &str) -> Self {
        ErrorInfo::application(message)
    }
}

impl From<String> for ErrorInfo {
    fn from(message: String) -> Self {
        ErrorInfo::application(message)
    }
}

/// Whether a member of a remote object or export is callable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Data,
    Method,
}

/// Outer message type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadMessageType {
    Task = 1,
    TaskCompleted = 2,
    DirectMessage = 3,
    DirectMessageReplied = 4,
}

impl TryFrom<u8> for ThreadMessageType {
    type Error = IpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ThreadMessageType::Task),
            2 => Ok(ThreadMessageType::TaskCompleted),
            3 => Ok(ThreadMessageType::DirectMessage),
            4 => Ok(ThreadMessageType::DirectMessageReplied),
            other => Err(IpcError::InvalidMessageType(other)),
        }
    }
}

/// Messages exchanged between a thread and its worker.
///
/// On the wire every message is a two element array `[type, payload]`:
///
/// | type | payload |
/// |---|---|
/// | `Task` | `[coroutineId, taskKind, operands]` |
/// | `TaskCompleted` | `[coroutineId, error, result]` |
/// | `DirectMessage` | `[coroutineId, [messageId, name, data]]` |
/// | `DirectMessageReplied` | `[coroutineId, [messageId, error, result]]` |
///
/// `kind` on `Task` stays a raw code so the receiving side can reject an
/// unknown kind for that one coroutine instead of dropping the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireMessage", try_from = "WireMessage")]
pub enum ThreadMessage {
    Task {
        coroutine_id: u64,
        kind: u8,
        operands: Vec<JsonValue>,
    },
    TaskCompleted {
        coroutine_id: u64,
        result: CallResult,
    },
    DirectMessage {
        coroutine_id: u64,
        message_id: u64,
        name: String,
        data: Vec<JsonValue>,
    },
    DirectMessageReplied {
        coroutine_id: u64,
        message_id: u64,
        result: CallResult,
    },
}

impl ThreadMessage {
    pub fn message_type(&self) -> ThreadMessageType {
        match self {
            ThreadMessage::Task { .. } => ThreadMessageType::Task,
            ThreadMessage::TaskCompleted { .. } => ThreadMessageType::TaskCompleted,
            ThreadMessage::DirectMessage { .. } => ThreadMessageType::DirectMessage,
            ThreadMessage::DirectMessageReplied { .. } => ThreadMessageType::DirectMessageReplied,
        }
    }

    /// Coroutine this message is routed by
    pub fn coroutine_id(&self) -> u64 {
        match self {
            ThreadMessage::Task { coroutine_id, .. }
            | ThreadMessage::TaskCompleted { coroutine_id, .. }
            | ThreadMessage::DirectMessage { coroutine_id, .. }
            | ThreadMessage::DirectMessageReplied { coroutine_id, .. } => *coroutine_id,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireMessage(u8, JsonValue);

type ReplyPayload = (u64, Option<ErrorInfo>, Option<JsonValue>);

fn split_result(result: CallResult) -> (Option<ErrorInfo>, Option<JsonValue>) {
    match result {
        Ok(value) => (None, Some(value)),
        Err(error) => (Some(error), None),
    }
}

fn join_result(error: Option<ErrorInfo>, result: Option<JsonValue>) -> CallResult {
    match error {
        Some(error) => Err(error),
        None => Ok(result.unwrap_or(JsonValue::Null)),
    }
}

impl From<ThreadMessage> for WireMessage {
    fn from(message: ThreadMessage) -> Self {
        let message_type = message.message_type() as u8;
        let payload = match message {
            ThreadMessage::Task {
                coroutine_id,
                kind,
                operands,
            } => json!([coroutine_id, kind, operands]),
            ThreadMessage::TaskCompleted {
                coroutine_id,
                result,
            } => {
                let (error, result) = split_result(result);
                json!([coroutine_id, error, result])
            }
            ThreadMessage::DirectMessage {
                coroutine_id,
                message_id,
                name,
                data,
            } => json!([coroutine_id, [message_id, name, data]]),
            ThreadMessage::DirectMessageReplied {
                coroutine_id,
                message_id,
                result,
            } => {
                let (error, result) = split_result(result);
                json!([coroutine_id, [message_id, error, result]])
            }
        };
        WireMessage(message_type, payload)
    }
}

impl TryFrom<WireMessage> for ThreadMessage {
    type Error = IpcError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let WireMessage(message_type, payload) = wire;
        let message = match ThreadMessageType::try_from(message_type)? {
            ThreadMessageType::Task => {
                let (coroutine_id, kind, operands): (u64, u8, Vec<JsonValue>) =
                    serde_json::from_value(payload)?;
                ThreadMessage::Task {
                    coroutine_id,
                    kind,
                    operands,
                }
            }
            ThreadMessageType::TaskCompleted => {
                let (coroutine_id, error, result): ReplyPayload = serde_json::from_value(payload)?;
                ThreadMessage::TaskCompleted {
                    coroutine_id,
                    result: join_result(error, result),
                }
            }
            ThreadMessageType::DirectMessage => {
                let (coroutine_id, (message_id, name, data)): (u64, (u64, String, Vec<JsonValue>)) =
                    serde_json::from_value(payload)?;
                ThreadMessage::DirectMessage {
                    coroutine_id,
                    message_id,
                    name,
                    data,
                }
            }
            ThreadMessageType::DirectMessageReplied => {
                let (coroutine_id, (message_id, error, result)): (u64, ReplyPayload) =
                    serde_json::from_value(payload)?;
                ThreadMessage::DirectMessageReplied {
                    coroutine_id,
                    message_id,
                    result: join_result(error, result),
                }
            }
        };
        Ok(message)
    }
}

/// Message envelope for all worker communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}
