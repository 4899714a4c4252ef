//! Worker transport abstractions
//!
//! The runtime never builds a worker primitive itself; a [`WorkerFactory`]
//! is injected and each [`Worker`] is driven purely through messages.

use std::sync::Arc;

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, ThreadMessage, IPC_PROTOCOL_VERSION};

/// Callback for messages coming out of a worker
pub type MessageHandler = Arc<dyn Fn(ThreadMessage) + Send + Sync>;

/// Callback for worker-level transport faults
pub type ErrorHandler = Arc<dyn Fn(IpcError) + Send + Sync>;

/// Anything that can carry a message to the other side of a worker boundary
pub trait MessageSink: Send + Sync {
    fn send(&self, message: ThreadMessage) -> Result<(), IpcError>;
}

/// One worker execution context
pub trait Worker: Send + Sync {
    /// Post a message to the worker
    fn post_message(&self, message: ThreadMessage) -> Result<(), IpcError>;

    /// Install the handler for messages posted by the worker
    fn on_message(&self, handler: MessageHandler);

    /// Install the handler for transport faults
    fn on_error(&self, handler: ErrorHandler);

    /// Stop the worker. Further posts fail with `ConnectionClosed`.
    fn terminate(&self);
}

/// Builds worker contexts for a host platform
pub trait WorkerFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Worker>, IpcError>;
}

/// Encode a message as one JSON line payload
pub fn encode_message(message: &ThreadMessage) -> Result<String, IpcError> {
    serde_json::to_string(&MessageEnvelope::new(message))
        .map_err(|e| IpcError::SerializationError(e.to_string()))
}

/// Decode a message and check protocol version compatibility
pub fn decode_message(line: &str) -> Result<ThreadMessage, IpcError> {
    let envelope: MessageEnvelope<ThreadMessage> = serde_json::from_str(line.trim_end())?;

    if !envelope.is_compatible() {
        return Err(IpcError::ProtocolVersionMismatch {
            expected: IPC_PROTOCOL_VERSION,
            actual: envelope.protocol_version,
        });
    }

    Ok(envelope.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_message() {
        let message = ThreadMessage::Task {
            coroutine_id: 12,
            kind: 9,
            operands: vec![json!(3)],
        };

        let line = encode_message(&message).unwrap();
        assert!(line.contains("\"protocol_version\":3"));
        assert_eq!(decode_message(&line).unwrap(), message);
    }

    #[test]
    fn test_version_mismatch() {
        let line = r#"{"protocol_version":1,"timestamp":"2024-01-01T00:00:00Z","message":[2,[1,null,5]]}"#;
        match decode_message(line) {
            Err(IpcError::ProtocolVersionMismatch { expected, actual }) => {
                assert_eq!(expected, IPC_PROTOCOL_VERSION);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            decode_message("not json"),
            Err(IpcError::DeserializationError(_))
        ));
    }
}
