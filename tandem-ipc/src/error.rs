//! IPC error types

use thiserror::Error;

use crate::protocol::{ErrorInfo, ErrorKind};

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// The other end went away
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// Unknown outer message type
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    /// Invalid message format
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// The worker primitive could not be started
    #[error("Failed to create worker: {0}")]
    WorkerCreation(String),

    /// The worker reported a transport fault
    #[error("Worker fault: {0}")]
    WorkerFault(String),
}

impl IpcError {
    /// Check if this error indicates a fatal condition for the connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::ProtocolVersionMismatch { .. }
                | IpcError::ConnectionClosed
                | IpcError::WorkerFault(_)
        )
    }

    /// Protocol error kind this transport failure maps to
    pub fn kind(&self) -> ErrorKind {
        match self {
            IpcError::InvalidMessageType(_) => ErrorKind::InvalidMessageType,
            _ => ErrorKind::InternalError,
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}

impl From<IpcError> for ErrorInfo {
    fn from(err: IpcError) -> Self {
        ErrorInfo::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatal() {
        assert!(IpcError::ProtocolVersionMismatch { expected: 1, actual: 2 }.is_fatal());
        assert!(IpcError::ConnectionClosed.is_fatal());
        assert!(!IpcError::InvalidMessage("bad format".to_string()).is_fatal());
        assert!(!IpcError::InvalidMessageType(9).is_fatal());
    }

    #[test]
    fn test_error_info_conversion() {
        let info: ErrorInfo = IpcError::InvalidMessageType(42).into();
        assert_eq!(info.kind, ErrorKind::InvalidMessageType);
        assert_eq!(info.message, "Invalid message type: 42");

        let info: ErrorInfo = IpcError::ConnectionClosed.into();
        assert_eq!(info.kind, ErrorKind::InternalError);
    }

    #[test]
    fn test_from_serde_json() {
        let err = serde_json::from_str::<u64>("\"not a number\"").unwrap_err();
        assert!(matches!(IpcError::from(err), IpcError::DeserializationError(_)));
    }
}
