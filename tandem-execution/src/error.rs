//! Error types for the caller side

use std::time::Duration;
use thiserror::Error;

use tandem_config::ConfigError;
use tandem_ipc::{ErrorInfo, ErrorKind, IpcError};

/// Result type for caller-side operations
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Caller-side failures
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Thread has been terminated")]
    ThreadTerminated,

    #[error("Thread pool has been terminated")]
    ThreadPoolTerminated,

    #[error("Thread allocation timed out after {0:?}")]
    ThreadAllocationTimeout(Duration),

    #[error("No coroutine with id '{0}'")]
    CoroutineNotFound(u64),

    #[error("No object with id '{0}'")]
    ObjectNotFound(u64),

    #[error("Can't assign to method '{0}'")]
    MethodAssignment(String),

    #[error("Export '{0}' is neither a function nor a class")]
    NotAccessibleExport(String),

    #[error("Export '{0}' does not exist")]
    ExportNotFound(String),

    #[error("Member '{0}' does not exist")]
    MemberNotFound(String),

    #[error("Member '{0}' can't be accessed this way")]
    InvalidMemberAccess(String),

    #[error("A call accepts one channel, {0} were provided")]
    TooManyChannelsProvided(usize),

    #[error("Channel is already bound to coroutine '{0}'")]
    UsedChannelProvided(u64),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Failure reported by the other side of the worker boundary
    #[error("{0}")]
    Call(ErrorInfo),

    #[error("Failed to load module: {0}")]
    Load(ErrorInfo),

    #[error("Transport error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ExecutionError {
    /// Protocol error kind of this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::ThreadTerminated => ErrorKind::ThreadTerminated,
            ExecutionError::ThreadPoolTerminated => ErrorKind::ThreadPoolTerminated,
            ExecutionError::ThreadAllocationTimeout(_) => ErrorKind::ThreadAllocationTimeout,
            ExecutionError::CoroutineNotFound(_) => ErrorKind::CoroutineNotFound,
            ExecutionError::ObjectNotFound(_) => ErrorKind::ObjectNotFound,
            ExecutionError::MethodAssignment(_) => ErrorKind::MethodAssignment,
            ExecutionError::NotAccessibleExport(_) => ErrorKind::NotAccessibleExport,
            ExecutionError::ExportNotFound(_) => ErrorKind::ExportNotFound,
            ExecutionError::MemberNotFound(_) => ErrorKind::MemberNotFound,
            ExecutionError::InvalidMemberAccess(_) => ErrorKind::InvalidMemberAccess,
            ExecutionError::TooManyChannelsProvided(_) => ErrorKind::TooManyChannelsProvided,
            ExecutionError::UsedChannelProvided(_) => ErrorKind::UsedChannelProvided,
            ExecutionError::Internal(_) | ExecutionError::Config(_) => ErrorKind::InternalError,
            ExecutionError::Call(info) | ExecutionError::Load(info) => info.kind,
            ExecutionError::Ipc(err) => err.kind(),
        }
    }

    /// Serializable form, used where a failure has to be shared
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            ExecutionError::Call(info) | ExecutionError::Load(info) => info.clone(),
            other => ErrorInfo::new(other.kind(), other.to_string()),
        }
    }
}

impl From<ErrorInfo> for ExecutionError {
    fn from(info: ErrorInfo) -> Self {
        ExecutionError::Call(info)
    }
}
