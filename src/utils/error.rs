use crate::distributed::tracker::Handle;
use thiserror::Error;

/// A failed call into the underlying collective or device library.
///
/// `code` and `message` are surfaced verbatim from the library.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{library} error {code}: {message}")]
pub struct NativeError {
    pub library: &'static str,
    pub code: i32,
    pub message: String,
}

impl NativeError {
    pub fn new(library: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            library,
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum CommError {
    #[error("Communicator init failed: {0}")]
    Init(NativeError),

    #[error("Communicator split failed: {0}")]
    Split(NativeError),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Collective {op} failed: {source}")]
    Collective {
        op: &'static str,
        #[source]
        source: NativeError,
    },

    #[error("Device error: {0}")]
    Device(NativeError),

    #[error("Unknown resource handle: {0}")]
    NotFound(Handle),

    #[error("Resource handle already tracked: {0}")]
    AlreadyTracked(Handle),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CommError {
    /// Numeric code reported through the host error channel.
    ///
    /// Native failures keep the library's own code; everything else is `-1`.
    pub fn code(&self) -> i32 {
        match self {
            CommError::Init(e) | CommError::Split(e) | CommError::Device(e) => e.code,
            CommError::Collective { source, .. } => source.code,
            _ => -1,
        }
    }

    pub fn collective(op: &'static str, source: NativeError) -> Self {
        CommError::Collective { op, source }
    }
}

pub type Result<T> = std::result::Result<T, CommError>;
