use thiserror::Error;

// ---

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("server error: {0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("encode request: {0}")]
    Encode(String),

    #[error("request channel shut down")]
    Shutdown,

    #[error("request channel not installed")]
    NotInstalled,
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Encode(e.to_string())
    }
}

// ---

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload already started")]
    AlreadyStarted,

    #[error("invalid transfer id: {0:?}")]
    InvalidTransferId(String),

    #[error("resume offset {offset} is past the end of a {size} byte source")]
    InvalidOffset { offset: u64, size: u64 },

    #[error("block size must be positive")]
    InvalidBlockSize,

    #[error("no tokio runtime to run the upload on: {0}")]
    NoRuntime(String),

    #[error("upload failed: {0}")]
    Failed(String),
}
