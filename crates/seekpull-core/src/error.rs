use thiserror::Error;

pub type SeekpullResult<T> = Result<T, SeekpullError>;

#[derive(Debug, Error)]
pub enum SeekpullError {
    /// Malformed size or span parameters.
    #[error("config error: {0}")]
    Config(String),

    /// Network failure, or an unexpected status after retries were exhausted.
    /// `url` is always redacted.
    #[error("transport error for {url}: {message}")]
    Transport {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// Malformed Content-Range, multipart framing, or an empty request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A read returned fewer bytes than the region it was asked for.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    /// 401/403 persisted after the single refresh-and-retry.
    #[error("authorization failed for {url} (HTTP {status})")]
    Auth { url: String, status: u16 },

    /// Corrupt checkpoint, inflate failure, or a wrong decoded byte count.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("blob is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SeekpullError {
    pub fn decode(msg: impl Into<String>) -> Self {
        SeekpullError::Decode(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        SeekpullError::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SeekpullError::Config(msg.into())
    }

    /// HTTP status attached to a transport error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            SeekpullError::Transport { status, .. } => *status,
            SeekpullError::Auth { status, .. } => Some(*status),
            _ => None,
        }
    }
}
