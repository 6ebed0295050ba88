use thiserror::Error;

/// A serial frame that could not be turned into a `SensorMessage`.
///
/// Frame errors are absorbed by the codec: they are logged and counted,
/// never propagated past the read loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is not valid ASCII/UTF-8")]
    Encoding,

    #[error("frame has too few fields: expected {expected}, got {got}")]
    MissingFields { expected: usize, got: usize },

    #[error("field `{field}` is not a valid integer: {value:?}")]
    BadInteger { field: &'static str, value: String },

    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unrecognized type code {0:?}")]
    UnknownType(String),

    #[error("unterminated frame exceeded {0} bytes")]
    Oversize(usize),

    #[error("frame abandoned by a new start marker")]
    Truncated,

    #[error("empty identity label")]
    EmptyLabel,
}

impl FrameError {
    /// Length mismatches are protocol violations; they are handled exactly
    /// like any other malformed frame.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, FrameError::LengthMismatch { .. })
    }
}

/// Transport-level failure on either link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("failed to open {endpoint}: {reason}")]
    Open { endpoint: String, reason: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("link is not connected")]
    NotConnected,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("operation timed out")]
    Timeout,

    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

/// The sensor module did not carry out a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("sensor rejected {command}: {message}")]
    Rejected { command: String, message: String },

    #[error("no reply to {0} before the deadline")]
    Timeout(String),

    #[error("sensor link unavailable for {command}: {source}")]
    Link { command: String, source: LinkError },
}

/// Invalid argument for a sensor command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("user id contains reserved character {0:?}")]
    ReservedCharacter(char),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
