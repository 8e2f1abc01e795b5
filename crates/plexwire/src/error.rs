//! # Error Definitions
//!
//! Failures raised while framing, encoding or decoding messages.

/// Wire-level failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A frame declared (or would need) more bytes than the configured limit.
    FrameTooLarge { len: usize, max: usize },
    /// The frame body was not valid JSON, or did not match the message schema.
    Json(String),
    /// A tagged bytes value carried an invalid base64 payload.
    InvalidBase64(String),
    /// A `__t` tag was present but its companion fields were missing or mistyped.
    InvalidTag(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {} bytes exceeds the {} byte limit", len, max)
            }
            Self::Json(msg) => write!(f, "malformed frame body: {}", msg),
            Self::InvalidBase64(msg) => write!(f, "invalid base64 in bytes value: {}", msg),
            Self::InvalidTag(msg) => write!(f, "invalid tagged value: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Self::InvalidBase64(e.to_string())
    }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
