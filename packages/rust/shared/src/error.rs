//! Error types for cardpipe.
//!
//! Library crates use [`CardpipeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all cardpipe operations.
#[derive(Debug, thiserror::Error)]
pub enum CardpipeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Connection refused, timeout, or other transport failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The remote service answered with a non-success status.
    #[error("service error (HTTP {status}): {message}")]
    Service { status: u16, message: String },

    /// The generated payload is not valid JSON.
    #[error("parse error: {message}")]
    Parse {
        message: String,
        /// Length in characters of the cleaned payload that failed to parse.
        payload_len: usize,
    },

    /// The generated payload parsed, but is not a JSON array.
    #[error("shape error: expected a JSON array, got {found}")]
    Shape { found: String },

    /// The generated payload is an empty JSON array.
    #[error("empty payload: the response contained no items")]
    EmptyPayload,

    /// One or more returned items do not conform to the mode's schema.
    #[error("schema error: {message}")]
    Schema {
        message: String,
        /// Number of items the response contained.
        item_count: usize,
    },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The source collection is malformed (not a JSON array, bad JSON, ...).
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// The flashcard store reported an error in its response envelope.
    #[error("bridge error: {0}")]
    Bridge(String),

    /// Anything the taxonomy above does not cover.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CardpipeError>;

/// Flat tag for each [`CardpipeError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Transport,
    Service,
    Parse,
    Shape,
    EmptyPayload,
    Schema,
    FileSystem,
    InvalidInput,
    Bridge,
    Unexpected,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::Config,
        ErrorKind::Transport,
        ErrorKind::Service,
        ErrorKind::Parse,
        ErrorKind::Shape,
        ErrorKind::EmptyPayload,
        ErrorKind::Schema,
        ErrorKind::FileSystem,
        ErrorKind::InvalidInput,
        ErrorKind::Bridge,
        ErrorKind::Unexpected,
    ];
}

impl CardpipeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a transport error from any displayable message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    /// Create a service error for the given HTTP status.
    pub fn service(status: u16, msg: impl Into<String>) -> Self {
        Self::Service {
            status,
            message: msg.into(),
        }
    }

    /// Create an invalid-input error from any displayable message.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The taxonomy tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Service { .. } => ErrorKind::Service,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Shape { .. } => ErrorKind::Shape,
            Self::EmptyPayload => ErrorKind::EmptyPayload,
            Self::Schema { .. } => ErrorKind::Schema,
            Self::Io { .. } => ErrorKind::FileSystem,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Bridge(_) => ErrorKind::Bridge,
            Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CardpipeError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = CardpipeError::service(503, "overloaded");
        assert_eq!(err.to_string(), "service error (HTTP 503): overloaded");

        let err = CardpipeError::Shape {
            found: "object".into(),
        };
        assert!(err.to_string().contains("got object"));
    }

    #[test]
    fn io_errors_report_filesystem_kind() {
        let err = CardpipeError::io(
            "/tmp/missing.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.kind(), ErrorKind::FileSystem);
        assert!(err.to_string().contains("missing.json"));
    }
}
