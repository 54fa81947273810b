//! Error types for the avlink-stream crate.
//!
//! Device failures, timeouts and unparseable lines are not errors at this
//! level: they are logged and reported through callbacks. The types here cover
//! construction, configuration and the transport seam.

/// Errors raised while building or operating a session.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Timers and the frame pump need a tokio runtime
    #[error("No tokio runtime available; sessions must be created inside a runtime context")]
    NoRuntime,

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operator command that the diagnostic surface does not know
    #[error("Unknown diagnostic command: {0}")]
    UnknownDiagnostic(String),
}

/// Errors reported by a [`crate::Transport`] write.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link is down
    #[error("Transport not connected")]
    NotConnected,

    /// The underlying port or socket failed
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using StreamError.
pub type Result<T> = std::result::Result<T, StreamError>;
