use thiserror::Error;

/// Errors raised while turning a protocol line into a [`crate::Response`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line held nothing but whitespace
    #[error("Empty line")]
    Empty,

    /// The line did not follow the grammar
    ///
    /// The offending text is kept so the caller can log it verbatim.
    #[error("Malformed line {line:?}: {reason}")]
    Malformed { line: String, reason: String },
}

impl ParseError {
    /// Shorthand for a [`ParseError::Malformed`] error
    pub fn malformed(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            line: line.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for Results using ParseError
pub type Result<T> = std::result::Result<T, ParseError>;
