//! Outbound requests and their equality contract

use std::fmt::Debug;

/// A command that can be written to a device
///
/// Requests are immutable once handed to a command queue. Two requests are the
/// same request when their serialized intent matches, independent of object
/// identity; the command queue relies on this to coalesce duplicate queries
/// issued by independent controls.
pub trait Request: Send + Sync + Debug {
    /// Serialize the request to wire text, without the line terminator.
    fn to_wire(&self) -> String;

    /// Equality contract used for coalescing.
    ///
    /// The default compares the serialized text. Grammars whose commands carry
    /// volatile parts (sequence numbers, timestamps) should override this.
    fn same_request(&self, other: &dyn Request) -> bool {
        self.to_wire() == other.to_wire()
    }
}

/// A request that is nothing more than a command line
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextRequest(String);

impl TextRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self(command.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Request for TextRequest {
    fn to_wire(&self) -> String {
        self.0.clone()
    }
}

impl From<&str> for TextRequest {
    fn from(command: &str) -> Self {
        Self::new(command)
    }
}

impl From<String> for TextRequest {
    fn from(command: String) -> Self {
        Self(command)
    }
}

impl std::fmt::Display for TextRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
