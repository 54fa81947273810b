//! Operator commands for inspecting and nudging a live session.

use std::fmt;
use std::str::FromStr;

use crate::error::StreamError;
use crate::session::Session;

/// A command typed by an operator at a maintenance console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticCommand {
    /// Re-send every live subscription now
    Resubscribe,
    /// Drop all pending requests
    ClearQueue,
    /// Report state, queue depth and subscription count
    Status,
}

impl FromStr for DiagnosticCommand {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resubscribe" => Ok(Self::Resubscribe),
            "clearqueue" | "clear" => Ok(Self::ClearQueue),
            "status" => Ok(Self::Status),
            other => Err(StreamError::UnknownDiagnostic(other.to_string())),
        }
    }
}

impl fmt::Display for DiagnosticCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resubscribe => "resubscribe",
            Self::ClearQueue => "clearqueue",
            Self::Status => "status",
        };
        f.write_str(name)
    }
}

impl Session {
    /// Run an operator command and return a one-line report.
    pub fn run_diagnostic(&self, command: DiagnosticCommand) -> String {
        tracing::info!(%command, "Running diagnostic command");
        match command {
            DiagnosticCommand::Resubscribe => {
                let count = self.reassert_subscriptions();
                format!("re-asserted {count} subscription(s)")
            }
            DiagnosticCommand::ClearQueue => {
                let count = self.queue().clear();
                format!("cleared {count} pending request(s)")
            }
            DiagnosticCommand::Status => {
                let queue = self.queue();
                format!(
                    "state={} pending={} in_flight={} subscriptions={}",
                    self.state(),
                    queue.len(),
                    queue.in_flight().as_deref().unwrap_or("-"),
                    self.registry().len(),
                )
            }
        }
    }
}
