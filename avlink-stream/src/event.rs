//! Session events.

use tokio::sync::mpsc;

/// Lifecycle and diagnostic notifications raised by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The device sent its welcome banner.
    SessionReady,

    /// The post-connect delay elapsed, or an initialized session lost its link.
    InitializedChanged { initialized: bool },

    /// A request got no response within the configured timeout.
    RequestTimedOut { command: String },

    /// Every live subscription was re-sent.
    SubscriptionsReasserted { count: usize },

    /// A complete line could not be parsed and was dropped.
    ParseFailed { line: String, error: String },
}

/// Sending half of the session event channel.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Send an event, ignoring a dropped receiver.
pub(crate) fn emit(sender: &EventSender, event: Event) {
    let _ = sender.send(event);
}
