//! The vendor grammar seam

use crate::error::Result;
use crate::response::Response;

/// Text every supported device uses when re-subscribing an active stream
const ALREADY_SUBSCRIBED: &str = "already subscribed";

/// A vendor-specific command grammar
///
/// Implementations turn complete protocol lines (delimiters already stripped)
/// into [`Response`]s and describe the connection banner and line terminator.
/// Grammars are shared between the transport read path and caller threads, so
/// they must be `Send + Sync`.
pub trait Grammar: Send + Sync {
    /// Parse one line into a response.
    fn parse(&self, line: &str) -> Result<Response>;

    /// The exact line a device sends once it is ready to accept commands.
    fn banner(&self) -> Option<&str> {
        None
    }

    /// Terminator appended to every serialized request.
    fn line_terminator(&self) -> &str {
        "\n"
    }

    /// Whether a failure response is expected noise rather than a real fault.
    ///
    /// Re-asserting a subscription that is still active makes most devices
    /// answer with an "already subscribed" error, which is harmless.
    fn is_benign_error(&self, response: &Response) -> bool {
        response.is_failure()
            && response
                .message
                .as_deref()
                .is_some_and(|message| message.to_ascii_lowercase().contains(ALREADY_SUBSCRIBED))
    }
}
