//! Protocol model for line-oriented AV control devices
//!
//! DSP mixers, AV receivers and conferencing cores are usually driven over a
//! text protocol: one command per line, one reply per command, plus unsolicited
//! feedback lines for attributes the client subscribed to. Every vendor grammar
//! is different, but the engine in `avlink-stream` only needs their shape:
//!
//! - a [`Request`] that can be serialized to wire text and compared for equality
//! - a [`Response`] parsed from one line, with a [`ResponseKind`], named values
//!   and an optional publish token
//! - a [`SubscriptionKey`] identifying one feedback stream, which derives the
//!   publish token the device echoes back
//! - a [`Grammar`] that turns lines into responses
//!
//! ```rust
//! use avlink_protocol::{Request, SubscriptionKey, TextRequest};
//!
//! let key = SubscriptionKey::new("Level1", "level", [1]);
//! let request = TextRequest::new(format!("Level1 subscribe level 1 {}", key.token()));
//! assert!(request.same_request(&TextRequest::new(request.to_wire())));
//! ```

pub mod error;
pub mod grammar;
pub mod request;
pub mod response;
pub mod subscription;

pub use error::{ParseError, Result};
pub use grammar::Grammar;
pub use request::{Request, TextRequest};
pub use response::{Response, ResponseKind};
pub use subscription::SubscriptionKey;
