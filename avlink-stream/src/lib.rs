//! # avlink-stream
//!
//! Request correlation and subscription management for AV devices driven over
//! a line-oriented text protocol.
//!
//! A [`Session`] sits between a byte transport (serial port, TCP socket) and
//! the application. It frames incoming bytes into lines, matches each reply to
//! the one request in flight, fans subscription feedback out to registered
//! callbacks, and keeps subscriptions alive across reconnects and on a fixed
//! re-assertion interval. The vendor command syntax stays outside this crate,
//! behind the [`Grammar`] and [`Request`] traits of `avlink-protocol`.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use avlink_stream::{Session, SessionConfig, SubscriptionKey, SubscriptionRequests, TextRequest};
//! # fn demo(transport: Arc<dyn avlink_stream::Transport>, grammar: Arc<dyn avlink_stream::Grammar>) -> avlink_stream::Result<()> {
//! let session = Session::new(transport, grammar, SessionConfig::default())?;
//!
//! let key = SubscriptionKey::new("Level1", "level", [1]);
//! let subscribe = TextRequest::new(format!("Level1 subscribe level 1 {}", key.token()));
//! session.subscribe(key, SubscriptionRequests::new(subscribe), |response, _| {
//!     println!("level is now {:?}", response.value("value"));
//! });
//!
//! // Driven by the transport:
//! session.on_connected();
//! session.on_data(b"+OK \"value\":-12.5\r\n");
//! # Ok(())
//! # }
//! ```

mod config;
mod diagnostics;
mod error;
mod event;
mod framing;
pub mod logging;
mod queue;
mod session;
mod subscription;
mod timer;
mod transport;

#[cfg(test)]
mod testing;

pub use config::{DeviceSettings, FramingConfig, SessionConfig, TELNET_IAC};
pub use diagnostics::DiagnosticCommand;
pub use error::{Result, StreamError, TransportError};
pub use event::{Event, EventSender};
pub use framing::{FrameReader, Framed, ReaderEvent};
pub use queue::{same_request, CommandQueue, Equality, Outcome, Resolution, ResponseCallback};
pub use session::{Session, SessionState};
pub use subscription::{
    FeedbackCallback, SubscriptionHandle, SubscriptionRegistry, SubscriptionRequests,
};
pub use timer::{spawn_interval, spawn_once, TimerHandle};
pub use transport::Transport;

pub use avlink_protocol::{
    Grammar, ParseError, Request, Response, ResponseKind, SubscriptionKey, TextRequest,
};
