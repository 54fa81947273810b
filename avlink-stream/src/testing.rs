//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};

use avlink_protocol::{Grammar, ParseError, Response, ResponseKind};
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::transport::Transport;

/// Records every write as text.
#[derive(Default)]
pub struct RecordingTransport {
    writes: Mutex<Vec<String>>,
    fail_writes: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Transport for RecordingTransport {
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.writes
            .lock()
            .push(String::from_utf8_lossy(bytes).into_owned());
        Ok(())
    }
}

/// `+OK [value]`, `-ERR message`, `! token value`.
pub struct StubGrammar;

impl Grammar for StubGrammar {
    fn parse(&self, line: &str) -> avlink_protocol::Result<Response> {
        let mut parts = line.splitn(3, ' ');
        match parts.next() {
            Some("+OK") => Ok(match parts.next() {
                Some(value) => Response::ok().with_value("value", value),
                None => Response::ok(),
            }
            .with_raw(line)),
            Some("-ERR") => Ok(Response::failure(
                ResponseKind::Error,
                line.trim_start_matches("-ERR").trim(),
            )
            .with_raw(line)),
            Some("!") => {
                let token = parts
                    .next()
                    .ok_or_else(|| ParseError::malformed(line, "missing token"))?;
                let value = parts.next().unwrap_or_default();
                Ok(Response::ok()
                    .with_token(token)
                    .with_value("value", value)
                    .with_raw(line))
            }
            _ => Err(ParseError::malformed(line, "unrecognized line")),
        }
    }

    fn banner(&self) -> Option<&str> {
        Some("Welcome")
    }
}
