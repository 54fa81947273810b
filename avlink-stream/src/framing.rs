//! Line framing for inbound transport data.
//!
//! The [`FrameReader`] turns arbitrarily split transport chunks into complete
//! protocol lines. Out-of-band negotiation sequences (telnet IAC commands) are
//! split off before line scanning, and the device banner is turned into a
//! [`ReaderEvent::SessionReady`] signal instead of a frame.
//!
//! # Concurrency
//!
//! `feed` may be called from any thread. Two locks guard the reader: one
//! around the queue of received chunks and one around the parse loop. A caller
//! always queues its chunk first and then tries to take the parse lock; if
//! another thread is already parsing, that thread drains the new chunk too.
//! Chunks are therefore parsed strictly in the order they were queued and a
//! chunk never lands in the middle of a parse.
//!
//! Every emitted event is stamped with the reader's epoch, which `clear`
//! advances. Consumers drop events whose epoch is older than the reader's, so
//! lines that were already framed but not yet handled when the link dropped
//! never reach the next connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::FramingConfig;

/// Output of the frame reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// A complete line, delimiter stripped.
    Frame(String),
    /// A complete out-of-band negotiation sequence, marker included.
    Negotiation(Bytes),
    /// The device banner was received.
    SessionReady,
}

/// A reader event and the epoch it was framed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed {
    pub epoch: u64,
    pub event: ReaderEvent,
}

/// Splits transport chunks into frames, in arrival order.
pub struct FrameReader {
    config: FramingConfig,
    /// Chunks waiting for the parse loop.
    incoming: Mutex<VecDeque<Bytes>>,
    /// Unterminated tail of the stream, owned by the parse loop.
    remainder: Mutex<BytesMut>,
    epoch: AtomicU64,
    events: mpsc::UnboundedSender<Framed>,
}

impl FrameReader {
    pub fn new(config: FramingConfig, events: mpsc::UnboundedSender<Framed>) -> Self {
        Self {
            config,
            incoming: Mutex::new(VecDeque::new()),
            remainder: Mutex::new(BytesMut::new()),
            epoch: AtomicU64::new(0),
            events,
        }
    }

    /// Accept one raw chunk and emit every frame it completes.
    pub fn feed(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.incoming.lock().push_back(Bytes::copy_from_slice(chunk));

        loop {
            let Some(mut remainder) = self.remainder.try_lock() else {
                // The thread holding the parse lock will pick our chunk up.
                return;
            };

            loop {
                let next = self.incoming.lock().pop_front();
                let Some(chunk) = next else { break };
                remainder.extend_from_slice(&chunk);
                self.extract(&mut remainder);
            }
            drop(remainder);

            // A chunk queued between our last pop and the unlock would
            // otherwise sit there until the next feed.
            if self.incoming.lock().is_empty() {
                return;
            }
        }
    }

    /// Discard buffered data so nothing from a previous connection survives.
    ///
    /// Waits for a parse in progress to finish, so every event it emits keeps
    /// the old epoch.
    pub fn clear(&self) {
        let discarded = {
            let mut remainder = self.remainder.lock();
            self.incoming.lock().clear();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            let len = remainder.len();
            remainder.clear();
            len
        };
        if discarded > 0 {
            tracing::debug!(bytes = discarded, "Discarded partial line");
        }
    }

    /// Current epoch; events stamped with an older one are stale.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Snapshot of the unterminated tail.
    pub fn remainder(&self) -> Vec<u8> {
        self.remainder.lock().to_vec()
    }

    fn extract(&self, buffer: &mut BytesMut) {
        loop {
            if buffer.first() == Some(&self.config.negotiation_marker) {
                if buffer.len() < self.config.negotiation_len {
                    // Incomplete sequence; wait for the rest.
                    return;
                }
                let sequence = buffer.split_to(self.config.negotiation_len).freeze();
                self.emit(ReaderEvent::Negotiation(sequence));
                continue;
            }

            let Some(end) = buffer
                .iter()
                .position(|byte| self.config.delimiters.contains(byte))
            else {
                return;
            };

            let line = buffer.split_to(end);
            buffer.advance(1);
            self.complete_line(&line);
        }
    }

    fn complete_line(&self, line: &[u8]) {
        if line.is_empty() {
            return;
        }

        let text = String::from_utf8_lossy(line);
        if self.config.banner.as_deref() == Some(text.as_ref()) {
            tracing::debug!("Received device banner");
            self.emit(ReaderEvent::SessionReady);
            return;
        }

        tracing::trace!(frame = %text, "Frame completed");
        self.emit(ReaderEvent::Frame(text.into_owned()));
    }

    fn emit(&self, event: ReaderEvent) {
        let _ = self.events.send(Framed {
            epoch: self.epoch(),
            event,
        });
    }
}
