//! Request/response correlation over a single text channel.
//!
//! Line protocols answer one command at a time and never echo a request
//! identifier, so the only reliable correlation is order: the [`CommandQueue`]
//! keeps at most one request in flight and matches every non-feedback response
//! to it. Requests wait in FIFO order behind the in-flight one.
//!
//! Equal requests (per the [`Request`] equality contract, or a caller-supplied
//! comparison) are coalesced: a second enqueue of a request that is already
//! waiting or in flight only attaches its callback, so one physical write
//! serves every caller. Coalesced callbacks share the single timeout clock of
//! that write.
//!
//! Device failures, timeouts and transport write errors are logged and
//! reported through callbacks; nothing here returns an error to the caller.
//!
//! A queue can be closed while its link is down. A closed queue is empty and
//! drops whatever it is handed. Every close starts a new generation, so work
//! prepared for an earlier link can be refused after the queue reopens.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use avlink_protocol::{Grammar, Request, Response};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::error::{Result, StreamError};
use crate::event::{emit, Event, EventSender};
use crate::timer::{self, TimerHandle};
use crate::transport::Transport;

/// What a request callback is told about its request.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The correlated response; failures arrive here too, classified.
    Response(Arc<Response>),
    /// No response arrived within the response timeout.
    TimedOut,
}

impl Outcome {
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Response(response) => Some(response),
            Self::TimedOut => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Invoked once with the outcome and the request it belongs to.
pub type ResponseCallback = Box<dyn FnOnce(&Outcome, &Arc<dyn Request>) + Send>;

/// Decides whether two requests are the same request.
pub type Equality = fn(&dyn Request, &dyn Request) -> bool;

/// Default equality: the request's own contract.
pub fn same_request(existing: &dyn Request, incoming: &dyn Request) -> bool {
    existing.same_request(incoming)
}

/// Result of handing a response to [`CommandQueue::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The in-flight request was resolved and this many callbacks ran.
    Resolved { callbacks: usize },
    /// The in-flight request was acknowledged by a response with no content.
    Inert,
    /// Nothing was in flight; the response was dropped.
    Unmatched,
}

struct PendingEntry {
    id: u64,
    request: Arc<dyn Request>,
    wire: String,
    callbacks: Vec<ResponseCallback>,
    enqueued_at: Instant,
}

struct InFlight {
    entry: PendingEntry,
    sent_at: Instant,
    timeout: TimerHandle,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<PendingEntry>,
    in_flight: Option<InFlight>,
    next_id: u64,
    open: bool,
    /// Bumped on every close.
    generation: u64,
}

impl QueueState {
    fn find_equal(&mut self, request: &dyn Request, eq: Equality) -> Option<&mut PendingEntry> {
        if let Some(in_flight) = self.in_flight.as_mut() {
            if eq(in_flight.entry.request.as_ref(), request) {
                return Some(&mut in_flight.entry);
            }
        }
        self.waiting
            .iter_mut()
            .find(|entry| eq(entry.request.as_ref(), request))
    }

    fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.in_flight.is_some())
    }
}

/// Owns the outbound channel to one device and correlates its replies.
pub struct CommandQueue {
    transport: Arc<dyn Transport>,
    grammar: Arc<dyn Grammar>,
    response_timeout: Duration,
    runtime: Handle,
    events: EventSender,
    state: Mutex<QueueState>,
    me: Weak<CommandQueue>,
}

impl CommandQueue {
    /// Create a queue. Must be called inside a tokio runtime, which drives
    /// the response timeouts.
    pub fn new(
        transport: Arc<dyn Transport>,
        grammar: Arc<dyn Grammar>,
        response_timeout: Duration,
        events: EventSender,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| StreamError::NoRuntime)?;

        Ok(Arc::new_cyclic(|me| Self {
            transport,
            grammar,
            response_timeout,
            runtime,
            events,
            state: Mutex::new(QueueState {
                open: true,
                ..QueueState::default()
            }),
            me: me.clone(),
        }))
    }

    /// Enqueue a request using its own equality contract.
    pub fn enqueue(&self, request: Arc<dyn Request>, callback: Option<ResponseCallback>) {
        self.enqueue_with(request, callback, same_request);
    }

    /// Enqueue a request, coalescing with any queued or in-flight request
    /// that `eq` considers the same.
    pub fn enqueue_with(
        &self,
        request: Arc<dyn Request>,
        callback: Option<ResponseCallback>,
        eq: Equality,
    ) {
        self.submit(request, callback, eq, None);
    }

    /// Enqueue unless the queue is closed or, when `generation` is given, has
    /// been closed since that generation was read. Returns whether the request
    /// was accepted; a refused request is dropped without its callback.
    pub(crate) fn submit(
        &self,
        request: Arc<dyn Request>,
        callback: Option<ResponseCallback>,
        eq: Equality,
        generation: Option<u64>,
    ) -> bool {
        let to_send = {
            let mut state = self.state.lock();

            if !state.open || generation.is_some_and(|g| g != state.generation) {
                drop(state);
                tracing::debug!(command = %request.to_wire(), "Dropping request for a closed link");
                return false;
            }

            if let Some(existing) = state.find_equal(request.as_ref(), eq) {
                tracing::debug!(command = %existing.wire, "Coalesced with pending request");
                existing.callbacks.extend(callback);
                return true;
            }

            let id = state.next_id;
            state.next_id += 1;
            state.waiting.push_back(PendingEntry {
                id,
                wire: request.to_wire(),
                request,
                callbacks: callback.into_iter().collect(),
                enqueued_at: Instant::now(),
            });

            self.promote(&mut state)
        };

        if let Some(wire) = to_send {
            self.write(&wire);
        }
        true
    }

    /// Correlate a response with the request in flight.
    ///
    /// Failure classifications still resolve the request so the queue keeps
    /// moving; they are logged unless the grammar marks them benign.
    pub fn resolve(&self, response: Response) -> Resolution {
        let (entry, sent_at, next) = {
            let mut state = self.state.lock();
            let Some(InFlight {
                entry,
                sent_at,
                mut timeout,
            }) = state.in_flight.take()
            else {
                drop(state);
                tracing::debug!(line = %response.raw, "Dropping response with nothing in flight");
                return Resolution::Unmatched;
            };
            timeout.stop();
            let next = self.promote(&mut state);
            (entry, sent_at, next)
        };

        if let Some(wire) = next {
            self.write(&wire);
        }

        if response.is_failure() {
            if self.grammar.is_benign_error(&response) {
                tracing::debug!(command = %entry.wire, "Device reports subscription already active");
            } else {
                tracing::warn!(
                    command = %entry.wire,
                    kind = %response.kind,
                    message = response.message().unwrap_or(""),
                    "Device rejected command"
                );
            }
        } else {
            tracing::debug!(
                command = %entry.wire,
                round_trip_ms = sent_at.elapsed().as_millis() as u64,
                queued_ms = (sent_at - entry.enqueued_at).as_millis() as u64,
                "Command resolved"
            );
        }

        if response.is_inert() {
            return Resolution::Inert;
        }

        let outcome = Outcome::Response(Arc::new(response));
        let callbacks = entry.callbacks.len();
        for callback in entry.callbacks {
            callback(&outcome, &entry.request);
        }
        Resolution::Resolved { callbacks }
    }

    /// Abort every queued and in-flight request without running callbacks.
    ///
    /// Returns the number of requests dropped.
    pub fn clear(&self) -> usize {
        let (waiting, in_flight) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.waiting), state.in_flight.take())
        };
        Self::abort(waiting, in_flight)
    }

    /// Clear the queue and refuse requests until [`CommandQueue::open`].
    ///
    /// Returns the number of requests dropped.
    pub fn close(&self) -> usize {
        let (waiting, in_flight) = {
            let mut state = self.state.lock();
            state.open = false;
            state.generation += 1;
            (std::mem::take(&mut state.waiting), state.in_flight.take())
        };
        Self::abort(waiting, in_flight)
    }

    /// Accept requests again. A closed queue is empty, so nothing is sent.
    pub fn open(&self) {
        self.state.lock().open = true;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Current generation; it changes on every [`CommandQueue::close`].
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn abort(aborted: VecDeque<PendingEntry>, in_flight: Option<InFlight>) -> usize {
        let count = aborted.len() + usize::from(in_flight.is_some());
        if let Some(mut in_flight) = in_flight {
            in_flight.timeout.stop();
        }
        if count > 0 {
            tracing::info!(count, "Cleared command queue");
        }
        count
    }

    /// Number of waiting plus in-flight requests.
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wire text of the request in flight, if any.
    pub fn in_flight(&self) -> Option<String> {
        self.state
            .lock()
            .in_flight
            .as_ref()
            .map(|in_flight| in_flight.entry.wire.clone())
    }

    /// Move the head of the queue in flight when the channel is idle.
    ///
    /// Arms the timeout and returns the text to write; the caller writes it
    /// after releasing the lock.
    fn promote(&self, state: &mut QueueState) -> Option<String> {
        if state.in_flight.is_some() {
            return None;
        }
        let entry = state.waiting.pop_front()?;

        let id = entry.id;
        let queue = self.me.clone();
        let timeout = timer::spawn_once(&self.runtime, self.response_timeout, move || {
            if let Some(queue) = queue.upgrade() {
                queue.expire(id);
            }
        });

        let wire = entry.wire.clone();
        state.in_flight = Some(InFlight {
            entry,
            sent_at: Instant::now(),
            timeout,
        });
        Some(wire)
    }

    fn expire(&self, id: u64) {
        let (entry, next) = {
            let mut state = self.state.lock();
            match state.in_flight.as_ref() {
                Some(in_flight) if in_flight.entry.id == id => {}
                // Resolved or cleared while the timer was firing.
                _ => return,
            }
            let Some(InFlight { entry, timeout, .. }) = state.in_flight.take() else {
                return;
            };
            // This runs on the timer's own task; releasing the handle just
            // lets the task finish.
            drop(timeout);
            let next = self.promote(&mut state);
            (entry, next)
        };

        tracing::warn!(
            command = %entry.wire,
            timeout_ms = self.response_timeout.as_millis() as u64,
            "Command timed out"
        );
        emit(
            &self.events,
            Event::RequestTimedOut {
                command: entry.wire.clone(),
            },
        );

        if let Some(wire) = next {
            self.write(&wire);
        }

        for callback in entry.callbacks {
            callback(&Outcome::TimedOut, &entry.request);
        }
    }

    fn write(&self, wire: &str) {
        let mut line = String::with_capacity(wire.len() + 2);
        line.push_str(wire);
        line.push_str(self.grammar.line_terminator());

        tracing::debug!(command = %wire, "Sending command");
        if let Err(e) = self.transport.write(line.as_bytes()) {
            // The request stays in flight and will time out.
            tracing::warn!(command = %wire, error = %e, "Failed to write command");
        }
    }
}
