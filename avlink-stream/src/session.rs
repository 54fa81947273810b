//! Per-device session: transport lifecycle, frame routing and timers.
//!
//! A [`Session`] ties the [`FrameReader`], [`CommandQueue`] and
//! [`SubscriptionRegistry`] of one device to the state of its link:
//!
//! ```text
//! Disconnected --on_connected--> Connected --init delay--> Initialized
//!      ^                             |                          |
//!      +-------on_disconnected-------+--------------------------+
//! ```
//!
//! Connecting arms two timers, both created fresh for that connect cycle: the
//! one-shot initialization delay, which absorbs login noise before the device
//! is considered ready, and the re-subscription interval. Timer callbacks carry
//! the cycle number they were armed in and do nothing once it is stale.
//!
//! State changes, the registry's online flag and the opening and closing of
//! the command queue move together under one lifecycle lock. Subscribe
//! requests re-sent on initialization are bound to the queue generation seen
//! under that lock, so a disconnect that lands first makes the queue refuse
//! them. The command queue is closed while disconnected and drops what it is
//! given.
//!
//! Every complete frame is parsed with the device [`Grammar`]. Feedback (a
//! response with a publish token) goes to the registry, everything else
//! resolves the request in flight. A line that fails to parse is logged and
//! dropped; it never stops the read loop.

use std::sync::{Arc, Weak};

use avlink_protocol::{Grammar, Request, Response, SubscriptionKey};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{SessionConfig, TELNET_IAC};
use crate::error::{Result, StreamError};
use crate::event::{emit, Event, EventSender};
use crate::framing::{FrameReader, Framed, ReaderEvent};
use crate::queue::{CommandQueue, Equality, ResponseCallback};
use crate::subscription::{FeedbackCallback, SubscriptionHandle, SubscriptionRegistry, SubscriptionRequests};
use crate::timer::{self, TimerHandle};
use crate::transport::Transport;

const TELNET_WILL: u8 = 251;
const TELNET_WONT: u8 = 252;
const TELNET_DO: u8 = 253;
const TELNET_DONT: u8 = 254;

/// Link state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connected,
    Initialized,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Initialized => "initialized",
        };
        f.write_str(name)
    }
}

struct Lifecycle {
    state: SessionState,
    /// Bumped on every connect and disconnect.
    cycle: u64,
    init_timer: Option<TimerHandle>,
    resubscribe_timer: Option<TimerHandle>,
    shut_down: bool,
}

/// Correlation and subscription engine for one device connection.
pub struct Session {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    grammar: Arc<dyn Grammar>,
    reader: FrameReader,
    queue: Arc<CommandQueue>,
    registry: SubscriptionRegistry,
    lifecycle: Mutex<Lifecycle>,
    events: EventSender,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
    me: Weak<Session>,
}

impl Session {
    /// Create a session in the `Disconnected` state.
    ///
    /// Must be called inside a tokio runtime; the session spawns a task that
    /// handles framed lines and uses the runtime for its timers.
    pub fn new(
        transport: Arc<dyn Transport>,
        grammar: Arc<dyn Grammar>,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| StreamError::NoRuntime)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (reader_tx, mut reader_rx) = mpsc::unbounded_channel::<Framed>();

        let mut framing = config.framing.clone();
        if framing.banner.is_none() {
            framing.banner = grammar.banner().map(str::to_owned);
        }

        let queue = CommandQueue::new(
            Arc::clone(&transport),
            Arc::clone(&grammar),
            config.response_timeout,
            event_tx.clone(),
        )?;
        queue.close();
        let registry = SubscriptionRegistry::new(Arc::clone(&queue));

        let session = Arc::new_cyclic(|me| Self {
            config,
            transport,
            grammar,
            reader: FrameReader::new(framing, reader_tx),
            queue,
            registry,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Disconnected,
                cycle: 0,
                init_timer: None,
                resubscribe_timer: None,
                shut_down: false,
            }),
            events: event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            pump: Mutex::new(None),
            runtime: runtime.clone(),
            me: me.clone(),
        });

        let weak = Arc::downgrade(&session);
        let pump = runtime.spawn(async move {
            while let Some(framed) = reader_rx.recv().await {
                let Some(session) = weak.upgrade() else { break };
                session.handle_framed(framed);
            }
            tracing::debug!("Frame pump stopped");
        });
        *session.pump.lock() = Some(pump);

        Ok(session)
    }

    /// Take the event receiver. Only the first call returns `Some`.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.event_rx.lock().take()
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == SessionState::Initialized
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// The transport came up.
    pub fn on_connected(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.shut_down {
            tracing::debug!("Ignoring connect after shutdown");
            return;
        }
        if lifecycle.state != SessionState::Disconnected {
            tracing::debug!(state = %lifecycle.state, "Ignoring duplicate connect");
            return;
        }

        lifecycle.cycle += 1;
        lifecycle.state = SessionState::Connected;
        self.queue.open();
        let cycle = lifecycle.cycle;

        let session = self.me.clone();
        lifecycle.init_timer = Some(timer::spawn_once(
            &self.runtime,
            self.config.init_delay,
            move || {
                if let Some(session) = session.upgrade() {
                    session.on_init_elapsed(cycle);
                }
            },
        ));

        let session = self.me.clone();
        lifecycle.resubscribe_timer = Some(timer::spawn_interval(
            &self.runtime,
            self.config.resubscribe_interval,
            move || {
                if let Some(session) = session.upgrade() {
                    session.on_resubscribe_tick(cycle);
                }
            },
        ));

        tracing::info!(cycle, "Connected");
    }

    /// The transport went down.
    ///
    /// Every queued and in-flight request is dropped without its callback and
    /// any partial line is discarded.
    pub fn on_disconnected(&self) {
        let (aborted, timers) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == SessionState::Disconnected {
                return;
            }
            self.go_offline(&mut lifecycle)
        };
        drop(timers);

        tracing::info!(aborted, "Disconnected");
    }

    /// Raw bytes arrived from the transport.
    pub fn on_data(&self, chunk: &[u8]) {
        self.reader.feed(chunk);
    }

    /// Send a request through the command queue.
    ///
    /// While disconnected the request is dropped without its callback.
    pub fn enqueue(&self, request: Arc<dyn Request>, callback: Option<ResponseCallback>) {
        self.queue.enqueue(request, callback);
    }

    /// Like [`Session::enqueue`] with a caller-supplied equality for coalescing.
    pub fn enqueue_with(
        &self,
        request: Arc<dyn Request>,
        callback: Option<ResponseCallback>,
        eq: Equality,
    ) {
        self.queue.enqueue_with(request, callback, eq);
    }

    /// Register for feedback on `key`.
    pub fn subscribe<F>(
        &self,
        key: SubscriptionKey,
        requests: SubscriptionRequests,
        callback: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&Response, &dyn Request) + Send + Sync + 'static,
    {
        let callback: FeedbackCallback = Arc::new(callback);
        self.registry.subscribe(key, requests, callback)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.registry.unsubscribe(handle)
    }

    /// Stop timers and the frame pump and take the session offline for good.
    ///
    /// Later calls to [`Session::on_connected`] are ignored.
    pub fn shutdown(&self) {
        let (aborted, timers) = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.shut_down = true;
            self.go_offline(&mut lifecycle)
        };
        drop(timers);

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        tracing::info!(aborted, "Session shut down");
    }

    /// Move to `Disconnected` while the lifecycle lock is held.
    ///
    /// Returns the number of aborted requests and the cycle's timers, which
    /// the caller drops after releasing the lock.
    fn go_offline(&self, lifecycle: &mut Lifecycle) -> (usize, [Option<TimerHandle>; 2]) {
        let was_initialized = lifecycle.state == SessionState::Initialized;
        lifecycle.state = SessionState::Disconnected;
        lifecycle.cycle += 1;

        self.registry.set_online(false);
        let aborted = self.queue.close();
        self.reader.clear();
        if was_initialized {
            emit(&self.events, Event::InitializedChanged { initialized: false });
        }

        let timers = [lifecycle.init_timer.take(), lifecycle.resubscribe_timer.take()];
        (aborted, timers)
    }

    fn on_init_elapsed(&self, cycle: u64) {
        let generation = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.cycle != cycle || lifecycle.state != SessionState::Connected {
                return;
            }
            lifecycle.state = SessionState::Initialized;
            self.registry.set_online(true);
            emit(&self.events, Event::InitializedChanged { initialized: true });
            self.queue.generation()
        };

        tracing::info!(cycle, "Initialized");
        self.reassert_in(generation);
    }

    fn on_resubscribe_tick(&self, cycle: u64) {
        let generation = {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.cycle != cycle || lifecycle.state != SessionState::Initialized {
                return;
            }
            self.queue.generation()
        };
        self.reassert_in(generation);
    }

    /// Re-send every live subscription unless the link dropped after
    /// `generation` was read.
    fn reassert_in(&self, generation: u64) {
        if let Some(count) = self.registry.reassert_in(generation) {
            emit(&self.events, Event::SubscriptionsReasserted { count });
        }
    }

    pub(crate) fn reassert_subscriptions(&self) -> usize {
        let count = self.registry.reassert_all();
        emit(&self.events, Event::SubscriptionsReasserted { count });
        count
    }

    fn handle_framed(&self, framed: Framed) {
        if framed.epoch != self.reader.epoch() {
            tracing::trace!("Dropping event framed before the last disconnect");
            return;
        }

        match framed.event {
            ReaderEvent::Frame(line) => self.handle_frame(&line),
            ReaderEvent::Negotiation(sequence) => self.refuse_negotiation(&sequence),
            ReaderEvent::SessionReady => {
                tracing::info!("Device banner received");
                emit(&self.events, Event::SessionReady);
            }
        }
    }

    fn handle_frame(&self, line: &str) {
        let response = match self.grammar.parse(line) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(line, error = %e, "Dropping unparseable frame");
                emit(
                    &self.events,
                    Event::ParseFailed {
                        line: line.to_string(),
                        error: e.to_string(),
                    },
                );
                return;
            }
        };

        match response.publish_token.clone() {
            Some(token) => {
                // A token nobody owns is late feedback for a key that was just
                // unsubscribed. Handing it to the queue would resolve whatever
                // command is in flight with an unrelated value, so it is
                // dropped instead.
                if self.registry.dispatch(&token, &response) == 0 {
                    tracing::debug!(token, "Dropping feedback for unknown subscription");
                }
            }
            None => {
                self.queue.resolve(response);
            }
        }
    }

    /// Answer telnet option negotiation by refusing every option.
    fn refuse_negotiation(&self, sequence: &[u8]) {
        let &[TELNET_IAC, verb, option] = sequence else {
            tracing::trace!(?sequence, "Ignoring negotiation sequence");
            return;
        };
        let reply = match verb {
            TELNET_DO => TELNET_WONT,
            TELNET_WILL => TELNET_DONT,
            _ => return,
        };

        tracing::debug!(verb, option, "Refusing telnet option");
        if let Err(e) = self.transport.write(&[TELNET_IAC, reply, option]) {
            tracing::warn!(error = %e, "Failed to answer telnet negotiation");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::debug!(
            subscriptions = self.registry.len(),
            pending = self.queue.len(),
            "Session dropping"
        );
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}
