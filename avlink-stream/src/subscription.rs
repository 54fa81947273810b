//! Subscription registry with handle-based unsubscription.
//!
//! Every feedback stream is identified by a [`SubscriptionKey`]. Any number of
//! independent callers can subscribe to the same key; the device is only asked
//! once, on the first registration, and told to stop when the last one leaves.
//!
//! Devices forget subscriptions (after a timeout, across a reboot the client
//! never sees), so the session periodically calls
//! [`SubscriptionRegistry::reassert_all`], which blindly re-sends the subscribe
//! request of every live key. Re-subscribing an active stream is harmless; the
//! resulting "already subscribed" error is treated as benign by the queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use avlink_protocol::{Request, Response, SubscriptionKey};
use parking_lot::Mutex;

use crate::queue::{same_request, CommandQueue};

/// Invoked with each feedback response and the subscribe request it answers.
pub type FeedbackCallback = Arc<dyn Fn(&Response, &dyn Request) + Send + Sync>;

/// The commands that start and stop one feedback stream.
#[derive(Debug, Clone)]
pub struct SubscriptionRequests {
    pub subscribe: Arc<dyn Request>,
    pub unsubscribe: Option<Arc<dyn Request>>,
}

impl SubscriptionRequests {
    pub fn new(subscribe: impl Request + 'static) -> Self {
        Self {
            subscribe: Arc::new(subscribe),
            unsubscribe: None,
        }
    }

    pub fn with_unsubscribe(mut self, unsubscribe: impl Request + 'static) -> Self {
        self.unsubscribe = Some(Arc::new(unsubscribe));
        self
    }
}

/// Identifies one registration; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    key: SubscriptionKey,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }
}

struct Registration {
    id: u64,
    callback: FeedbackCallback,
    requests: SubscriptionRequests,
}

/// All registrations for one key, in registration order.
struct SubscriptionEntry {
    token: String,
    registrations: Vec<Registration>,
}

#[derive(Default)]
struct RegistryState {
    entries: BTreeMap<SubscriptionKey, SubscriptionEntry>,
    tokens: HashMap<String, SubscriptionKey>,
    next_id: u64,
}

/// Tracks live subscriptions and fans feedback out to their callbacks.
pub struct SubscriptionRegistry {
    queue: Arc<CommandQueue>,
    online: AtomicBool,
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new(queue: Arc<CommandQueue>) -> Self {
        Self {
            queue,
            online: AtomicBool::new(false),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Whether subscribe and unsubscribe requests are sent immediately.
    ///
    /// While offline, first registrations are only recorded; the re-assertion
    /// that follows initialization sends them.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Register `callback` for feedback on `key`.
    pub fn subscribe(
        &self,
        key: SubscriptionKey,
        requests: SubscriptionRequests,
        callback: FeedbackCallback,
    ) -> SubscriptionHandle {
        let (handle, first) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;

            let first = !state.entries.contains_key(&key);
            if first {
                let token = key.token();
                state.tokens.insert(token.clone(), key.clone());
                state.entries.insert(
                    key.clone(),
                    SubscriptionEntry {
                        token,
                        registrations: Vec::new(),
                    },
                );
            }

            let subscribe = Arc::clone(&requests.subscribe);
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.registrations.push(Registration {
                    id,
                    callback,
                    requests,
                });
            }

            (SubscriptionHandle { id, key }, first.then_some(subscribe))
        };

        tracing::debug!(key = %handle.key, first = first.is_some(), "Subscribed");
        if let Some(subscribe) = first {
            if self.is_online() {
                self.queue.enqueue(subscribe, None);
            }
        }
        handle
    }

    /// Remove one registration. Returns false if the handle is unknown.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let unsubscribe = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&handle.key) else {
                return false;
            };
            let Some(position) = entry.registrations.iter().position(|r| r.id == handle.id) else {
                return false;
            };
            let removed = entry.registrations.remove(position);

            if !entry.registrations.is_empty() {
                return true;
            }

            if let Some(entry) = state.entries.remove(&handle.key) {
                state.tokens.remove(&entry.token);
            }
            removed.requests.unsubscribe
        };

        tracing::debug!(key = %handle.key, "Last subscriber left");
        if let Some(request) = unsubscribe {
            if self.is_online() {
                self.queue.enqueue(request, None);
            }
        }
        true
    }

    /// Deliver feedback to every callback registered under `token`.
    ///
    /// Callbacks run outside the registry lock, in registration order, so they
    /// may subscribe or unsubscribe themselves. Returns how many ran.
    pub fn dispatch(&self, token: &str, response: &Response) -> usize {
        let targets: Vec<(FeedbackCallback, Arc<dyn Request>)> = {
            let state = self.state.lock();
            let Some(entry) = state
                .tokens
                .get(token)
                .and_then(|key| state.entries.get(key))
            else {
                return 0;
            };
            entry
                .registrations
                .iter()
                .map(|r| (Arc::clone(&r.callback), Arc::clone(&r.requests.subscribe)))
                .collect()
        };

        for (callback, request) in &targets {
            callback(response, request.as_ref());
        }
        targets.len()
    }

    /// Re-send the subscribe request of every live key, once per key.
    ///
    /// Returns how many were accepted; nothing is sent while the queue is
    /// closed.
    pub fn reassert_all(&self) -> usize {
        self.reassert(None).unwrap_or(0)
    }

    /// Like [`SubscriptionRegistry::reassert_all`], bound to one queue
    /// generation. Returns `None` if the queue was closed after `generation`
    /// was read; the remaining requests are not sent.
    pub(crate) fn reassert_in(&self, generation: u64) -> Option<usize> {
        self.reassert(Some(generation))
    }

    fn reassert(&self, generation: Option<u64>) -> Option<usize> {
        let requests: Vec<Arc<dyn Request>> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .filter_map(|entry| entry.registrations.first())
                .map(|r| Arc::clone(&r.requests.subscribe))
                .collect()
        };

        for request in &requests {
            if !self.queue.submit(Arc::clone(request), None, same_request, generation) {
                tracing::debug!(key_count = requests.len(), "Link closed during re-assertion");
                return None;
            }
        }
        tracing::info!(count = requests.len(), "Re-asserted subscriptions");
        Some(requests.len())
    }

    pub fn is_live_token(&self, token: &str) -> bool {
        self.state.lock().tokens.contains_key(token)
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.state.lock().entries.keys().cloned().collect()
    }

    pub fn callback_count(&self, key: &SubscriptionKey) -> usize {
        self.state
            .lock()
            .entries
            .get(key)
            .map_or(0, |entry| entry.registrations.len())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
