//! Subscription registry: the `channel ↔ subscriber` dual index.
//!
//! Bookkeeping here is synchronous and never touches the broker directly: mutating a
//! `HashMap` while holding a `RefCell` borrow across an `.await` on a broker round
//! trip would mean any other connection task scheduled in between and reaching for
//! the same registry panics on a re-entrant borrow. Instead each mutating method
//! returns the [`ChannelAction`] (if any) the caller must still carry out against the
//! broker once the borrow is dropped — see `connection.rs`'s envelope dispatch.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::envelope::OutboundEnvelope;
use crate::pubsub::intern::{Canonical, Pool};

/// Opaque handle identifying a client-side message sink — one WebSocket connection's
/// outbound side.
#[derive(Clone)]
pub struct Subscriber(Rc<SubscriberInner>);

/// What the registry needs of a subscriber: somewhere to queue outbound bytes and a
/// way to wake the connection task that owns the socket.
pub struct SubscriberInner {
    pub outbox: std::cell::RefCell<std::collections::VecDeque<Vec<u8>>>,
    pub notify: tokio::sync::Notify,
}

impl Subscriber {
    pub fn new() -> Self {
        Self(Rc::new(SubscriberInner {
            outbox: std::cell::RefCell::new(std::collections::VecDeque::new()),
            notify: tokio::sync::Notify::new(),
        }))
    }

    pub fn inner(&self) -> &SubscriberInner {
        &self.0
    }

    pub fn enqueue(&self, frame: Vec<u8>) {
        self.0.outbox.borrow_mut().push_back(frame);
        self.0.notify.notify_one();
    }
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Subscriber {}
impl Hash for Subscriber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state)
    }
}

/// A broker command the caller still needs to issue once it has dropped its borrow of
/// the registry: SUBSCRIBE/UNSUBSCRIBE is issued exactly on the empty↔non-empty
/// transition for a channel.
#[derive(Debug, Clone)]
pub enum ChannelAction {
    Subscribe(Canonical),
    Unsubscribe(Canonical),
}

/// The dual-indexed channel/subscriber registry.
#[derive(Default)]
pub struct Registry {
    channels_to_subscribers: HashMap<Canonical, HashSet<Subscriber>>,
    subscribers_to_channels: HashMap<Subscriber, HashSet<Canonical>>,
    pool: Pool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            channels_to_subscribers: HashMap::new(),
            subscribers_to_channels: HashMap::new(),
            pool: Pool::new(),
        }
    }

    /// Every channel with at least one local subscriber — used to replay
    /// subscriptions to the broker after a reconnect.
    pub fn active_channels(&self) -> Vec<Canonical> {
        self.channels_to_subscribers.keys().cloned().collect()
    }

    /// Idempotent if already subscribed. Returns `Some(Subscribe(..))` only the
    /// first time a channel gains a local subscriber.
    pub fn subscribe(&mut self, channel: &str, subscriber: Subscriber) -> Option<ChannelAction> {
        let canonical = self.pool.get(channel);
        let subs = self.channels_to_subscribers.entry(canonical.clone()).or_default();
        let was_empty = subs.is_empty();
        let newly_inserted = subs.insert(subscriber.clone());
        self.subscribers_to_channels
            .entry(subscriber)
            .or_default()
            .insert(canonical.clone());
        if newly_inserted && was_empty {
            debug!(channel = %canonical.as_str(), "first local subscriber");
            Some(ChannelAction::Subscribe(canonical))
        } else {
            None
        }
    }

    pub fn unsubscribe(&mut self, channel: &str, subscriber: &Subscriber) -> Option<ChannelAction> {
        let canonical = self.pool.get(channel);
        self.remove_edge(&canonical, subscriber)
    }

    /// Remove `subscriber` from every channel it holds; called on disconnect.
    pub fn unsubscribe_all(&mut self, subscriber: &Subscriber) -> Vec<ChannelAction> {
        let channels: Vec<Canonical> = self
            .subscribers_to_channels
            .get(subscriber)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        channels
            .into_iter()
            .filter_map(|channel| self.remove_edge(&channel, subscriber))
            .collect()
    }

    fn remove_edge(&mut self, canonical: &Canonical, subscriber: &Subscriber) -> Option<ChannelAction> {
        let mut became_empty = false;
        if let Some(subs) = self.channels_to_subscribers.get_mut(canonical) {
            subs.remove(subscriber);
            if subs.is_empty() {
                became_empty = true;
                self.channels_to_subscribers.remove(canonical);
            }
        }
        if let Some(channels) = self.subscribers_to_channels.get_mut(subscriber) {
            channels.remove(canonical);
            if channels.is_empty() {
                self.subscribers_to_channels.remove(subscriber);
            }
        }
        if became_empty {
            debug!(channel = %canonical.as_str(), "last local subscriber left");
            Some(ChannelAction::Unsubscribe(canonical.clone()))
        } else {
            None
        }
    }

    /// Broker inbound: fan a message out to every local subscriber of `channel`.
    /// Purely local — a publish is never delivered back to the registry directly; see
    /// `broker.rs`.
    pub fn deliver(&mut self, channel: &str, payload: &[u8]) {
        let canonical = self.pool.get(channel);
        let Some(subs) = self.channels_to_subscribers.get(&canonical) else {
            return;
        };
        let envelope = OutboundEnvelope {
            key: canonical.as_str(),
            data: payload,
        };
        let frame = match envelope.encode_frame() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "failed to encode outbound pub/sub envelope");
                return;
            }
        };
        for sub in subs {
            sub.enqueue(frame.clone());
        }
    }
}
