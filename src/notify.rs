//! Notification bus
//!
//! Ordered fan-out of session events to presentation-side observers. Every
//! event gets a sequence number at publish time and each subscriber sees
//! events in exactly that order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::directory::SessionId;
use crate::matchmaking::status::MatchStatus;
use crate::roster::ConnectionId;

/// Role this client plays in a formed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    /// Owns the directory record and drives the start barrier
    Host,
    /// Observes the host's authoritative state
    Client,
}

/// Events published to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Matchmaking status changed
    Status(MatchStatus),
    /// A session was created or joined
    MatchFound { session_id: SessionId, role: SessionRole },
    /// Directory-side member count of the current lobby
    LobbyMembersChanged { count: usize, capacity: usize },
    /// Transport-level participant count on the authoritative side
    ParticipantCountChanged { count: usize, threshold: usize },
    /// Start countdown began from its full duration
    CountdownStarted { seconds: u32 },
    /// Whole seconds left on the countdown
    CountdownTick { remaining_secs: u32 },
    /// Countdown aborted because the roster dropped below threshold
    CountdownCancelled,
    /// Every listed participant was activated at once
    GameStarted { participants: Vec<ConnectionId> },
}

impl SessionEvent {
    /// Whether this event originates from the authoritative side and must be
    /// replicated to non-authoritative participants
    pub fn is_authoritative(&self) -> bool {
        matches!(
            self,
            SessionEvent::ParticipantCountChanged { .. }
                | SessionEvent::CountdownStarted { .. }
                | SessionEvent::CountdownTick { .. }
                | SessionEvent::CountdownCancelled
                | SessionEvent::GameStarted { .. }
        )
    }
}

/// An event stamped with its publish order
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub seq: u64,
    pub event: SessionEvent,
}

type SubscriberId = u64;

struct BusInner {
    subscribers: Mutex<Vec<(SubscriberId, mpsc::UnboundedSender<Notification>)>>,
    next_seq: AtomicU64,
    next_subscriber: AtomicU64,
}

/// Notification bus shared by the orchestrator, the authoritative driver and
/// any number of observers
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_seq: AtomicU64::new(0),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// Register an observer. Dropping the returned handle unsubscribes it.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, tx));
        debug!("Bus subscriber {} registered", id);

        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Publish an event to every current subscriber.
    ///
    /// The subscriber lock is held while the sequence number is assigned so
    /// concurrent publishers cannot interleave out of order.
    pub fn publish(&self, event: SessionEvent) -> u64 {
        let mut subscribers = self.inner.subscribers.lock();
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        trace!("Publishing #{}: {:?}", seq, event);

        let notification = Notification { seq, event };
        subscribers.retain(|(_, tx)| tx.send(notification.clone()).is_ok());
        seq
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Receiving end of a bus subscription
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Notification>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Wait for the next notification
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Take a notification if one is already queued
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Drain everything queued so far
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.rx.try_recv() {
            out.push(n);
        }
        out
    }

    /// Wait until an event matching `predicate` arrives, returning it
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<SessionEvent>
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        while let Some(notification) = self.rx.recv().await {
            if predicate(&notification.event) {
                return Some(notification.event);
            }
        }
        None
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.lock().retain(|(id, _)| *id != self.id);
            debug!("Bus subscriber {} unsubscribed", self.id);
        }
    }
}
