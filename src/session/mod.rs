//! Authoritative session state
//!
//! Lives only on the session owner. Every connection event and every
//! countdown step goes through [`AuthoritativeSession`], which keeps the
//! roster and the start barrier consistent and fans the resulting events out
//! to the local bus and to connected clients.

pub mod barrier;
pub mod driver;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::metrics::Metrics;
use crate::notify::{NotificationBus, SessionEvent};
use crate::roster::{ConnectOutcome, ConnectionId, DisconnectOutcome, RosterTracker};
use crate::session::barrier::{BarrierState, BarrierTransition, StartBarrier};
use crate::transport::{ConnectionEvent, EventReplicator};

/// Point-in-time view of the authoritative state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub participants: Vec<ConnectionId>,
    pub threshold: usize,
    pub capacity: usize,
    /// Seconds left on the countdown, negative when not counting
    pub countdown_remaining: f32,
    pub started: bool,
}

/// Roster plus start barrier, driven from a single evaluation path
pub struct AuthoritativeSession {
    tracker: RosterTracker,
    barrier: StartBarrier,
    bus: NotificationBus,
    replicator: Arc<dyn EventReplicator>,
    metrics: Arc<Metrics>,
}

impl AuthoritativeSession {
    pub fn new(
        capacity: usize,
        threshold: usize,
        countdown: Duration,
        bus: NotificationBus,
        replicator: Arc<dyn EventReplicator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            tracker: RosterTracker::new(capacity),
            barrier: StartBarrier::new(threshold, countdown),
            bus,
            replicator,
            metrics,
        }
    }

    pub fn handle(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(id) => self.on_connect(id),
            ConnectionEvent::Disconnected(id) => self.on_disconnect(id),
        }
    }

    pub fn on_connect(&mut self, id: ConnectionId) {
        match self.tracker.on_connect(id) {
            ConnectOutcome::Added { count } => {
                let previous = self.barrier.state();
                self.replicator.admit(id);
                self.metrics.participants_connected.store(count as u64, Ordering::Relaxed);
                self.emit(SessionEvent::ParticipantCountChanged {
                    count,
                    threshold: self.barrier.threshold(),
                });
                let transitions = self.barrier.update_count(count);
                self.apply(transitions);
                self.catch_up(id, previous);
            }
            ConnectOutcome::Duplicate => {}
            ConnectOutcome::Rejected => {
                Metrics::incr(&self.metrics.connections_rejected);
                self.replicator.disconnect(id);
            }
        }
    }

    pub fn on_disconnect(&mut self, id: ConnectionId) {
        if let DisconnectOutcome::Removed { count, .. } = self.tracker.on_disconnect(id) {
            self.metrics.participants_connected.store(count as u64, Ordering::Relaxed);
            self.emit(SessionEvent::ParticipantCountChanged {
                count,
                threshold: self.barrier.threshold(),
            });
            let transitions = self.barrier.update_count(count);
            self.apply(transitions);
        }
    }

    /// Advance the countdown by `elapsed`
    pub fn tick(&mut self, elapsed: Duration) {
        let transitions = self.barrier.tick(elapsed);
        self.apply(transitions);
    }

    fn apply<I>(&mut self, transitions: I)
    where
        I: IntoIterator<Item = BarrierTransition>,
    {
        for transition in transitions {
            let event = match transition {
                BarrierTransition::CountdownStarted { seconds } => {
                    Metrics::incr(&self.metrics.countdowns_started);
                    SessionEvent::CountdownStarted { seconds }
                }
                BarrierTransition::CountdownTick { remaining_secs } => {
                    SessionEvent::CountdownTick { remaining_secs }
                }
                BarrierTransition::CountdownCancelled => {
                    Metrics::incr(&self.metrics.countdowns_cancelled);
                    SessionEvent::CountdownCancelled
                }
                BarrierTransition::Started => {
                    Metrics::incr(&self.metrics.games_started);
                    let participants = self.tracker.activate_all();
                    info!("Game started with {} participants", participants.len());
                    SessionEvent::GameStarted { participants }
                }
            };
            self.emit(event);
        }
    }

    /// Bring a connection that arrived mid-countdown or after the start up to
    /// the current barrier state. Broadcasts already covered the count.
    fn catch_up(&self, id: ConnectionId, previous: BarrierState) {
        let event = match (previous, self.barrier.state()) {
            (BarrierState::CountingDown, BarrierState::CountingDown) => {
                match self.barrier.remaining_whole_secs() {
                    Some(seconds) => SessionEvent::CountdownStarted { seconds },
                    None => return,
                }
            }
            (BarrierState::Started, _) => SessionEvent::GameStarted {
                participants: self.tracker.roster().connection_ids(),
            },
            _ => return,
        };
        debug!("Catching up connection {} with {:?}", id, event);
        self.replicator.send_to(id, &event);
    }

    fn emit(&self, event: SessionEvent) {
        if event.is_authoritative() {
            self.replicator.replicate(&event);
        }
        let seq = self.bus.publish(event);
        debug!("Authoritative event #{} emitted", seq);
    }

    pub fn state(&self) -> BarrierState {
        self.barrier.state()
    }

    pub fn participant_count(&self) -> usize {
        self.tracker.count()
    }

    pub fn tracker(&self) -> &RosterTracker {
        &self.tracker
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            participants: self.tracker.roster().connection_ids(),
            threshold: self.barrier.threshold(),
            capacity: self.tracker.capacity(),
            countdown_remaining: self.barrier.countdown_remaining_secs(),
            started: self.barrier.is_started(),
        }
    }
}
