//! Authoritative roster of transport-level participants
//!
//! Only the session owner keeps a roster. Connect and disconnect events are
//! applied here one at a time by the authoritative driver.

pub mod participant;

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::roster::participant::Participant;

/// Transport connection identifier
pub type ConnectionId = u64;

/// Result of applying a connect event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// New participant added
    Added { count: usize },
    /// Identifier was already present; nothing changed
    Duplicate,
    /// Session is at capacity; the connection must be dropped
    Rejected,
}

/// Result of applying a disconnect event
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectOutcome {
    /// Participant removed
    Removed { participant: Participant, count: usize },
    /// Identifier was not tracked; nothing changed
    Unknown,
}

/// Join-ordered set of connected participants
#[derive(Debug, Default)]
pub struct Roster {
    participants: HashMap<ConnectionId, Participant>,
    next_join_order: u64,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.participants.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Participant> {
        self.participants.get(&id)
    }

    /// Insert unless already present. Returns false for duplicates.
    fn insert(&mut self, id: ConnectionId) -> bool {
        if self.participants.contains_key(&id) {
            return false;
        }
        let participant = Participant::new(id, self.next_join_order);
        self.next_join_order += 1;
        self.participants.insert(id, participant);
        true
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Participant> {
        self.participants.remove(&id).map(|mut p| {
            p.disconnect();
            p
        })
    }

    /// Participants ordered by join time
    pub fn ordered(&self) -> Vec<&Participant> {
        let mut list: Vec<&Participant> = self.participants.values().collect();
        list.sort_by_key(|p| p.join_order);
        list
    }

    /// Connection ids ordered by join time
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.ordered().iter().map(|p| p.connection_id).collect()
    }

    /// Enable control for every participant in one pass
    fn enable_all(&mut self) -> Vec<ConnectionId> {
        for participant in self.participants.values_mut() {
            participant.enable_control();
        }
        self.connection_ids()
    }
}

/// Server-side roster tracker
#[derive(Debug)]
pub struct RosterTracker {
    roster: Roster,
    capacity: usize,
    /// Set once the start barrier fires; later joiners are enabled on arrival
    activated: bool,
}

impl RosterTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            roster: Roster::new(),
            capacity,
            activated: false,
        }
    }

    /// Apply a transport connect event
    pub fn on_connect(&mut self, id: ConnectionId) -> ConnectOutcome {
        if self.roster.contains(id) {
            debug!("Duplicate connect for {}, ignoring", id);
            return ConnectOutcome::Duplicate;
        }

        if self.roster.len() >= self.capacity {
            warn!(
                "Rejecting connection {}: session full ({}/{})",
                id,
                self.roster.len(),
                self.capacity
            );
            return ConnectOutcome::Rejected;
        }

        self.roster.insert(id);
        if self.activated {
            if let Some(p) = self.roster.participants.get_mut(&id) {
                p.enable_control();
            }
        }

        let count = self.roster.len();
        info!("Participant {} connected ({}/{})", id, count, self.capacity);
        ConnectOutcome::Added { count }
    }

    /// Apply a transport disconnect event
    pub fn on_disconnect(&mut self, id: ConnectionId) -> DisconnectOutcome {
        match self.roster.remove(id) {
            Some(participant) => {
                let count = self.roster.len();
                info!("Participant {} disconnected ({} remaining)", id, count);
                DisconnectOutcome::Removed { participant, count }
            }
            None => {
                debug!("Disconnect for untracked connection {}", id);
                DisconnectOutcome::Unknown
            }
        }
    }

    /// Activate every tracked participant simultaneously
    pub fn activate_all(&mut self) -> Vec<ConnectionId> {
        self.activated = true;
        self.roster.enable_all()
    }

    pub fn count(&self) -> usize {
        self.roster.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }
}
