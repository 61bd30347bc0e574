use tokio::time::Instant;

use crate::roster::ConnectionId;

/// Participant connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    /// Transport connection is up
    Active,
    /// Transport connection went away
    Disconnected,
}

/// A transport-level participant tracked by the authoritative side
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub join_order: u64,
    pub state: ParticipantState,
    /// Whether the participant may act. Held false until the start barrier fires.
    pub control_enabled: bool,
    pub connected_at: Instant,
}

impl Participant {
    pub fn new(connection_id: ConnectionId, join_order: u64) -> Self {
        Self {
            connection_id,
            join_order,
            state: ParticipantState::Active,
            control_enabled: false,
            connected_at: Instant::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ParticipantState::Active
    }

    pub fn disconnect(&mut self) {
        self.state = ParticipantState::Disconnected;
        self.control_enabled = false;
    }

    pub fn enable_control(&mut self) {
        self.control_enabled = true;
    }
}
