//! Session directory
//!
//! The directory is an external lobby service holding one record per open
//! session. Only the owning host writes a record; everyone else reads.

pub mod client;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::PlayerId;

pub type SessionId = Uuid;

/// Public metadata key carrying the game mode
pub const GAME_MODE_KEY: &str = "GameMode";
/// Member-only metadata key carrying the relay join credential
pub const JOIN_CREDENTIAL_KEY: &str = "RelayJoinCode";

/// Who may discover a session through queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    Private,
}

/// Who may read a metadata entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataVisibility {
    /// Visible in query results
    Public,
    /// Visible only to session members
    Member,
}

/// A metadata value with its visibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub visibility: DataVisibility,
    pub value: String,
}

impl DataEntry {
    pub fn public(value: impl Into<String>) -> Self {
        Self {
            visibility: DataVisibility::Public,
            value: value.into(),
        }
    }

    pub fn member(value: impl Into<String>) -> Self {
        Self {
            visibility: DataVisibility::Member,
            value: value.into(),
        }
    }
}

/// Cached copy of a directory record
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub host_id: PlayerId,
    pub max_players: usize,
    pub visibility: Visibility,
    pub players: Vec<PlayerId>,
    pub data: HashMap<String, DataEntry>,
    pub last_heartbeat: Instant,
}

impl SessionRecord {
    pub fn available_slots(&self) -> usize {
        self.max_players.saturating_sub(self.players.len())
    }

    pub fn has_capacity(&self) -> bool {
        self.available_slots() > 0
    }

    pub fn is_member(&self, player: PlayerId) -> bool {
        self.players.contains(&player)
    }

    pub fn data_value(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(|entry| entry.value.as_str())
    }

    /// Copy with member-only metadata removed
    pub fn public_view(&self) -> Self {
        let mut view = self.clone();
        view.data.retain(|_, entry| entry.visibility == DataVisibility::Public);
        view
    }
}

/// Options for creating a session
#[derive(Debug, Clone)]
pub struct CreateSessionOptions {
    pub name: String,
    pub max_players: usize,
    pub visibility: Visibility,
    pub data: HashMap<String, DataEntry>,
}

/// Filter for session queries
#[derive(Debug, Clone)]
pub struct SessionQuery {
    /// Only sessions with at least this many free slots
    pub min_available_slots: usize,
    /// Maximum results
    pub page_size: usize,
    /// Optional required game mode
    pub game_mode: Option<String>,
}

impl SessionQuery {
    pub fn open_sessions(page_size: usize) -> Self {
        Self {
            min_available_slots: 1,
            page_size,
            game_mode: None,
        }
    }

    pub fn with_game_mode(mut self, mode: impl Into<String>) -> Self {
        self.game_mode = Some(mode.into());
        self
    }

    pub fn matches(&self, record: &SessionRecord) -> bool {
        if record.visibility != Visibility::Public {
            return false;
        }
        if record.available_slots() < self.min_available_slots {
            return false;
        }
        match &self.game_mode {
            Some(mode) => record.data_value(GAME_MODE_KEY) == Some(mode.as_str()),
            None => true,
        }
    }
}

/// Result of an atomic create-if-absent call
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// No open session matched; this caller now hosts a new one
    Created(SessionRecord),
    /// An open session already existed; the caller should join it
    Existing(SessionRecord),
}

/// External session directory
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn create_session(
        &self,
        host: PlayerId,
        options: CreateSessionOptions,
    ) -> Result<SessionRecord, DirectoryError>;

    /// Create a session unless one matching `query` already exists.
    ///
    /// Directories that can do this atomically should override it; the
    /// default is a plain query followed by a create.
    async fn create_session_if_absent(
        &self,
        host: PlayerId,
        options: CreateSessionOptions,
        query: &SessionQuery,
    ) -> Result<CreateOutcome, DirectoryError> {
        if let Some(existing) = self.query_sessions(query).await?.into_iter().next() {
            return Ok(CreateOutcome::Existing(existing));
        }
        self.create_session(host, options)
            .await
            .map(CreateOutcome::Created)
    }

    async fn query_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>, DirectoryError>;

    /// Fetch a record as seen by `viewer`; member-only data is hidden from non-members
    async fn get_session(&self, id: SessionId, viewer: PlayerId) -> Result<SessionRecord, DirectoryError>;

    async fn join_session(&self, id: SessionId, player: PlayerId) -> Result<SessionRecord, DirectoryError>;

    /// Merge metadata into a record. Only the host may call this.
    async fn update_session_data(
        &self,
        id: SessionId,
        caller: PlayerId,
        data: HashMap<String, DataEntry>,
    ) -> Result<SessionRecord, DirectoryError>;

    /// Remove a member; removing the host closes the session
    async fn remove_player(&self, id: SessionId, player: PlayerId) -> Result<(), DirectoryError>;

    async fn send_heartbeat(&self, id: SessionId, caller: PlayerId) -> Result<(), DirectoryError>;
}

/// Directory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Session not found")]
    SessionNotFound,
    #[error("Session is full")]
    SessionFull,
    #[error("Only the session host may modify it")]
    NotOwner,
    #[error("Player is not a member of the session")]
    NotMember,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Directory service unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(max_players: usize, players: usize) -> SessionRecord {
        let mut data = HashMap::new();
        data.insert(GAME_MODE_KEY.to_string(), DataEntry::public("FreeForAll"));
        data.insert(JOIN_CREDENTIAL_KEY.to_string(), DataEntry::member("ABC123"));
        SessionRecord {
            id: Uuid::new_v4(),
            name: "Game_1234".to_string(),
            host_id: Uuid::new_v4(),
            max_players,
            visibility: Visibility::Public,
            players: (0..players).map(|_| Uuid::new_v4()).collect(),
            data,
            last_heartbeat: Instant::now(),
        }
    }

    #[test]
    fn test_available_slots() {
        assert_eq!(record(4, 1).available_slots(), 3);
        assert!(!record(2, 2).has_capacity());
        assert_eq!(record(2, 3).available_slots(), 0);
    }

    #[test]
    fn test_public_view_hides_member_data() {
        let view = record(4, 1).public_view();
        assert_eq!(view.data_value(GAME_MODE_KEY), Some("FreeForAll"));
        assert_eq!(view.data_value(JOIN_CREDENTIAL_KEY), None);
    }

    #[test]
    fn test_query_matching() {
        let query = SessionQuery::open_sessions(10);
        assert!(query.matches(&record(4, 1)));
        assert!(!query.matches(&record(2, 2)));

        let mut private = record(4, 1);
        private.visibility = Visibility::Private;
        assert!(!query.matches(&private));

        let mode_query = SessionQuery::open_sessions(10).with_game_mode("CaptureTheFlag");
        assert!(!mode_query.matches(&record(4, 1)));
    }
}
