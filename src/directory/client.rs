//! Directory client
//!
//! Wraps the external directory for one local player and holds the
//! current-session handle. The heartbeat loop lives here because only the
//! owner of a record keeps it alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::auth::PlayerId;
use crate::directory::{
    CreateOutcome, CreateSessionOptions, DataEntry, DirectoryError, SessionDirectory, SessionId,
    SessionQuery, SessionRecord, Visibility, GAME_MODE_KEY, JOIN_CREDENTIAL_KEY,
};
use crate::metrics::Metrics;
use crate::transport::JoinCredential;

/// Directory access for one local player
#[derive(Clone)]
pub struct DirectoryClient {
    directory: Arc<dyn SessionDirectory>,
    player_id: PlayerId,
    current: Arc<RwLock<Option<SessionRecord>>>,
    metrics: Arc<Metrics>,
}

impl DirectoryClient {
    pub fn new(directory: Arc<dyn SessionDirectory>, player_id: PlayerId, metrics: Arc<Metrics>) -> Self {
        Self {
            directory,
            player_id,
            current: Arc::new(RwLock::new(None)),
            metrics,
        }
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    /// Cached copy of the current session
    pub fn current(&self) -> Option<SessionRecord> {
        self.current.read().clone()
    }

    pub fn current_id(&self) -> Option<SessionId> {
        self.current.read().as_ref().map(|s| s.id)
    }

    /// Whether the current session is still `id`
    pub fn is_current(&self, id: SessionId) -> bool {
        self.current_id() == Some(id)
    }

    /// Clear the handle and return what it held
    pub fn take_current(&self) -> Option<SessionRecord> {
        self.current.write().take()
    }

    fn set_current(&self, record: SessionRecord) {
        *self.current.write() = Some(record);
    }

    fn note_error<T>(&self, result: Result<T, DirectoryError>) -> Result<T, DirectoryError> {
        if result.is_err() {
            Metrics::incr(&self.metrics.directory_errors);
        }
        result
    }

    /// Sessions with free slots, oldest first
    pub async fn find_open_sessions(
        &self,
        page_size: usize,
        game_mode: Option<&str>,
    ) -> Result<Vec<SessionRecord>, DirectoryError> {
        let mut query = SessionQuery::open_sessions(page_size);
        if let Some(mode) = game_mode {
            query = query.with_game_mode(mode);
        }
        let result = self.directory.query_sessions(&query).await;
        let sessions = self.note_error(result)?;
        debug!("Directory returned {} open sessions", sessions.len());
        Ok(sessions)
    }

    /// Create a public session unless an open one appeared in the meantime
    pub async fn create_or_find(
        &self,
        max_players: usize,
        game_mode: &str,
        page_size: usize,
    ) -> Result<CreateOutcome, DirectoryError> {
        let options = Self::session_options(max_players, game_mode);
        let query = SessionQuery::open_sessions(page_size).with_game_mode(game_mode);

        let result = self
            .directory
            .create_session_if_absent(self.player_id, options, &query)
            .await;
        let outcome = self.note_error(result)?;

        if let CreateOutcome::Created(record) = &outcome {
            info!("Created session '{}' ({})", record.name, record.id);
            self.set_current(record.clone());
        }
        Ok(outcome)
    }

    /// Create a public session unconditionally
    pub async fn create(&self, max_players: usize, game_mode: &str) -> Result<SessionRecord, DirectoryError> {
        let options = Self::session_options(max_players, game_mode);
        let result = self.directory.create_session(self.player_id, options).await;
        let record = self.note_error(result)?;

        info!("Created session '{}' ({})", record.name, record.id);
        self.set_current(record.clone());
        Ok(record)
    }

    fn session_options(max_players: usize, game_mode: &str) -> CreateSessionOptions {
        let mut data = HashMap::new();
        data.insert(GAME_MODE_KEY.to_string(), DataEntry::public(game_mode));

        CreateSessionOptions {
            name: random_session_name(),
            max_players,
            visibility: Visibility::Public,
            data,
        }
    }

    /// Join an existing session
    pub async fn join(&self, id: SessionId) -> Result<SessionRecord, DirectoryError> {
        let result = self.directory.join_session(id, self.player_id).await;
        let record = self.note_error(result)?;

        info!(
            "Joined session '{}' ({}/{} players)",
            record.name,
            record.players.len(),
            record.max_players
        );
        self.set_current(record.clone());
        Ok(record)
    }

    /// Re-read the current session, updating the cached copy
    pub async fn refresh(&self) -> Result<Option<SessionRecord>, DirectoryError> {
        let Some(id) = self.current_id() else {
            return Ok(None);
        };

        let result = self.directory.get_session(id, self.player_id).await;
        let record = self.note_error(result)?;

        // The handle may have been cleared while the request was in flight
        let mut current = self.current.write();
        if current.as_ref().map(|s| s.id) == Some(id) {
            *current = Some(record.clone());
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// Write the join credential into the current session's member-only metadata
    pub async fn publish_credential(&self, credential: &JoinCredential) -> Result<SessionRecord, DirectoryError> {
        let id = self.current_id().ok_or(DirectoryError::SessionNotFound)?;

        let mut data = HashMap::new();
        data.insert(
            JOIN_CREDENTIAL_KEY.to_string(),
            DataEntry::member(credential.as_str()),
        );

        let result = self.directory.update_session_data(id, self.player_id, data).await;
        let record = self.note_error(result)?;
        debug!("Published join credential for session {}", id);

        if self.is_current(id) {
            self.set_current(record.clone());
        }
        Ok(record)
    }

    /// Remove the local player from `id`
    pub async fn remove_self(&self, id: SessionId) -> Result<(), DirectoryError> {
        let result = self.directory.remove_player(id, self.player_id).await;
        self.note_error(result)?;
        info!("Left session {}", id);
        Ok(())
    }

    /// Clear the handle and deregister from the directory
    pub async fn leave(&self) -> Result<Option<SessionId>, DirectoryError> {
        match self.take_current() {
            Some(record) => {
                self.remove_self(record.id).await?;
                Ok(Some(record.id))
            }
            None => Ok(None),
        }
    }

    /// Keep the current session alive until the handle no longer points at it.
    ///
    /// A failed heartbeat ends the loop; the directory's own liveness policy
    /// then expires the record.
    pub fn spawn_heartbeat(&self, interval: Duration) -> Option<JoinHandle<()>> {
        let id = self.current_id()?;
        let client = self.clone();

        Some(tokio::spawn(async move {
            debug!("Heartbeat loop started for {}", id);
            while client.is_current(id) {
                match client.directory.send_heartbeat(id, client.player_id).await {
                    Ok(()) => {
                        Metrics::incr(&client.metrics.heartbeats_sent);
                    }
                    Err(e) => {
                        Metrics::incr(&client.metrics.heartbeat_failures);
                        warn!("Heartbeat for {} failed, stopping: {}", id, e);
                        break;
                    }
                }
                sleep(interval).await;
            }
            debug!("Heartbeat loop for {} finished", id);
        }))
    }
}

fn random_session_name() -> String {
    format!("Game_{}", rand::thread_rng().gen_range(1000..10000))
}
