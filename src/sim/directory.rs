//! In-memory session directory

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::PlayerId;
use crate::directory::{
    CreateOutcome, CreateSessionOptions, DataEntry, DirectoryError, SessionDirectory, SessionId,
    SessionQuery, SessionRecord,
};

/// Records that miss heartbeats for this long disappear
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure injection switches
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryFaults {
    pub fail_queries: bool,
    pub fail_creates: bool,
    pub fail_joins: bool,
    pub fail_heartbeats: bool,
}

/// Process-local directory shared by every simulated client
pub struct InMemoryDirectory {
    sessions: Mutex<Vec<SessionRecord>>,
    heartbeat_timeout: Duration,
    faults: Mutex<DirectoryFaults>,
    queries: AtomicU64,
    creates: AtomicU64,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::with_heartbeat_timeout(DEFAULT_HEARTBEAT_TIMEOUT)
    }

    pub fn with_heartbeat_timeout(heartbeat_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            heartbeat_timeout,
            faults: Mutex::new(DirectoryFaults::default()),
            queries: AtomicU64::new(0),
            creates: AtomicU64::new(0),
        }
    }

    pub fn set_faults(&self, faults: DirectoryFaults) {
        *self.faults.lock() = faults;
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::Relaxed)
    }

    /// Live sessions, oldest first
    pub fn sessions(&self) -> Vec<SessionRecord> {
        let mut sessions = self.sessions.lock();
        self.expire_stale(&mut sessions);
        sessions.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Insert a record directly, bypassing create
    pub fn insert(&self, record: SessionRecord) {
        self.sessions.lock().push(record);
    }

    fn expire_stale(&self, sessions: &mut Vec<SessionRecord>) {
        let now = Instant::now();
        let timeout = self.heartbeat_timeout;
        sessions.retain(|s| {
            let alive = now.duration_since(s.last_heartbeat) < timeout;
            if !alive {
                info!("Session '{}' ({}) expired: no heartbeat", s.name, s.id);
            }
            alive
        });
    }

    fn build_record(host: PlayerId, options: CreateSessionOptions) -> Result<SessionRecord, DirectoryError> {
        if options.max_players == 0 {
            return Err(DirectoryError::InvalidRequest("max_players must be at least 1".to_string()));
        }
        if options.name.trim().is_empty() {
            return Err(DirectoryError::InvalidRequest("session name is empty".to_string()));
        }

        Ok(SessionRecord {
            id: Uuid::new_v4(),
            name: options.name,
            host_id: host,
            max_players: options.max_players,
            visibility: options.visibility,
            players: vec![host],
            data: options.data,
            last_heartbeat: Instant::now(),
        })
    }

    fn create_locked(
        &self,
        sessions: &mut Vec<SessionRecord>,
        host: PlayerId,
        options: CreateSessionOptions,
    ) -> Result<SessionRecord, DirectoryError> {
        if self.faults.lock().fail_creates {
            return Err(DirectoryError::Unavailable("create rejected".to_string()));
        }
        let record = Self::build_record(host, options)?;
        self.creates.fetch_add(1, Ordering::Relaxed);
        debug!("Directory created '{}' ({})", record.name, record.id);
        sessions.push(record.clone());
        Ok(record)
    }

    fn query_locked(&self, sessions: &[SessionRecord], query: &SessionQuery) -> Vec<SessionRecord> {
        sessions
            .iter()
            .filter(|s| query.matches(s))
            .take(query.page_size)
            .map(SessionRecord::public_view)
            .collect()
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionDirectory for InMemoryDirectory {
    async fn create_session(
        &self,
        host: PlayerId,
        options: CreateSessionOptions,
    ) -> Result<SessionRecord, DirectoryError> {
        let mut sessions = self.sessions.lock();
        self.expire_stale(&mut sessions);
        self.create_locked(&mut sessions, host, options)
    }

    /// Query and create under one lock, so two callers can never both create
    async fn create_session_if_absent(
        &self,
        host: PlayerId,
        options: CreateSessionOptions,
        query: &SessionQuery,
    ) -> Result<CreateOutcome, DirectoryError> {
        let mut sessions = self.sessions.lock();
        self.expire_stale(&mut sessions);

        if let Some(existing) = self.query_locked(&sessions, query).into_iter().next() {
            return Ok(CreateOutcome::Existing(existing));
        }
        self.create_locked(&mut sessions, host, options)
            .map(CreateOutcome::Created)
    }

    async fn query_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>, DirectoryError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if self.faults.lock().fail_queries {
            return Err(DirectoryError::Unavailable("query rejected".to_string()));
        }

        let mut sessions = self.sessions.lock();
        self.expire_stale(&mut sessions);
        Ok(self.query_locked(&sessions, query))
    }

    async fn get_session(&self, id: SessionId, viewer: PlayerId) -> Result<SessionRecord, DirectoryError> {
        let mut sessions = self.sessions.lock();
        self.expire_stale(&mut sessions);

        let record = sessions
            .iter()
            .find(|s| s.id == id)
            .ok_or(DirectoryError::SessionNotFound)?;
        if record.is_member(viewer) {
            Ok(record.clone())
        } else {
            Ok(record.public_view())
        }
    }

    async fn join_session(&self, id: SessionId, player: PlayerId) -> Result<SessionRecord, DirectoryError> {
        if self.faults.lock().fail_joins {
            return Err(DirectoryError::Unavailable("join rejected".to_string()));
        }

        let mut sessions = self.sessions.lock();
        self.expire_stale(&mut sessions);

        let record = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(DirectoryError::SessionNotFound)?;
        if record.is_member(player) {
            return Ok(record.clone());
        }
        if !record.has_capacity() {
            return Err(DirectoryError::SessionFull);
        }

        record.players.push(player);
        debug!("Player {} joined '{}' ({}/{})", player, record.name, record.players.len(), record.max_players);
        Ok(record.clone())
    }

    async fn update_session_data(
        &self,
        id: SessionId,
        caller: PlayerId,
        data: HashMap<String, DataEntry>,
    ) -> Result<SessionRecord, DirectoryError> {
        let mut sessions = self.sessions.lock();
        self.expire_stale(&mut sessions);

        let record = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(DirectoryError::SessionNotFound)?;
        if record.host_id != caller {
            return Err(DirectoryError::NotOwner);
        }

        record.data.extend(data);
        Ok(record.clone())
    }

    async fn remove_player(&self, id: SessionId, player: PlayerId) -> Result<(), DirectoryError> {
        let mut sessions = self.sessions.lock();

        let index = sessions
            .iter()
            .position(|s| s.id == id)
            .ok_or(DirectoryError::SessionNotFound)?;

        if sessions[index].host_id == player {
            let record = sessions.remove(index);
            info!("Host left, session '{}' ({}) closed", record.name, record.id);
            return Ok(());
        }

        let record = &mut sessions[index];
        let before = record.players.len();
        record.players.retain(|p| *p != player);
        if record.players.len() == before {
            return Err(DirectoryError::NotMember);
        }
        Ok(())
    }

    async fn send_heartbeat(&self, id: SessionId, caller: PlayerId) -> Result<(), DirectoryError> {
        if self.faults.lock().fail_heartbeats {
            return Err(DirectoryError::Unavailable("heartbeat rejected".to_string()));
        }

        let mut sessions = self.sessions.lock();
        self.expire_stale(&mut sessions);

        let record = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(DirectoryError::SessionNotFound)?;
        if record.host_id != caller {
            return Err(DirectoryError::NotOwner);
        }
        record.last_heartbeat = Instant::now();
        Ok(())
    }
}
