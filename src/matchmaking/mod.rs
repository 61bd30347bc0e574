//! Quick-match orchestration
//!
//! Drives one local player from "not in a session" to either hosting a new
//! session or connected to an existing one. The host side also owns the
//! authoritative driver; clients only mirror what the host replicates.

pub mod status;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::auth::{self, AuthenticationError, Authenticator, PlayerId};
use crate::config::MatchConfig;
use crate::directory::client::DirectoryClient;
use crate::directory::{
    CreateOutcome, DirectoryError, SessionDirectory, SessionId, SessionRecord, JOIN_CREDENTIAL_KEY,
};
use crate::matchmaking::status::MatchStatus;
use crate::metrics::Metrics;
use crate::notify::{NotificationBus, SessionEvent, SessionRole, Subscription};
use crate::session::driver::{spawn_authority, AuthorityHandle};
use crate::session::SessionSnapshot;
use crate::transport::handoff::{HandoffTiming, TransportHandoff};
use crate::transport::{JoinCredential, NetworkTransport, RelayService, TransportError};

/// External services a quick match talks to
#[derive(Clone)]
pub struct MatchServices {
    pub auth: Arc<dyn Authenticator>,
    pub directory: Arc<dyn SessionDirectory>,
    pub relay: Arc<dyn RelayService>,
    pub transport: Arc<dyn NetworkTransport>,
}

/// What a quick-match call ended in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuickMatchOutcome {
    /// A search or session was already active; nothing was done
    AlreadySearching,
    /// A new session was created and this client hosts it
    Hosting {
        session_id: SessionId,
        credential: JoinCredential,
    },
    /// An existing session was joined and the transport is connected
    Joined { session_id: SessionId },
}

/// Quick-match errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Join credential missing after {attempts} polls")]
    CredentialMissing { attempts: u32 },
    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthenticationError),
}

impl MatchError {
    /// Status shown when a join attempt fails with this error
    fn join_status(&self) -> MatchStatus {
        match self {
            MatchError::CredentialMissing { .. } => MatchStatus::CredentialMissing,
            MatchError::Transport(_) => MatchStatus::RelayConnectionFailed,
            MatchError::Directory(_) | MatchError::Authentication(_) => MatchStatus::JoinFailed,
        }
    }
}

#[derive(Default)]
struct MatchState {
    /// Set from the start of a search until leave or terminal failure
    searching: bool,
    role: Option<SessionRole>,
    client: Option<DirectoryClient>,
    authority: Option<AuthorityHandle>,
    tasks: Vec<JoinHandle<()>>,
}

/// Everything that has to be torn down when leaving a session
struct Teardown {
    client: Option<DirectoryClient>,
    authority: Option<AuthorityHandle>,
    tasks: Vec<JoinHandle<()>>,
}

/// Quick-match orchestrator for one local player
pub struct QuickMatch {
    config: MatchConfig,
    auth: Arc<dyn Authenticator>,
    directory: Arc<dyn SessionDirectory>,
    handoff: TransportHandoff,
    bus: NotificationBus,
    metrics: Arc<Metrics>,
    state: Mutex<MatchState>,
}

impl QuickMatch {
    pub fn new(config: MatchConfig, services: MatchServices, bus: NotificationBus, metrics: Arc<Metrics>) -> Self {
        let handoff = TransportHandoff::new(
            services.relay,
            services.transport,
            HandoffTiming::from(&config),
            metrics.clone(),
        );

        Self {
            config,
            auth: services.auth,
            directory: services.directory,
            handoff,
            bus,
            metrics,
            state: Mutex::new(MatchState::default()),
        }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn is_searching(&self) -> bool {
        self.state.lock().searching
    }

    pub fn role(&self) -> Option<SessionRole> {
        self.state.lock().role
    }

    /// Cached copy of the current directory record
    pub fn current_session(&self) -> Option<SessionRecord> {
        self.state.lock().client.as_ref().and_then(|c| c.current())
    }

    /// Authoritative state, when hosting
    pub fn authority_snapshot(&self) -> Option<SessionSnapshot> {
        self.state.lock().authority.as_ref().map(|a| a.snapshot())
    }

    /// Sign in and report readiness
    pub async fn initialize(&self) -> Result<PlayerId, MatchError> {
        let id = self.ensure_signed_in().await?;
        self.set_status(MatchStatus::ReadyToPlay);
        Ok(id)
    }

    /// Find an open session and join it, or host a new one.
    ///
    /// Calling this while a search or session is active does nothing.
    pub async fn start_quick_match(&self) -> Result<QuickMatchOutcome, MatchError> {
        {
            let mut state = self.state.lock();
            if state.searching {
                debug!("Quick match already in progress, ignoring");
                return Ok(QuickMatchOutcome::AlreadySearching);
            }
            state.searching = true;
        }

        Metrics::incr(&self.metrics.quick_matches_started);
        let started = Instant::now();

        match self.find_or_create().await {
            Ok(outcome) => {
                self.metrics.record_join_latency(started.elapsed());
                Ok(outcome)
            }
            Err(e) => {
                Metrics::incr(&self.metrics.quick_matches_failed);
                warn!("Quick match failed: {}", e);
                let teardown = self.take_teardown();
                self.run_teardown(teardown).await;
                Err(e)
            }
        }
    }

    /// Leave the current session and stop every background loop
    pub async fn leave(&self) {
        let was_active = {
            let state = self.state.lock();
            state.searching || state.client.is_some()
        };
        let teardown = self.take_teardown();
        self.run_teardown(teardown).await;

        if was_active {
            self.set_status(MatchStatus::Disconnected);
        }
    }

    async fn ensure_signed_in(&self) -> Result<PlayerId, MatchError> {
        if let Some(id) = self.auth.player_id() {
            return Ok(id);
        }

        match auth::sign_in(
            self.auth.as_ref(),
            self.config.auth_max_attempts,
            self.config.auth_retry_delay,
        )
        .await
        {
            Ok(id) => Ok(id),
            Err(e) => {
                Metrics::incr(&self.metrics.auth_failures);
                self.set_status(MatchStatus::AuthenticationFailed);
                Err(e.into())
            }
        }
    }

    async fn find_or_create(&self) -> Result<QuickMatchOutcome, MatchError> {
        let player_id = self.ensure_signed_in().await?;
        let client = DirectoryClient::new(self.directory.clone(), player_id, self.metrics.clone());
        self.state.lock().client = Some(client.clone());

        self.set_status(MatchStatus::Searching);
        sleep(self.config.settle_delay).await;

        let sessions = match client
            .find_open_sessions(self.config.query_page_size, Some(&self.config.game_mode))
            .await
        {
            Ok(sessions) => sessions,
            Err(e) => {
                self.set_status(MatchStatus::SearchFailed);
                return Err(e.into());
            }
        };

        if let Some(session) = sessions.into_iter().next() {
            info!("Found open session '{}' ({})", session.name, session.id);
            return self.join_or_fall_back(&client, session.id).await;
        }

        info!("No open sessions, creating one");
        self.set_status(MatchStatus::CreatingGame);
        let outcome = match client
            .create_or_find(
                self.config.max_players,
                &self.config.game_mode,
                self.config.query_page_size,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.set_status(MatchStatus::CreateFailed);
                return Err(e.into());
            }
        };

        match outcome {
            CreateOutcome::Created(record) => self.host(&client, record).await,
            CreateOutcome::Existing(record) => {
                info!("Session {} opened concurrently, joining it instead", record.id);
                self.join_or_fall_back(&client, record.id).await
            }
        }
    }

    /// Join `id`; on failure leave it and create a session instead, once
    async fn join_or_fall_back(
        &self,
        client: &DirectoryClient,
        id: SessionId,
    ) -> Result<QuickMatchOutcome, MatchError> {
        match self.join_existing(client, id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("Joining session {} failed: {}", id, e);
                self.set_status(e.join_status());
                self.abandon_join(client).await;

                Metrics::incr(&self.metrics.create_fallbacks);
                self.set_status(MatchStatus::CreatingGame);
                let record = match client.create(self.config.max_players, &self.config.game_mode).await {
                    Ok(record) => record,
                    Err(e) => {
                        self.set_status(MatchStatus::CreateFailed);
                        return Err(e.into());
                    }
                };
                self.host(client, record).await
            }
        }
    }

    async fn join_existing(&self, client: &DirectoryClient, id: SessionId) -> Result<QuickMatchOutcome, MatchError> {
        self.set_status(MatchStatus::JoiningGame);
        let record = client.join(id).await?;

        self.set_status(MatchStatus::WaitingForHost);
        let credential = self.poll_credential(client).await?;

        self.set_status(MatchStatus::Connecting);
        self.handoff
            .join_as_client(&credential, self.config.join_max_retries)
            .await?;
        Metrics::incr(&self.metrics.sessions_joined);

        let mut tasks = Vec::new();
        if let Some(mut events) = self.handoff.transport().take_replicated_events() {
            let bus = self.bus.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    bus.publish(event);
                }
                debug!("Host replication stream closed");
            }));
        }
        tasks.extend(self.spawn_lobby_poll(client));

        {
            let mut state = self.state.lock();
            state.role = Some(SessionRole::Client);
            state.tasks.extend(tasks);
        }

        self.bus.publish(SessionEvent::MatchFound {
            session_id: record.id,
            role: SessionRole::Client,
        });
        self.set_status(MatchStatus::Connected);
        Ok(QuickMatchOutcome::Joined { session_id: record.id })
    }

    /// Wait for the host to publish the join credential
    async fn poll_credential(&self, client: &DirectoryClient) -> Result<JoinCredential, MatchError> {
        let attempts = self.config.credential_poll_attempts.max(1);

        for attempt in 1..=attempts {
            Metrics::incr(&self.metrics.credential_polls);
            if let Some(record) = client.refresh().await? {
                if let Some(code) = record.data_value(JOIN_CREDENTIAL_KEY) {
                    let credential = JoinCredential::new(code);
                    if !credential.is_empty() {
                        debug!("Join credential found on poll {}", attempt);
                        return Ok(credential);
                    }
                }
            }
            debug!("Join credential not published yet ({}/{})", attempt, attempts);
            if attempt < attempts {
                sleep(self.config.credential_poll_interval).await;
            }
        }

        warn!("Host never published a join credential");
        Err(MatchError::CredentialMissing { attempts })
    }

    /// Release a session whose join failed, keeping the search alive
    async fn abandon_join(&self, client: &DirectoryClient) {
        let tasks = std::mem::take(&mut self.state.lock().tasks);
        for task in tasks {
            task.abort();
        }
        if let Err(e) = client.leave().await {
            warn!("Failed to leave abandoned session: {}", e);
        }
        let transport = self.handoff.transport();
        if transport.is_listening() {
            transport.shutdown().await;
        }
    }

    async fn host(&self, client: &DirectoryClient, record: SessionRecord) -> Result<QuickMatchOutcome, MatchError> {
        let endpoint = match self.handoff.create_host_endpoint(self.config.max_players).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.set_status(MatchStatus::CreateFailed);
                return Err(e.into());
            }
        };

        if let Err(e) = client.publish_credential(&endpoint.credential).await {
            self.set_status(MatchStatus::CreateFailed);
            return Err(e.into());
        }
        Metrics::incr(&self.metrics.sessions_created);

        let authority = spawn_authority(&self.config, endpoint.link, self.bus.clone(), self.metrics.clone());
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.extend(client.spawn_heartbeat(self.config.heartbeat_interval));
        tasks.extend(self.spawn_lobby_poll(client));

        {
            let mut state = self.state.lock();
            state.role = Some(SessionRole::Host);
            state.authority = Some(authority);
            state.tasks.extend(tasks);
        }

        self.bus.publish(SessionEvent::MatchFound {
            session_id: record.id,
            role: SessionRole::Host,
        });
        self.set_status(MatchStatus::WaitingForPlayers);

        Ok(QuickMatchOutcome::Hosting {
            session_id: record.id,
            credential: endpoint.credential,
        })
    }

    /// Publish the directory-side member count until the handle changes
    fn spawn_lobby_poll(&self, client: &DirectoryClient) -> Option<JoinHandle<()>> {
        let id = client.current_id()?;
        let client = client.clone();
        let bus = self.bus.clone();
        let interval = self.config.lobby_poll_interval;

        Some(tokio::spawn(async move {
            while client.is_current(id) {
                match client.refresh().await {
                    Ok(Some(record)) => {
                        bus.publish(SessionEvent::LobbyMembersChanged {
                            count: record.players.len(),
                            capacity: record.max_players,
                        });
                    }
                    Ok(None) => break,
                    Err(DirectoryError::SessionNotFound) | Err(DirectoryError::NotMember) => {
                        warn!("Session {} is no longer available", id);
                        break;
                    }
                    Err(e) => debug!("Lobby poll failed: {}", e),
                }
                sleep(interval).await;
            }
            debug!("Lobby polling for {} finished", id);
        }))
    }

    fn take_teardown(&self) -> Teardown {
        let mut state = self.state.lock();
        state.searching = false;
        state.role = None;
        Teardown {
            client: state.client.take(),
            authority: state.authority.take(),
            tasks: std::mem::take(&mut state.tasks),
        }
    }

    async fn run_teardown(&self, teardown: Teardown) {
        for task in teardown.tasks {
            task.abort();
        }
        if let Some(authority) = teardown.authority {
            authority.stop().await;
        }
        if let Some(client) = teardown.client {
            if let Err(e) = client.leave().await {
                warn!("Failed to leave session: {}", e);
            }
        }
        let transport = self.handoff.transport();
        if transport.is_listening() {
            transport.shutdown().await;
        }
    }

    fn set_status(&self, status: MatchStatus) {
        info!("Status: {}", status);
        self.bus.publish(SessionEvent::Status(status));
    }
}

impl Drop for QuickMatch {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.authority.take();

        let client = state.client.take();
        let transport: Arc<dyn NetworkTransport> = self.handoff.transport().clone();
        if client.as_ref().and_then(|c| c.current_id()).is_none() && !transport.is_listening() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(client) = client {
                        if let Err(e) = client.leave().await {
                            warn!("Failed to leave session on drop: {}", e);
                        }
                    }
                    if transport.is_listening() {
                        transport.shutdown().await;
                    }
                });
            }
            Err(_) => {
                warn!("No runtime available at drop, session left to expire");
            }
        }
    }
}
