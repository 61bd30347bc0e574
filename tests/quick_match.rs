//! End-to-end session formation against the in-memory backends

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use quickmatch::config::MatchConfig;
use quickmatch::directory::{
    CreateSessionOptions, DataEntry, DataVisibility, SessionDirectory, SessionQuery, Visibility,
    GAME_MODE_KEY, JOIN_CREDENTIAL_KEY,
};
use quickmatch::matchmaking::status::MatchStatus;
use quickmatch::matchmaking::{MatchError, QuickMatch, QuickMatchOutcome};
use quickmatch::metrics::Metrics;
use quickmatch::notify::{NotificationBus, SessionEvent, SessionRole, Subscription};
use quickmatch::sim::auth::AnonymousAuthenticator;
use quickmatch::sim::directory::{DirectoryFaults, InMemoryDirectory};
use quickmatch::sim::transport::MemoryTransport;
use quickmatch::sim::SimWorld;
use quickmatch::transport::NetworkTransport;

struct Player {
    quick_match: QuickMatch,
    auth: Arc<AnonymousAuthenticator>,
    transport: Arc<MemoryTransport>,
    metrics: Arc<Metrics>,
}

fn player(world: &SimWorld, config: &MatchConfig) -> Player {
    let peer = world.peer();
    let metrics = Arc::new(Metrics::new());
    Player {
        quick_match: QuickMatch::new(config.clone(), peer.services, NotificationBus::new(), metrics.clone()),
        auth: peer.auth,
        transport: peer.transport,
        metrics,
    }
}

fn statuses(sub: &mut Subscription) -> Vec<MatchStatus> {
    sub.drain()
        .into_iter()
        .filter_map(|n| match n.event {
            SessionEvent::Status(status) => Some(status),
            _ => None,
        })
        .collect()
}

async fn wait_for_start(sub: &mut Subscription) -> Vec<u64> {
    let event = timeout(
        Duration::from_secs(30),
        sub.wait_for(|e| matches!(e, SessionEvent::GameStarted { .. })),
    )
    .await
    .expect("game never started");

    match event {
        Some(SessionEvent::GameStarted { participants }) => participants,
        other => panic!("unexpected event: {:?}", other),
    }
}

/// An open session whose host never publishes a join credential
async fn orphan_session(world: &SimWorld) -> Uuid {
    let mut data = HashMap::new();
    data.insert(GAME_MODE_KEY.to_string(), DataEntry::public("FreeForAll"));
    let record = world
        .directory
        .create_session(
            Uuid::new_v4(),
            CreateSessionOptions {
                name: "Game_1111".to_string(),
                max_players: 4,
                visibility: Visibility::Public,
                data,
            },
        )
        .await
        .unwrap();
    record.id
}

#[tokio::test(start_paused = true)]
async fn test_empty_directory_creates_and_publishes_session() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    let mut sub = host.quick_match.subscribe();

    let outcome = assert_ok!(host.quick_match.start_quick_match().await);

    let QuickMatchOutcome::Hosting { session_id, credential } = outcome else {
        panic!("expected to host, got {:?}", outcome);
    };
    let sessions = world.directory.sessions();
    assert_eq!(sessions.len(), 1);
    let record = &sessions[0];
    assert_eq!(record.id, session_id);
    assert_eq!(record.available_slots(), config.max_players - 1);
    assert_eq!(record.data_value(JOIN_CREDENTIAL_KEY), Some(credential.as_str()));
    assert_eq!(record.data[JOIN_CREDENTIAL_KEY].visibility, DataVisibility::Member);
    assert_eq!(record.data_value(GAME_MODE_KEY), Some("FreeForAll"));

    // Visible to others with capacity, credential hidden
    let found = world
        .directory
        .query_sessions(&SessionQuery::open_sessions(10))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].data_value(JOIN_CREDENTIAL_KEY), None);

    assert_eq!(
        statuses(&mut sub),
        vec![MatchStatus::Searching, MatchStatus::CreatingGame, MatchStatus::WaitingForPlayers]
    );
    assert_eq!(host.quick_match.role(), Some(SessionRole::Host));
    assert!(host.transport.is_host());
    assert_eq!(host.metrics.sessions_created.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_player_joins_existing_session() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    let guest = player(&world, &config);

    let QuickMatchOutcome::Hosting { session_id, .. } = host.quick_match.start_quick_match().await.unwrap() else {
        panic!("first player should host");
    };
    let mut guest_sub = guest.quick_match.subscribe();

    let outcome = guest.quick_match.start_quick_match().await.unwrap();

    assert_eq!(outcome, QuickMatchOutcome::Joined { session_id });
    assert!(guest.transport.is_connected_client());
    assert_eq!(guest.quick_match.role(), Some(SessionRole::Client));
    assert_eq!(world.directory.session_count(), 1);
    assert_eq!(world.directory.sessions()[0].players.len(), 2);

    let statuses = statuses(&mut guest_sub);
    assert_eq!(statuses.first(), Some(&MatchStatus::Searching));
    assert_eq!(statuses.last(), Some(&MatchStatus::Connected));
    assert!(statuses.contains(&MatchStatus::WaitingForHost));

    sleep(Duration::from_millis(200)).await;
    let snapshot = host.quick_match.authority_snapshot().unwrap();
    assert_eq!(snapshot.participants, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_countdown_starts_game_for_everyone() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    let guest = player(&world, &config);
    let mut host_sub = host.quick_match.subscribe();
    let mut guest_sub = guest.quick_match.subscribe();

    host.quick_match.start_quick_match().await.unwrap();
    guest.quick_match.start_quick_match().await.unwrap();

    let host_view = wait_for_start(&mut host_sub).await;
    let guest_view = wait_for_start(&mut guest_sub).await;

    assert_eq!(host_view, vec![0, 1]);
    assert_eq!(guest_view, host_view);
    let snapshot = host.quick_match.authority_snapshot().unwrap();
    assert!(snapshot.started);
    assert!(snapshot.countdown_remaining < 0.0);
    assert_eq!(host.metrics.games_started.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_guest_mirrors_countdown_in_order() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    let guest = player(&world, &config);
    let mut guest_sub = guest.quick_match.subscribe();

    host.quick_match.start_quick_match().await.unwrap();
    guest.quick_match.start_quick_match().await.unwrap();

    let mut countdown = Vec::new();
    let mut last_seq = None;
    loop {
        let notification = timeout(Duration::from_secs(30), guest_sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(last_seq.map_or(true, |seq| notification.seq > seq));
        last_seq = Some(notification.seq);

        match notification.event {
            SessionEvent::CountdownStarted { seconds } => countdown.push(seconds),
            SessionEvent::CountdownTick { remaining_secs } => countdown.push(remaining_secs),
            SessionEvent::GameStarted { .. } => break,
            _ => {}
        }
    }

    assert_eq!(countdown, vec![3, 2, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_searching_is_ignored() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);

    let (first, second) = tokio::join!(
        host.quick_match.start_quick_match(),
        host.quick_match.start_quick_match()
    );

    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(
        outcomes.iter().filter(|o| **o == QuickMatchOutcome::AlreadySearching).count(),
        1
    );
    assert_eq!(world.directory.query_count(), 1);
    assert_eq!(world.directory.create_count(), 1);

    // Still ignored once the session exists
    assert_eq!(
        host.quick_match.start_quick_match().await.unwrap(),
        QuickMatchOutcome::AlreadySearching
    );
    assert_eq!(world.directory.session_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_credential_falls_back_to_create() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let orphan = orphan_session(&world).await;
    let guest = player(&world, &config);
    let mut sub = guest.quick_match.subscribe();

    let outcome = guest.quick_match.start_quick_match().await.unwrap();

    let QuickMatchOutcome::Hosting { session_id, .. } = outcome else {
        panic!("expected fallback to host, got {:?}", outcome);
    };
    assert_ne!(session_id, orphan);
    assert_eq!(world.directory.create_count(), 2);
    assert_eq!(guest.metrics.create_fallbacks.load(Ordering::Relaxed), 1);
    assert_eq!(
        guest.metrics.credential_polls.load(Ordering::Relaxed),
        u64::from(config.credential_poll_attempts)
    );

    let orphan_record = world.directory.sessions().into_iter().find(|s| s.id == orphan).unwrap();
    assert_eq!(orphan_record.players.len(), 1);

    let statuses = statuses(&mut sub);
    assert!(statuses.contains(&MatchStatus::CredentialMissing));
    assert_eq!(statuses.last(), Some(&MatchStatus::WaitingForPlayers));
}

#[tokio::test(start_paused = true)]
async fn test_join_retries_until_transport_connects() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    let guest = player(&world, &config);
    host.quick_match.start_quick_match().await.unwrap();

    guest.transport.stall_next_connects(2);
    let started = tokio::time::Instant::now();
    let outcome = guest.quick_match.start_quick_match().await.unwrap();

    assert!(matches!(outcome, QuickMatchOutcome::Joined { .. }));
    assert_eq!(guest.transport.client_starts(), 3);
    assert!(started.elapsed() >= (config.connect_timeout + config.retry_cooldown) * 2);
    assert_eq!(guest.metrics.connect_attempt_failures.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_join_falls_back_to_create() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    let guest = player(&world, &config);
    let QuickMatchOutcome::Hosting { session_id: first, .. } = host.quick_match.start_quick_match().await.unwrap()
    else {
        panic!("first player should host");
    };

    guest.transport.stall_next_connects(3);
    let mut sub = guest.quick_match.subscribe();
    let outcome = guest.quick_match.start_quick_match().await.unwrap();

    let QuickMatchOutcome::Hosting { session_id, .. } = outcome else {
        panic!("expected fallback to host, got {:?}", outcome);
    };
    assert_ne!(session_id, first);
    assert!(statuses(&mut sub).contains(&MatchStatus::RelayConnectionFailed));

    let first_record = world.directory.sessions().into_iter().find(|s| s.id == first).unwrap();
    assert_eq!(first_record.players.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_full_session_is_not_offered() {
    let world = SimWorld::new();
    let config = MatchConfig {
        max_players: 2,
        ..MatchConfig::default()
    };
    let host = player(&world, &config);
    let guest = player(&world, &config);
    let late = player(&world, &config);

    host.quick_match.start_quick_match().await.unwrap();
    guest.quick_match.start_quick_match().await.unwrap();
    let outcome = late.quick_match.start_quick_match().await.unwrap();

    assert!(matches!(outcome, QuickMatchOutcome::Hosting { .. }));
    assert_eq!(world.directory.session_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_guest_leaving_cancels_countdown() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    let guest = player(&world, &config);
    let mut host_sub = host.quick_match.subscribe();

    host.quick_match.start_quick_match().await.unwrap();
    guest.quick_match.start_quick_match().await.unwrap();
    host_sub
        .wait_for(|e| matches!(e, SessionEvent::CountdownStarted { .. }))
        .await;

    guest.quick_match.leave().await;

    let cancelled = timeout(
        Duration::from_secs(5),
        host_sub.wait_for(|e| *e == SessionEvent::CountdownCancelled),
    )
    .await
    .unwrap();
    assert_eq!(cancelled, Some(SessionEvent::CountdownCancelled));

    sleep(Duration::from_secs(10)).await;
    let snapshot = host.quick_match.authority_snapshot().unwrap();
    assert!(!snapshot.started);
    assert_eq!(snapshot.participants, vec![0]);
    assert!(!guest.transport.is_listening());
    assert_eq!(world.directory.sessions()[0].players.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_leave_closes_session_and_allows_new_search() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    let mut sub = host.quick_match.subscribe();
    host.quick_match.start_quick_match().await.unwrap();

    host.quick_match.leave().await;

    assert_eq!(world.directory.session_count(), 0);
    assert!(!host.transport.is_listening());
    assert!(!host.quick_match.is_searching());
    assert!(host.quick_match.current_session().is_none());
    assert_eq!(statuses(&mut sub).last(), Some(&MatchStatus::Disconnected));

    let outcome = host.quick_match.start_quick_match().await.unwrap();
    assert!(matches!(outcome, QuickMatchOutcome::Hosting { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_keeps_session_alive() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    host.quick_match.start_quick_match().await.unwrap();

    sleep(Duration::from_secs(120)).await;

    assert_eq!(world.directory.session_count(), 1);
    assert!(host.metrics.heartbeats_sent.load(Ordering::Relaxed) >= 8);
}

#[tokio::test(start_paused = true)]
async fn test_failed_heartbeat_lets_session_expire() {
    let world = SimWorld::with_directory(InMemoryDirectory::with_heartbeat_timeout(Duration::from_secs(30)));
    let config = MatchConfig::default();
    let host = player(&world, &config);
    host.quick_match.start_quick_match().await.unwrap();

    world.directory.set_faults(DirectoryFaults {
        fail_heartbeats: true,
        ..DirectoryFaults::default()
    });
    sleep(Duration::from_secs(60)).await;

    assert_eq!(world.directory.session_count(), 0);
    assert_eq!(host.metrics.heartbeat_failures.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_is_terminal() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    host.auth.set_reject(true);
    let mut sub = host.quick_match.subscribe();

    let result = host.quick_match.start_quick_match().await;

    assert!(matches!(result, Err(MatchError::Authentication(_))));
    assert_eq!(statuses(&mut sub), vec![MatchStatus::AuthenticationFailed]);
    assert!(!host.quick_match.is_searching());
    assert_eq!(world.directory.query_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_retries_transient_sign_in() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    host.auth.fail_next(5);
    let mut sub = host.quick_match.subscribe();

    assert_ok!(host.quick_match.initialize().await);
    assert_eq!(statuses(&mut sub), vec![MatchStatus::ReadyToPlay]);
}

#[tokio::test(start_paused = true)]
async fn test_search_failure_resets_searching() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    world.directory.set_faults(DirectoryFaults {
        fail_queries: true,
        ..DirectoryFaults::default()
    });
    let mut sub = host.quick_match.subscribe();

    let result = host.quick_match.start_quick_match().await;

    assert!(matches!(result, Err(MatchError::Directory(_))));
    assert_eq!(statuses(&mut sub).last(), Some(&MatchStatus::SearchFailed));
    assert!(!host.quick_match.is_searching());
    assert_eq!(host.metrics.quick_matches_failed.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_relay_failure_releases_created_session() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    world.relay.set_fail_allocations(true);

    let result = host.quick_match.start_quick_match().await;

    assert_err!(&result);
    assert!(matches!(result, Err(MatchError::Transport(_))));
    assert_eq!(world.directory.session_count(), 0);
    assert!(!host.quick_match.is_searching());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_orchestrator_leaves_session() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    host.quick_match.start_quick_match().await.unwrap();
    let transport = host.transport.clone();
    assert_eq!(world.directory.session_count(), 1);

    drop(host);
    sleep(Duration::from_millis(10)).await;

    assert_eq!(world.directory.session_count(), 0);
    assert!(!transport.is_listening());
}

#[tokio::test(start_paused = true)]
async fn test_three_players_start_together() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let players: Vec<Player> = (0..3).map(|_| player(&world, &config)).collect();
    let mut subs: Vec<Subscription> = players.iter().map(|p| p.quick_match.subscribe()).collect();

    for p in &players {
        p.quick_match.start_quick_match().await.unwrap();
    }

    let mut views = Vec::new();
    for sub in &mut subs {
        views.push(wait_for_start(sub).await);
    }

    assert_eq!(views[0], vec![0, 1, 2]);
    assert!(views.iter().all(|v| *v == views[0]));
    assert_eq!(world.directory.session_count(), 1);
    assert_eq!(
        players[0].quick_match.authority_snapshot().map(|s| s.participants.len()),
        Some(3)
    );
}

#[tokio::test(start_paused = true)]
async fn test_player_joining_after_start_is_told_the_game_started() {
    let world = SimWorld::new();
    let config = MatchConfig::default();
    let host = player(&world, &config);
    let guest = player(&world, &config);
    let mut host_sub = host.quick_match.subscribe();

    host.quick_match.start_quick_match().await.unwrap();
    guest.quick_match.start_quick_match().await.unwrap();
    assert_eq!(wait_for_start(&mut host_sub).await, vec![0, 1]);

    let late = player(&world, &config);
    let mut late_sub = late.quick_match.subscribe();
    let outcome = assert_ok!(late.quick_match.start_quick_match().await);
    assert!(matches!(outcome, QuickMatchOutcome::Joined { .. }));

    assert_eq!(wait_for_start(&mut late_sub).await, vec![0, 1, 2]);
    assert_eq!(host.metrics.games_started.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_player_joining_mid_countdown_sees_it_start() {
    let world = SimWorld::new();
    let config = MatchConfig {
        countdown: Duration::from_secs(30),
        ..MatchConfig::default()
    };
    let host = player(&world, &config);
    let guest = player(&world, &config);

    host.quick_match.start_quick_match().await.unwrap();
    guest.quick_match.start_quick_match().await.unwrap();

    let late = player(&world, &config);
    let mut late_sub = late.quick_match.subscribe();
    late.quick_match.start_quick_match().await.unwrap();

    let mut countdown = Vec::new();
    loop {
        let notification = timeout(Duration::from_secs(60), late_sub.recv())
            .await
            .unwrap()
            .unwrap();
        match notification.event {
            SessionEvent::CountdownStarted { seconds } => countdown.push(seconds),
            SessionEvent::CountdownTick { remaining_secs } => {
                assert!(!countdown.is_empty(), "tick before the countdown was announced");
                countdown.push(remaining_secs);
            }
            SessionEvent::GameStarted { participants } => {
                assert_eq!(participants, vec![0, 1, 2]);
                break;
            }
            _ => {}
        }
    }

    assert!(countdown[0] > 1 && countdown[0] < 30);
    assert!(countdown.windows(2).all(|w| w[1] < w[0]));
    assert_eq!(countdown.last(), Some(&1));
}
