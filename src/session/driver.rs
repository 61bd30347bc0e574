//! Authoritative driver task
//!
//! One task owns the evaluation path: connection events and countdown ticks
//! are handled in the order they are selected, so the roster and barrier are
//! never touched concurrently.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::MatchConfig;
use crate::metrics::Metrics;
use crate::notify::NotificationBus;
use crate::session::barrier::BarrierState;
use crate::session::{AuthoritativeSession, SessionSnapshot};
use crate::transport::HostLink;

/// Handle to a running authoritative driver. Dropping it stops the task.
pub struct AuthorityHandle {
    session: Arc<Mutex<AuthoritativeSession>>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl AuthorityHandle {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().snapshot()
    }

    pub fn state(&self) -> BarrierState {
        self.session.lock().state()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop the driver and wait for it to exit
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AuthorityHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start the authoritative driver for a freshly started host
pub fn spawn_authority(
    config: &MatchConfig,
    link: HostLink,
    bus: NotificationBus,
    metrics: Arc<Metrics>,
) -> AuthorityHandle {
    let HostLink {
        local_connection,
        mut connections,
        replicator,
    } = link;

    let session = Arc::new(Mutex::new(AuthoritativeSession::new(
        config.max_players,
        config.min_players_to_start,
        config.countdown,
        bus,
        replicator,
        metrics,
    )));
    let (stop, mut stop_rx) = watch::channel(false);
    let tick_duration = config.barrier_tick;
    let task_session = session.clone();

    let task = tokio::spawn(async move {
        let mut ticker = interval(tick_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        info!("Authoritative driver started (local connection {})", local_connection);

        loop {
            tokio::select! {
                event = connections.recv() => {
                    match event {
                        Some(event) => {
                            debug!("Connection event: {:?}", event);
                            task_session.lock().handle(event);
                        }
                        None => {
                            info!("Host link closed, stopping authoritative driver");
                            break;
                        }
                    }
                }
                now = ticker.tick() => {
                    let elapsed = now.duration_since(last_tick);
                    last_tick = now;
                    task_session.lock().tick(elapsed);
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        debug!("Authoritative driver stop requested");
                        break;
                    }
                }
            }
        }
    });

    AuthorityHandle {
        session,
        stop,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::notify::SessionEvent;
    use crate::roster::ConnectionId;
    use crate::transport::{ConnectionEvent, EventReplicator};

    struct NullReplicator;

    impl EventReplicator for NullReplicator {
        fn replicate(&self, _event: &SessionEvent) {}
        fn send_to(&self, _id: ConnectionId, _event: &SessionEvent) {}
        fn disconnect(&self, _id: ConnectionId) {}
    }

    fn start(config: &MatchConfig) -> (AuthorityHandle, mpsc::UnboundedSender<ConnectionEvent>, NotificationBus) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = NotificationBus::new();
        let link = HostLink {
            local_connection: 0,
            connections: rx,
            replicator: Arc::new(NullReplicator),
        };
        let handle = spawn_authority(config, link, bus.clone(), Arc::new(Metrics::new()));
        (handle, tx, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_runs_to_start() {
        let config = MatchConfig::default();
        let (handle, tx, bus) = start(&config);
        let mut sub = bus.subscribe();

        tx.send(ConnectionEvent::Connected(0)).unwrap();
        tx.send(ConnectionEvent::Connected(1)).unwrap();

        let event = tokio::time::timeout(
            Duration::from_secs(10),
            sub.wait_for(|e| matches!(e, SessionEvent::GameStarted { .. })),
        )
        .await
        .unwrap();

        assert_eq!(event, Some(SessionEvent::GameStarted { participants: vec![0, 1] }));
        assert_eq!(handle.state(), BarrierState::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_announced_in_order() {
        let config = MatchConfig::default();
        let (_handle, tx, bus) = start(&config);
        let mut sub = bus.subscribe();

        tx.send(ConnectionEvent::Connected(0)).unwrap();
        tx.send(ConnectionEvent::Connected(1)).unwrap();

        let mut countdown = Vec::new();
        while let Some(n) = sub.recv().await {
            match n.event {
                SessionEvent::CountdownStarted { seconds } => countdown.push(seconds),
                SessionEvent::CountdownTick { remaining_secs } => countdown.push(remaining_secs),
                SessionEvent::GameStarted { .. } => break,
                _ => {}
            }
        }
        assert_eq!(countdown, vec![3, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_start() {
        let config = MatchConfig::default();
        let (handle, tx, bus) = start(&config);
        let mut sub = bus.subscribe();

        tx.send(ConnectionEvent::Connected(0)).unwrap();
        tx.send(ConnectionEvent::Connected(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        tx.send(ConnectionEvent::Disconnected(1)).unwrap();

        let cancelled = sub.wait_for(|e| *e == SessionEvent::CountdownCancelled).await;
        assert_eq!(cancelled, Some(SessionEvent::CountdownCancelled));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.state(), BarrierState::Idle);
        assert!(!handle.snapshot().started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task() {
        let config = MatchConfig::default();
        let (handle, _tx, _bus) = start(&config);
        assert!(handle.is_running());

        handle.stop().await;
    }
}
