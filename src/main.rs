use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use quickmatch::config::MatchConfig;
use quickmatch::matchmaking::{QuickMatch, QuickMatchOutcome};
use quickmatch::metrics::{self, Metrics};
use quickmatch::notify::{NotificationBus, SessionEvent, Subscription};
use quickmatch::sim::cache::LocalHostCache;
use quickmatch::sim::SimWorld;

/// Longest a simulated client waits for the game to start
const START_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("QuickMatch simulator v{}", env!("CARGO_PKG_VERSION"));

    let config = MatchConfig::load_or_default();
    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        "Configuration loaded: max_players={}, min_to_start={}, countdown={:?}, mode={}",
        config.max_players, config.min_players_to_start, config.countdown, config.game_mode
    );

    let metrics = Arc::new(Metrics::new());

    // Metrics endpoint only when METRICS_PORT is set
    if let Some(port) = std::env::var("METRICS_PORT").ok().and_then(|s| s.parse::<u16>().ok()) {
        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_clone, port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let client_count: usize = std::env::var("SIM_CLIENTS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|n| *n >= 1)
        .unwrap_or(3)
        .min(config.max_players);

    let cache = match std::env::var("LOCAL_CACHE_PATH") {
        Ok(path) => Arc::new(LocalHostCache::open(&path)?),
        Err(_) => Arc::new(LocalHostCache::in_memory()),
    };

    let world = SimWorld::new();
    let mut matches = Vec::with_capacity(client_count);
    for i in 0..client_count {
        let peer = world.peer_with_cache(cache.clone());
        let quick_match = Arc::new(QuickMatch::new(
            config.clone(),
            peer.services,
            NotificationBus::new(),
            metrics.clone(),
        ));
        quick_match.initialize().await?;
        info!("Client {} ready", i);
        matches.push(quick_match);
    }

    let run = run_clients(&matches);

    tokio::select! {
        result = run => {
            match result {
                Ok(()) => info!("Every client saw the game start"),
                Err(e) => error!("Simulation failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Cleanup
    for quick_match in &matches {
        quick_match.leave().await;
    }
    if let Some(host) = cache.active_host() {
        warn!("Host cache still points at {}", host);
    }

    info!("Simulation stopped\n{}", metrics.to_prometheus());
    Ok(())
}

/// Start every client with a short stagger and wait until each observes the
/// game start
async fn run_clients(matches: &[Arc<QuickMatch>]) -> anyhow::Result<()> {
    let mut waiters = Vec::with_capacity(matches.len());

    for (i, quick_match) in matches.iter().enumerate() {
        let subscription = quick_match.subscribe();
        waiters.push(tokio::spawn(run_client(i, quick_match.clone(), subscription)));

        // Give the first client time to publish its session
        tokio::time::sleep(Duration::from_millis(750)).await;
    }

    for waiter in waiters {
        waiter.await??;
    }
    Ok(())
}

async fn run_client(i: usize, quick_match: Arc<QuickMatch>, mut subscription: Subscription) -> anyhow::Result<()> {
    match quick_match.start_quick_match().await? {
        QuickMatchOutcome::Hosting { session_id, credential } => {
            info!("Client {} hosting {} (join code {})", i, session_id, credential)
        }
        QuickMatchOutcome::Joined { session_id } => info!("Client {} joined {}", i, session_id),
        QuickMatchOutcome::AlreadySearching => {}
    }

    let started = tokio::time::timeout(
        START_TIMEOUT,
        subscription.wait_for(|e| matches!(e, SessionEvent::GameStarted { .. })),
    )
    .await
    .map_err(|_| anyhow::anyhow!("client {} timed out waiting for the game to start", i))?;

    match started {
        Some(SessionEvent::GameStarted { participants }) => {
            info!("Client {} sees the game start with {} participants", i, participants.len());
            Ok(())
        }
        _ => Err(anyhow::anyhow!("client {} lost its notification stream", i)),
    }
}
