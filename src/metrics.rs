//! Prometheus-compatible metrics
//!
//! Counters for the session-formation flow, rendered in Prometheus text
//! format. The simulation binary serves them on loopback when
//! `METRICS_PORT` is set.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, debug};

/// Metrics registry for session formation
#[derive(Debug)]
pub struct Metrics {
    // Matchmaking
    pub quick_matches_started: AtomicU64,
    pub quick_matches_failed: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_joined: AtomicU64,
    pub create_fallbacks: AtomicU64,
    pub credential_polls: AtomicU64,
    pub auth_failures: AtomicU64,

    // Directory liveness
    pub heartbeats_sent: AtomicU64,
    pub heartbeat_failures: AtomicU64,
    pub directory_errors: AtomicU64,

    // Transport handoff
    pub connect_attempts: AtomicU64,
    pub connect_attempt_failures: AtomicU64,

    // Authoritative side
    pub participants_connected: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub countdowns_started: AtomicU64,
    pub countdowns_cancelled: AtomicU64,
    pub games_started: AtomicU64,

    start_time: Instant,

    // Rolling join latencies (search start -> transport connected)
    join_latency_ms: RwLock<VecDeque<u64>>,
    pub join_latency_p95_ms: AtomicU64,
    pub join_latency_max_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            quick_matches_started: AtomicU64::new(0),
            quick_matches_failed: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_joined: AtomicU64::new(0),
            create_fallbacks: AtomicU64::new(0),
            credential_polls: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            heartbeat_failures: AtomicU64::new(0),
            directory_errors: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            connect_attempt_failures: AtomicU64::new(0),
            participants_connected: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            countdowns_started: AtomicU64::new(0),
            countdowns_cancelled: AtomicU64::new(0),
            games_started: AtomicU64::new(0),
            start_time: Instant::now(),
            join_latency_ms: RwLock::new(VecDeque::with_capacity(256)),
            join_latency_p95_ms: AtomicU64::new(0),
            join_latency_max_ms: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long a quick match took to reach a connected transport
    pub fn record_join_latency(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;

        let mut history = self.join_latency_ms.write();
        history.push_back(ms);

        // Keep last 256 samples
        while history.len() > 256 {
            history.pop_front();
        }

        let mut sorted: Vec<u64> = history.iter().copied().collect();
        sorted.sort_unstable();
        let p95_idx = ((sorted.len() as f32 * 0.95) as usize).min(sorted.len() - 1);

        if let Some(p95) = sorted.get(p95_idx) {
            self.join_latency_p95_ms.store(*p95, Ordering::Relaxed);
        }
        self.join_latency_max_ms
            .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Matchmaking
        metric!("quickmatch_searches_total", "Quick-match searches started", "counter",
            self.quick_matches_started.load(Ordering::Relaxed));
        metric!("quickmatch_searches_failed_total", "Quick-match searches ending in failure", "counter",
            self.quick_matches_failed.load(Ordering::Relaxed));
        metric!("quickmatch_sessions_created_total", "Sessions created as host", "counter",
            self.sessions_created.load(Ordering::Relaxed));
        metric!("quickmatch_sessions_joined_total", "Sessions joined as client", "counter",
            self.sessions_joined.load(Ordering::Relaxed));
        metric!("quickmatch_create_fallbacks_total", "Joins that fell back to creating a session", "counter",
            self.create_fallbacks.load(Ordering::Relaxed));
        metric!("quickmatch_credential_polls_total", "Metadata polls while waiting for a join credential", "counter",
            self.credential_polls.load(Ordering::Relaxed));
        metric!("quickmatch_auth_failures_total", "Failed anonymous sign-ins", "counter",
            self.auth_failures.load(Ordering::Relaxed));

        // Directory
        metric!("quickmatch_heartbeats_total", "Directory heartbeats sent", "counter",
            self.heartbeats_sent.load(Ordering::Relaxed));
        metric!("quickmatch_heartbeat_failures_total", "Directory heartbeats that failed", "counter",
            self.heartbeat_failures.load(Ordering::Relaxed));
        metric!("quickmatch_directory_errors_total", "Directory operations that failed", "counter",
            self.directory_errors.load(Ordering::Relaxed));

        // Transport
        metric!("quickmatch_connect_attempts_total", "Client connect attempts", "counter",
            self.connect_attempts.load(Ordering::Relaxed));
        metric!("quickmatch_connect_attempt_failures_total", "Client connect attempts that failed", "counter",
            self.connect_attempt_failures.load(Ordering::Relaxed));
        metric!("quickmatch_join_latency_p95_milliseconds", "95th percentile search-to-connected time", "gauge",
            self.join_latency_p95_ms.load(Ordering::Relaxed));
        metric!("quickmatch_join_latency_max_milliseconds", "Maximum search-to-connected time", "gauge",
            self.join_latency_max_ms.load(Ordering::Relaxed));

        // Authority
        metric!("quickmatch_participants_connected", "Participants in the authoritative roster", "gauge",
            self.participants_connected.load(Ordering::Relaxed));
        metric!("quickmatch_connections_rejected_total", "Connections rejected at capacity", "counter",
            self.connections_rejected.load(Ordering::Relaxed));
        metric!("quickmatch_countdowns_started_total", "Start countdowns begun", "counter",
            self.countdowns_started.load(Ordering::Relaxed));
        metric!("quickmatch_countdowns_cancelled_total", "Start countdowns cancelled", "counter",
            self.countdowns_cancelled.load(Ordering::Relaxed));
        metric!("quickmatch_games_started_total", "Games started by the barrier", "counter",
            self.games_started.load(Ordering::Relaxed));
        metric!("quickmatch_uptime_seconds", "Process uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Expose `/metrics` on the loopback interface
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
    info!("Metrics available at http://{}/metrics", listener.local_addr()?);
    serve_metrics(listener, metrics).await
}

/// Answer scrapes on an already bound listener, one short-lived task per request
pub async fn serve_metrics(listener: TcpListener, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 512];
            let n = match socket.read(&mut buffer).await {
                Ok(n) => n,
                Err(e) => {
                    debug!("Metrics scrape from {} failed: {}", peer, e);
                    return;
                }
            };
            let request = String::from_utf8_lossy(&buffer[..n]);
            let response = scrape_response(&metrics, &request);
            if let Err(e) = socket.write_all(response.as_bytes()).await {
                debug!("Metrics reply to {} failed: {}", peer, e);
            }
        });
    }
}

fn scrape_response(metrics: &Metrics, request: &str) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("GET "))
        .and_then(|rest| rest.split_whitespace().next());

    match path {
        Some("/metrics") => {
            let body = metrics.to_prometheus();
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
        }
        _ => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
    }
}
