//! Transport handoff
//!
//! Host path: allocate, mint a credential, start listening.
//! Client path: resolve the credential and connect, with a bounded retry loop
//! that absorbs credentials which are not yet active right after creation.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::MatchConfig;
use crate::metrics::Metrics;
use crate::transport::{HostLink, JoinCredential, NetworkTransport, RelayService, TransportError};

/// Timing for the client connect loop
#[derive(Debug, Clone, Copy)]
pub struct HandoffTiming {
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub retry_cooldown: Duration,
}

impl Default for HandoffTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(100),
            retry_cooldown: Duration::from_secs(1),
        }
    }
}

impl From<&MatchConfig> for HandoffTiming {
    fn from(config: &MatchConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            poll_interval: config.connect_poll_interval,
            retry_cooldown: config.retry_cooldown,
        }
    }
}

/// A started host endpoint
#[derive(Debug)]
pub struct HostEndpoint {
    pub credential: JoinCredential,
    pub link: HostLink,
}

/// Bridges join credentials and the local transport
#[derive(Clone)]
pub struct TransportHandoff {
    relay: Arc<dyn RelayService>,
    transport: Arc<dyn NetworkTransport>,
    timing: HandoffTiming,
    metrics: Arc<Metrics>,
}

impl TransportHandoff {
    pub fn new(
        relay: Arc<dyn RelayService>,
        transport: Arc<dyn NetworkTransport>,
        timing: HandoffTiming,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            relay,
            transport,
            timing,
            metrics,
        }
    }

    pub fn transport(&self) -> &Arc<dyn NetworkTransport> {
        &self.transport
    }

    /// Allocate relay resources for `capacity - 1` remote clients and start hosting.
    ///
    /// Failures are terminal for this attempt; nothing is retried here.
    pub async fn create_host_endpoint(&self, capacity: usize) -> Result<HostEndpoint, TransportError> {
        let remote_slots = capacity.saturating_sub(1).max(1);

        let (allocation, credential) = self.relay.allocate(remote_slots).await?;
        info!(
            "Relay allocated {} ({} remote slots), join code {}",
            allocation.allocation_id, remote_slots, credential
        );

        let link = self.transport.start_host(&allocation).await?;
        info!("Host started, local connection {}", link.local_connection);

        Ok(HostEndpoint { credential, link })
    }

    /// Connect as a client, retrying up to `max_retries` attempts.
    pub async fn join_as_client(
        &self,
        credential: &JoinCredential,
        max_retries: u32,
    ) -> Result<(), TransportError> {
        let max_retries = max_retries.max(1);

        for attempt in 1..=max_retries {
            if attempt > 1 {
                sleep(self.timing.retry_cooldown).await;
            }

            debug!("Connect attempt {}/{}", attempt, max_retries);
            Metrics::incr(&self.metrics.connect_attempts);

            match self.try_connect(credential).await {
                Ok(()) => {
                    info!("Connected to host on attempt {}/{}", attempt, max_retries);
                    return Ok(());
                }
                Err(e) => {
                    Metrics::incr(&self.metrics.connect_attempt_failures);
                    warn!("Connect attempt {}/{} failed: {}", attempt, max_retries, e);
                    if self.transport.is_listening() {
                        self.transport.shutdown().await;
                    }
                }
            }
        }

        warn!("Giving up after {} connect attempts", max_retries);
        Err(TransportError::RetriesExhausted { attempts: max_retries })
    }

    async fn try_connect(&self, credential: &JoinCredential) -> Result<(), TransportError> {
        let allocation = self.relay.resolve(credential).await?;
        self.transport.start_client(&allocation).await?;

        let deadline = Instant::now() + self.timing.connect_timeout;
        while !self.transport.is_connected_client() {
            if Instant::now() >= deadline {
                return Err(TransportError::ConnectTimeout(self.timing.connect_timeout));
            }
            sleep(self.timing.poll_interval).await;
        }
        Ok(())
    }
}
