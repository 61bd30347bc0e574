//! Relay and transport seams
//!
//! The relay mints allocations and join credentials; the network transport
//! turns an allocation into a running host or client connection. Both are
//! external collaborators reached through the traits below.

pub mod handoff;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::notify::SessionEvent;
use crate::roster::ConnectionId;

/// Opaque join credential minted by the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinCredential(String);

impl JoinCredential {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for JoinCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection parameters for a relay allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub allocation_id: Uuid,
    pub relay_address: SocketAddr,
    pub key: Vec<u8>,
    pub connection_data: Vec<u8>,
    /// Present when resolved by a joining client
    pub host_connection_data: Option<Vec<u8>>,
}

/// Transport-level membership change seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
}

/// Host-side channel back to connected clients
pub trait EventReplicator: Send + Sync {
    /// Broadcast authoritative state to every connected client
    fn replicate(&self, event: &SessionEvent);
    /// Send state to a single client
    fn send_to(&self, id: ConnectionId, event: &SessionEvent);
    /// Start including a client in broadcasts once the roster accepted it
    fn admit(&self, _id: ConnectionId) {}
    /// Drop a client connection
    fn disconnect(&self, id: ConnectionId);
}

/// What a started host hands back to the session owner
pub struct HostLink {
    pub local_connection: ConnectionId,
    pub connections: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub replicator: Arc<dyn EventReplicator>,
}

impl fmt::Debug for HostLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLink")
            .field("local_connection", &self.local_connection)
            .finish_non_exhaustive()
    }
}

/// Relay service: allocates and resolves relay endpoints
#[async_trait]
pub trait RelayService: Send + Sync {
    /// Reserve relay resources for `remote_slots` remote clients
    async fn allocate(&self, remote_slots: usize) -> Result<(Allocation, JoinCredential), TransportError>;

    /// Look up the allocation behind a join credential
    async fn resolve(&self, credential: &JoinCredential) -> Result<Allocation, TransportError>;
}

/// Local network transport
#[async_trait]
pub trait NetworkTransport: Send + Sync {
    /// Configure with a host allocation and start listening
    async fn start_host(&self, allocation: &Allocation) -> Result<HostLink, TransportError>;

    /// Configure with a resolved allocation and begin connecting
    async fn start_client(&self, allocation: &Allocation) -> Result<(), TransportError>;

    /// Whether a client connection has completed
    fn is_connected_client(&self) -> bool;

    /// Whether the transport is running in any role
    fn is_listening(&self) -> bool;

    /// Replicated authoritative events for a connected client. Yields the
    /// receiver once per connection.
    fn take_replicated_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>>;

    /// Stop whatever is running
    async fn shutdown(&self);
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Relay allocation failed: {0}")]
    Allocation(String),
    #[error("Join credential could not be resolved: {0}")]
    Resolve(String),
    #[error("Transport failed to start: {0}")]
    StartFailed(String),
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("Could not connect after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("Host endpoint is gone")]
    HostUnavailable,
}
