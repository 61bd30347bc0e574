//! In-memory relay
//!
//! Mints allocations and join codes, and doubles as the network that host
//! and client transports talk through.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::notify::SessionEvent;
use crate::roster::ConnectionId;
use crate::transport::{
    Allocation, ConnectionEvent, EventReplicator, HostLink, JoinCredential, RelayService, TransportError,
};

const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const JOIN_CODE_LEN: usize = 6;

/// Connection id the relay assigns to the host itself
pub const HOST_CONNECTION: ConnectionId = 0;

struct ClientSlot {
    events: mpsc::UnboundedSender<SessionEvent>,
    connected: Arc<AtomicBool>,
    /// Broadcasts reach the client only after the host admits it
    admitted: bool,
}

struct HostEntry {
    connections: mpsc::UnboundedSender<ConnectionEvent>,
    clients: HashMap<ConnectionId, ClientSlot>,
    next_connection: ConnectionId,
}

#[derive(Default)]
struct RelayInner {
    allocations: Mutex<HashMap<String, Allocation>>,
    hosts: Mutex<HashMap<Uuid, HostEntry>>,
    stale_resolves: AtomicU32,
    fail_allocations: AtomicBool,
}

/// A live client connection through the relay
pub struct ClientConnection {
    pub connection: ConnectionId,
    pub connected: Arc<AtomicBool>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[derive(Clone, Default)]
pub struct InMemoryRelay {
    inner: Arc<RelayInner>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` resolves fail as if the code were not active yet
    pub fn fail_next_resolves(&self, count: u32) {
        self.inner.stale_resolves.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_allocations(&self, fail: bool) {
        self.inner.fail_allocations.store(fail, Ordering::SeqCst);
    }

    /// Join code minted for an allocation
    pub fn code_for(&self, allocation_id: Uuid) -> Option<JoinCredential> {
        self.inner
            .allocations
            .lock()
            .iter()
            .find(|(_, a)| a.allocation_id == allocation_id)
            .map(|(code, _)| JoinCredential::new(code.clone()))
    }

    pub fn host_count(&self) -> usize {
        self.inner.hosts.lock().len()
    }

    /// Register a started host. The host's own connection is reported first.
    pub(crate) fn open_host(&self, allocation: &Allocation) -> Result<HostLink, TransportError> {
        let mut hosts = self.inner.hosts.lock();
        if hosts.contains_key(&allocation.allocation_id) {
            return Err(TransportError::StartFailed("allocation already hosted".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ConnectionEvent::Connected(HOST_CONNECTION));
        hosts.insert(
            allocation.allocation_id,
            HostEntry {
                connections: tx,
                clients: HashMap::new(),
                next_connection: HOST_CONNECTION + 1,
            },
        );
        info!("Relay host opened for {}", allocation.allocation_id);

        Ok(HostLink {
            local_connection: HOST_CONNECTION,
            connections: rx,
            replicator: Arc::new(RelayReplicator {
                relay: Arc::downgrade(&self.inner),
                allocation_id: allocation.allocation_id,
            }),
        })
    }

    /// Tear down a host and every client attached to it. Its join code dies too.
    pub(crate) fn close_host(&self, allocation_id: Uuid) {
        if let Some(entry) = self.inner.hosts.lock().remove(&allocation_id) {
            for slot in entry.clients.values() {
                slot.connected.store(false, Ordering::SeqCst);
            }
            info!("Relay host {} closed, {} clients dropped", allocation_id, entry.clients.len());
        }
        self.inner
            .allocations
            .lock()
            .retain(|_, a| a.allocation_id != allocation_id);
    }

    /// Attach a client to a hosted allocation
    pub(crate) fn connect_client(&self, allocation_id: Uuid) -> Result<ClientConnection, TransportError> {
        let mut hosts = self.inner.hosts.lock();
        let entry = hosts
            .get_mut(&allocation_id)
            .ok_or(TransportError::HostUnavailable)?;

        let connection = entry.next_connection;
        entry.next_connection += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        entry.clients.insert(
            connection,
            ClientSlot {
                events: tx,
                connected: connected.clone(),
                admitted: false,
            },
        );

        if entry.connections.send(ConnectionEvent::Connected(connection)).is_err() {
            entry.clients.remove(&connection);
            return Err(TransportError::HostUnavailable);
        }
        debug!("Client {} attached to {}", connection, allocation_id);

        Ok(ClientConnection {
            connection,
            connected,
            events: rx,
        })
    }

    /// Detach a client, telling the host
    pub(crate) fn disconnect_client(&self, allocation_id: Uuid, connection: ConnectionId) {
        let mut hosts = self.inner.hosts.lock();
        if let Some(entry) = hosts.get_mut(&allocation_id) {
            if let Some(slot) = entry.clients.remove(&connection) {
                slot.connected.store(false, Ordering::SeqCst);
                let _ = entry.connections.send(ConnectionEvent::Disconnected(connection));
                debug!("Client {} detached from {}", connection, allocation_id);
            }
        }
    }
}

#[async_trait]
impl RelayService for InMemoryRelay {
    async fn allocate(&self, remote_slots: usize) -> Result<(Allocation, JoinCredential), TransportError> {
        if self.inner.fail_allocations.load(Ordering::SeqCst) {
            return Err(TransportError::Allocation("no relay capacity".to_string()));
        }
        if remote_slots == 0 {
            return Err(TransportError::Allocation("zero remote slots requested".to_string()));
        }

        let mut rng = rand::thread_rng();
        let allocation = Allocation {
            allocation_id: Uuid::new_v4(),
            relay_address: SocketAddr::from((Ipv4Addr::LOCALHOST, rng.gen_range(7000..8000))),
            key: (0..16).map(|_| rng.gen()).collect(),
            connection_data: (0..8).map(|_| rng.gen()).collect(),
            host_connection_data: None,
        };

        let mut allocations = self.inner.allocations.lock();
        let code = loop {
            let code: String = (0..JOIN_CODE_LEN)
                .map(|_| JOIN_CODE_ALPHABET[rng.gen_range(0..JOIN_CODE_ALPHABET.len())] as char)
                .collect();
            if !allocations.contains_key(&code) {
                break code;
            }
        };
        allocations.insert(code.clone(), allocation.clone());
        debug!("Relay allocated {} for {} remote slots", code, remote_slots);

        Ok((allocation, JoinCredential::new(code)))
    }

    async fn resolve(&self, credential: &JoinCredential) -> Result<Allocation, TransportError> {
        let stale = self
            .inner
            .stale_resolves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stale {
            return Err(TransportError::Resolve(format!("join code {} not active yet", credential)));
        }

        let allocations = self.inner.allocations.lock();
        let allocation = allocations
            .get(credential.as_str())
            .ok_or_else(|| TransportError::Resolve(format!("unknown join code {}", credential)))?;

        let mut resolved = allocation.clone();
        resolved.host_connection_data = Some(allocation.connection_data.clone());
        Ok(resolved)
    }
}

/// Host-side replication through the relay
struct RelayReplicator {
    relay: Weak<RelayInner>,
    allocation_id: Uuid,
}

impl EventReplicator for RelayReplicator {
    fn replicate(&self, event: &SessionEvent) {
        let Some(relay) = self.relay.upgrade() else {
            return;
        };
        let mut hosts = relay.hosts.lock();
        if let Some(entry) = hosts.get_mut(&self.allocation_id) {
            entry
                .clients
                .retain(|_, slot| !slot.admitted || slot.events.send(event.clone()).is_ok());
        }
    }

    fn send_to(&self, id: ConnectionId, event: &SessionEvent) {
        let Some(relay) = self.relay.upgrade() else {
            return;
        };
        let mut hosts = relay.hosts.lock();
        if let Some(entry) = hosts.get_mut(&self.allocation_id) {
            if entry
                .clients
                .get(&id)
                .is_some_and(|slot| slot.events.send(event.clone()).is_err())
            {
                entry.clients.remove(&id);
            }
        }
    }

    fn admit(&self, id: ConnectionId) {
        let Some(relay) = self.relay.upgrade() else {
            return;
        };
        let mut hosts = relay.hosts.lock();
        if let Some(slot) = hosts
            .get_mut(&self.allocation_id)
            .and_then(|entry| entry.clients.get_mut(&id))
        {
            slot.admitted = true;
        }
    }

    fn disconnect(&self, id: ConnectionId) {
        let Some(relay) = self.relay.upgrade() else {
            return;
        };
        let mut hosts = relay.hosts.lock();
        if let Some(entry) = hosts.get_mut(&self.allocation_id) {
            if let Some(slot) = entry.clients.remove(&id) {
                slot.connected.store(false, Ordering::SeqCst);
                warn!("Relay dropped client {} on host request", id);
            }
        }
    }
}
