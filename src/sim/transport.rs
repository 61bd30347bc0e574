//! In-memory network transport backed by [`InMemoryRelay`]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::notify::SessionEvent;
use crate::roster::ConnectionId;
use crate::sim::cache::LocalHostCache;
use crate::sim::relay::InMemoryRelay;
use crate::transport::{Allocation, HostLink, NetworkTransport, TransportError};

enum Role {
    Idle,
    Host {
        allocation_id: Uuid,
    },
    Client {
        allocation_id: Uuid,
        connection: Option<ConnectionId>,
        connected: Arc<AtomicBool>,
    },
}

pub struct MemoryTransport {
    relay: InMemoryRelay,
    role: Mutex<Role>,
    replicated: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    cache: Option<Arc<LocalHostCache>>,
    start_failures: AtomicU32,
    silent_starts: AtomicU32,
    client_starts: AtomicU32,
}

impl MemoryTransport {
    pub fn new(relay: InMemoryRelay) -> Self {
        Self {
            relay,
            role: Mutex::new(Role::Idle),
            replicated: Mutex::new(None),
            cache: None,
            start_failures: AtomicU32::new(0),
            silent_starts: AtomicU32::new(0),
            client_starts: AtomicU32::new(0),
        }
    }

    /// Record host details in `cache` while hosting
    pub fn with_cache(mut self, cache: Arc<LocalHostCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Make the next `count` client starts fail outright
    pub fn fail_next_starts(&self, count: u32) {
        self.start_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` client starts succeed but never connect
    pub fn stall_next_connects(&self, count: u32) {
        self.silent_starts.store(count, Ordering::SeqCst);
    }

    pub fn client_starts(&self) -> u32 {
        self.client_starts.load(Ordering::SeqCst)
    }

    pub fn is_host(&self) -> bool {
        matches!(*self.role.lock(), Role::Host { .. })
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl NetworkTransport for MemoryTransport {
    async fn start_host(&self, allocation: &Allocation) -> Result<HostLink, TransportError> {
        if !matches!(*self.role.lock(), Role::Idle) {
            return Err(TransportError::StartFailed("transport already running".to_string()));
        }

        let link = self.relay.open_host(allocation)?;
        *self.role.lock() = Role::Host {
            allocation_id: allocation.allocation_id,
        };

        if let Some(cache) = &self.cache {
            let code = self.relay.code_for(allocation.allocation_id);
            if let Err(e) = cache.record_host(allocation.relay_address, code.as_ref()) {
                warn!("Failed to cache host details: {}", e);
            }
        }
        info!("Hosting on {}", allocation.relay_address);
        Ok(link)
    }

    async fn start_client(&self, allocation: &Allocation) -> Result<(), TransportError> {
        self.client_starts.fetch_add(1, Ordering::SeqCst);
        if !matches!(*self.role.lock(), Role::Idle) {
            return Err(TransportError::StartFailed("transport already running".to_string()));
        }
        if Self::take_one(&self.start_failures) {
            return Err(TransportError::StartFailed("client failed to start".to_string()));
        }

        if Self::take_one(&self.silent_starts) {
            debug!("Client start for {} will never connect", allocation.allocation_id);
            *self.role.lock() = Role::Client {
                allocation_id: allocation.allocation_id,
                connection: None,
                connected: Arc::new(AtomicBool::new(false)),
            };
            return Ok(());
        }

        let client = self.relay.connect_client(allocation.allocation_id)?;
        *self.replicated.lock() = Some(client.events);
        *self.role.lock() = Role::Client {
            allocation_id: allocation.allocation_id,
            connection: Some(client.connection),
            connected: client.connected,
        };
        debug!("Client connection {} started", client.connection);
        Ok(())
    }

    fn is_connected_client(&self) -> bool {
        match &*self.role.lock() {
            Role::Client { connected, .. } => connected.load(Ordering::SeqCst),
            _ => false,
        }
    }

    fn is_listening(&self) -> bool {
        !matches!(*self.role.lock(), Role::Idle)
    }

    fn take_replicated_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.replicated.lock().take()
    }

    async fn shutdown(&self) {
        let role = std::mem::replace(&mut *self.role.lock(), Role::Idle);
        self.replicated.lock().take();

        match role {
            Role::Idle => {}
            Role::Host { allocation_id } => {
                self.relay.close_host(allocation_id);
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.clear_host() {
                        warn!("Failed to clear cached host details: {}", e);
                    }
                }
                info!("Host shut down");
            }
            Role::Client {
                allocation_id,
                connection,
                ..
            } => {
                if let Some(connection) = connection {
                    self.relay.disconnect_client(allocation_id, connection);
                }
                debug!("Client shut down");
            }
        }
    }
}
