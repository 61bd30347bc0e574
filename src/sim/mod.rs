//! In-process backends for local runs and tests
//!
//! One [`SimWorld`] holds the shared directory and relay; every simulated
//! player gets its own authenticator and transport from [`SimWorld::peer`].

pub mod auth;
pub mod cache;
pub mod directory;
pub mod relay;
pub mod transport;

use std::sync::Arc;

use crate::matchmaking::MatchServices;
use crate::sim::auth::AnonymousAuthenticator;
use crate::sim::cache::LocalHostCache;
use crate::sim::directory::InMemoryDirectory;
use crate::sim::relay::InMemoryRelay;
use crate::sim::transport::MemoryTransport;

/// Shared services every simulated player talks to
#[derive(Clone)]
pub struct SimWorld {
    pub directory: Arc<InMemoryDirectory>,
    pub relay: InMemoryRelay,
}

/// Per-player handles, kept concrete so tests can inject faults
pub struct SimPeer {
    pub auth: Arc<AnonymousAuthenticator>,
    pub transport: Arc<MemoryTransport>,
    pub services: MatchServices,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::with_directory(InMemoryDirectory::new())
    }

    pub fn with_directory(directory: InMemoryDirectory) -> Self {
        Self {
            directory: Arc::new(directory),
            relay: InMemoryRelay::new(),
        }
    }

    pub fn peer(&self) -> SimPeer {
        self.build_peer(MemoryTransport::new(self.relay.clone()))
    }

    /// A peer whose transport records hosting details in `cache`
    pub fn peer_with_cache(&self, cache: Arc<LocalHostCache>) -> SimPeer {
        self.build_peer(MemoryTransport::new(self.relay.clone()).with_cache(cache))
    }

    fn build_peer(&self, transport: MemoryTransport) -> SimPeer {
        let auth = Arc::new(AnonymousAuthenticator::new());
        let transport = Arc::new(transport);
        let services = MatchServices {
            auth: auth.clone(),
            directory: self.directory.clone(),
            relay: Arc::new(self.relay.clone()),
            transport: transport.clone(),
        };
        SimPeer {
            auth,
            transport,
            services,
        }
    }
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}
