//! QuickMatch Library
//!
//! Session formation for small peer-hosted multiplayer games: find or create
//! a lobby in a session directory, hand off to a relay transport, and hold
//! every participant until an authoritative countdown starts the game.
//!
//! # Features
//!
//! - `local_sim` - In-memory directory, relay and transport for local runs and tests (enabled by default)

pub mod auth;
pub mod config;
pub mod directory;
pub mod matchmaking;
pub mod metrics;
pub mod notify;
pub mod roster;
pub mod session;
pub mod transport;

#[cfg(feature = "local_sim")]
pub mod sim;
