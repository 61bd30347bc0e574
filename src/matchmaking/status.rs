use std::fmt;

use serde::{Deserialize, Serialize};

/// Human-readable matchmaking status shown to the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchStatus {
    ReadyToPlay,
    AuthenticationFailed,
    Searching,
    JoiningGame,
    WaitingForHost,
    Connecting,
    Connected,
    CreatingGame,
    WaitingForPlayers,
    SearchFailed,
    JoinFailed,
    CredentialMissing,
    RelayConnectionFailed,
    CreateFailed,
    Disconnected,
}

impl MatchStatus {
    pub fn text(&self) -> &'static str {
        match self {
            MatchStatus::ReadyToPlay => "Ready to play",
            MatchStatus::AuthenticationFailed => "Authentication failed",
            MatchStatus::Searching => "Searching for game...",
            MatchStatus::JoiningGame => "Joining game...",
            MatchStatus::WaitingForHost => "Waiting for host...",
            MatchStatus::Connecting => "Connecting...",
            MatchStatus::Connected => "Connected!",
            MatchStatus::CreatingGame => "Creating game...",
            MatchStatus::WaitingForPlayers => "Waiting for players...",
            MatchStatus::SearchFailed => "Failed to search for games",
            MatchStatus::JoinFailed => "Failed to join game",
            MatchStatus::CredentialMissing => "Host is not ready",
            MatchStatus::RelayConnectionFailed => "Relay connection failed",
            MatchStatus::CreateFailed => "Failed to create game",
            MatchStatus::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}
