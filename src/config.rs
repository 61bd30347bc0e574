use std::time::Duration;

/// Matchmaking and session-formation configuration
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Maximum participants per session (host included)
    pub max_players: usize,
    /// Participants required before the start countdown begins
    pub min_players_to_start: usize,
    /// Length of the start countdown
    pub countdown: Duration,
    /// How often the authoritative side advances the countdown
    pub barrier_tick: Duration,
    /// Public game-mode tag written into session metadata
    pub game_mode: String,
    /// Delay before querying the directory
    pub settle_delay: Duration,
    /// Maximum sessions returned by a directory query
    pub query_page_size: usize,
    /// Number of metadata polls while waiting for the join credential
    pub credential_poll_attempts: u32,
    /// Delay between metadata polls
    pub credential_poll_interval: Duration,
    /// Directory heartbeat interval for hosted sessions
    pub heartbeat_interval: Duration,
    /// Lobby member-count polling interval
    pub lobby_poll_interval: Duration,
    /// Client connect attempts before giving up
    pub join_max_retries: u32,
    /// Time allowed for a single client connect attempt
    pub connect_timeout: Duration,
    /// Connected-state polling interval during a connect attempt
    pub connect_poll_interval: Duration,
    /// Pause before retrying a failed connect attempt
    pub retry_cooldown: Duration,
    /// Anonymous sign-in attempts
    pub auth_max_attempts: u32,
    /// Delay between sign-in attempts
    pub auth_retry_delay: Duration,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            max_players: 4,
            min_players_to_start: 2,
            countdown: Duration::from_secs(3),
            barrier_tick: Duration::from_millis(100),
            game_mode: "FreeForAll".to_string(),
            settle_delay: Duration::from_millis(500),
            query_page_size: 10,
            credential_poll_attempts: 10,
            credential_poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(15),
            lobby_poll_interval: Duration::from_millis(1500),
            join_max_retries: 3,
            connect_timeout: Duration::from_secs(15),
            connect_poll_interval: Duration::from_millis(100),
            retry_cooldown: Duration::from_secs(1),
            auth_max_attempts: 30,
            auth_retry_delay: Duration::from_millis(200),
        }
    }
}

impl MatchConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(max_players) = std::env::var("MAX_PLAYERS") {
            if let Ok(parsed) = max_players.parse::<usize>() {
                if (2..=64).contains(&parsed) {
                    config.max_players = parsed;
                } else {
                    tracing::warn!("MAX_PLAYERS must be 2-64, using default");
                }
            } else {
                tracing::warn!("Invalid MAX_PLAYERS '{}', using default", max_players);
            }
        }

        if let Ok(min_players) = std::env::var("MIN_PLAYERS_TO_START") {
            if let Ok(parsed) = min_players.parse::<usize>() {
                if parsed > 0 {
                    config.min_players_to_start = parsed;
                } else {
                    tracing::warn!("MIN_PLAYERS_TO_START must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid MIN_PLAYERS_TO_START '{}', using default", min_players);
            }
        }

        if let Ok(countdown) = std::env::var("COUNTDOWN_SECS") {
            if let Ok(parsed) = countdown.parse::<f32>() {
                if parsed.is_finite() && parsed > 0.0 && parsed <= 60.0 {
                    config.countdown = Duration::from_secs_f32(parsed);
                } else {
                    tracing::warn!("COUNTDOWN_SECS must be in (0, 60], using default");
                }
            } else {
                tracing::warn!("Invalid COUNTDOWN_SECS '{}', using default", countdown);
            }
        }

        if let Ok(mode) = std::env::var("GAME_MODE") {
            let mode = mode.trim();
            if mode.is_empty() {
                tracing::warn!("GAME_MODE is empty, using default");
            } else {
                config.game_mode = mode.to_string();
            }
        }

        if let Ok(interval) = std::env::var("HEARTBEAT_INTERVAL_SECS") {
            if let Ok(parsed) = interval.parse::<u64>() {
                if parsed > 0 {
                    config.heartbeat_interval = Duration::from_secs(parsed);
                } else {
                    tracing::warn!("HEARTBEAT_INTERVAL_SECS must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid HEARTBEAT_INTERVAL_SECS '{}', using default", interval);
            }
        }

        if let Ok(interval) = std::env::var("LOBBY_POLL_INTERVAL_MS") {
            if let Ok(parsed) = interval.parse::<u64>() {
                if parsed >= 100 {
                    config.lobby_poll_interval = Duration::from_millis(parsed);
                } else {
                    tracing::warn!("LOBBY_POLL_INTERVAL_MS must be >= 100, using default");
                }
            } else {
                tracing::warn!("Invalid LOBBY_POLL_INTERVAL_MS '{}', using default", interval);
            }
        }

        if let Ok(retries) = std::env::var("JOIN_MAX_RETRIES") {
            if let Ok(parsed) = retries.parse::<u32>() {
                if (1..=10).contains(&parsed) {
                    config.join_max_retries = parsed;
                } else {
                    tracing::warn!("JOIN_MAX_RETRIES must be 1-10, using default");
                }
            } else {
                tracing::warn!("Invalid JOIN_MAX_RETRIES '{}', using default", retries);
            }
        }

        if let Ok(timeout) = std::env::var("CONNECT_TIMEOUT_SECS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                if parsed > 0 {
                    config.connect_timeout = Duration::from_secs(parsed);
                } else {
                    tracing::warn!("CONNECT_TIMEOUT_SECS must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid CONNECT_TIMEOUT_SECS '{}', using default", timeout);
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.max_players < 2 {
            return Err("max_players must be at least 2".to_string());
        }
        if self.min_players_to_start == 0 {
            return Err("min_players_to_start must be at least 1".to_string());
        }
        if self.min_players_to_start > self.max_players {
            return Err("min_players_to_start cannot exceed max_players".to_string());
        }
        if self.countdown.is_zero() {
            return Err("countdown must be non-zero".to_string());
        }
        if self.barrier_tick.is_zero() || self.connect_poll_interval.is_zero() {
            return Err("tick and poll intervals must be non-zero".to_string());
        }
        if self.query_page_size == 0 {
            return Err("query_page_size must be at least 1".to_string());
        }
        if self.join_max_retries == 0 || self.auth_max_attempts == 0 {
            return Err("retry budgets must be at least 1".to_string());
        }
        Ok(())
    }
}
