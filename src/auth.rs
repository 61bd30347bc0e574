//! Anonymous authentication
//!
//! Yields the local player identity used for directory membership.

use async_trait::async_trait;
use tokio::time::sleep;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type PlayerId = Uuid;

/// Authentication backend
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Current identity, if signed in
    fn player_id(&self) -> Option<PlayerId>;

    /// Perform one anonymous sign-in attempt
    async fn sign_in_anonymously(&self) -> Result<PlayerId, AuthenticationError>;
}

/// Sign in, retrying while the backend reports a transient failure.
///
/// Returns the existing identity without a round trip when already signed in.
pub async fn sign_in(
    auth: &dyn Authenticator,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<PlayerId, AuthenticationError> {
    if let Some(id) = auth.player_id() {
        debug!("Already signed in as {}", id);
        return Ok(id);
    }

    let max_attempts = max_attempts.max(1);
    let mut last_error = AuthenticationError::Rejected("no attempt made".to_string());

    for attempt in 1..=max_attempts {
        match auth.sign_in_anonymously().await {
            Ok(id) => {
                info!("Signed in as {}", id);
                return Ok(id);
            }
            Err(e) => {
                // A concurrent sign-in may have completed in the meantime
                if let Some(id) = auth.player_id() {
                    info!("Signed in as {} by a concurrent attempt", id);
                    return Ok(id);
                }
                if !e.is_transient() {
                    warn!("Sign-in rejected: {}", e);
                    return Err(e);
                }
                debug!("Sign-in attempt {}/{} failed: {}", attempt, max_attempts, e);
                last_error = e;
                sleep(retry_delay).await;
            }
        }
    }

    warn!("Sign-in failed after {} attempts", max_attempts);
    Err(AuthenticationError::AttemptsExhausted {
        attempts: max_attempts,
        last: Box::new(last_error),
    })
}

/// Authentication errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthenticationError {
    #[error("Sign-in already in progress")]
    InProgress,
    #[error("Authentication service unavailable: {0}")]
    Unavailable(String),
    #[error("Sign-in rejected: {0}")]
    Rejected(String),
    #[error("Sign-in failed after {attempts} attempts: {last}")]
    AttemptsExhausted {
        attempts: u32,
        last: Box<AuthenticationError>,
    },
}

impl AuthenticationError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuthenticationError::InProgress | AuthenticationError::Unavailable(_)
        )
    }
}
