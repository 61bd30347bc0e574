use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::auth::{AuthenticationError, Authenticator, PlayerId};

/// Anonymous sign-in that always succeeds unless told otherwise
#[derive(Default)]
pub struct AnonymousAuthenticator {
    player_id: Mutex<Option<PlayerId>>,
    transient_failures: AtomicU32,
    reject: AtomicBool,
}

impl AnonymousAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` attempts with a transient error
    pub fn fail_next(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Reject every attempt permanently
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn sign_out(&self) {
        *self.player_id.lock() = None;
    }
}

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    fn player_id(&self) -> Option<PlayerId> {
        *self.player_id.lock()
    }

    async fn sign_in_anonymously(&self) -> Result<PlayerId, AuthenticationError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(AuthenticationError::Rejected("anonymous sign-in disabled".to_string()));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AuthenticationError::Unavailable("service warming up".to_string()));
        }

        let mut player_id = self.player_id.lock();
        Ok(*player_id.get_or_insert_with(Uuid::new_v4))
    }
}
