//! Fatal authentication failure handling.
//!
//! When renewal is impossible or the server rejects a credential, the session
//! is over: the store is cleared and the host application is sent back to its
//! login entry point. [`SessionGuard`] makes that side effect happen once per
//! rejected credential no matter how many in-flight calls hit the failure
//! together. A credential written into the store by anyone, including a host
//! that logs in without going through this crate, arms the guard again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::credentials::{CredentialPair, CredentialStore};

/// Sink for the "go back to login" side effect.
pub trait LoginRedirect: Send + Sync {
    fn redirect_to_login(&self, login_path: &str);
}

/// Redirect sink that only records the event in the log.
///
/// Useful for headless hosts (CLIs, daemons) that poll the store instead of
/// navigating anywhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogOnlyRedirect;

impl LoginRedirect for LogOnlyRedirect {
    fn redirect_to_login(&self, login_path: &str) {
        warn!(event = "login_required", login_path);
    }
}

/// Why a session was invalidated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvalidationReason {
    /// Access token expired and could not be renewed.
    Expired,
    /// The server answered 401/403.
    Denied,
}

impl InvalidationReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Denied => "denied",
        }
    }
}

#[derive(Debug)]
enum GuardState {
    Armed,
    /// The session ended while `credential` was the access token in use.
    /// `None` when the failing call was unauthenticated.
    Invalidated { credential: Option<SecretString> },
}

impl GuardState {
    /// Whether a failure of a call made with `credential` was already handled.
    fn covers(&self, credential: Option<&SecretString>) -> bool {
        match (self, credential) {
            (Self::Armed, _) => false,
            (Self::Invalidated { .. }, None) => true,
            (Self::Invalidated { credential: None }, Some(_)) => false,
            (Self::Invalidated { credential: Some(ended) }, Some(failed)) => {
                ended.expose_secret() == failed.expose_secret()
            }
        }
    }
}

/// Owner of session establishment and invalidation.
pub struct SessionGuard {
    store: Arc<dyn CredentialStore>,
    redirect: Arc<dyn LoginRedirect>,
    login_path: String,
    state: Mutex<GuardState>,
}

impl SessionGuard {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        redirect: Arc<dyn LoginRedirect>,
        login_path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            redirect,
            login_path: login_path.into(),
            state: Mutex::new(GuardState::Armed),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Stores a freshly issued pair and re-arms invalidation for it.
    pub fn establish(&self, pair: CredentialPair) {
        let mut state = self.lock_state();
        self.store.set(pair);
        *state = GuardState::Armed;
        drop(state);
        debug!(event = "session_established");
    }

    /// Clears the store without redirecting.
    pub fn logout(&self) {
        let mut state = self.lock_state();
        let credential = self.store.get().access;
        self.store.clear();
        *state = GuardState::Invalidated { credential };
        drop(state);
        debug!(event = "session_logged_out");
    }

    /// Clears the store and redirects to login after a call made with
    /// `credential` failed fatally.
    ///
    /// Returns `true` only for the call that actually performed the side
    /// effect. Failures of the same credential, concurrent or later, are
    /// no-ops. A different credential (a new login, however it reached the
    /// store) is handled again.
    pub fn invalidate(
        &self,
        reason: InvalidationReason,
        credential: Option<&SecretString>,
    ) -> bool {
        {
            let mut state = self.lock_state();
            if state.covers(credential) {
                debug!(
                    event = "session_invalidation_skipped",
                    reason = reason.as_str()
                );
                return false;
            }
            self.store.clear();
            *state = GuardState::Invalidated {
                credential: credential.cloned(),
            };
        }

        warn!(
            event = "session_invalidated",
            reason = reason.as_str(),
            login_path = %self.login_path
        );
        self.redirect.redirect_to_login(&self.login_path);
        true
    }

    pub fn is_invalidated(&self) -> bool {
        matches!(*self.lock_state(), GuardState::Invalidated { .. })
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("login_path", &self.login_path)
            .field("invalidated", &self.is_invalidated())
            .finish_non_exhaustive()
    }
}
