//! Credential store contract shared by the request gateway and the realtime
//! channel.

use std::sync::{PoisonError, RwLock};

use secrecy::SecretString;

/// Access/refresh token pair held by a [`CredentialStore`].
///
/// Either side may be absent: no access token means calls go out
/// unauthenticated, no refresh token means an expired access token cannot be
/// renewed.
#[derive(Clone, Debug, Default)]
pub struct CredentialPair {
    /// Short-lived bearer token carrying an `exp` claim.
    pub access: Option<SecretString>,
    /// Longer-lived token used only to mint a new access token.
    pub refresh: Option<SecretString>,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: Some(SecretString::new(access.into())),
            refresh: Some(SecretString::new(refresh.into())),
        }
    }

    /// Pair with an access token and no way to renew it.
    pub fn access_only(access: impl Into<String>) -> Self {
        Self {
            access: Some(SecretString::new(access.into())),
            refresh: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.refresh.is_none()
    }
}

/// Storage for the current credential pair.
///
/// Each method must be atomic with respect to the others. Implementations are
/// shared behind an `Arc` by every gateway and channel of a session, so they
/// are expected to be cheap to call and never block on I/O for long.
pub trait CredentialStore: Send + Sync {
    /// Returns a snapshot of the current pair.
    fn get(&self) -> CredentialPair;

    /// Replaces the current pair.
    fn set(&self, pair: CredentialPair);

    /// Removes both tokens.
    fn clear(&self);
}

/// Process-local [`CredentialStore`] backed by a lock.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    pair: RwLock<CredentialPair>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: RwLock::new(pair),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> CredentialPair {
        self.pair
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, pair: CredentialPair) {
        *self.pair.write().unwrap_or_else(PoisonError::into_inner) = pair;
    }

    fn clear(&self) {
        *self.pair.write().unwrap_or_else(PoisonError::into_inner) = CredentialPair::default();
    }
}
