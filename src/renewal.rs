//! Single-flight access token renewal.
//!
//! At most one renewal call is outstanding per coordinator. Callers that find
//! the access token expired either join the outstanding renewal or, if there
//! is none, start it. Joining and starting happen under one lock with no
//! suspension point in between, so a burst of callers produces exactly one
//! call to the renewal endpoint and every caller sees the same outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::{CredentialPair, CredentialStore};
use crate::token;

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Why a renewal did not produce a new access token.
///
/// `Clone` because one outcome is handed to every caller that waited on it.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RenewalError {
    #[error("no refresh token available")]
    MissingRefresh,

    #[error("renewal request failed: {0}")]
    Transport(String),

    #[error("renewal http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse renewal response: {0}")]
    Parse(String),
}

#[derive(Serialize)]
struct RenewalRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct RenewalResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

type RenewalFuture = Shared<BoxFuture<'static, Result<SecretString, RenewalError>>>;

struct InFlight {
    id: u64,
    future: RenewalFuture,
}

type InFlightSlot = Arc<Mutex<Option<InFlight>>>;

enum Ticket {
    Ready(SecretString),
    Wait(RenewalFuture),
}

/// Coordinates renewal against one refresh endpoint and one store.
pub(crate) struct RenewalCoordinator {
    http: Client,
    endpoint: String,
    timeout: Duration,
    store: Arc<dyn CredentialStore>,
    in_flight: InFlightSlot,
    next_id: AtomicU64,
}

impl RenewalCoordinator {
    pub(crate) fn new(
        http: Client,
        endpoint: String,
        timeout: Duration,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            http,
            endpoint,
            timeout,
            store,
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns a usable access token, renewing it if necessary.
    pub(crate) async fn access_token(&self) -> Result<SecretString, RenewalError> {
        match self.join_or_start()? {
            Ticket::Ready(access) => Ok(access),
            Ticket::Wait(future) => future.await,
        }
    }

    pub(crate) fn is_renewing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn join_or_start(&self) -> Result<Ticket, RenewalError> {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(in_flight) = slot.as_ref() {
            debug!(event = "renewal_joined", renewal_id = in_flight.id);
            return Ok(Ticket::Wait(in_flight.future.clone()));
        }

        // A renewal may have settled between the caller's expiry check and
        // taking the lock; its result is already in the store.
        let pair = self.store.get();
        if let Some(access) = pair.access.as_ref() {
            if !token::is_expired(access.expose_secret(), SystemTime::now()) {
                return Ok(Ticket::Ready(access.clone()));
            }
        }

        let refresh = pair.refresh.ok_or(RenewalError::MissingRefresh)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(event = "renewal_started", renewal_id = id);

        let future = run_renewal(
            self.http.clone(),
            self.endpoint.clone(),
            self.timeout,
            Arc::clone(&self.store),
            refresh,
            ReleaseSlot {
                slot: Arc::clone(&self.in_flight),
                id,
            },
        )
        .boxed()
        .shared();

        // Drive the renewal to completion even if every caller stops
        // awaiting it, so the store is updated and the slot released.
        tokio::spawn(future.clone());
        *slot = Some(InFlight {
            id,
            future: future.clone(),
        });
        Ok(Ticket::Wait(future))
    }
}

/// Clears the in-flight marker when the renewal settles, or when its task is
/// torn down with the runtime.
struct ReleaseSlot {
    slot: InFlightSlot,
    id: u64,
}

impl Drop for ReleaseSlot {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|in_flight| in_flight.id == self.id) {
            *slot = None;
        }
    }
}

async fn run_renewal(
    http: Client,
    endpoint: String,
    timeout: Duration,
    store: Arc<dyn CredentialStore>,
    refresh: SecretString,
    release: ReleaseSlot,
) -> Result<SecretString, RenewalError> {
    let result = request_renewal(&http, &endpoint, timeout, &refresh).await;

    match &result {
        Ok(renewed) => {
            let access = SecretString::new(renewed.access.clone());
            let refresh = renewed
                .refresh
                .clone()
                .map(SecretString::new)
                .unwrap_or(refresh);
            store.set(CredentialPair {
                access: Some(access),
                refresh: Some(refresh),
            });
            debug!(event = "renewal_succeeded", renewal_id = release.id);
        }
        Err(error) => {
            warn!(event = "renewal_failed", renewal_id = release.id, error = %error);
        }
    }

    // Store is updated before the marker is released.
    drop(release);
    result.map(|renewed| SecretString::new(renewed.access))
}

async fn request_renewal(
    http: &Client,
    endpoint: &str,
    timeout: Duration,
    refresh: &SecretString,
) -> Result<RenewalResponse, RenewalError> {
    let response = http
        .post(endpoint)
        .timeout(timeout)
        .json(&RenewalRequest {
            refresh: refresh.expose_secret(),
        })
        .send()
        .await
        .map_err(|err| RenewalError::Transport(err.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| RenewalError::Transport(err.to_string()))?;

    if !status.is_success() {
        return Err(RenewalError::HttpStatus {
            status,
            body: body.chars().take(ERROR_BODY_SNIPPET_LEN).collect(),
        });
    }

    let renewed: RenewalResponse =
        serde_json::from_str(&body).map_err(|err| RenewalError::Parse(err.to_string()))?;
    if renewed.access.is_empty() {
        return Err(RenewalError::Parse("renewal response has empty access".to_string()));
    }
    Ok(renewed)
}
