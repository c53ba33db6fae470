//! Authenticated HTTP request gateway.
//!
//! Every outbound call goes through [`RequestGateway::request`], which attaches
//! the current access token, renews it first when it has expired (one renewal
//! per expiry, shared by all concurrent callers), and ends the session when
//! renewal is impossible or the server rejects the credential.

use std::sync::Arc;
use std::time::SystemTime;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::GatewayOptions;
use crate::credentials::{CredentialPair, CredentialStore};
use crate::renewal::{RenewalCoordinator, RenewalError};
use crate::session::{InvalidationReason, LoginRedirect, SessionGuard};
use crate::token;

/// Description of one outbound call.
#[derive(Clone, Debug)]
pub struct CallSpec {
    pub method: Method,
    /// Path relative to the gateway base URL, or an absolute URL.
    pub target: String,
    pub body: Option<Value>,
    /// Extra headers. Any `Authorization` header is replaced by the gateway.
    pub headers: HeaderMap,
}

impl CallSpec {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Access token expired and no renewed token could be obtained.
    #[error("access token expired: {0}")]
    AuthExpired(#[source] RenewalError),

    /// The server rejected the credential.
    #[error("authentication denied with http status {status}")]
    AuthDenied { status: StatusCode },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Whether this error ended the session.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthExpired(_) | Self::AuthDenied { .. })
    }
}

#[derive(Clone)]
pub struct RequestGateway {
    http: Client,
    base_url: String,
    refresh_url: Url,
    request_timeout: std::time::Duration,
    renewal: Arc<RenewalCoordinator>,
    session: Arc<SessionGuard>,
}

impl RequestGateway {
    pub fn new(
        options: GatewayOptions,
        store: Arc<dyn CredentialStore>,
        redirect: Arc<dyn LoginRedirect>,
    ) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()?;

        let base_url = options.base_url.trim_end().trim_end_matches('/').to_string();
        let refresh_url = join_url(&base_url, &options.refresh_path)?;

        let renewal = RenewalCoordinator::new(
            http.clone(),
            refresh_url.to_string(),
            options.request_timeout,
            Arc::clone(&store),
        );
        let session = SessionGuard::new(store, redirect, options.login_path);

        Ok(Self {
            http,
            base_url,
            refresh_url,
            request_timeout: options.request_timeout,
            renewal: Arc::new(renewal),
            session: Arc::new(session),
        })
    }

    pub fn session(&self) -> &Arc<SessionGuard> {
        &self.session
    }

    /// Stores credentials from a successful login.
    pub fn login(&self, pair: CredentialPair) {
        self.session.establish(pair);
    }

    pub fn logout(&self) {
        self.session.logout();
    }

    /// Whether a renewal call is currently outstanding.
    pub fn is_renewing(&self) -> bool {
        self.renewal.is_renewing()
    }

    pub async fn get(&self, target: impl Into<String>) -> Result<Response, GatewayError> {
        self.request(CallSpec::get(target)).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        target: impl Into<String>,
        body: &T,
    ) -> Result<Response, GatewayError> {
        let body = serde_json::to_value(body)
            .map_err(|err| GatewayError::InvalidRequest(format!("encode body: {err}")))?;
        self.request(CallSpec::post(target).with_json(body)).await
    }

    /// Sends one call with the current (or freshly renewed) access token.
    ///
    /// The response is returned untouched unless its status is 401 or 403,
    /// which ends the session and yields [`GatewayError::AuthDenied`].
    pub async fn request(&self, call: CallSpec) -> Result<Response, GatewayError> {
        let url = self.resolve(&call.target)?;
        if self.targets_renewal(&url) {
            return Err(GatewayError::InvalidRequest(format!(
                "{} is the renewal endpoint and cannot go through the gateway",
                url.path()
            )));
        }

        let access = self.authorize().await?;
        debug!(
            event = "gateway_request",
            method = %call.method,
            path = url.path(),
            authenticated = access.is_some()
        );

        let mut headers = call.headers;
        headers.remove(AUTHORIZATION);

        let mut builder = self
            .http
            .request(call.method, url)
            .timeout(self.request_timeout)
            .headers(headers);
        if let Some(body) = call.body.as_ref() {
            builder = builder.json(body);
        }
        if let Some(access) = access.as_ref() {
            builder = builder.bearer_auth(access.expose_secret());
        }

        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.session
                .invalidate(InvalidationReason::Denied, access.as_ref());
            return Err(GatewayError::AuthDenied { status });
        }

        Ok(response)
    }

    async fn authorize(&self) -> Result<Option<SecretString>, GatewayError> {
        let pair = self.session.store().get();
        let Some(access) = pair.access else {
            return Ok(None);
        };

        if !token::is_expired(access.expose_secret(), SystemTime::now()) {
            return Ok(Some(access));
        }

        if pair.refresh.is_none() {
            return Err(self.expire(RenewalError::MissingRefresh, &access));
        }

        match self.renewal.access_token().await {
            Ok(renewed) => Ok(Some(renewed)),
            Err(error) => Err(self.expire(error, &access)),
        }
    }

    fn expire(&self, cause: RenewalError, expired: &SecretString) -> GatewayError {
        self.session
            .invalidate(InvalidationReason::Expired, Some(expired));
        GatewayError::AuthExpired(cause)
    }

    fn resolve(&self, target: &str) -> Result<Url, GatewayError> {
        if target.starts_with("http://") || target.starts_with("https://") {
            return Url::parse(target)
                .map_err(|err| GatewayError::InvalidRequest(format!("{target}: {err}")));
        }
        join_url(&self.base_url, target)
    }

    fn targets_renewal(&self, url: &Url) -> bool {
        url.origin() == self.refresh_url.origin()
            && url.path().trim_end_matches('/') == self.refresh_url.path().trim_end_matches('/')
    }
}

impl std::fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGateway")
            .field("base_url", &self.base_url)
            .field("refresh_url", &self.renewal.endpoint())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

fn join_url(base_url: &str, path: &str) -> Result<Url, GatewayError> {
    let joined = if path.starts_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    };
    Url::parse(&joined).map_err(|err| GatewayError::InvalidRequest(format!("{joined}: {err}")))
}
