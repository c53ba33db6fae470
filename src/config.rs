//! Transport configuration.
//!
//! Constructors take `*Options` structs that default to [`TransportDefaults`].
//! [`TransportConfig`] is the serde-friendly flat form for host applications
//! that keep these settings in their own config files.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::retry::ReconnectPolicy;

pub const LOCAL_BASE_URL: &str = "http://localhost:8080";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportDefaults;

impl TransportDefaults {
    pub const REFRESH_PATH: &'static str = "/auth/refresh";
    pub const LOGIN_PATH: &'static str = "/login";
    pub const REALTIME_PATH: &'static str = "/ws";
    pub const TOKEN_QUERY_PARAM: &'static str = "token";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
}

/// Options for [`RequestGateway`](crate::gateway::RequestGateway).
#[derive(Clone, Debug)]
pub struct GatewayOptions {
    /// Base HTTP endpoint that relative call paths are joined onto.
    pub base_url: String,
    /// Path of the renewal endpoint, relative to `base_url`.
    pub refresh_path: String,
    /// Login entry point handed to the redirect sink on fatal failure.
    pub login_path: String,
    /// TCP connect timeout for the HTTP client.
    pub connect_timeout: Duration,
    /// Whole-request timeout applied to every call, renewal included.
    pub request_timeout: Duration,
}

impl GatewayOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            base_url: LOCAL_BASE_URL.to_string(),
            refresh_path: TransportDefaults::REFRESH_PATH.to_string(),
            login_path: TransportDefaults::LOGIN_PATH.to_string(),
            connect_timeout: TransportDefaults::CONNECT_TIMEOUT,
            request_timeout: TransportDefaults::REQUEST_TIMEOUT,
        }
    }
}

/// Options for [`RealtimeChannel`](crate::realtime::RealtimeChannel).
#[derive(Clone, Debug)]
pub struct RealtimeOptions {
    /// Base HTTP endpoint; its scheme is swapped for `ws`/`wss`.
    pub base_url: String,
    /// Fixed path appended to the base endpoint.
    pub path: String,
    /// Query parameter carrying the access token.
    pub token_query_param: String,
    /// Upper bound for the websocket handshake.
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl RealtimeOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            base_url: LOCAL_BASE_URL.to_string(),
            path: TransportDefaults::REALTIME_PATH.to_string(),
            token_query_param: TransportDefaults::TOKEN_QUERY_PARAM.to_string(),
            handshake_timeout: TransportDefaults::HANDSHAKE_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse transport config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid transport config: {0}")]
    Invalid(String),
}

/// Flat, deserializable transport settings.
///
/// Durations are integer milliseconds. Every field is optional in the source
/// document and falls back to [`TransportDefaults`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub base_url: String,
    pub refresh_path: String,
    pub login_path: String,
    pub realtime_path: String,
    pub token_query_param: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: LOCAL_BASE_URL.to_string(),
            refresh_path: TransportDefaults::REFRESH_PATH.to_string(),
            login_path: TransportDefaults::LOGIN_PATH.to_string(),
            realtime_path: TransportDefaults::REALTIME_PATH.to_string(),
            token_query_param: TransportDefaults::TOKEN_QUERY_PARAM.to_string(),
            connect_timeout_ms: duration_ms(TransportDefaults::CONNECT_TIMEOUT),
            request_timeout_ms: duration_ms(TransportDefaults::REQUEST_TIMEOUT),
            handshake_timeout_ms: duration_ms(TransportDefaults::HANDSHAKE_TIMEOUT),
            reconnect_base_delay_ms: duration_ms(TransportDefaults::RECONNECT_BASE_DELAY),
            max_reconnect_attempts: TransportDefaults::MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl TransportConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must not be empty".to_string()));
        }
        for (field, path) in [
            ("refresh_path", &self.refresh_path),
            ("login_path", &self.login_path),
            ("realtime_path", &self.realtime_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!("{field} must start with '/'")));
            }
        }
        if self.token_query_param.is_empty() {
            return Err(ConfigError::Invalid(
                "token_query_param must not be empty".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            base_url: self.base_url.trim_end().to_string(),
            refresh_path: self.refresh_path.clone(),
            login_path: self.login_path.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn realtime_options(&self) -> RealtimeOptions {
        RealtimeOptions {
            base_url: self.base_url.trim_end().to_string(),
            path: self.realtime_path.clone(),
            token_query_param: self.token_query_param.clone(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
                max_attempts: self.max_reconnect_attempts,
            },
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
