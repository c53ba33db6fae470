//! Authenticated transport layer: an HTTP request gateway with single-flight
//! access token renewal, and a reconnecting realtime websocket channel.
//!
//! The crate is organized by transport surface:
//! - `gateway`: authenticated HTTP calls with transparent token renewal.
//! - `realtime`: websocket channel with handler dispatch and reconnects.
//! - `credentials`: the credential store both surfaces read from.
//! - `session`: fatal authentication failure handling.
//! - `retry`: reconnect backoff and timeout utilities.

/// Transport configuration and defaults.
pub mod config;
/// Credential store contract and in-memory store.
pub mod credentials;
/// Request gateway and outgoing call types.
pub mod gateway;
/// Realtime channel, frame types, and handler registry.
pub mod realtime;
mod renewal;
/// Reconnect policy and timeout helpers.
pub mod retry;
/// Session establishment and invalidation.
pub mod session;
/// Access token expiry decoding.
pub mod token;

pub use config::{GatewayOptions, RealtimeOptions, TransportConfig};
pub use credentials::{CredentialPair, CredentialStore, MemoryCredentialStore};
pub use gateway::{CallSpec, GatewayError, RequestGateway};
pub use realtime::{RealtimeChannel, Registration};
pub use renewal::RenewalError;
pub use session::{LoginRedirect, SessionGuard};
