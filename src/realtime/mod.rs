//! Realtime channel modules.
//!
//! - `channel`: websocket connection, best-effort sends, and reconnect
//!   handling with linear backoff.
//! - `registry`: per-kind and lifecycle handler registration.
//! - `proto`: inbound frame parsing and the tagged outbound frame.
//! - `endpoint`: websocket URL derivation from the HTTP base endpoint.

/// Websocket connection owner and public channel handle.
pub mod channel;
/// Realtime URL derivation.
pub mod endpoint;
/// Frame parsing.
pub mod proto;
/// Handler registry with revocable registrations.
pub mod registry;

pub use channel::{ChannelError, ConnectionState, RealtimeChannel, SendOutcome};
pub use proto::{InboundFrame, OutboundFrame, DEFAULT_KIND};
pub use registry::Registration;
