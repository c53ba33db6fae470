//! Reconnecting realtime websocket channel.
//!
//! One [`RealtimeChannel`] owns at most one socket at a time. The socket lives
//! in a background worker task; the channel keeps the connection state, an
//! outbound sender into the worker, and the reconnect timer. Every
//! connection attempt gets a generation number, and close events from an
//! older generation are ignored, so a manual `disconnect` or an explicit
//! `connect` can never be undone by a stale worker or timer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

use crate::config::RealtimeOptions;
use crate::credentials::CredentialStore;
use crate::realtime::endpoint::realtime_url;
use crate::realtime::proto::InboundFrame;
use crate::realtime::registry::{HandlerRegistry, Registration};
use crate::retry::{with_timeout, ReconnectState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectAttempt = Shared<BoxFuture<'static, Result<(), ChannelError>>>;

/// Lifecycle of the underlying connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Errors produced while establishing the realtime connection.
///
/// `Clone` because concurrent `connect` callers share one attempt's outcome.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ChannelError {
    #[error("websocket handshake did not complete within {0:?}")]
    ConnectTimeout(Duration),

    #[error("websocket connect failed: {0}")]
    Connect(String),

    #[error("invalid realtime endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("failed to encode outbound frame: {0}")]
    Encode(String),

    /// `disconnect` was called while the attempt was in flight.
    #[error("channel was disconnected")]
    Disconnected,
}

/// What happened to a message handed to [`RealtimeChannel::send`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    /// Queued on an open socket.
    Sent,
    /// No connection could be established; the message was discarded.
    Dropped,
}

/// Cloneable handle to a realtime channel.
///
/// All clones share the same connection and handler registry. Background
/// tasks only hold weak references, so dropping the last handle closes the
/// socket and stops reconnecting.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    options: RealtimeOptions,
    store: Arc<dyn CredentialStore>,
    registry: HandlerRegistry,
    state: Mutex<ChannelState>,
}

struct ChannelState {
    status: ConnectionState,
    generation: u64,
    reconnect: ReconnectState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    attempt: Option<ConnectAttempt>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl ChannelState {
    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}

impl RealtimeChannel {
    pub fn new(options: RealtimeOptions, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                options,
                store,
                registry: HandlerRegistry::default(),
                state: Mutex::new(ChannelState {
                    status: ConnectionState::Idle,
                    generation: 0,
                    reconnect: ReconnectState::default(),
                    outbound: None,
                    attempt: None,
                    reconnect_timer: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_state().status
    }

    /// Consecutive reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock_state().reconnect.attempts()
    }

    /// Opens the connection, or joins the attempt already in progress.
    ///
    /// The access token is read from the credential store once, here, and
    /// sent as a query parameter. Resolves immediately when already open.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let attempt = {
            let mut state = self.inner.lock_state();
            if state.status == ConnectionState::Open {
                return Ok(());
            }
            match state.attempt.clone() {
                Some(attempt) if state.status == ConnectionState::Connecting => attempt,
                _ => self.inner.begin_attempt(&mut state)?,
            }
        };
        attempt.await
    }

    /// Closes the connection and disables automatic reconnection until the
    /// next explicit [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let was_open = {
            let mut state = self.inner.lock_state();
            state.reconnect.disable();
            state.generation += 1;
            state.cancel_reconnect_timer();
            // Dropping the sender makes the worker close the socket.
            state.outbound = None;
            state.attempt = None;
            let was_open = state.status == ConnectionState::Open;
            state.status = ConnectionState::Closed;
            was_open
        };

        info!(event = "realtime_disconnected", was_open);
        if was_open {
            self.inner.registry.emit_disconnect();
        }
    }

    /// Sends one JSON frame, connecting first if needed.
    ///
    /// Delivery is best effort: if the connection cannot be established the
    /// message is dropped and [`SendOutcome::Dropped`] is returned. Nothing is
    /// queued for a later reconnect.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        message: &T,
    ) -> Result<SendOutcome, ChannelError> {
        let text =
            serde_json::to_string(message).map_err(|err| ChannelError::Encode(err.to_string()))?;

        if self.inner.try_transmit(&text) {
            return Ok(SendOutcome::Sent);
        }

        if let Err(error) = self.connect().await {
            debug!(event = "realtime_send_dropped", error = %error);
            return Ok(SendOutcome::Dropped);
        }

        if self.inner.try_transmit(&text) {
            Ok(SendOutcome::Sent)
        } else {
            debug!(event = "realtime_send_dropped", error = "closed after connect");
            Ok(SendOutcome::Dropped)
        }
    }

    /// Registers a handler for inbound frames of `kind`.
    ///
    /// Handlers run synchronously on the connection worker, in registration
    /// order.
    pub fn on_message<F>(&self, kind: impl Into<String>, handler: F) -> Registration
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        self.inner.registry.on_message(kind.into(), Arc::new(handler))
    }

    /// Registers a handler run after every successful open.
    pub fn on_connect<F>(&self, handler: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.registry.on_connect(Arc::new(handler))
    }

    /// Registers a handler run whenever an open connection closes.
    pub fn on_disconnect<F>(&self, handler: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.registry.on_disconnect(Arc::new(handler))
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("RealtimeChannel")
            .field("status", &state.status)
            .field("generation", &state.generation)
            .field("reconnect", &state.reconnect)
            .finish_non_exhaustive()
    }
}

impl ChannelInner {
    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_attempt(
        self: &Arc<Self>,
        state: &mut ChannelState,
    ) -> Result<ConnectAttempt, ChannelError> {
        let access = self.store.get().access;
        let url = match realtime_url(
            &self.options.base_url,
            &self.options.path,
            &self.options.token_query_param,
            access.as_ref(),
        ) {
            Ok(url) => url,
            Err(error) => {
                state.status = ConnectionState::Closed;
                return Err(error);
            }
        };

        state.generation += 1;
        state.status = ConnectionState::Connecting;
        state.reconnect.enable();
        state.cancel_reconnect_timer();

        let generation = state.generation;
        debug!(
            event = "realtime_connecting",
            generation,
            authenticated = access.is_some()
        );

        let attempt = run_attempt(
            Arc::downgrade(self),
            url,
            self.options.handshake_timeout,
            generation,
        )
        .boxed()
        .shared();

        // Drive the attempt even if every caller stops awaiting it.
        tokio::spawn(attempt.clone());
        state.attempt = Some(attempt.clone());
        Ok(attempt)
    }

    fn try_transmit(&self, text: &str) -> bool {
        let state = self.lock_state();
        if state.status != ConnectionState::Open {
            return false;
        }
        state
            .outbound
            .as_ref()
            .is_some_and(|tx| tx.send(Message::Text(text.to_string())).is_ok())
    }

    fn on_open(self: &Arc<Self>, socket: Socket, generation: u64) -> Result<(), ChannelError> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock_state();
            if state.generation != generation {
                return Err(ChannelError::Disconnected);
            }
            state.status = ConnectionState::Open;
            state.attempt = None;
            state.outbound = Some(outbound_tx);
            state.reconnect.on_open();
        }

        info!(event = "realtime_open", generation);
        self.registry.emit_connect();
        tokio::spawn(connection_worker(
            Arc::downgrade(self),
            socket,
            outbound_rx,
            generation,
        ));
        Ok(())
    }

    /// Handles the close of `generation`, whether it was open or still
    /// connecting, and schedules the next reconnect attempt.
    fn on_closed(self: &Arc<Self>, generation: u64) {
        let was_open = {
            let mut state = self.lock_state();
            if state.generation != generation || state.status == ConnectionState::Closed {
                return;
            }

            let was_open = state.status == ConnectionState::Open;
            state.status = ConnectionState::Closed;
            state.outbound = None;
            state.attempt = None;

            match state.reconnect.on_close(&self.options.reconnect) {
                Some(scheduled) => {
                    debug!(
                        event = "realtime_reconnect_scheduled",
                        attempt = scheduled.attempt,
                        delay_ms = scheduled.delay.as_millis() as u64
                    );
                    state.reconnect_timer = Some(tokio::spawn(reconnect_after(
                        Arc::downgrade(self),
                        scheduled.delay,
                        generation,
                    )));
                }
                None if state.reconnect.is_enabled() => {
                    info!(
                        event = "realtime_reconnect_exhausted",
                        attempts = state.reconnect.attempts()
                    );
                }
                None => {}
            }
            was_open
        };

        if was_open {
            info!(event = "realtime_closed", generation);
            self.registry.emit_disconnect();
        }
    }

    /// Starts the reconnect attempt scheduled for `generation`.
    ///
    /// The check and the start happen under one lock, so a `disconnect` or
    /// `connect` that got there first always wins.
    fn resume_after_backoff(self: &Arc<Self>, generation: u64) -> Option<ConnectAttempt> {
        let mut state = self.lock_state();
        if state.generation != generation || !state.reconnect.is_enabled() {
            return None;
        }
        // The calling timer task must not be aborted by the attempt it starts.
        state.reconnect_timer = None;
        match self.begin_attempt(&mut state) {
            Ok(attempt) => Some(attempt),
            Err(error) => {
                debug!(event = "realtime_reconnect_failed", generation, error = %error);
                None
            }
        }
    }

    fn dispatch_text(&self, text: &str) {
        match InboundFrame::parse(text) {
            Ok(frame) => {
                let handled = self.registry.dispatch(&frame);
                trace!(event = "realtime_frame", kind = %frame.kind, handled);
            }
            Err(error) => {
                trace!(event = "realtime_frame_dropped", error = %error);
            }
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.cancel_reconnect_timer();
    }
}

async fn run_attempt(
    channel: Weak<ChannelInner>,
    url: Url,
    handshake_timeout: Duration,
    generation: u64,
) -> Result<(), ChannelError> {
    // On timeout the handshake future is dropped, which closes the socket.
    let outcome = with_timeout(handshake_timeout, connect_async(url.as_str())).await;

    let Some(inner) = channel.upgrade() else {
        return Err(ChannelError::Disconnected);
    };

    match outcome {
        Ok(Ok((socket, _response))) => inner.on_open(socket, generation),
        Ok(Err(err)) => {
            let error = ChannelError::Connect(err.to_string());
            debug!(event = "realtime_connect_failed", generation, error = %error);
            inner.on_closed(generation);
            Err(error)
        }
        Err(_) => {
            let error = ChannelError::ConnectTimeout(handshake_timeout);
            debug!(event = "realtime_connect_failed", generation, error = %error);
            inner.on_closed(generation);
            Err(error)
        }
    }
}

async fn reconnect_after(channel: Weak<ChannelInner>, delay: Duration, generation: u64) {
    tokio::time::sleep(delay).await;

    let Some(inner) = channel.upgrade() else {
        return;
    };
    let Some(attempt) = inner.resume_after_backoff(generation) else {
        return;
    };
    if let Err(error) = attempt.await {
        debug!(event = "realtime_reconnect_failed", error = %error);
    }
}

async fn connection_worker(
    channel: Weak<ChannelInner>,
    mut socket: Socket,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    generation: u64,
) {
    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(message) => {
                        if socket.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        break;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        let Some(inner) = channel.upgrade() else {
                            break;
                        };
                        inner.dispatch_text(&text);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let Some(inner) = channel.upgrade() else {
                            break;
                        };
                        match std::str::from_utf8(&bytes) {
                            Ok(text) => inner.dispatch_text(text),
                            Err(_) => trace!(event = "realtime_frame_dropped", error = "binary frame is not utf-8"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) => break,
                    Some(Err(_)) => break,
                    None => break,
                }
            }
        }
    }

    if let Some(inner) = channel.upgrade() {
        inner.on_closed(generation);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::{ChannelError, ConnectionState, RealtimeChannel, SendOutcome};
    use crate::config::RealtimeOptions;
    use crate::credentials::MemoryCredentialStore;
    use crate::retry::ReconnectPolicy;

    fn options(base_url: String, max_attempts: u32) -> RealtimeOptions {
        RealtimeOptions {
            handshake_timeout: Duration::from_millis(200),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(10),
                max_attempts,
            },
            ..RealtimeOptions::new(base_url)
        }
    }

    /// Accepts TCP connections and drops them before the handshake.
    async fn refusing_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
        (format!("http://{addr}"), accepted)
    }

    #[tokio::test]
    async fn starts_idle() {
        let channel = RealtimeChannel::new(
            RealtimeOptions::default(),
            Arc::new(MemoryCredentialStore::new()),
        );
        assert_eq!(channel.state(), ConnectionState::Idle);
        assert_eq!(channel.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn invalid_endpoint_fails_fast() {
        let channel = RealtimeChannel::new(
            options("ftp://host.test".to_string(), 3),
            Arc::new(MemoryCredentialStore::new()),
        );

        let error = channel.connect().await.expect_err("bad scheme");
        assert!(matches!(error, ChannelError::InvalidEndpoint(_)));
        assert_eq!(channel.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn failed_connects_stop_at_attempt_cap() {
        let (base_url, accepted) = refusing_server().await;
        let channel = RealtimeChannel::new(
            options(base_url, 3),
            Arc::new(MemoryCredentialStore::new()),
        );

        let error = channel.connect().await.expect_err("handshake must fail");
        assert!(matches!(error, ChannelError::Connect(_)));

        // 10 + 20 + 30 ms of backoff, with generous slack.
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(accepted.load(Ordering::SeqCst), 4);
        assert_eq!(channel.reconnect_attempts(), 3);
        assert_eq!(channel.state(), ConnectionState::Closed);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let (base_url, accepted) = refusing_server().await;
        let mut options = options(base_url, 5);
        options.reconnect.base_delay = Duration::from_millis(100);
        let channel = RealtimeChannel::new(options, Arc::new(MemoryCredentialStore::new()));

        let _ = channel.connect().await;
        channel.disconnect();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn backoff_expiring_after_disconnect_starts_nothing() {
        let (base_url, accepted) = refusing_server().await;
        let mut options = options(base_url, 5);
        options.reconnect.base_delay = Duration::from_secs(30);
        let channel = RealtimeChannel::new(options, Arc::new(MemoryCredentialStore::new()));

        let _ = channel.connect().await;
        let scheduled = channel.inner.lock_state().generation;
        channel.disconnect();

        // The timer for `scheduled` fires after the disconnect.
        assert!(channel.inner.resume_after_backoff(scheduled).is_none());
        let state = channel.inner.lock_state();
        assert_eq!(state.status, ConnectionState::Closed);
        assert!(!state.reconnect.is_enabled());
        assert!(state.attempt.is_none());
        drop(state);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_expiry_starts_attempt_atomically() {
        let (base_url, accepted) = refusing_server().await;
        let mut options = options(base_url, 5);
        options.reconnect.base_delay = Duration::from_secs(30);
        let channel = RealtimeChannel::new(options, Arc::new(MemoryCredentialStore::new()));

        let _ = channel.connect().await;
        let scheduled = channel.inner.lock_state().generation;

        let attempt = channel
            .inner
            .resume_after_backoff(scheduled)
            .expect("attempt for current generation");
        assert_eq!(channel.state(), ConnectionState::Connecting);
        assert!(attempt.await.is_err());
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        channel.disconnect();
    }

    #[tokio::test]
    async fn send_without_connection_is_dropped() {
        let (base_url, _accepted) = refusing_server().await;
        let channel = RealtimeChannel::new(
            options(base_url, 0),
            Arc::new(MemoryCredentialStore::new()),
        );

        let outcome = channel
            .send(&serde_json::json!({"type": "ping"}))
            .await
            .expect("encode");
        assert_eq!(outcome, SendOutcome::Dropped);
        assert_eq!(channel.state(), ConnectionState::Closed);
    }
}
