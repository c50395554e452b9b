//! The session engine.
//!
//! A [`Session`] binds one [`Adapter`] to the full protocol pipeline:
//! outbound frames flow through a three-lane dispatch queue into a push
//! worker that encodes and writes them; inbound adapter events flow
//! through a pull worker that decodes frames and routes them to the
//! pending-correlation table, typed handlers, or registered services.
//! An optional keep-alive monitor probes the peer between traffic, and an
//! optional encryption handshake runs in-band before the first outbound
//! frame.
//!
//! Concurrency model: exactly one push worker and one pull worker per
//! connection. Handlers and service calls run on spawned tasks so a slow
//! handler never stalls frame intake. All waiting callers park in the
//! pending table and are resolved by the pull worker, a timeout monitor,
//! or session teardown; nothing blocks on the wire directly.

pub mod events;
pub mod handlers;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::adapter::{Adapter, AdapterEvent, ComponentState};
use crate::codec::{ChannelSecurity, CodecRegistry, FrameCodec, FrameType, IncomingFrame, OutgoingFrame, PayloadCodec};
use crate::config::{
    defaults, AckBehavior, ContinuousRequestConfig, CryptoConfig, KeepAliveConfig, LoggingMode,
    MessageConfig, Priority, RequestConfig, ResponseConfig,
};
use crate::crypto::{CryptoProvider, X25519Provider};
use crate::error::{CrosstalkError, Result};
use crate::handshake::{is_handshake_frame, HandshakeAction, HandshakeNegotiator, HandshakeState};
use crate::pending::PendingTable;
use crate::queue::{DispatchQueue, DispatchReceiver};
use crate::rpc::{self, RegisteredService, ServiceDescriptor};
use crate::token::{ShortTokenGenerator, TokenGenerator};

pub use events::{ConnectionLossDecision, SessionEvent};
pub use handlers::{HandlerId, Payload};

use events::EventHub;
use handlers::{HandlerCallback, HandlerEntry, HandlerKind};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not connected; the starting state, and the state after a graceful
    /// [`Session::disconnect`].
    #[default]
    Disconnected,
    /// Connected and exchanging frames.
    Connected,
    /// Dead with a captured cause; see [`Session::failure`].
    Failed,
    /// Terminal; the session cannot be reused.
    Disposed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Why an outbound item matters to observers; selects the failure event
/// emitted when its write or encode fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Message,
    Request,
    Response,
    /// Keep-alive probes, acks, disconnect notifications.
    Silent,
}

/// One unit in the outgoing dispatch queue.
struct OutgoingItem {
    frame: OutgoingFrame,
    /// Resolve the pending entry as soon as the write succeeds (no-ack
    /// messages and disconnect notifications).
    resolve_on_write: bool,
    failure_kind: FailureKind,
    logging_mode: LoggingMode,
}

impl OutgoingItem {
    fn silent(frame: OutgoingFrame) -> Self {
        Self {
            frame,
            resolve_on_write: false,
            failure_kind: FailureKind::Silent,
            logging_mode: LoggingMode::None,
        }
    }
}

/// Builder for a [`Session`].
pub struct SessionBuilder {
    adapter: Option<Arc<dyn Adapter>>,
    registry: Option<Arc<CodecRegistry>>,
    payload_codec: Option<Arc<dyn PayloadCodec>>,
    token_generator: Arc<dyn TokenGenerator>,
    crypto_provider: Arc<dyn CryptoProvider>,
    crypto: CryptoConfig,
    keep_alive: KeepAliveConfig,
    ack_behavior: AckBehavior,
    compress: bool,
    notify_on_disconnect: bool,
    fail_with_adapter: bool,
    default_timeout: Duration,
}

impl SessionBuilder {
    fn new() -> Self {
        Self {
            adapter: None,
            registry: None,
            payload_codec: None,
            token_generator: Arc::new(ShortTokenGenerator),
            crypto_provider: Arc::new(X25519Provider),
            crypto: CryptoConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            ack_behavior: AckBehavior::default(),
            compress: false,
            notify_on_disconnect: true,
            fail_with_adapter: true,
            default_timeout: defaults::REQUEST_TIMEOUT,
        }
    }

    /// Set the transport adapter. Required.
    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Inject a codec registry shared across sessions.
    pub fn with_codec_registry(mut self, registry: Arc<CodecRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Encode outbound payloads with this codec instead of the registry's
    /// JSON default.
    pub fn with_payload_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.payload_codec = Some(codec);
        self
    }

    /// Replace the correlation token generator.
    pub fn with_token_generator(mut self, generator: Arc<dyn TokenGenerator>) -> Self {
        self.token_generator = generator;
        self
    }

    /// Replace the handshake crypto provider.
    pub fn with_crypto_provider(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.crypto_provider = provider;
        self
    }

    /// Channel encryption settings.
    pub fn with_crypto(mut self, crypto: CryptoConfig) -> Self {
        self.crypto = crypto;
        self
    }

    /// Keep-alive monitor settings.
    pub fn with_keep_alive(mut self, keep_alive: KeepAliveConfig) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// When inbound sync messages are acknowledged.
    pub fn with_ack_behavior(mut self, behavior: AckBehavior) -> Self {
        self.ack_behavior = behavior;
        self
    }

    /// Compress outbound payloads.
    pub fn with_compression(mut self) -> Self {
        self.compress = true;
        self
    }

    /// Send a Disconnect frame to the peer during a graceful disconnect
    /// (on by default).
    pub fn with_notify_on_disconnect(mut self, notify: bool) -> Self {
        self.notify_on_disconnect = notify;
        self
    }

    /// Fail the session when the adapter fails (on by default).
    pub fn with_fail_on_adapter_failure(mut self, fail: bool) -> Self {
        self.fail_with_adapter = fail;
        self
    }

    /// Default deadline for requests and acknowledged messages.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Build the session. Fails when a required collaborator is missing.
    pub fn build(self) -> Result<Session> {
        let adapter = self
            .adapter
            .ok_or(CrosstalkError::ConfigurationMissing("transport adapter"))?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(CodecRegistry::with_defaults()));
        let security = Arc::new(ChannelSecurity::new());
        let mut codec = FrameCodec::new(Arc::clone(&registry), Arc::clone(&security))?;
        if let Some(payload_codec) = self.payload_codec {
            codec = codec.with_payload_codec(payload_codec);
        }
        if self.compress {
            codec = codec.with_compression();
        }

        Ok(Session {
            inner: Arc::new(Inner {
                adapter,
                codec,
                security,
                token_generator: self.token_generator,
                crypto_provider: self.crypto_provider,
                crypto: self.crypto,
                keep_alive: self.keep_alive,
                ack_behavior: self.ack_behavior,
                notify_on_disconnect: self.notify_on_disconnect,
                fail_with_adapter: self.fail_with_adapter,
                default_timeout: self.default_timeout,
                state: Mutex::new(SessionState::Disconnected),
                failure: Mutex::new(None),
                negotiator: Mutex::new(HandshakeNegotiator::new()),
                any_frame_seen: AtomicBool::new(false),
                handshake_bypassed: AtomicBool::new(false),
                pending: PendingTable::new(),
                queue: DispatchQueue::new(),
                handlers: Mutex::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
                services: Mutex::new(HashMap::new()),
                events: EventHub::default(),
                total_incoming: AtomicU64::new(0),
                total_outgoing: AtomicU64::new(0),
                last_incoming: Mutex::new(Instant::now()),
                workers: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct Inner {
    adapter: Arc<dyn Adapter>,
    codec: FrameCodec,
    security: Arc<ChannelSecurity>,
    token_generator: Arc<dyn TokenGenerator>,
    crypto_provider: Arc<dyn CryptoProvider>,
    crypto: CryptoConfig,
    keep_alive: KeepAliveConfig,
    ack_behavior: AckBehavior,
    notify_on_disconnect: bool,
    fail_with_adapter: bool,
    default_timeout: Duration,

    state: Mutex<SessionState>,
    failure: Mutex<Option<String>>,
    negotiator: Mutex<HandshakeNegotiator>,
    /// Set by the first inbound frame of any kind.
    any_frame_seen: AtomicBool,
    /// Set when the first inbound frame is a protocol frame: the peer is
    /// not handshaking, so handshake processing is skipped for the rest of
    /// the connection.
    handshake_bypassed: AtomicBool,
    pending: PendingTable,
    queue: DispatchQueue<OutgoingItem>,
    handlers: Mutex<Vec<HandlerEntry>>,
    next_handler_id: AtomicU64,
    services: Mutex<HashMap<String, Arc<RegisteredService>>>,
    events: EventHub,
    total_incoming: AtomicU64,
    total_outgoing: AtomicU64,
    last_incoming: Mutex<Instant>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A connection-oriented messaging session over one adapter.
///
/// Cheap to clone; clones share the same underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Start building a session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Cause of the `Failed` state, when in it.
    pub fn failure(&self) -> Option<String> {
        lock(&self.inner.failure).clone()
    }

    /// Frames decoded since the session was built.
    pub fn total_incoming(&self) -> u64 {
        self.inner.total_incoming.load(Ordering::Relaxed)
    }

    /// Frames written since the session was built.
    pub fn total_outgoing(&self) -> u64 {
        self.inner.total_outgoing.load(Ordering::Relaxed)
    }

    /// Number of in-flight outbound units awaiting correlation.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Subscribe to session events. Listeners run synchronously on the
    /// emitting task and must not block.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(Arc::new(listener));
    }

    /// Subscribe to connection-loss decisions. A listener may call
    /// [`ConnectionLossDecision::retain`] to veto the automatic failure.
    pub fn on_connection_lost<F>(&self, listener: F)
    where
        F: Fn(&CrosstalkError, &mut ConnectionLossDecision) + Send + Sync + 'static,
    {
        self.inner.events.subscribe_loss(Arc::new(listener));
    }

    /// Connect the adapter and start the workers.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            SessionState::Connected => {
                return Err(CrosstalkError::InvalidState(
                    "session is already connected".to_string(),
                ))
            }
            SessionState::Disposed => {
                return Err(CrosstalkError::InvalidState("session is disposed".to_string()))
            }
            _ => {}
        }

        // Workers from a previous connection are already winding down
        // (their queue saw the shutdown sentinel and the adapter was
        // disconnected); make sure none of them outlives into this one.
        for worker in lock(&self.inner.workers).drain(..) {
            worker.abort();
        }

        self.inner.queue.reset();
        {
            let mut negotiator = lock(&self.inner.negotiator);
            negotiator.reset(self.inner.crypto.enabled, Arc::clone(&self.inner.crypto_provider))?;
        }
        self.inner.any_frame_seen.store(false, Ordering::Release);
        self.inner.handshake_bypassed.store(false, Ordering::Release);
        *lock(&self.inner.failure) = None;
        *lock(&self.inner.last_incoming) = Instant::now();

        // Subscribe before connecting so no early frame is missed.
        let adapter_events = self.inner.adapter.events();
        self.inner.adapter.connect().await?;
        self.inner.set_state(SessionState::Connected);

        let receiver = self.inner.queue.take_receiver().ok_or_else(|| {
            CrosstalkError::InvalidState("dispatch queue receiver already taken".to_string())
        })?;

        let mut workers = lock(&self.inner.workers);
        workers.push(tokio::spawn(run_push_worker(Arc::clone(&self.inner), receiver)));
        workers.push(tokio::spawn(run_pull_worker(
            Arc::clone(&self.inner),
            adapter_events,
        )));
        if self.inner.keep_alive.enabled {
            workers.push(tokio::spawn(run_keep_alive_worker(Arc::clone(&self.inner))));
        }

        tracing::info!(
            crypto = self.inner.crypto.enabled,
            keep_alive = self.inner.keep_alive.enabled,
            "Session connected"
        );
        Ok(())
    }

    /// Gracefully disconnect: notify the peer (when configured), stop the
    /// workers, and fail every pending entry with
    /// [`CrosstalkError::Disconnected`]. No-op unless connected.
    pub async fn disconnect(&self) -> Result<()> {
        self.disconnect_with_reason(None).await
    }

    /// [`Session::disconnect`] carrying a reason in the Disconnect frame.
    pub async fn disconnect_with_reason(&self, reason: Option<String>) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Ok(());
        }

        // Let an in-flight handshake settle; the peer may be mid-exchange.
        let watch = {
            let negotiator = lock(&self.inner.negotiator);
            (negotiator.state() == HandshakeState::Negotiating)
                .then(|| negotiator.completed_watch())
        };
        if let Some(watch) = watch {
            let _ = self
                .inner
                .await_handshake(watch, defaults::DISCONNECT_HANDSHAKE_GRACE)
                .await;
        }

        if self.inner.notify_on_disconnect {
            let token = self.inner.token_generator.generate();
            let rx = self.inner.pending.register_message(&token);
            let item = OutgoingItem {
                frame: OutgoingFrame::disconnect(token.clone(), reason),
                resolve_on_write: true,
                failure_kind: FailureKind::Silent,
                logging_mode: LoggingMode::None,
            };
            if self.inner.enqueue(Priority::High, item).is_ok() {
                // Bounded wait for the frame to hit the wire before the
                // queue is shut down.
                let _ = tokio::time::timeout(Duration::from_secs(2), rx).await;
            } else {
                self.inner.pending.fail(&token, CrosstalkError::Disconnected);
            }
        }

        let transitioned = {
            let mut state = lock(&self.inner.state);
            if *state != SessionState::Connected {
                false
            } else {
                *state = SessionState::Disconnected;
                true
            }
        };
        if !transitioned {
            return Ok(());
        }
        self.inner.events.emit(&SessionEvent::StateChanged {
            from: SessionState::Connected,
            to: SessionState::Disconnected,
        });
        self.inner.teardown(&CrosstalkError::Disconnected).await;
        tracing::info!("Session disconnected");
        Ok(())
    }

    /// Disconnect and mark the session unusable, aborting its workers.
    pub async fn dispose(&self) {
        let _ = self.disconnect().await;
        self.inner.set_state(SessionState::Disposed);
        for worker in lock(&self.inner.workers).drain(..) {
            worker.abort();
        }
    }

    /// Send a one-way message. Without `require_ack` this resolves when
    /// the frame is written; with it, when the peer's acknowledgment
    /// arrives (or the deadline passes).
    pub async fn send<M: Payload>(&self, message: &M, config: MessageConfig) -> Result<()> {
        let payload = handlers::wrap_payload(message)?;
        self.send_message_internal(payload, None, config).await
    }

    /// [`Session::send`] with an untyped payload.
    pub async fn send_raw(&self, payload: Value, config: MessageConfig) -> Result<()> {
        self.send_message_internal(payload, None, config).await
    }

    pub(crate) async fn send_message_internal(
        &self,
        payload: Value,
        rpc_signature: Option<String>,
        config: MessageConfig,
    ) -> Result<()> {
        self.inner.ensure_connected()?;
        let token = self.inner.token_generator.generate();
        let mut frame = OutgoingFrame::message(token.clone(), payload, config.require_ack);
        if let Some(signature) = rpc_signature {
            frame = frame.with_rpc_signature(signature);
        }

        let rx = self.inner.pending.register_message(&token);
        let item = OutgoingItem {
            frame,
            resolve_on_write: !config.require_ack,
            failure_kind: FailureKind::Message,
            logging_mode: config.logging_mode,
        };
        self.inner.submit(config.priority, item, &token)?;
        if config.require_ack {
            self.inner
                .spawn_timeout_monitor(&token, config.timeout, "message acknowledgment");
        }
        if let Some(cancellation) = config.cancellation {
            self.inner.spawn_cancellation_monitor(&token, cancellation);
        }
        rx.await.map_err(|_| CrosstalkError::Disconnected)?
    }

    /// Send a request and await its single response.
    pub async fn send_request<Req, Resp>(&self, request: &Req, config: RequestConfig) -> Result<Resp>
    where
        Req: Payload,
        Resp: DeserializeOwned,
    {
        let payload = handlers::wrap_payload(request)?;
        let value = self.send_request_internal(payload, None, config).await?;
        let (_, body) = handlers::unwrap_payload(value);
        Ok(serde_json::from_value(body)?)
    }

    /// [`Session::send_request`] with untyped payloads.
    pub async fn send_request_raw(&self, payload: Value, config: RequestConfig) -> Result<Value> {
        self.send_request_internal(payload, None, config).await
    }

    pub(crate) async fn send_request_internal(
        &self,
        payload: Value,
        rpc_signature: Option<String>,
        config: RequestConfig,
    ) -> Result<Value> {
        self.inner.ensure_connected()?;
        let token = self.inner.token_generator.generate();
        let mut frame = OutgoingFrame::request(token.clone(), payload);
        frame.timeout_secs = config.timeout.as_secs().min(u64::from(u8::MAX)) as u8;
        if let Some(signature) = rpc_signature {
            frame = frame.with_rpc_signature(signature);
        }

        let rx = self.inner.pending.register_request(&token);
        let item = OutgoingItem {
            frame,
            resolve_on_write: false,
            failure_kind: FailureKind::Request,
            logging_mode: config.logging_mode,
        };
        self.inner.submit(config.priority, item, &token)?;
        self.inner
            .spawn_timeout_monitor(&token, config.timeout, "request");
        if let Some(cancellation) = config.cancellation {
            self.inner.spawn_cancellation_monitor(&token, cancellation);
        }
        rx.await.map_err(|_| CrosstalkError::Disconnected)?
    }

    /// Send a continuous request and obtain its response stream.
    pub async fn send_continuous_request<Req: Payload>(
        &self,
        request: &Req,
        config: ContinuousRequestConfig,
    ) -> Result<ContinuousResponses> {
        let payload = handlers::wrap_payload(request)?;
        self.send_continuous_internal(payload, None, config).await
    }

    /// [`Session::send_continuous_request`] with an untyped payload.
    pub async fn send_continuous_raw(
        &self,
        payload: Value,
        config: ContinuousRequestConfig,
    ) -> Result<ContinuousResponses> {
        self.send_continuous_internal(payload, None, config).await
    }

    pub(crate) async fn send_continuous_internal(
        &self,
        payload: Value,
        rpc_signature: Option<String>,
        config: ContinuousRequestConfig,
    ) -> Result<ContinuousResponses> {
        self.inner.ensure_connected()?;
        let token = self.inner.token_generator.generate();
        let mut frame = OutgoingFrame::continuous_request(token.clone(), payload);
        frame.timeout_secs = config
            .timeout
            .map_or(0, |timeout| timeout.as_secs().min(u64::from(u8::MAX)) as u8);
        if let Some(signature) = rpc_signature {
            frame = frame.with_rpc_signature(signature);
        }

        let receiver = self.inner.pending.register_continuous(&token);
        let item = OutgoingItem {
            frame,
            resolve_on_write: false,
            failure_kind: FailureKind::Request,
            logging_mode: config.logging_mode,
        };
        self.inner.submit(config.priority, item, &token)?;
        self.inner
            .spawn_continuous_monitor(&token, config.timeout, config.continuous_timeout);
        if let Some(cancellation) = config.cancellation {
            self.inner.spawn_cancellation_monitor(&token, cancellation);
        }
        Ok(ContinuousResponses { receiver })
    }

    /// Send the response to a previously received request. Fire-and-forget:
    /// delivery failures surface only as [`SessionEvent::ResponseFailed`].
    pub fn send_response<R: Serialize>(
        &self,
        token: &str,
        response: &R,
        config: ResponseConfig,
    ) -> Result<()> {
        let value = serde_json::to_value(response)?;
        self.send_response_value(token, value, true, config)
    }

    /// Send a non-terminal response into the peer's continuous stream.
    /// End the stream with [`Session::send_response`] (terminal, carries
    /// the last payload) or [`Session::send_error_response`].
    pub fn send_stream_response<R: Serialize>(
        &self,
        token: &str,
        response: &R,
        config: ResponseConfig,
    ) -> Result<()> {
        let value = serde_json::to_value(response)?;
        self.send_response_value(token, value, false, config)
    }

    /// Send an error response, failing the peer's pending request.
    pub fn send_error_response(
        &self,
        token: &str,
        message: impl Into<String>,
        config: ResponseConfig,
    ) -> Result<()> {
        self.inner.ensure_connected()?;
        let frame = OutgoingFrame::error_response(token.to_string(), message.into());
        self.inner.enqueue(
            config.priority,
            OutgoingItem {
                frame,
                resolve_on_write: false,
                failure_kind: FailureKind::Response,
                logging_mode: config.logging_mode,
            },
        )
    }

    pub(crate) fn send_response_value(
        &self,
        token: &str,
        value: Value,
        completed: bool,
        config: ResponseConfig,
    ) -> Result<()> {
        self.inner.ensure_connected()?;
        let frame = OutgoingFrame::response(token.to_string(), value, completed);
        self.inner.enqueue(
            config.priority,
            OutgoingItem {
                frame,
                resolve_on_write: false,
                failure_kind: FailureKind::Response,
                logging_mode: config.logging_mode,
            },
        )
    }

    /// Register a handler for one-way messages of type `M`. Multiple
    /// handlers may observe the same type.
    pub fn register_message_handler<M, F, Fut>(&self, handler: F) -> HandlerId
    where
        M: Payload,
        F: Fn(Session, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let handler = Arc::new(handler);
        let callback: HandlerCallback = Arc::new(move |_token, body| {
            let weak = weak.clone();
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let inner = weak.upgrade().ok_or(CrosstalkError::Disconnected)?;
                let message: M = serde_json::from_value(body)?;
                handler(Session { inner }, message).await?;
                Ok(None)
            })
        });
        self.add_handler(M::TYPE_NAME, HandlerKind::Message, callback)
    }

    /// Register the responding handler for requests of type `Req`. Its
    /// result is sent back as the response; its error becomes an error
    /// response. One responder per type answers; extras are ignored with a
    /// warning.
    pub fn register_request_handler<Req, Resp, F, Fut>(&self, handler: F) -> HandlerId
    where
        Req: Payload,
        Resp: Serialize + Send + 'static,
        F: Fn(Session, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let handler = Arc::new(handler);
        let callback: HandlerCallback = Arc::new(move |_token, body| {
            let weak = weak.clone();
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let inner = weak.upgrade().ok_or(CrosstalkError::Disconnected)?;
                let request: Req = serde_json::from_value(body)?;
                let response = handler(Session { inner }, request).await?;
                Ok(Some(serde_json::to_value(response)?))
            })
        });
        self.add_handler(Req::TYPE_NAME, HandlerKind::RequestResponder, callback)
    }

    /// Register a non-responding observer for requests of type `Req`.
    pub fn register_request_observer<Req, F, Fut>(&self, handler: F) -> HandlerId
    where
        Req: Payload,
        F: Fn(Session, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let handler = Arc::new(handler);
        let callback: HandlerCallback = Arc::new(move |_token, body| {
            let weak = weak.clone();
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let inner = weak.upgrade().ok_or(CrosstalkError::Disconnected)?;
                let request: Req = serde_json::from_value(body)?;
                handler(Session { inner }, request).await?;
                Ok(None)
            })
        });
        self.add_handler(Req::TYPE_NAME, HandlerKind::RequestObserver, callback)
    }

    /// Register the streaming handler for continuous requests of type
    /// `Req`. The handler answers with any number of
    /// [`Session::send_stream_response`] frames for the given token,
    /// ending with [`Session::send_response`].
    pub fn register_continuous_request_handler<Req, F, Fut>(&self, handler: F) -> HandlerId
    where
        Req: Payload,
        F: Fn(Session, String, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let handler = Arc::new(handler);
        let callback: HandlerCallback = Arc::new(move |token, body| {
            let weak = weak.clone();
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let inner = weak.upgrade().ok_or(CrosstalkError::Disconnected)?;
                let request: Req = serde_json::from_value(body)?;
                handler(Session { inner }, token, request).await?;
                Ok(None)
            })
        });
        self.add_handler(Req::TYPE_NAME, HandlerKind::ContinuousResponder, callback)
    }

    fn add_handler(
        &self,
        type_name: &'static str,
        kind: HandlerKind,
        callback: HandlerCallback,
    ) -> HandlerId {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = lock(&self.inner.handlers);
        if kind == HandlerKind::RequestResponder
            && handlers
                .iter()
                .any(|entry| entry.kind == HandlerKind::RequestResponder && entry.type_name == type_name)
        {
            tracing::warn!(
                type_name,
                "A responding handler is already registered for this type; the earlier one answers"
            );
        }
        handlers.push(HandlerEntry {
            id,
            type_name,
            kind,
            callback,
        });
        id
    }

    /// Remove a handler. Returns false when the id is unknown.
    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let before = handlers.len();
        handlers.retain(|entry| entry.id != id);
        handlers.len() != before
    }

    /// Expose a service to the peer. Fails when the name is taken.
    pub fn register_service<S: Send + Sync + 'static>(
        &self,
        descriptor: ServiceDescriptor<S>,
    ) -> Result<()> {
        let service = descriptor.build();
        let mut services = lock(&self.inner.services);
        if services.contains_key(service.name()) {
            return Err(CrosstalkError::InvalidState(format!(
                "service {:?} is already registered",
                service.name()
            )));
        }
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Withdraw a service. Live event subscriptions receive a terminal
    /// frame so remote subscribers end instead of hanging; subsequent calls
    /// from the peer get an error response. Returns false when the name is
    /// unknown.
    pub fn unregister_service(&self, name: &str) -> bool {
        let service = lock(&self.inner.services).remove(name);
        let Some(service) = service else {
            return false;
        };
        for (token, handle) in service.take_event_tasks() {
            handle.abort();
            let _ = self.send_response_value(&token, Value::Null, true, ResponseConfig::default());
        }
        true
    }

    pub(crate) fn service(&self, name: &str) -> Option<Arc<RegisteredService>> {
        lock(&self.inner.services).get(name).cloned()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

/// Response stream of a continuous request.
///
/// Yields one `Result<Value>` per response frame and ends after a terminal
/// frame, an error frame, a timeout, cancellation, or session teardown.
pub struct ContinuousResponses {
    receiver: mpsc::UnboundedReceiver<Result<Value>>,
}

impl ContinuousResponses {
    /// Next response payload, or `None` when the stream has ended.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        self.receiver.recv().await
    }

    /// Next response payload, deserialized.
    pub async fn next_as<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        match self.receiver.recv().await {
            Some(Ok(value)) => Some(serde_json::from_value(value).map_err(Into::into)),
            Some(Err(err)) => Some(Err(err)),
            None => None,
        }
    }
}

impl futures::Stream for ContinuousResponses {
    type Item = Result<Value>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl std::fmt::Debug for ContinuousResponses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousResponses").finish_non_exhaustive()
    }
}

impl Inner {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, to: SessionState) {
        let from = {
            let mut state = lock(&self.state);
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            self.events.emit(&SessionEvent::StateChanged { from, to });
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        let state = self.state();
        if state == SessionState::Connected {
            Ok(())
        } else {
            Err(CrosstalkError::NotConnected(state))
        }
    }

    fn enqueue(&self, priority: Priority, item: OutgoingItem) -> Result<()> {
        self.queue
            .enqueue(priority, item)
            .map_err(|_| CrosstalkError::NotConnected(self.state()))
    }

    /// Enqueue an item that has a pending entry; on queue rejection the
    /// entry is failed so the caller's receiver resolves.
    fn submit(&self, priority: Priority, item: OutgoingItem, token: &str) -> Result<()> {
        if let Err(err) = self.enqueue(priority, item) {
            self.pending.fail(token, err.duplicate());
            return Err(err);
        }
        Ok(())
    }

    fn enqueue_silent(&self, priority: Priority, frame: OutgoingFrame) {
        if self.enqueue(priority, OutgoingItem::silent(frame)).is_err() {
            tracing::debug!("Dropped control frame; dispatch queue is closed");
        }
    }

    fn spawn_timeout_monitor(self: &Arc<Self>, token: &str, timeout: Duration, what: &'static str) {
        let inner = Arc::clone(self);
        let token = token.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if inner.pending.fail(
                &token,
                CrosstalkError::Timeout(format!("{what} {token} after {timeout:?}")),
            ) {
                tracing::debug!(token, what, "Pending entry timed out");
            }
        });
    }

    fn spawn_cancellation_monitor(
        self: &Arc<Self>,
        token: &str,
        cancellation: tokio_util::sync::CancellationToken,
    ) {
        let inner = Arc::clone(self);
        let token = token.to_string();
        tokio::spawn(async move {
            cancellation.cancelled().await;
            if inner.pending.fail(&token, CrosstalkError::Cancelled) {
                tracing::debug!(token, "Pending entry cancelled");
            }
        });
    }

    /// Optional first-response deadline, then an optional inactivity
    /// window.
    fn spawn_continuous_monitor(
        self: &Arc<Self>,
        token: &str,
        first_timeout: Option<Duration>,
        continuous_timeout: Option<Duration>,
    ) {
        if first_timeout.is_none() && continuous_timeout.is_none() {
            return;
        }
        let inner = Arc::clone(self);
        let token = token.to_string();
        tokio::spawn(async move {
            if let Some(first) = first_timeout {
                tokio::time::sleep(first).await;
                match inner.pending.continuous_status(&token) {
                    None => return,
                    Some(status) if !status.first_response_seen => {
                        inner.pending.fail(
                            &token,
                            CrosstalkError::Timeout(format!(
                                "continuous request {token} saw no response after {first:?}"
                            )),
                        );
                        return;
                    }
                    Some(_) => {}
                }
            }
            let Some(window) = continuous_timeout else {
                return;
            };
            loop {
                let Some(status) = inner.pending.continuous_status(&token) else {
                    return;
                };
                if status.first_response_seen {
                    let idle = status.last_response.elapsed();
                    if idle >= window {
                        inner.pending.fail(
                            &token,
                            CrosstalkError::Timeout(format!(
                                "continuous request {token} inactive for {idle:?}"
                            )),
                        );
                        return;
                    }
                    tokio::time::sleep(window - idle).await;
                } else {
                    tokio::time::sleep(window).await;
                }
            }
        });
    }

    /// Run (or join) the encryption handshake before a frame goes out.
    async fn ensure_handshake(&self) -> Result<()> {
        if self.handshake_bypassed.load(Ordering::Acquire) {
            return Ok(());
        }
        let (actions, watch) = {
            let mut negotiator = lock(&self.negotiator);
            match negotiator.state() {
                HandshakeState::Completed => return Ok(()),
                // Neither side has asked for a handshake.
                HandshakeState::Idle if !self.crypto.enabled => return Ok(()),
                _ => {}
            }
            (negotiator.begin()?, negotiator.completed_watch())
        };
        self.apply_handshake_actions(actions).await?;
        self.await_handshake(watch, defaults::HANDSHAKE_TIMEOUT).await
    }

    async fn apply_handshake_actions(&self, actions: Vec<HandshakeAction>) -> Result<()> {
        for action in actions {
            match action {
                HandshakeAction::Write(bytes) => {
                    self.adapter
                        .write(Bytes::from(bytes))
                        .await
                        .map_err(|err| CrosstalkError::Handshake(err.to_string()))?;
                }
                HandshakeAction::PasswordAvailable(password) => {
                    self.security.enable(&password)?;
                    tracing::debug!("Channel encryption enabled");
                }
                HandshakeAction::Completed => {
                    tracing::debug!("Encryption handshake completed");
                }
            }
        }
        Ok(())
    }

    async fn await_handshake(
        &self,
        mut watch: watch::Receiver<bool>,
        deadline: Duration,
    ) -> Result<()> {
        let wait = async {
            loop {
                if *watch.borrow_and_update() {
                    return Ok(());
                }
                if watch.changed().await.is_err() {
                    return Err(CrosstalkError::Handshake(
                        "handshake negotiator dropped".to_string(),
                    ));
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(CrosstalkError::Handshake(format!(
                "handshake did not complete within {deadline:?}"
            ))),
        }
    }

    /// Transition to `Failed` unless a loss listener vetoes it.
    async fn fail(&self, cause: CrosstalkError) {
        if self.state() != SessionState::Connected {
            return;
        }
        if !self.events.decide_loss(&cause) {
            tracing::warn!(error = %cause, "Connection loss vetoed by listener; session stays up");
            return;
        }
        let transitioned = {
            let mut state = lock(&self.state);
            if *state != SessionState::Connected {
                false
            } else {
                *state = SessionState::Failed;
                true
            }
        };
        if !transitioned {
            return;
        }
        *lock(&self.failure) = Some(cause.to_string());
        tracing::error!(error = %cause, "Session failed");
        self.events.emit(&SessionEvent::StateChanged {
            from: SessionState::Connected,
            to: SessionState::Failed,
        });
        self.teardown(&cause).await;
    }

    /// Common shutdown path for failure and graceful disconnect.
    async fn teardown(&self, cause: &CrosstalkError) {
        self.queue.shutdown();
        if let Err(err) = self.adapter.disconnect().await {
            tracing::debug!(error = %err, "Adapter disconnect during teardown failed");
        }
        let aborted = self.pending.fail_all(cause);
        if aborted > 0 {
            tracing::debug!(aborted, "Aborted pending entries");
        }
        let services: Vec<Arc<RegisteredService>> =
            lock(&self.services).values().cloned().collect();
        for service in services {
            for (_, handle) in service.take_event_tasks() {
                handle.abort();
            }
        }
    }

    fn report_write_failure(&self, item: &OutgoingItem, error: &CrosstalkError) {
        let token = item.frame.token.clone();
        let error = error.to_string();
        let event = match item.failure_kind {
            FailureKind::Message => SessionEvent::MessageFailed { token, error },
            FailureKind::Request => SessionEvent::RequestFailed { token, error },
            FailureKind::Response => SessionEvent::ResponseFailed { token, error },
            FailureKind::Silent => return,
        };
        self.events.emit(&event);
    }

    fn log_outgoing(&self, item: &OutgoingItem) {
        match item.logging_mode {
            LoggingMode::None => {}
            LoggingMode::Title => {
                tracing::debug!(
                    token = %item.frame.token,
                    frame_type = ?item.frame.frame_type,
                    "Sending frame"
                );
            }
            LoggingMode::TitleAndContent => {
                tracing::debug!(
                    token = %item.frame.token,
                    frame_type = ?item.frame.frame_type,
                    payload = %item.frame.payload,
                    "Sending frame"
                );
            }
        }
    }

    async fn run_message_handlers(&self, token: &str, payload: Value) -> Result<()> {
        let (type_name, body) = handlers::unwrap_payload(payload);
        let callbacks: Vec<HandlerCallback> = {
            lock(&self.handlers)
                .iter()
                .filter(|entry| {
                    entry.kind == HandlerKind::Message
                        && Some(entry.type_name) == type_name.as_deref()
                })
                .map(|entry| Arc::clone(&entry.callback))
                .collect()
        };
        if callbacks.is_empty() {
            tracing::debug!(type_name = ?type_name, "No handler registered for inbound message");
            return Ok(());
        }
        let mut first_error = None;
        for callback in callbacks {
            if let Err(err) = callback(token.to_string(), body.clone()).await {
                tracing::warn!(error = %err, "Message handler failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn run_push_worker(inner: Arc<Inner>, mut receiver: DispatchReceiver<OutgoingItem>) {
    while let Some(item) = receiver.recv().await {
        if inner.state() != SessionState::Connected {
            inner
                .pending
                .fail(&item.frame.token, CrosstalkError::Disconnected);
            continue;
        }
        if let Err(err) = inner.ensure_handshake().await {
            inner.pending.fail(&item.frame.token, err.duplicate());
            inner.fail(err).await;
            break;
        }
        inner.log_outgoing(&item);

        let bytes = match inner.codec.encode(&item.frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(token = %item.frame.token, error = %err, "Failed to encode frame");
                inner.report_write_failure(&item, &err);
                inner.pending.fail(&item.frame.token, err);
                continue;
            }
        };

        match inner.adapter.write(Bytes::from(bytes)).await {
            Ok(()) => {
                inner.total_outgoing.fetch_add(1, Ordering::Relaxed);
                if item.resolve_on_write {
                    inner.pending.resolve_ack(&item.frame.token, None);
                }
                if item.failure_kind == FailureKind::Message {
                    inner.events.emit(&SessionEvent::MessageSent {
                        token: item.frame.token.clone(),
                    });
                }
            }
            Err(err) => {
                tracing::warn!(token = %item.frame.token, error = %err, "Failed to write frame");
                inner.report_write_failure(&item, &err);
                let adapter_dead = inner.adapter.state() == ComponentState::Failed;
                inner.pending.fail(&item.frame.token, err.duplicate());
                if adapter_dead {
                    let cause = CrosstalkError::Adapter(
                        inner.adapter.failure().unwrap_or_else(|| err.to_string()),
                    );
                    inner.fail(cause).await;
                    break;
                }
            }
        }
    }

    // Whatever was still queued at shutdown never hits the wire.
    for item in receiver.drain() {
        inner
            .pending
            .fail(&item.frame.token, CrosstalkError::Disconnected);
    }
}

async fn run_pull_worker(inner: Arc<Inner>, mut events: broadcast::Receiver<AdapterEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Inbound event stream lagged; frames were dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if inner.state() != SessionState::Connected {
            break;
        }
        match event {
            AdapterEvent::Data(data) => handle_inbound(&inner, &data).await,
            AdapterEvent::StateChanged(_, ComponentState::Failed) => {
                if inner.fail_with_adapter {
                    let cause = CrosstalkError::Adapter(
                        inner
                            .adapter
                            .failure()
                            .unwrap_or_else(|| "adapter failed".to_string()),
                    );
                    inner.fail(cause).await;
                    break;
                }
            }
            AdapterEvent::StateChanged(..) => {}
        }
    }
}

async fn handle_inbound(inner: &Arc<Inner>, data: &[u8]) {
    inner.total_incoming.fetch_add(1, Ordering::Relaxed);
    *lock(&inner.last_incoming) = Instant::now();
    let first_frame = !inner.any_frame_seen.swap(true, Ordering::AcqRel);

    if is_handshake_frame(data) {
        if inner.handshake_bypassed.load(Ordering::Acquire) {
            tracing::debug!("Ignoring handshake frame on a bypassed connection");
            return;
        }
        let actions = {
            let mut negotiator = lock(&inner.negotiator);
            negotiator.handle_frame(data)
        };
        let result = match actions {
            Ok(actions) => inner.apply_handshake_actions(actions).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::error!(error = %err, "Handshake failed");
            inner.fail(err).await;
        }
        return;
    }

    // A peer that opens with a protocol frame is not going to handshake;
    // skip handshake processing for the rest of the connection.
    if first_frame {
        inner.handshake_bypassed.store(true, Ordering::Release);
    }

    let frame = match inner.codec.decode(data) {
        Ok(frame) => frame,
        Err(err) => {
            if let CrosstalkError::Decode {
                token: Some(token), ..
            } = &err
            {
                let token = token.clone();
                tracing::warn!(token, error = %err, "Failed to decode frame; failing its pending entry");
                inner.pending.fail(&token, err);
            } else {
                tracing::warn!(error = %err, "Failed to decode frame");
            }
            return;
        }
    };

    match frame.frame_type {
        FrameType::Message | FrameType::MessageSync => {
            let inner = Arc::clone(inner);
            tokio::spawn(async move { dispatch_message(inner, frame).await });
        }
        FrameType::Request | FrameType::ContinuousRequest => {
            let session = Session {
                inner: Arc::clone(inner),
            };
            tokio::spawn(async move { dispatch_request(session, frame).await });
        }
        FrameType::Response => {
            if !inner.pending.resolve_response(
                &frame.token,
                frame.payload,
                frame.completed,
                frame.error_message,
            ) {
                tracing::debug!(token = %frame.token, "Unmatched response frame dropped");
            }
        }
        FrameType::MessageSyncAck => {
            // Under the default behavior the peer acks plain messages
            // before handlers run, so error text only ever arrives when
            // the peer chose to report one (ReportErrors, or a service
            // notification); honor it unconditionally.
            if !inner.pending.resolve_ack(&frame.token, frame.error_message) {
                tracing::debug!(token = %frame.token, "Unmatched acknowledgment dropped");
            }
        }
        FrameType::KeepAliveRequest => {
            if inner.keep_alive.auto_respond {
                inner.enqueue_silent(Priority::Low, OutgoingFrame::keep_alive_response(frame.token));
            }
        }
        FrameType::KeepAliveResponse => {
            inner.pending.resolve_request(&frame.token, Ok(Value::Null));
        }
        FrameType::Disconnect => {
            tracing::info!(reason = ?frame.error_message, "Peer announced disconnect");
            inner.events.emit(&SessionEvent::Disconnected {
                reason: frame.error_message.clone(),
            });
            inner
                .fail(CrosstalkError::ConnectionClosed(frame.error_message))
                .await;
        }
    }
}

async fn dispatch_message(inner: Arc<Inner>, frame: IncomingFrame) {
    let needs_ack = frame.frame_type == FrameType::MessageSync;
    // Service notifications always report dispatch failures in the ack;
    // a notify to a missing service or member must not look delivered.
    let report_errors =
        inner.ack_behavior == AckBehavior::ReportErrors || frame.rpc_signature.is_some();
    if needs_ack && !report_errors {
        inner.enqueue_silent(
            Priority::Standard,
            OutgoingFrame::ack(frame.token.clone(), None),
        );
    }

    let result = if let Some(signature) = &frame.rpc_signature {
        let session = Session {
            inner: Arc::clone(&inner),
        };
        rpc::dispatch_notification(&session, signature, frame.payload).await
    } else {
        inner.run_message_handlers(&frame.token, frame.payload).await
    };

    if needs_ack && report_errors {
        inner.enqueue_silent(
            Priority::Standard,
            OutgoingFrame::ack(frame.token, result.err().map(|err| err.to_string())),
        );
    }
}

async fn dispatch_request(session: Session, frame: IncomingFrame) {
    if let Some(signature) = frame.rpc_signature.clone() {
        rpc::dispatch_request(&session, &signature, frame).await;
        return;
    }

    let continuous = frame.frame_type == FrameType::ContinuousRequest;
    let token = frame.token.clone();
    let (type_name, body) = handlers::unwrap_payload(frame.payload);
    let (observers, responder) = {
        let entries = lock(&session.inner.handlers);
        let mut observers = Vec::new();
        let mut responder: Option<HandlerCallback> = None;
        for entry in entries.iter() {
            if Some(entry.type_name) != type_name.as_deref() {
                continue;
            }
            match entry.kind {
                HandlerKind::RequestObserver if !continuous => {
                    observers.push(Arc::clone(&entry.callback));
                }
                HandlerKind::RequestResponder if !continuous && responder.is_none() => {
                    responder = Some(Arc::clone(&entry.callback));
                }
                HandlerKind::ContinuousResponder if continuous && responder.is_none() => {
                    responder = Some(Arc::clone(&entry.callback));
                }
                _ => {}
            }
        }
        (observers, responder)
    };

    for observer in observers {
        if let Err(err) = observer(token.clone(), body.clone()).await {
            tracing::warn!(token, error = %err, "Request observer failed");
        }
    }

    let Some(responder) = responder else {
        tracing::warn!(
            token,
            type_name = ?type_name,
            continuous,
            "No responding handler for request; the sender will time out"
        );
        return;
    };
    match responder(token.clone(), body).await {
        Ok(Some(value)) => {
            if let Err(err) =
                session.send_response_value(&token, value, true, ResponseConfig::default())
            {
                tracing::warn!(token, error = %err, "Failed to queue response");
            }
        }
        Ok(None) if continuous => {
            // The streaming handler answers on its own schedule.
        }
        Ok(None) => {
            tracing::warn!(token, "Responding handler produced no response");
        }
        Err(err) => {
            let _ = session.send_error_response(&token, err.to_string(), ResponseConfig::default());
        }
    }
}

/// Periodic keep-alive probe loop.
///
/// A missed probe does not count against the retry budget when unrelated
/// inbound traffic arrived within the probe window; the channel is
/// evidently alive, just busy.
async fn run_keep_alive_worker(inner: Arc<Inner>) {
    let cfg = inner.keep_alive.clone();
    tokio::time::sleep(cfg.delay).await;
    let mut misses = 0u32;

    while inner.state() == SessionState::Connected {
        let token = inner.token_generator.generate();
        let rx = inner.pending.register_request(&token);
        if inner
            .enqueue(
                Priority::Low,
                OutgoingItem::silent(OutgoingFrame::keep_alive_request(token.clone())),
            )
            .is_err()
        {
            inner.pending.fail(&token, CrosstalkError::Disconnected);
            break;
        }
        inner.spawn_timeout_monitor(&token, cfg.timeout, "keep-alive probe");

        match rx.await {
            Ok(Ok(_)) => {
                misses = 0;
            }
            Ok(Err(CrosstalkError::Timeout(_))) => {
                let recent_traffic =
                    lock(&inner.last_incoming).elapsed() < cfg.timeout;
                if recent_traffic {
                    misses = 0;
                } else {
                    misses += 1;
                    tracing::warn!(misses, retries = cfg.retries, "Keep-alive probe unanswered");
                    // `retries` unanswered probes are tolerated; the one
                    // after that escalates.
                    if misses > cfg.retries {
                        inner.events.emit(&SessionEvent::KeepAliveFailed);
                        if cfg.fail_session_on_timeout {
                            inner.fail(CrosstalkError::KeepAliveExhausted).await;
                        }
                        break;
                    }
                }
            }
            _ => break,
        }
        tokio::time::sleep(cfg.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryAdapter;

    fn session_for(adapter: Arc<InMemoryAdapter>) -> Session {
        Session::builder().with_adapter(adapter).build().unwrap()
    }

    #[test]
    fn test_builder_requires_adapter() {
        match Session::builder().build() {
            Err(CrosstalkError::ConfigurationMissing(what)) => {
                assert_eq!(what, "transport adapter");
            }
            other => panic!("expected missing configuration, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_transitions_state() {
        let (left, right) = InMemoryAdapter::pair();
        let session = session_for(left);
        right.connect().await.unwrap();

        assert_eq!(session.state(), SessionState::Disconnected);
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_double_connect_rejected() {
        let (left, right) = InMemoryAdapter::pair();
        let session = session_for(left);
        right.connect().await.unwrap();

        session.connect().await.unwrap();
        assert!(matches!(
            session.connect().await,
            Err(CrosstalkError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (left, _right) = InMemoryAdapter::pair();
        let session = session_for(left);

        let result = session
            .send_raw(serde_json::json!({"x": 1}), MessageConfig::default())
            .await;
        assert!(matches!(
            result,
            Err(CrosstalkError::NotConnected(SessionState::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_state_change_events_emitted() {
        let (left, right) = InMemoryAdapter::pair();
        let session = session_for(left);
        right.connect().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.on_event(move |event| {
            if let SessionEvent::StateChanged { to, .. } = event {
                lock(&sink).push(*to);
            }
        });

        session.connect().await.unwrap();
        session.disconnect().await.unwrap();
        let states = lock(&seen).clone();
        assert_eq!(
            states,
            vec![SessionState::Connected, SessionState::Disconnected]
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (left, right) = InMemoryAdapter::pair();
        let session = session_for(left);
        right.connect().await.unwrap();

        session.connect().await.unwrap();
        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_dispose_is_terminal() {
        let (left, right) = InMemoryAdapter::pair();
        let session = session_for(left);
        right.connect().await.unwrap();

        session.connect().await.unwrap();
        session.dispose().await;
        assert_eq!(session.state(), SessionState::Disposed);
        assert!(matches!(
            session.connect().await,
            Err(CrosstalkError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_handler() {
        let (left, _right) = InMemoryAdapter::pair();
        let session = session_for(left);

        #[derive(serde::Serialize, serde::Deserialize)]
        struct Ping;
        impl Payload for Ping {
            const TYPE_NAME: &'static str = "Ping";
        }

        let id = session.register_message_handler(|_session, _message: Ping| async { Ok(()) });
        assert!(session.unregister_handler(id));
        assert!(!session.unregister_handler(id));
    }
}
