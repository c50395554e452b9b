//! # Crosstalk - Transport-Agnostic Messaging Sessions
//!
//! Connection-oriented messaging engine: typed messages, request/response,
//! continuous response streams, and explicit service registries over any
//! byte-frame transport, with optional in-band channel encryption and
//! keep-alive supervision.
//!
//! ## Architecture
//!
//! ```text
//! send / send_request / ServiceClient
//!        |
//!        v
//!  [dispatch queue]  high | standard | low
//!        |
//!        v                                  inbound frames
//!   push worker ---> Adapter (transport) ---> pull worker
//!   (handshake,                               (decode, correlate)
//!    encode, write)                                |
//!                                   +--------------+--------------+
//!                                   v              v              v
//!                             pending table    handlers      services
//!                             (ack/response)  (by @type)  (by signature)
//! ```
//!
//! Exactly one push worker and one pull worker run per connection. Senders
//! never touch the wire: they park in the pending-correlation table and
//! are resolved by the pull worker, a timeout or cancellation monitor, or
//! session teardown.
//!
//! ### Frame Types
//!
//! | Type              | Direction     | Purpose                            |
//! |-------------------|---------------|------------------------------------|
//! | Message           | One-way       | Fire-and-forget payload            |
//! | MessageSync       | One-way       | Payload demanding an ACK           |
//! | MessageSyncAck    | Reply         | Delivery/handler acknowledgment    |
//! | Request           | Round-trip    | Expects exactly one Response       |
//! | ContinuousRequest | Round-trip    | Expects an open response stream    |
//! | Response          | Reply         | Result, error, or stream element   |
//! | KeepAliveRequest  | Background    | Liveness probe                     |
//! | KeepAliveResponse | Background    | Probe answer                       |
//! | Disconnect        | Notification  | Graceful-close announcement        |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use crosstalk::{
//!     InMemoryAdapter, MessageConfig, Payload, RequestConfig, Session,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SumRequest { a: i64, b: i64 }
//! impl Payload for SumRequest {
//!     const TYPE_NAME: &'static str = "SumRequest";
//! }
//!
//! # async fn run() -> crosstalk::Result<()> {
//! let (client_end, server_end) = InMemoryAdapter::pair();
//! let server = Session::builder().with_adapter(server_end).build()?;
//! server.register_request_handler(|_session, request: SumRequest| async move {
//!     Ok(request.a + request.b)
//! });
//! server.connect().await?;
//!
//! let client = Session::builder().with_adapter(client_end).build()?;
//! client.connect().await?;
//! let sum: i64 = client
//!     .send_request(&SumRequest { a: 10, b: 15 }, RequestConfig::default())
//!     .await?;
//! assert_eq!(sum, 25);
//! # Ok(())
//! # }
//! ```
//!
//! ### Services
//!
//! ```rust,ignore
//! use crosstalk::{CreationPolicy, ServiceClient, ServiceDescriptor};
//!
//! # async fn run(server: crosstalk::Session, client: crosstalk::Session) -> crosstalk::Result<()> {
//! struct Calculator;
//! server.register_service(
//!     ServiceDescriptor::new("Calculator", || Calculator)
//!         .with_policy(CreationPolicy::Singleton)
//!         .method("Add", |_service, (a, b): (i64, i64)| async move { Ok(a + b) }),
//! )?;
//!
//! let calculator = ServiceClient::new(&client, "Calculator");
//! let sum: i64 = calculator.call("Add", &(10, 15)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Connection lifecycle, workers, send family, handlers
//! - [`adapter`]: Transport contract and the in-process adapter pair
//! - [`codec`]: Envelope model, header layout, payload codecs
//! - [`rpc`]: Service descriptors, dispatch, and the client proxy
//! - [`handshake`]: In-band encryption negotiation
//! - [`pending`]: Token-keyed correlation table
//! - [`queue`]: Three-lane outgoing dispatch queue
//! - [`config`]: Send-family and engine configuration
//! - [`error`]: Error types and result alias

pub mod adapter;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod pending;
pub mod queue;
pub mod rpc;
pub mod session;
pub mod token;

// Re-exports for convenience
pub use adapter::{Adapter, AdapterEvent, ComponentState, InMemoryAdapter};
pub use codec::{
    ChannelSecurity, CodecRegistry, Compressor, FrameCodec, FrameType, GzipCompressor,
    IncomingFrame, JsonCodec, OutgoingFrame, PayloadCodec,
};
pub use config::{
    AckBehavior, ContinuousRequestConfig, CryptoConfig, KeepAliveConfig, LoggingMode,
    MessageConfig, Priority, RequestConfig, ResponseConfig,
};
pub use crypto::{CryptoProvider, KeyPair, X25519Provider};
pub use error::{CrosstalkError, Result};
pub use handshake::{HandshakeNegotiator, HandshakeState};
pub use pending::PendingTable;
pub use rpc::{
    CreationPolicy, EventEmitter, RpcKind, RpcSignature, ServiceClient, ServiceDescriptor,
};
pub use session::{
    ConnectionLossDecision, ContinuousResponses, HandlerId, Payload, Session, SessionBuilder,
    SessionEvent, SessionState,
};
pub use token::{SequentialTokenGenerator, ShortTokenGenerator, TokenGenerator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
