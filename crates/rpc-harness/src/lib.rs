//! RPC Session Harness Library
//!
//! A small RPC harness for the four call shapes (unary, client-streaming,
//! server-streaming, bidirectional) over a multiplexed, already-secured
//! channel, with explicit control over cancellation, deadlines and
//! interception.
//!
//! # Architecture
//!
//! ```text
//! HelloClient ──► InterceptorChain ──► StreamingSession ─┐
//!                                                        │ Connection (frames over a Link)
//! Hello impl ◄── InterceptorChain ◄── StreamingSession ◄─┘
//!      │
//!      └── RelayHop ──► HelloClient ──► second server (same CallContext)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One context per call**: a [`context::CallContext`] is shared by
//!   reference with everything running for the call, including a relay hop
//! - **Termination crosses the wire**: the caller's remaining deadline is sent
//!   with the open request; errors and cancellations travel as `Reset` frames
//! - **Explicit composition**: interceptor chains are values handed to the
//!   server and client, never registered globally
//! - **Decorators for streams**: stream interceptors wrap the
//!   [`session::MessageSink`] / [`session::MessageSource`] capabilities
//!
//! # Modules
//!
//! - [`context`] - Call context, deadlines and cancellation
//! - [`session`] - Streaming session state machine
//! - [`transport`] - Links and the session multiplexer
//! - [`interceptor`] / [`interceptors`] - Interceptor chain and built-ins
//! - [`client`] / [`server`] / [`service`] - The Hello service end to end
//! - [`relay`] - Forwarding tagged requests to a second instance
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types mapped to gRPC status codes

pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod interceptor;
pub mod interceptors;
pub mod observability;
pub mod proto;
pub mod relay;
pub mod server;
pub mod service;
pub mod session;
pub mod transport;

pub use client::HelloClient;
pub use context::{CallContext, DoneReason};
pub use errors::RpcError;
pub use interceptor::InterceptorChain;
pub use server::Server;
pub use service::{Hello, HelloService};
pub use session::{SessionState, StreamingSession};
