//! Streaming session state machine.
//!
//! A session backs one logical call on a [`Connection`]. It is split into a
//! [`SendHalf`] and a [`RecvHalf`] so one task can drive sends while another
//! drives receives; `&mut self` on every operation keeps each half to a
//! single owner.
//!
//! # States
//!
//! ```text
//!            close_send            peer end-of-stream
//!   Open ──────────────► HalfClosedLocal ──────────────► Closed
//!     │                                                    ▲
//!     └──────────────► HalfClosedRemote ───────────────────┘
//!      peer end-of-stream              close_send
//!
//!   any non-terminal state ──(context, transport, protocol, peer reset)──► Errored
//! ```
//!
//! # Supervision
//!
//! Each session runs a supervisor task racing the call context and the
//! peer's reset signal against terminal state. If the context terminates
//! first the session is aborted and the peer receives a `Reset` frame, so a
//! cancellation raised on either side surfaces on both. On the server side a
//! peer reset also cancels the call context, reaching anything the handler
//! is blocked on (including a relay hop).
//!
//! # Completion
//!
//! Success is signalled by end-of-stream; failure by a `Reset` carrying a
//! status. Messages queued before a peer reset are still delivered.

use crate::context::CallContext;
use crate::errors::RpcError;
use crate::interceptor::InterceptorChain;
use crate::proto::Frame;
use crate::transport::{Connection, ResetSignal, SessionChannel};
use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, trace};

/// The four call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Bidi,
}

impl CallShape {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CallShape::Unary => "unary",
            CallShape::ClientStreaming => "client_streaming",
            CallShape::ServerStreaming => "server_streaming",
            CallShape::Bidi => "bidi",
        }
    }

    /// Messages `role` may send in this shape; `None` means unbounded.
    #[must_use]
    pub fn send_limit(self, role: Role) -> Option<usize> {
        match (self, role) {
            (CallShape::Unary, _)
            | (CallShape::ClientStreaming, Role::Server)
            | (CallShape::ServerStreaming, Role::Client) => Some(1),
            _ => None,
        }
    }
}

/// Which end of the session this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    #[must_use]
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Static description of a call, shared with interceptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub method: String,
    pub shape: CallShape,
    pub role: Role,
}

impl CallInfo {
    pub fn new(method: impl Into<String>, shape: CallShape, role: Role) -> Self {
        Self {
            method: method.into(),
            shape,
            role,
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Local send half closed; the peer may still send.
    HalfClosedLocal,
    /// Peer signalled end-of-stream; local side may still send.
    HalfClosedRemote,
    /// Both halves closed. Terminal, success.
    Closed,
    /// Terminal, failure.
    Errored(RpcError),
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored(_))
    }
}

/// Outbound capability of a session: the decorator seam for interceptors.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Enqueue one message in FIFO order.
    async fn send(&mut self, payload: Bytes) -> Result<(), RpcError>;

    /// Close the send half and emit end-of-stream. Idempotent.
    async fn close_send(&mut self) -> Result<(), RpcError>;
}

/// Inbound capability of a session.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Next message, or `Ok(None)` for the peer's end-of-stream (yielded once).
    async fn receive(&mut self) -> Result<Option<Bytes>, RpcError>;
}

struct SessionCore {
    session_id: u64,
    info: CallInfo,
    ctx: CallContext,
    conn: Connection,
    state: watch::Sender<SessionState>,
    reset: Arc<ResetSignal>,
    /// The latched error came from the peer.
    remote_failure: AtomicBool,
}

impl SessionCore {
    fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn transition(&self, next: impl FnOnce(&SessionState) -> Option<SessionState>) -> bool {
        self.state.send_if_modified(|state| match next(state) {
            Some(new_state) => {
                trace!(
                    target: "rpc.session",
                    session_id = self.session_id,
                    from = ?state,
                    to = ?new_state,
                    "Session transition"
                );
                *state = new_state;
                true
            }
            None => false,
        })
    }

    fn close_local(&self) {
        self.transition(|state| match state {
            SessionState::Open => Some(SessionState::HalfClosedLocal),
            SessionState::HalfClosedRemote => Some(SessionState::Closed),
            _ => None,
        });
    }

    fn close_remote(&self) {
        self.transition(|state| match state {
            SessionState::Open => Some(SessionState::HalfClosedRemote),
            SessionState::HalfClosedLocal => Some(SessionState::Closed),
            _ => None,
        });
    }

    /// Move a non-terminal session to `Errored(err)`.
    fn latch(&self, err: RpcError) -> bool {
        self.transition(|state| {
            if state.is_terminal() {
                None
            } else {
                Some(SessionState::Errored(err))
            }
        })
    }

    /// Error latched by this side, if any. Peer failures are excluded so
    /// that queued messages can drain first.
    fn local_failure(&self) -> Option<RpcError> {
        let state = self.state.borrow();
        match &*state {
            SessionState::Errored(err) if !self.remote_failure.load(Ordering::Acquire) => {
                Some(err.clone())
            }
            _ => None,
        }
    }

    /// Fail the session locally and tell the peer. Returns the error that
    /// the session is terminal with (the first one wins).
    async fn abort(&self, err: RpcError) -> RpcError {
        if self.latch(err.clone()) {
            debug!(
                target: "rpc.session",
                session_id = self.session_id,
                method = %self.info.method,
                role = self.info.role.as_str(),
                error = %err,
                "Session aborted"
            );
            let _ = self
                .conn
                .send_frame(Frame::reset(self.session_id, &Status::from(err.clone())))
                .await;
            return err;
        }
        match self.state() {
            SessionState::Errored(existing) => existing,
            _ => err,
        }
    }

    fn on_remote_reset(&self, err: RpcError) {
        let latched = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            self.remote_failure.store(true, Ordering::Release);
            *state = SessionState::Errored(err.clone());
            true
        });
        if latched {
            debug!(
                target: "rpc.session",
                session_id = self.session_id,
                method = %self.info.method,
                role = self.info.role.as_str(),
                error = %err,
                "Session reset by peer"
            );
        }
        if self.info.role == Role::Server {
            self.ctx.cancel();
        }
    }

    /// Send a frame, racing the context. Any failure aborts the session.
    async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        match self.ctx.run(self.conn.send_frame(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) | Err(err) => Err(self.abort(err).await),
        }
    }

    async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if state.is_terminal() {
                    return state.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

/// Releases the route and stops the supervisor once both halves are gone.
struct Lease {
    core: Arc<SessionCore>,
    released: CancellationToken,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.released.cancel();
        // A server that already sent end-of-stream has reported success; a
        // client dropping a live call abandons it.
        let abandoned = match self.core.state() {
            SessionState::Open | SessionState::HalfClosedRemote => true,
            SessionState::HalfClosedLocal => self.core.info.role == Role::Client,
            SessionState::Closed | SessionState::Errored(_) => false,
        };
        if abandoned && self.core.latch(RpcError::ContextCancelled) {
            debug!(
                target: "rpc.session",
                session_id = self.core.session_id,
                "Live session dropped, resetting"
            );
            self.core.conn.try_send_frame(Frame::reset(
                self.core.session_id,
                &Status::cancelled("session dropped"),
            ));
        }
        self.core.conn.release(self.core.session_id);
    }
}

async fn supervise(core: Arc<SessionCore>, released: CancellationToken) {
    tokio::select! {
        biased;
        () = released.cancelled() => {}
        _ = core.wait_terminal() => {}
        reason = core.ctx.done() => {
            core.abort(reason.into()).await;
        }
        err = core.reset.fired() => {
            core.on_remote_reset(err);
        }
    }
}

struct RawSink {
    core: Arc<SessionCore>,
    sent: usize,
    closed: bool,
}

#[async_trait]
impl MessageSink for RawSink {
    async fn send(&mut self, payload: Bytes) -> Result<(), RpcError> {
        if let SessionState::Errored(err) = self.core.state() {
            return Err(err);
        }
        if let Some(err) = self.core.ctx.err() {
            return Err(self.core.abort(err).await);
        }
        if self.closed {
            return Err(RpcError::SessionClosed);
        }

        self.core
            .send_frame(Frame::message(self.core.session_id, payload))
            .await?;
        self.sent += 1;

        if self.core.info.shape.send_limit(self.core.info.role) == Some(self.sent) {
            self.close_send().await?;
        }
        Ok(())
    }

    async fn close_send(&mut self) -> Result<(), RpcError> {
        if self.closed {
            return Ok(());
        }
        if let SessionState::Errored(err) = self.core.state() {
            return Err(err);
        }
        if let Some(err) = self.core.ctx.err() {
            return Err(self.core.abort(err).await);
        }

        self.core
            .send_frame(Frame::end_of_stream(self.core.session_id))
            .await?;
        self.closed = true;
        self.core.close_local();
        Ok(())
    }
}

struct RawSource {
    core: Arc<SessionCore>,
    inbound: mpsc::Receiver<Bytes>,
    /// Set by the transport before it closes `inbound` on end-of-stream.
    peer_closed: Arc<AtomicBool>,
    received: usize,
    end_of_stream: bool,
}

#[async_trait]
impl MessageSource for RawSource {
    async fn receive(&mut self) -> Result<Option<Bytes>, RpcError> {
        if self.end_of_stream {
            return Err(RpcError::SessionClosed);
        }
        if let Some(err) = self.core.local_failure() {
            return Err(err);
        }
        if let Some(err) = self.core.ctx.err() {
            return Err(self.core.abort(err).await);
        }

        let core = Arc::clone(&self.core);
        let item = tokio::select! {
            biased;
            reason = core.ctx.done() => return Err(core.abort(reason.into()).await),
            item = self.inbound.recv() => item,
            err = core.reset.fired() => {
                core.on_remote_reset(err.clone());
                return Err(err);
            }
        };

        match item {
            Some(payload) => {
                let limit = core.info.shape.send_limit(core.info.role.peer());
                if limit.is_some_and(|limit| self.received >= limit) {
                    let err = RpcError::ProtocolViolation(format!(
                        "unexpected message: {} peer may send at most one",
                        core.info.shape.as_str()
                    ));
                    return Err(core.abort(err).await);
                }
                self.received += 1;
                Ok(Some(payload))
            }
            None if self.peer_closed.load(Ordering::Acquire) => {
                self.end_of_stream = true;
                core.close_remote();
                Ok(None)
            }
            None => match core.reset.error() {
                Some(err) => {
                    core.on_remote_reset(err.clone());
                    Err(err)
                }
                None => Err(core
                    .abort(RpcError::Transport("connection closed".to_string()))
                    .await),
            },
        }
    }
}

/// Outbound half of a session.
pub struct SendHalf {
    sink: Box<dyn MessageSink>,
    core: Arc<SessionCore>,
    _lease: Arc<Lease>,
}

impl SendHalf {
    pub async fn send(&mut self, payload: Bytes) -> Result<(), RpcError> {
        self.sink.send(payload).await
    }

    pub async fn close_send(&mut self) -> Result<(), RpcError> {
        self.sink.close_send().await
    }

    /// Terminate the session with `err`, notifying the peer.
    pub async fn abort(&self, err: RpcError) -> RpcError {
        self.core.abort(err).await
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.core.session_id
    }
}

/// Inbound half of a session.
pub struct RecvHalf {
    source: Box<dyn MessageSource>,
    core: Arc<SessionCore>,
    _lease: Arc<Lease>,
}

impl RecvHalf {
    pub async fn receive(&mut self) -> Result<Option<Bytes>, RpcError> {
        self.source.receive().await
    }

    /// Terminate the session with `err`, notifying the peer.
    pub async fn abort(&self, err: RpcError) -> RpcError {
        self.core.abort(err).await
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.core.state()
    }
}

/// One active call: both halves plus the shared state.
pub struct StreamingSession {
    send: SendHalf,
    recv: RecvHalf,
}

impl StreamingSession {
    /// Bind a session to its transport channel, spawn its supervisor and
    /// apply the stream interceptors of `chain`.
    pub(crate) fn establish(
        conn: Connection,
        channel: SessionChannel,
        info: CallInfo,
        ctx: CallContext,
        chain: &InterceptorChain,
    ) -> StreamingSession {
        let SessionChannel {
            session_id,
            inbound,
            end_of_stream,
            reset,
        } = channel;

        let (state, _) = watch::channel(SessionState::Open);
        let core = Arc::new(SessionCore {
            session_id,
            info,
            ctx,
            conn,
            state,
            reset,
            remote_failure: AtomicBool::new(false),
        });

        let released = CancellationToken::new();
        tokio::spawn(supervise(Arc::clone(&core), released.clone()));
        let lease = Arc::new(Lease {
            core: Arc::clone(&core),
            released,
        });

        let raw_sink: Box<dyn MessageSink> = Box::new(RawSink {
            core: Arc::clone(&core),
            sent: 0,
            closed: false,
        });
        let raw_source: Box<dyn MessageSource> = Box::new(RawSource {
            core: Arc::clone(&core),
            inbound,
            peer_closed: end_of_stream,
            received: 0,
            end_of_stream: false,
        });
        let (sink, source) = chain.wrap_stream(&core.info, raw_sink, raw_source);

        StreamingSession {
            send: SendHalf {
                sink,
                core: Arc::clone(&core),
                _lease: Arc::clone(&lease),
            },
            recv: RecvHalf {
                source,
                core,
                _lease: lease,
            },
        }
    }

    pub async fn send(&mut self, payload: Bytes) -> Result<(), RpcError> {
        self.send.send(payload).await
    }

    pub async fn receive(&mut self) -> Result<Option<Bytes>, RpcError> {
        self.recv.receive().await
    }

    pub async fn close_send(&mut self) -> Result<(), RpcError> {
        self.send.close_send().await
    }

    pub async fn abort(&self, err: RpcError) -> RpcError {
        self.send.abort(err).await
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.send.state()
    }

    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.send.session_id()
    }

    #[must_use]
    pub fn info(&self) -> &CallInfo {
        &self.send.core.info
    }

    #[must_use]
    pub fn context(&self) -> &CallContext {
        &self.send.core.ctx
    }

    /// Resolves once the session is `Closed` or `Errored`.
    pub async fn wait_terminal(&self) -> SessionState {
        self.send.core.wait_terminal().await
    }

    /// Split for concurrent use from two tasks.
    #[must_use]
    pub fn split(self) -> (SendHalf, RecvHalf) {
        (self.send, self.recv)
    }
}

/// Typed outbound stream of prost messages.
pub struct Outgoing<M> {
    half: SendHalf,
    _message: PhantomData<fn(M)>,
}

impl<M: Message> Outgoing<M> {
    #[must_use]
    pub fn new(half: SendHalf) -> Self {
        Self {
            half,
            _message: PhantomData,
        }
    }

    pub async fn send(&mut self, message: &M) -> Result<(), RpcError> {
        self.half.send(Bytes::from(message.encode_to_vec())).await
    }

    pub async fn close_send(&mut self) -> Result<(), RpcError> {
        self.half.close_send().await
    }

    pub async fn abort(&self, err: RpcError) -> RpcError {
        self.half.abort(err).await
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.half.state()
    }
}

/// Typed inbound stream of prost messages.
pub struct Incoming<M> {
    half: RecvHalf,
    _message: PhantomData<fn() -> M>,
}

impl<M: Message + Default> Incoming<M> {
    #[must_use]
    pub fn new(half: RecvHalf) -> Self {
        Self {
            half,
            _message: PhantomData,
        }
    }

    /// Next decoded message, or `Ok(None)` at end-of-stream. An undecodable
    /// payload fails the session.
    pub async fn message(&mut self) -> Result<Option<M>, RpcError> {
        match self.half.receive().await? {
            Some(payload) => match M::decode(payload) {
                Ok(message) => Ok(Some(message)),
                Err(e) => Err(self.half.abort(RpcError::from(e)).await),
            },
            None => Ok(None),
        }
    }

    pub async fn abort(&self, err: RpcError) -> RpcError {
        self.half.abort(err).await
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.half.state()
    }
}
