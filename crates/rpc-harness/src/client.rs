//! Client for the Hello service.
//!
//! Each entry point takes the [`CallContext`] that governs the call. The
//! context's remaining time travels to the server with the open request, and
//! its cancellation resets the session on both ends.
//!
//! Dropping a call handle before it has completed cancels the call on the
//! server.

use crate::context::CallContext;
use crate::errors::RpcError;
use crate::interceptor::{InterceptorChain, UnaryHandler};
use crate::proto::{HelloReply, HelloRequest, Open};
use crate::service::{
    BIDIRECTIONAL_STREAMING_HELLO, CLIENT_STREAMING_HELLO, SERVER_STREAMING_HELLO, UNARY_HELLO,
};
use crate::session::{
    CallInfo, CallShape, Incoming, Outgoing, Role, SessionState, StreamingSession,
};
use crate::transport::Connection;
use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use secrecy::{ExposeSecret, SecretString};
use tonic::metadata::{Ascii, MetadataMap, MetadataValue};
use tonic::Request;
use tracing::{debug, instrument};

/// Hello client bound to one connection.
#[derive(Clone)]
pub struct HelloClient {
    conn: Connection,
    chain: InterceptorChain,
    credentials: Option<SecretString>,
}

impl std::fmt::Debug for HelloClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelloClient")
            .field("conn", &self.conn)
            .field("chain", &self.chain)
            .field(
                "credentials",
                &self.credentials.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl HelloClient {
    #[must_use]
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            chain: InterceptorChain::default(),
            credentials: None,
        }
    }

    /// Send `authorization: Bearer <token>` with every call.
    #[must_use]
    pub fn with_credentials(mut self, token: SecretString) -> Self {
        self.credentials = Some(token);
        self
    }

    #[must_use]
    pub fn with_interceptors(mut self, chain: InterceptorChain) -> Self {
        self.chain = chain;
        self
    }

    fn attach_credentials(&self, metadata: &mut MetadataMap) -> Result<(), RpcError> {
        if let Some(token) = &self.credentials {
            let value = format!("Bearer {}", token.expose_secret())
                .parse::<MetadataValue<Ascii>>()
                .map_err(|_| RpcError::Unauthenticated("Invalid credentials".to_string()))?;
            metadata.insert("authorization", value);
        }
        Ok(())
    }

    /// Open a session; `wrap` supplies the stream decorators.
    async fn open_session(
        &self,
        ctx: &CallContext,
        info: CallInfo,
        metadata: &MetadataMap,
        wrap: &InterceptorChain,
    ) -> Result<StreamingSession, RpcError> {
        ctx.check()?;
        let open = Open::new(info.method.clone(), ctx.remaining(), metadata);
        let channel = self.conn.open(open).await?;
        debug!(
            target: "rpc.client",
            call_id = %ctx.call_id(),
            session_id = channel.session_id,
            method = %info.method,
            "Session opened"
        );
        Ok(StreamingSession::establish(
            self.conn.clone(),
            channel,
            info,
            ctx.clone(),
            wrap,
        ))
    }

    /// Run stream admission hooks and open a streaming session.
    async fn open_stream(
        &self,
        ctx: &CallContext,
        method: &str,
        shape: CallShape,
    ) -> Result<(StreamingSession, CallTracker), RpcError> {
        let info = CallInfo::new(method, shape, Role::Client);
        let mut request = Request::new(());
        self.attach_credentials(request.metadata_mut())?;

        // Finish hooks run even when admission or the open itself fails.
        let mut tracker = CallTracker {
            chain: self.chain.clone(),
            info: info.clone(),
            ctx: ctx.clone(),
            finished: false,
        };
        let opened = match self.chain.admit_stream(&info, ctx, &mut request).await {
            Ok(()) => {
                self.open_session(ctx, info, request.metadata(), &self.chain)
                    .await
            }
            Err(e) => Err(e),
        };
        match opened {
            Ok(session) => Ok((session, tracker)),
            Err(e) => {
                tracker.finish(&Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Unary call.
    #[instrument(skip_all, name = "rpc.client.unary_hello", fields(call_id = %ctx.call_id()))]
    pub async fn unary_hello(
        &self,
        ctx: &CallContext,
        request: HelloRequest,
    ) -> Result<HelloReply, RpcError> {
        let info = CallInfo::new(UNARY_HELLO, CallShape::Unary, Role::Client);
        let mut request = Request::new(Bytes::from(request.encode_to_vec()));
        self.attach_credentials(request.metadata_mut())?;

        let wire = WireCall {
            client: self,
            info: &info,
        };
        let reply = self.chain.invoke_unary(&info, ctx, request, &wire).await?;
        Ok(HelloReply::decode(reply)?)
    }

    /// Server-streaming call: one request, replies until end-of-stream.
    #[instrument(skip_all, name = "rpc.client.server_streaming_hello", fields(call_id = %ctx.call_id()))]
    pub async fn server_streaming_hello(
        &self,
        ctx: &CallContext,
        request: HelloRequest,
    ) -> Result<ServerStreamCall, RpcError> {
        let (session, mut tracker) = self
            .open_stream(ctx, SERVER_STREAMING_HELLO, CallShape::ServerStreaming)
            .await?;
        let (send, recv) = session.split();

        // The single request closes the send half.
        let mut outgoing = Outgoing::<HelloRequest>::new(send);
        if let Err(e) = outgoing.send(&request).await {
            tracker.finish(&Err(e.clone()));
            return Err(e);
        }

        Ok(ServerStreamCall {
            replies: ReplyStream {
                incoming: Incoming::new(recv),
                tracker,
            },
        })
    }

    /// Client-streaming call: many requests, one reply after close.
    #[instrument(skip_all, name = "rpc.client.client_streaming_hello", fields(call_id = %ctx.call_id()))]
    pub async fn client_streaming_hello(
        &self,
        ctx: &CallContext,
    ) -> Result<ClientStreamCall, RpcError> {
        let (session, tracker) = self
            .open_stream(ctx, CLIENT_STREAMING_HELLO, CallShape::ClientStreaming)
            .await?;
        let (send, recv) = session.split();
        Ok(ClientStreamCall {
            requests: Outgoing::new(send),
            replies: ReplyStream {
                incoming: Incoming::new(recv),
                tracker,
            },
        })
    }

    /// Bidirectional call with independent send and receive.
    #[instrument(skip_all, name = "rpc.client.bidirectional_streaming_hello", fields(call_id = %ctx.call_id()))]
    pub async fn bidirectional_streaming_hello(
        &self,
        ctx: &CallContext,
    ) -> Result<BidiStreamCall, RpcError> {
        let (session, tracker) = self
            .open_stream(ctx, BIDIRECTIONAL_STREAMING_HELLO, CallShape::Bidi)
            .await?;
        let (send, recv) = session.split();
        Ok(BidiStreamCall {
            requests: Outgoing::new(send),
            replies: ReplyStream {
                incoming: Incoming::new(recv),
                tracker,
            },
        })
    }
}

/// Terminal unary step on the client: one request out, one reply back.
struct WireCall<'a> {
    client: &'a HelloClient,
    info: &'a CallInfo,
}

#[async_trait]
impl UnaryHandler for WireCall<'_> {
    async fn call(&self, ctx: &CallContext, request: Request<Bytes>) -> Result<Bytes, RpcError> {
        let mut session = self
            .client
            .open_session(
                ctx,
                self.info.clone(),
                request.metadata(),
                &InterceptorChain::default(),
            )
            .await?;

        session.send(request.into_inner()).await?;
        let reply = match session.receive().await? {
            Some(reply) => reply,
            None => {
                return Err(session
                    .abort(RpcError::ProtocolViolation("missing reply".to_string()))
                    .await)
            }
        };
        match session.receive().await? {
            None => Ok(reply),
            Some(_) => Err(session
                .abort(RpcError::ProtocolViolation("unexpected second reply".to_string()))
                .await),
        }
    }
}

/// Reports a client stream's outcome to the interceptors exactly once.
struct CallTracker {
    chain: InterceptorChain,
    info: CallInfo,
    ctx: CallContext,
    finished: bool,
}

impl CallTracker {
    fn finish(&mut self, outcome: &Result<(), RpcError>) {
        if !self.finished {
            self.finished = true;
            self.chain.finish_stream(&self.info, &self.ctx, outcome);
        }
    }
}

impl Drop for CallTracker {
    fn drop(&mut self) {
        self.finish(&Err(RpcError::ContextCancelled));
    }
}

/// Receiving side of a streaming call.
pub struct ReplyStream {
    incoming: Incoming<HelloReply>,
    tracker: CallTracker,
}

impl ReplyStream {
    /// Next reply, or `Ok(None)` once the server has finished.
    pub async fn message(&mut self) -> Result<Option<HelloReply>, RpcError> {
        let result = self.incoming.message().await;
        match &result {
            Ok(Some(_)) => {}
            Ok(None) => self.tracker.finish(&Ok(())),
            Err(e) => self.tracker.finish(&Err(e.clone())),
        }
        result
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.incoming.state()
    }
}

/// Handle for a server-streaming call.
pub struct ServerStreamCall {
    replies: ReplyStream,
}

impl ServerStreamCall {
    pub async fn message(&mut self) -> Result<Option<HelloReply>, RpcError> {
        self.replies.message().await
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.replies.state()
    }
}

/// Handle for a client-streaming call.
pub struct ClientStreamCall {
    requests: Outgoing<HelloRequest>,
    replies: ReplyStream,
}

impl ClientStreamCall {
    pub async fn send(&mut self, request: &HelloRequest) -> Result<(), RpcError> {
        self.requests.send(request).await
    }

    pub async fn close_send(&mut self) -> Result<(), RpcError> {
        self.requests.close_send().await
    }

    /// Close the request stream and wait for the single reply.
    pub async fn close_and_receive(mut self) -> Result<HelloReply, RpcError> {
        self.requests.close_send().await?;
        let reply = self.replies.message().await?.ok_or_else(|| {
            RpcError::ProtocolViolation("stream ended without a reply".to_string())
        })?;
        match self.replies.message().await? {
            None => Ok(reply),
            Some(_) => Err(self
                .replies
                .incoming
                .abort(RpcError::ProtocolViolation("unexpected second reply".to_string()))
                .await),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.replies.state()
    }
}

/// Handle for a bidirectional call.
pub struct BidiStreamCall {
    requests: Outgoing<HelloRequest>,
    replies: ReplyStream,
}

impl BidiStreamCall {
    pub async fn send(&mut self, request: &HelloRequest) -> Result<(), RpcError> {
        self.requests.send(request).await
    }

    pub async fn close_send(&mut self) -> Result<(), RpcError> {
        self.requests.close_send().await
    }

    pub async fn message(&mut self) -> Result<Option<HelloReply>, RpcError> {
        self.replies.message().await
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.replies.state()
    }

    /// Separate the request and reply sides for use from two tasks.
    #[must_use]
    pub fn split(self) -> (Outgoing<HelloRequest>, ReplyStream) {
        (self.requests, self.replies)
    }
}
