//! Hello server: accept loop and per-session dispatch.
//!
//! Every accepted session gets its own task. The task builds the call's
//! context from the caller's timeout, resolves the method, runs the
//! interceptor chain and the handler, and reports the outcome to the peer as
//! end-of-stream (success) or a reset carrying the error's status.
//!
//! The call's context is cancelled when its dispatch task finishes, so
//! anything a handler left running on its behalf stops too.

use crate::context::CallContext;
use crate::errors::RpcError;
use crate::interceptor::{InterceptorChain, UnaryHandler};
use crate::proto::{Frame, HelloReply, HelloRequest};
use crate::service::{method_shape, Hello};
use crate::session::{CallInfo, CallShape, Incoming, Outgoing, Role, StreamingSession};
use crate::transport::{Connection, IncomingSession, Link};
use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::{Request, Status};
use tracing::{debug, info, instrument, warn};

/// Serves a [`Hello`] implementation behind an interceptor chain.
#[derive(Clone)]
pub struct Server {
    service: Arc<dyn Hello>,
    chain: InterceptorChain,
    capacity: usize,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("chain", &self.chain)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(service: impl Hello) -> Self {
        Self {
            service: Arc::new(service),
            chain: InterceptorChain::default(),
            capacity: 64,
        }
    }

    #[must_use]
    pub fn with_interceptors(mut self, chain: InterceptorChain) -> Self {
        self.chain = chain;
        self
    }

    /// Per-session queue bound.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Serve one connection in the background.
    pub fn spawn(self, link: Link, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.serve_connection(link, shutdown).await })
    }

    /// Accept sessions on `link` until the peer goes away or `shutdown`
    /// fires. Open sessions are failed with a transport error on exit.
    pub async fn serve_connection(&self, link: Link, shutdown: CancellationToken) {
        let (conn, mut incoming) = Connection::server(link, self.capacity);
        info!(target: "rpc.server", "Serving connection");

        loop {
            let session = tokio::select! {
                () = shutdown.cancelled() => {
                    info!(target: "rpc.server", "Shutdown requested");
                    break;
                }
                session = incoming.recv() => match session {
                    Some(session) => session,
                    None => {
                        debug!(target: "rpc.server", "Connection closed");
                        break;
                    }
                },
            };
            let server = self.clone();
            let conn = conn.clone();
            tokio::spawn(async move { server.dispatch(conn, session).await });
        }

        conn.close();
    }

    #[instrument(
        skip_all,
        name = "rpc.server.dispatch",
        fields(method = %session.open.method, session_id = session.channel.session_id)
    )]
    async fn dispatch(&self, conn: Connection, session: IncomingSession) {
        let IncomingSession { open, channel } = session;

        let ctx = match open.timeout() {
            Some(timeout) => CallContext::with_timeout(timeout),
            None => CallContext::background(),
        };
        // Dropped after the session below, so a finished call is not reset.
        let _guard = ctx.cancel_on_drop();

        let Some(shape) = method_shape(&open.method) else {
            warn!(target: "rpc.server", method = %open.method, "Unknown method");
            let err = RpcError::unimplemented(format!("unknown method {}", open.method));
            let _ = conn
                .send_frame(Frame::reset(channel.session_id, &Status::from(err)))
                .await;
            conn.release(channel.session_id);
            return;
        };

        let info = CallInfo::new(open.method.clone(), shape, Role::Server);
        let metadata = open.metadata_map();
        debug!(
            target: "rpc.server",
            call_id = %ctx.call_id(),
            shape = shape.as_str(),
            timeout_ms = open.timeout_millis,
            "Call accepted"
        );

        match shape {
            CallShape::Unary => {
                let session = StreamingSession::establish(
                    conn,
                    channel,
                    info.clone(),
                    ctx.clone(),
                    &InterceptorChain::default(),
                );
                self.serve_unary(session, &info, &ctx, metadata).await;
            }
            _ => {
                let session = StreamingSession::establish(
                    conn,
                    channel,
                    info.clone(),
                    ctx.clone(),
                    &self.chain,
                );
                self.serve_stream(session, &info, &ctx, metadata).await;
            }
        }
    }

    async fn serve_unary(
        &self,
        mut session: StreamingSession,
        info: &CallInfo,
        ctx: &CallContext,
        metadata: MetadataMap,
    ) {
        let payload = match session.receive().await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                let err = RpcError::ProtocolViolation("missing request".to_string());
                session.abort(err).await;
                return;
            }
            Err(e) => {
                debug!(target: "rpc.server", error = %e, "Failed to read unary request");
                return;
            }
        };

        let mut request = Request::new(payload);
        *request.metadata_mut() = metadata;

        let route = UnaryRoute {
            service: self.service.as_ref(),
        };
        let result = ctx
            .run(self.chain.invoke_unary(info, ctx, request, &route))
            .await
            .and_then(|result| result);

        match result {
            Ok(reply) => {
                if let Err(e) = session.send(reply).await {
                    debug!(target: "rpc.server", error = %e, "Failed to send unary reply");
                }
            }
            Err(e) => {
                debug!(target: "rpc.server", error = %e, "Unary call failed");
                session.abort(e).await;
            }
        }
    }

    async fn serve_stream(
        &self,
        session: StreamingSession,
        info: &CallInfo,
        ctx: &CallContext,
        metadata: MetadataMap,
    ) {
        let mut request = Request::new(());
        *request.metadata_mut() = metadata;
        if let Err(e) = self.chain.admit_stream(info, ctx, &mut request).await {
            debug!(target: "rpc.server", error = %e, "Stream rejected");
            let e = session.abort(e).await;
            self.chain.finish_stream(info, ctx, &Err(e));
            return;
        }

        let (send, recv) = session.split();
        let mut replies = Outgoing::new(send);
        let mut requests = Incoming::<HelloRequest>::new(recv);

        let result = ctx
            .run(self.run_stream_handler(info.shape, ctx, &mut requests, &mut replies))
            .await
            .and_then(|result| result);

        let outcome = match result {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(target: "rpc.server", error = %e, "Stream handler failed");
                Err(replies.abort(e).await)
            }
        };
        self.chain.finish_stream(info, ctx, &outcome);
    }

    /// Drive the handler for a streaming shape and close the reply stream.
    async fn run_stream_handler(
        &self,
        shape: CallShape,
        ctx: &CallContext,
        requests: &mut Incoming<HelloRequest>,
        replies: &mut Outgoing<HelloReply>,
    ) -> Result<(), RpcError> {
        match shape {
            CallShape::ServerStreaming => {
                let request = requests
                    .message()
                    .await?
                    .ok_or_else(|| RpcError::ProtocolViolation("missing request".to_string()))?;
                self.service
                    .server_streaming_hello(ctx, request, replies)
                    .await?;
                replies.close_send().await
            }
            CallShape::ClientStreaming => {
                let reply = self.service.client_streaming_hello(ctx, requests).await?;
                // The only reply closes the send half.
                replies.send(&reply).await
            }
            CallShape::Bidi => {
                self.service
                    .bidirectional_streaming_hello(ctx, requests, replies)
                    .await?;
                replies.close_send().await
            }
            CallShape::Unary => Err(RpcError::ProtocolViolation(
                "unary call routed as a stream".to_string(),
            )),
        }
    }
}

/// Terminal unary step on the server: decode, call the service, encode.
struct UnaryRoute<'a> {
    service: &'a dyn Hello,
}

#[async_trait]
impl UnaryHandler for UnaryRoute<'_> {
    async fn call(&self, ctx: &CallContext, request: Request<Bytes>) -> Result<Bytes, RpcError> {
        let message = HelloRequest::decode(request.get_ref().clone())?;
        let reply = self.service.unary_hello(ctx, request.map(|_| message)).await?;
        Ok(Bytes::from(reply.encode_to_vec()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::client::HelloClient;
    use crate::proto::Open;
    use crate::service::HelloService;
    use std::collections::HashMap;

    fn start(server: Server) -> (Connection, CancellationToken) {
        let (a, b) = Link::memory_pair(64);
        let shutdown = CancellationToken::new();
        server.spawn(b, shutdown.clone());
        (Connection::client(a, 64), shutdown)
    }

    #[tokio::test]
    async fn test_unary_round_trip() {
        let (conn, _shutdown) = start(Server::new(HelloService::new()));
        let client = HelloClient::new(conn);

        let reply = client
            .unary_hello(&CallContext::background(), HelloRequest::new("world"))
            .await
            .unwrap();

        assert_eq!(reply, HelloReply::new("world"));
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let (conn, _shutdown) = start(Server::new(HelloService::new()));
        let channel = conn
            .open(Open {
                method: "/helloworld.Hello/Missing".to_string(),
                timeout_millis: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();

        let err = channel.reset.fired().await;
        assert_eq!(err.code(), tonic::Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_shutdown_fails_open_sessions() {
        let (conn, shutdown) = start(Server::new(HelloService::new()));
        let client = HelloClient::new(conn);
        let mut call = client
            .bidirectional_streaming_hello(&CallContext::background())
            .await
            .unwrap();

        call.send(&HelloRequest::new("first")).await.unwrap();
        assert_eq!(
            call.message().await.unwrap(),
            Some(HelloReply::new("first"))
        );

        shutdown.cancel();

        let err = call.message().await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }
}
