//! The Hello service: trait, method table and the reference implementation.

use crate::context::CallContext;
use crate::errors::RpcError;
use crate::proto::{HelloReply, HelloRequest};
use crate::relay::{forward_target, RelayHop};
use crate::session::{CallShape, Incoming, Outgoing};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tonic::Request;
use tracing::{debug, info};

pub const UNARY_HELLO: &str = "/helloworld.Hello/UnaryHello";
pub const SERVER_STREAMING_HELLO: &str = "/helloworld.Hello/ServerStreamingHello";
pub const CLIENT_STREAMING_HELLO: &str = "/helloworld.Hello/ClientStreamingHello";
pub const BIDIRECTIONAL_STREAMING_HELLO: &str = "/helloworld.Hello/BidirectionalStreamingHello";

/// Request that triggers the artificial processing delay.
pub const DELAY_REQUEST: &str = "delay";

/// Call shape of a method path, `None` for unknown methods.
#[must_use]
pub fn method_shape(method: &str) -> Option<CallShape> {
    match method {
        UNARY_HELLO => Some(CallShape::Unary),
        SERVER_STREAMING_HELLO => Some(CallShape::ServerStreaming),
        CLIENT_STREAMING_HELLO => Some(CallShape::ClientStreaming),
        BIDIRECTIONAL_STREAMING_HELLO => Some(CallShape::Bidi),
        _ => None,
    }
}

/// Server-side handlers for the four call shapes.
///
/// Handlers receive the call's context and must stop promptly once it
/// terminates. The server closes the reply stream after a handler returns
/// `Ok`, and resets it with the error otherwise.
#[async_trait]
pub trait Hello: Send + Sync + 'static {
    async fn unary_hello(
        &self,
        ctx: &CallContext,
        request: Request<HelloRequest>,
    ) -> Result<HelloReply, RpcError>;

    async fn server_streaming_hello(
        &self,
        ctx: &CallContext,
        request: HelloRequest,
        replies: &mut Outgoing<HelloReply>,
    ) -> Result<(), RpcError>;

    async fn client_streaming_hello(
        &self,
        ctx: &CallContext,
        requests: &mut Incoming<HelloRequest>,
    ) -> Result<HelloReply, RpcError>;

    async fn bidirectional_streaming_hello(
        &self,
        ctx: &CallContext,
        requests: &mut Incoming<HelloRequest>,
        replies: &mut Outgoing<HelloReply>,
    ) -> Result<(), RpcError>;
}

/// Echo service with relay and delay behaviour.
#[derive(Debug, Clone)]
pub struct HelloService {
    relay: Option<RelayHop>,
    processing_delay: Duration,
    stream_replies: usize,
    channel_capacity: usize,
}

impl Default for HelloService {
    fn default() -> Self {
        Self {
            relay: None,
            processing_delay: Duration::from_secs(2),
            stream_replies: 10,
            channel_capacity: 16,
        }
    }
}

impl HelloService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward `[propagate me]` requests through `relay`.
    #[must_use]
    pub fn with_relay(mut self, relay: RelayHop) -> Self {
        self.relay = Some(relay);
        self
    }

    #[must_use]
    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }

    #[must_use]
    pub fn with_stream_replies(mut self, count: usize) -> Self {
        self.stream_replies = count;
        self
    }

    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Reply for one request name: relay, delay, or echo.
    async fn respond(&self, ctx: &CallContext, name: &str) -> Result<HelloReply, RpcError> {
        if let Some(payload) = forward_target(name) {
            let relay = self.relay.as_ref().ok_or_else(|| {
                RpcError::Application {
                    code: tonic::Code::FailedPrecondition,
                    message: "no relay target configured".to_string(),
                }
            })?;
            return relay.forward(ctx, payload).await;
        }

        if name == DELAY_REQUEST {
            debug!(
                target: "rpc.server",
                delay_ms = self.processing_delay.as_millis(),
                "Processing delay"
            );
            ctx.run(tokio::time::sleep(self.processing_delay)).await?;
        }

        Ok(HelloReply::new(name))
    }
}

#[async_trait]
impl Hello for HelloService {
    async fn unary_hello(
        &self,
        ctx: &CallContext,
        request: Request<HelloRequest>,
    ) -> Result<HelloReply, RpcError> {
        let name = request.into_inner().name;
        info!(target: "rpc.server", call_id = %ctx.call_id(), name = %name, "Received unary hello");
        self.respond(ctx, &name).await
    }

    async fn server_streaming_hello(
        &self,
        ctx: &CallContext,
        request: HelloRequest,
        replies: &mut Outgoing<HelloReply>,
    ) -> Result<(), RpcError> {
        info!(target: "rpc.server", call_id = %ctx.call_id(), name = %request.name, "Received server-streaming hello");
        for i in 0..self.stream_replies {
            ctx.check()?;
            replies
                .send(&HelloReply::new(format!("{}-{i}", request.name)))
                .await?;
        }
        Ok(())
    }

    async fn client_streaming_hello(
        &self,
        ctx: &CallContext,
        requests: &mut Incoming<HelloRequest>,
    ) -> Result<HelloReply, RpcError> {
        let mut received = 0usize;
        while let Some(request) = requests.message().await? {
            received += 1;
            debug!(target: "rpc.server", call_id = %ctx.call_id(), name = %request.name, "Received client-streaming message");
        }
        info!(target: "rpc.server", call_id = %ctx.call_id(), received, "Client finished streaming");
        Ok(HelloReply::new("ok"))
    }

    async fn bidirectional_streaming_hello(
        &self,
        ctx: &CallContext,
        requests: &mut Incoming<HelloRequest>,
        replies: &mut Outgoing<HelloReply>,
    ) -> Result<(), RpcError> {
        let (tx, mut rx) = mpsc::channel::<HelloReply>(self.channel_capacity);

        let reader = async {
            let tx = tx;
            while let Some(request) = requests.message().await? {
                debug!(target: "rpc.server", call_id = %ctx.call_id(), name = %request.name, "Received bidi message");
                let reply = self.respond(ctx, &request.name).await?;
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
            Ok::<(), RpcError>(())
        };

        let writer = async {
            while let Some(reply) = rx.recv().await {
                replies.send(&reply).await?;
            }
            Ok::<(), RpcError>(())
        };

        tokio::try_join!(reader, writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_table() {
        assert_eq!(method_shape(UNARY_HELLO), Some(CallShape::Unary));
        assert_eq!(
            method_shape(SERVER_STREAMING_HELLO),
            Some(CallShape::ServerStreaming)
        );
        assert_eq!(
            method_shape(CLIENT_STREAMING_HELLO),
            Some(CallShape::ClientStreaming)
        );
        assert_eq!(
            method_shape(BIDIRECTIONAL_STREAMING_HELLO),
            Some(CallShape::Bidi)
        );
        assert_eq!(method_shape("/helloworld.Hello/Missing"), None);
    }

    #[tokio::test]
    async fn test_unary_echoes_name() {
        let service = HelloService::new();
        let reply = service
            .unary_hello(
                &CallContext::background(),
                Request::new(HelloRequest::new("world")),
            )
            .await
            .ok();
        assert_eq!(reply, Some(HelloReply::new("world")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_request_respects_deadline() {
        let service = HelloService::new();
        let ctx = CallContext::with_timeout(Duration::from_millis(500));

        let result = service
            .unary_hello(&ctx, Request::new(HelloRequest::new(DELAY_REQUEST)))
            .await;

        assert_eq!(result.err(), Some(RpcError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_request_completes_within_deadline() {
        let service = HelloService::new();
        let ctx = CallContext::with_timeout(Duration::from_secs(3));

        let result = service
            .unary_hello(&ctx, Request::new(HelloRequest::new(DELAY_REQUEST)))
            .await;

        assert_eq!(result.ok(), Some(HelloReply::new(DELAY_REQUEST)));
    }

    #[tokio::test]
    async fn test_tagged_request_without_relay_fails() {
        let service = HelloService::new();
        let result = service
            .unary_hello(
                &CallContext::background(),
                Request::new(HelloRequest::new("[propagate me]x")),
            )
            .await;

        assert_eq!(
            result.err().map(|e| e.code()),
            Some(tonic::Code::FailedPrecondition)
        );
    }
}
