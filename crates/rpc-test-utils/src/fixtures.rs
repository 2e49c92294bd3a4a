//! Test fixtures: credentials, a recording interceptor and a counting
//! service wrapper.

use async_trait::async_trait;
use bytes::Bytes;
use rpc_harness::context::CallContext;
use rpc_harness::errors::RpcError;
use rpc_harness::interceptor::{Next, StreamInterceptor, UnaryInterceptor};
use rpc_harness::proto::{HelloReply, HelloRequest};
use rpc_harness::service::Hello;
use rpc_harness::session::{CallInfo, Incoming, Outgoing};
use secrecy::SecretString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tonic::Request;

/// Bearer token accepted by harness servers.
pub const TEST_TOKEN: &str = "test-token-0123456789abcdef";

/// [`TEST_TOKEN`] as a secret.
pub fn test_token() -> SecretString {
    SecretString::from(TEST_TOKEN)
}

/// Shared, ordered event log.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Interceptor that logs `<name>.pre` and `<name>.post` around unary calls
/// and `<name>.open` / `<name>.finish` around streams.
#[derive(Debug, Clone)]
pub struct RecordingInterceptor {
    name: String,
    log: EventLog,
}

impl RecordingInterceptor {
    pub fn new(name: impl Into<String>, log: &EventLog) -> Self {
        Self {
            name: name.into(),
            log: log.clone(),
        }
    }
}

#[async_trait]
impl UnaryInterceptor for RecordingInterceptor {
    async fn intercept(
        &self,
        _info: &CallInfo,
        ctx: &CallContext,
        request: Request<Bytes>,
        next: Next<'_>,
    ) -> Result<Bytes, RpcError> {
        self.log.push(format!("{}.pre", self.name));
        let result = next.run(ctx, request).await;
        self.log.push(format!("{}.post", self.name));
        result
    }
}

#[async_trait]
impl StreamInterceptor for RecordingInterceptor {
    async fn on_open(
        &self,
        _info: &CallInfo,
        _ctx: &CallContext,
        _request: &mut Request<()>,
    ) -> Result<(), RpcError> {
        self.log.push(format!("{}.open", self.name));
        Ok(())
    }

    fn on_finish(&self, _info: &CallInfo, _ctx: &CallContext, _outcome: &Result<(), RpcError>) {
        self.log.push(format!("{}.finish", self.name));
    }
}

/// Per-method handler invocation counts.
#[derive(Debug, Default)]
pub struct HandlerCalls {
    pub unary: AtomicUsize,
    pub server_streaming: AtomicUsize,
    pub client_streaming: AtomicUsize,
    pub bidi: AtomicUsize,
    /// Handlers entered and not yet returned.
    pub in_flight: AtomicUsize,
}

impl HandlerCalls {
    pub fn total(&self) -> usize {
        self.unary.load(Ordering::SeqCst)
            + self.server_streaming.load(Ordering::SeqCst)
            + self.client_streaming.load(Ordering::SeqCst)
            + self.bidi.load(Ordering::SeqCst)
    }

    fn enter(&self, method: &AtomicUsize) -> InFlight<'_> {
        method.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wraps a [`Hello`] implementation and counts handler invocations.
pub struct CountingHello<H> {
    inner: H,
    calls: Arc<HandlerCalls>,
}

impl<H: Hello> CountingHello<H> {
    pub fn new(inner: H) -> (Self, Arc<HandlerCalls>) {
        let calls = Arc::new(HandlerCalls::default());
        (
            Self {
                inner,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl<H: Hello> Hello for CountingHello<H> {
    async fn unary_hello(
        &self,
        ctx: &CallContext,
        request: Request<HelloRequest>,
    ) -> Result<HelloReply, RpcError> {
        let _in_flight = self.calls.enter(&self.calls.unary);
        self.inner.unary_hello(ctx, request).await
    }

    async fn server_streaming_hello(
        &self,
        ctx: &CallContext,
        request: HelloRequest,
        replies: &mut Outgoing<HelloReply>,
    ) -> Result<(), RpcError> {
        let _in_flight = self.calls.enter(&self.calls.server_streaming);
        self.inner.server_streaming_hello(ctx, request, replies).await
    }

    async fn client_streaming_hello(
        &self,
        ctx: &CallContext,
        requests: &mut Incoming<HelloRequest>,
    ) -> Result<HelloReply, RpcError> {
        let _in_flight = self.calls.enter(&self.calls.client_streaming);
        self.inner.client_streaming_hello(ctx, requests).await
    }

    async fn bidirectional_streaming_hello(
        &self,
        ctx: &CallContext,
        requests: &mut Incoming<HelloRequest>,
        replies: &mut Outgoing<HelloReply>,
    ) -> Result<(), RpcError> {
        let _in_flight = self.calls.enter(&self.calls.bidi);
        self.inner
            .bidirectional_streaming_hello(ctx, requests, replies)
            .await
    }
}
