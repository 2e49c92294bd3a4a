//! Test server harness for end-to-end scenarios.
//!
//! Spawns a relay target server and a primary server, wired together the way
//! the demo binary wires them, over in-process links.

use crate::fixtures::{test_token, CountingHello, HandlerCalls};
use rpc_harness::interceptors::{AuthInterceptor, LoggingInterceptor, StaticTokenValidator};
use rpc_harness::relay::RelayHop;
use rpc_harness::transport::{Connection, Link};
use rpc_harness::{HelloClient, HelloService, InterceptorChain, Server};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Subject assigned to callers presenting [`crate::fixtures::TEST_TOKEN`].
pub const TEST_SUBJECT: &str = "test-client";

const CAPACITY: usize = 16;

/// Builder for [`TestHarness`].
///
/// # Example
/// ```rust,ignore
/// #[tokio::test(start_paused = true)]
/// async fn test_relay() {
///     let harness = TestHarness::builder().relay_delay(Duration::from_millis(800)).spawn();
///     let reply = harness
///         .client()
///         .unary_hello(&CallContext::with_timeout(Duration::from_secs(1)), request)
///         .await;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TestHarnessBuilder {
    relay_delay: Duration,
    processing_delay: Duration,
    stream_replies: usize,
    require_auth: bool,
    server_chain: Option<InterceptorChain>,
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self {
            relay_delay: Duration::from_millis(800),
            processing_delay: Duration::from_secs(2),
            stream_replies: 10,
            require_auth: true,
            server_chain: None,
        }
    }
}

impl TestHarnessBuilder {
    pub fn relay_delay(mut self, delay: Duration) -> Self {
        self.relay_delay = delay;
        self
    }

    pub fn processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }

    pub fn stream_replies(mut self, count: usize) -> Self {
        self.stream_replies = count;
        self
    }

    pub fn require_auth(mut self, require: bool) -> Self {
        self.require_auth = require;
        self
    }

    /// Replace the primary server's chain (auth + logging by default).
    pub fn server_chain(mut self, chain: InterceptorChain) -> Self {
        self.server_chain = Some(chain);
        self
    }

    fn default_chain(&self) -> InterceptorChain {
        let auth = if self.require_auth {
            AuthInterceptor::new(StaticTokenValidator::new(test_token(), TEST_SUBJECT))
        } else {
            AuthInterceptor::disabled()
        };
        InterceptorChain::new()
            .with(auth)
            .with(LoggingInterceptor::new())
    }

    /// Start both servers. Must be called inside a Tokio runtime.
    pub fn spawn(self) -> TestHarness {
        let shutdown = CancellationToken::new();

        let target = HelloService::new()
            .with_processing_delay(self.processing_delay)
            .with_stream_replies(self.stream_replies)
            .with_channel_capacity(CAPACITY);
        let target_conn = start(target, self.default_chain(), &shutdown);
        let relay_client = HelloClient::new(target_conn).with_credentials(test_token());

        let primary = HelloService::new()
            .with_relay(RelayHop::new(relay_client, self.relay_delay))
            .with_processing_delay(self.processing_delay)
            .with_stream_replies(self.stream_replies)
            .with_channel_capacity(CAPACITY);
        let (primary, calls) = CountingHello::new(primary);
        let chain = self
            .server_chain
            .clone()
            .unwrap_or_else(|| self.default_chain());
        let conn = start(primary, chain, &shutdown);

        TestHarness {
            conn,
            calls,
            shutdown,
        }
    }
}

fn start(
    service: impl rpc_harness::Hello,
    chain: InterceptorChain,
    shutdown: &CancellationToken,
) -> Connection {
    let (client_end, server_end) = Link::memory_pair(CAPACITY);
    Server::new(service)
        .with_interceptors(chain)
        .with_capacity(CAPACITY)
        .spawn(server_end, shutdown.clone());
    Connection::client(client_end, CAPACITY)
}

/// A running primary server with a relay target behind it.
///
/// Both servers stop when the harness is dropped.
pub struct TestHarness {
    conn: Connection,
    calls: Arc<HandlerCalls>,
    shutdown: CancellationToken,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::default()
    }

    /// Client presenting the test token.
    pub fn client(&self) -> HelloClient {
        HelloClient::new(self.conn.clone()).with_credentials(test_token())
    }

    /// Client sending no credentials.
    pub fn anonymous_client(&self) -> HelloClient {
        HelloClient::new(self.conn.clone())
    }

    /// Client-side connection to the primary server.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Handler invocations on the primary server.
    pub fn handler_calls(&self) -> &HandlerCalls {
        &self.calls
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
