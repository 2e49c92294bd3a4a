//! RPC Session Harness demo
//!
//! Runs a primary Hello server and a relay target server over in-process
//! links and walks through the call shapes and the cancellation, deadline,
//! relay and authentication scenarios.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Start the relay target server
//! 4. Start the primary server with a relay hop to the target
//! 5. Run the scenarios against the primary server
//! 6. Log the metrics snapshot and shut down

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // scenario walk-through, naturally longer

use anyhow::{ensure, Context as _};
use rpc_harness::config::Config;
use rpc_harness::interceptors::{AuthInterceptor, LoggingInterceptor, StaticTokenValidator};
use rpc_harness::observability::metrics::init_metrics_recorder;
use rpc_harness::proto::HelloRequest;
use rpc_harness::relay::{RelayHop, FORWARD_TAG};
use rpc_harness::service::DELAY_REQUEST;
use rpc_harness::transport::{Connection, Link};
use rpc_harness::{CallContext, HelloClient, HelloService, InterceptorChain, RpcError, Server};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Subject reported for callers presenting the configured token.
const DEMO_SUBJECT: &str = "demo-client";

fn server_chain(config: &Config) -> InterceptorChain {
    let auth = if config.require_auth {
        AuthInterceptor::new(StaticTokenValidator::new(
            config.auth_token.clone(),
            DEMO_SUBJECT,
        ))
    } else {
        AuthInterceptor::disabled()
    };
    InterceptorChain::new()
        .with(auth)
        .with(LoggingInterceptor::new())
}

fn start_server(
    service: HelloService,
    config: &Config,
    shutdown: &CancellationToken,
) -> Connection {
    let (client_end, server_end) = Link::memory_pair(config.channel_capacity);
    Server::new(service)
        .with_interceptors(server_chain(config))
        .with_capacity(config.channel_capacity)
        .spawn(server_end, shutdown.clone());
    Connection::client(client_end, config.channel_capacity)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rpc_harness=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting RPC Session Harness");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    info!(config = ?config, "Configuration loaded successfully");

    let prometheus_handle = init_metrics_recorder().map_err(anyhow::Error::msg)?;
    info!("Prometheus metrics recorder initialized");

    let shutdown = CancellationToken::new();

    let target_service = HelloService::new()
        .with_processing_delay(config.processing_delay)
        .with_stream_replies(config.server_stream_replies)
        .with_channel_capacity(config.channel_capacity);
    let target_conn = start_server(target_service, &config, &shutdown);
    let relay_client =
        HelloClient::new(target_conn).with_credentials(config.auth_token.clone());
    info!("Relay target server started");

    let primary_service = HelloService::new()
        .with_relay(RelayHop::new(relay_client, config.relay_delay))
        .with_processing_delay(config.processing_delay)
        .with_stream_replies(config.server_stream_replies)
        .with_channel_capacity(config.channel_capacity);
    let primary_conn = start_server(primary_service, &config, &shutdown);
    let client =
        HelloClient::new(primary_conn.clone()).with_credentials(config.auth_token.clone());
    info!("Primary server started");

    let result = run_scenarios(&client, &primary_conn, &config).await;

    info!(metrics = %prometheus_handle.render(), "Metrics snapshot");
    shutdown.cancel();

    match &result {
        Ok(()) => info!("All scenarios passed"),
        Err(e) => error!(error = %e, "Scenario failed"),
    }
    result
}

async fn run_scenarios(
    client: &HelloClient,
    conn: &Connection,
    config: &Config,
) -> anyhow::Result<()> {
    let timeout = config.call_timeout;

    // Unary
    let reply = client
        .unary_hello(&CallContext::with_timeout(timeout), HelloRequest::new("world"))
        .await
        .context("unary call")?;
    info!(reply = %reply.message, "Unary call completed");

    // Scenario 1: bidi echo, then cancel
    let ctx = CallContext::with_timeout(timeout);
    let mut call = client
        .bidirectional_streaming_hello(&ctx)
        .await
        .context("open bidi call")?;
    for name in ["hello", "world"] {
        call.send(&HelloRequest::new(name)).await?;
        let reply = call.message().await?.context("bidi echo missing")?;
        ensure!(reply.message == name, "unexpected echo {:?}", reply.message);
        info!(reply = %reply.message, "Bidi echo received");
    }
    ctx.cancel();
    let third = call.send(&HelloRequest::new("third")).await;
    let after = call.message().await;
    ensure!(third.is_err(), "send after cancel succeeded");
    ensure!(
        after == Err(RpcError::ContextCancelled),
        "receive after cancel returned {after:?}"
    );
    info!(send = ?third, receive = ?after, "Scenario 1: bidi cancelled");

    // Scenario 2: server stream of replies
    let mut stream = client
        .server_streaming_hello(&CallContext::with_timeout(timeout), HelloRequest::new("X"))
        .await
        .context("open server stream")?;
    let mut replies = Vec::new();
    while let Some(reply) = stream.message().await? {
        replies.push(reply.message);
    }
    let expected: Vec<String> = (0..config.server_stream_replies)
        .map(|i| format!("X-{i}"))
        .collect();
    ensure!(replies == expected, "unexpected server stream {replies:?}");
    info!(count = replies.len(), "Scenario 2: server stream completed");

    // Scenario 3: client stream
    let mut upload = client
        .client_streaming_hello(&CallContext::with_timeout(timeout))
        .await
        .context("open client stream")?;
    for i in 0..config.client_stream_messages {
        upload
            .send(&HelloRequest::new(format!("message-{i}")))
            .await?;
    }
    let reply = upload.close_and_receive().await?;
    info!(reply = %reply.message, "Scenario 3: client stream completed");

    // Scenario 4: relay hop, then relay under an expiring deadline
    let tagged = format!("{FORWARD_TAG}suffix");
    let reply = client
        .unary_hello(
            &CallContext::with_timeout(timeout),
            HelloRequest::new(tagged.clone()),
        )
        .await
        .context("relay call")?;
    ensure!(reply.message == "suffix", "unexpected relay reply {:?}", reply.message);
    info!(reply = %reply.message, "Scenario 4: relay call completed");

    let short = config.relay_delay / 2;
    let relayed = client
        .unary_hello(&CallContext::with_timeout(short), HelloRequest::new(tagged))
        .await;
    ensure!(
        relayed == Err(RpcError::DeadlineExceeded),
        "relay under short deadline returned {relayed:?}"
    );
    info!("Scenario 4: relay past deadline failed with DeadlineExceeded");

    // Scenario 5: processing delay vs deadline
    let short = config.processing_delay / 2;
    let delayed = client
        .unary_hello(
            &CallContext::with_timeout(short),
            HelloRequest::new(DELAY_REQUEST),
        )
        .await;
    ensure!(
        delayed == Err(RpcError::DeadlineExceeded),
        "delay under short deadline returned {delayed:?}"
    );
    info!("Scenario 5: delayed call failed with DeadlineExceeded");

    // Scenario 6: missing credentials
    if config.require_auth {
        let anonymous = HelloClient::new(conn.clone());
        let rejected = anonymous
            .unary_hello(
                &CallContext::with_timeout(Duration::from_secs(1).min(timeout)),
                HelloRequest::new("intruder"),
            )
            .await;
        ensure!(
            matches!(rejected, Err(RpcError::Unauthenticated(_))),
            "anonymous call returned {rejected:?}"
        );
        info!("Scenario 6: anonymous call rejected");
    } else {
        info!("Scenario 6 skipped: authentication disabled");
    }

    Ok(())
}
