//! Call logging and metrics interceptor.
//!
//! Unary calls get one line at start and one at completion with RFC 3339
//! timestamps and the elapsed time. Streams additionally log every message
//! through sink and source decorators. Every finished call is recorded in
//! `rpc_calls_total` and `rpc_call_duration_seconds`.

use crate::context::CallContext;
use crate::errors::RpcError;
use crate::interceptor::{Next, StreamInterceptor, UnaryInterceptor};
use crate::observability::metrics;
use crate::session::{CallInfo, MessageSink, MessageSource};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tonic::{Code, Request};
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Metric label for a call outcome.
fn outcome_label<T>(result: &Result<T, RpcError>) -> &'static str {
    let code = match result {
        Ok(_) => return "ok",
        Err(e) => e.code(),
    };
    match code {
        Code::Ok => "ok",
        Code::Cancelled => "cancelled",
        Code::Unknown => "unknown",
        Code::InvalidArgument => "invalid_argument",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::NotFound => "not_found",
        Code::AlreadyExists => "already_exists",
        Code::PermissionDenied => "permission_denied",
        Code::ResourceExhausted => "resource_exhausted",
        Code::FailedPrecondition => "failed_precondition",
        Code::Aborted => "aborted",
        Code::OutOfRange => "out_of_range",
        Code::Unimplemented => "unimplemented",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::DataLoss => "data_loss",
        Code::Unauthenticated => "unauthenticated",
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Logs and measures every call it wraps.
#[derive(Debug, Default)]
pub struct LoggingInterceptor {
    /// Start instants of open streams, keyed by call id.
    streams: Mutex<HashMap<Uuid, Instant>>,
}

impl LoggingInterceptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnaryInterceptor for LoggingInterceptor {
    async fn intercept(
        &self,
        info: &CallInfo,
        ctx: &CallContext,
        request: Request<Bytes>,
        next: Next<'_>,
    ) -> Result<Bytes, RpcError> {
        let started = Instant::now();
        info!(
            target: "rpc.interceptor",
            call_id = %ctx.call_id(),
            method = %info.method,
            role = info.role.as_str(),
            start = %timestamp(),
            "Unary call started"
        );

        let result = next.run(ctx, request).await;

        let elapsed = started.elapsed();
        let outcome = outcome_label(&result);
        info!(
            target: "rpc.interceptor",
            call_id = %ctx.call_id(),
            method = %info.method,
            role = info.role.as_str(),
            end = %timestamp(),
            elapsed_ms = elapsed.as_millis(),
            outcome,
            "Unary call finished"
        );
        metrics::record_call(&info.method, info.shape.as_str(), outcome, elapsed);
        result
    }
}

#[async_trait]
impl StreamInterceptor for LoggingInterceptor {
    async fn on_open(
        &self,
        info: &CallInfo,
        ctx: &CallContext,
        _request: &mut Request<()>,
    ) -> Result<(), RpcError> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ctx.call_id(), Instant::now());
        info!(
            target: "rpc.interceptor",
            call_id = %ctx.call_id(),
            method = %info.method,
            shape = info.shape.as_str(),
            role = info.role.as_str(),
            start = %timestamp(),
            "Stream opened"
        );
        Ok(())
    }

    fn wrap_sink(&self, info: &CallInfo, inner: Box<dyn MessageSink>) -> Box<dyn MessageSink> {
        Box::new(LoggedSink {
            inner,
            info: info.clone(),
            sent: 0,
        })
    }

    fn wrap_source(&self, info: &CallInfo, inner: Box<dyn MessageSource>) -> Box<dyn MessageSource> {
        Box::new(LoggedSource {
            inner,
            info: info.clone(),
            received: 0,
        })
    }

    fn on_finish(&self, info: &CallInfo, ctx: &CallContext, outcome: &Result<(), RpcError>) {
        let started = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ctx.call_id());
        let elapsed = started.map(|s| s.elapsed()).unwrap_or_default();
        let label = outcome_label(outcome);
        info!(
            target: "rpc.interceptor",
            call_id = %ctx.call_id(),
            method = %info.method,
            role = info.role.as_str(),
            end = %timestamp(),
            elapsed_ms = elapsed.as_millis(),
            outcome = label,
            "Stream finished"
        );
        metrics::record_call(&info.method, info.shape.as_str(), label, elapsed);
    }
}

struct LoggedSink {
    inner: Box<dyn MessageSink>,
    info: CallInfo,
    sent: usize,
}

#[async_trait]
impl MessageSink for LoggedSink {
    async fn send(&mut self, payload: Bytes) -> Result<(), RpcError> {
        let len = payload.len();
        match self.inner.send(payload).await {
            Ok(()) => {
                self.sent += 1;
                trace!(
                    target: "rpc.interceptor",
                    method = %self.info.method,
                    seq = self.sent,
                    bytes = len,
                    "Stream message sent"
                );
                metrics::record_stream_message(&self.info.method, "sent");
                Ok(())
            }
            Err(e) => {
                debug!(
                    target: "rpc.interceptor",
                    method = %self.info.method,
                    error = %e,
                    "Stream send failed"
                );
                Err(e)
            }
        }
    }

    async fn close_send(&mut self) -> Result<(), RpcError> {
        let result = self.inner.close_send().await;
        debug!(
            target: "rpc.interceptor",
            method = %self.info.method,
            sent = self.sent,
            ok = result.is_ok(),
            "Stream send half closed"
        );
        result
    }
}

struct LoggedSource {
    inner: Box<dyn MessageSource>,
    info: CallInfo,
    received: usize,
}

#[async_trait]
impl MessageSource for LoggedSource {
    async fn receive(&mut self) -> Result<Option<Bytes>, RpcError> {
        let result = self.inner.receive().await;
        match &result {
            Ok(Some(payload)) => {
                self.received += 1;
                trace!(
                    target: "rpc.interceptor",
                    method = %self.info.method,
                    seq = self.received,
                    bytes = payload.len(),
                    "Stream message received"
                );
                metrics::record_stream_message(&self.info.method, "received");
            }
            Ok(None) => {
                debug!(
                    target: "rpc.interceptor",
                    method = %self.info.method,
                    received = self.received,
                    "Stream end of stream"
                );
            }
            Err(e) => {
                debug!(
                    target: "rpc.interceptor",
                    method = %self.info.method,
                    error = %e,
                    "Stream receive failed"
                );
            }
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::interceptor::{InterceptorChain, UnaryHandler};
    use crate::session::{CallShape, Role};

    struct Fails;

    #[async_trait]
    impl UnaryHandler for Fails {
        async fn call(&self, _ctx: &CallContext, _request: Request<Bytes>) -> Result<Bytes, RpcError> {
            Err(RpcError::DeadlineExceeded)
        }
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&Ok::<(), RpcError>(())), "ok");
        assert_eq!(
            outcome_label(&Err::<(), _>(RpcError::DeadlineExceeded)),
            "deadline_exceeded"
        );
        assert_eq!(
            outcome_label(&Err::<(), _>(RpcError::Unauthenticated("x".to_string()))),
            "unauthenticated"
        );
    }

    #[tokio::test]
    async fn test_unary_errors_pass_through_unchanged() {
        let chain = InterceptorChain::new().with(LoggingInterceptor::new());
        let info = CallInfo::new("/test.Log/Call", CallShape::Unary, Role::Server);

        let err = chain
            .invoke_unary(
                &info,
                &CallContext::background(),
                Request::new(Bytes::new()),
                &Fails,
            )
            .await
            .unwrap_err();

        assert_eq!(err, RpcError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_stream_start_is_forgotten_on_finish() {
        let interceptor = LoggingInterceptor::new();
        let info = CallInfo::new("/test.Log/Stream", CallShape::Bidi, Role::Server);
        let ctx = CallContext::background();

        interceptor
            .on_open(&info, &ctx, &mut Request::new(()))
            .await
            .unwrap();
        assert_eq!(interceptor.streams.lock().unwrap().len(), 1);

        interceptor.on_finish(&info, &ctx, &Ok(()));
        assert!(interceptor.streams.lock().unwrap().is_empty());
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let ts = timestamp();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
