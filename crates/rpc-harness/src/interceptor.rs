//! Interceptor chain for unary and streaming calls.
//!
//! Interceptors are composed explicitly into an [`InterceptorChain`] value
//! that is handed to a server or client; there is no global registry.
//!
//! # Ordering
//!
//! The first interceptor added is the outermost. With `[A, B]` a unary call
//! runs `A.pre → B.pre → handler → B.post → A.post`. Stream wrappers follow
//! the same rule: `A` sees every `send` before `B` does, and every received
//! message after `B` has seen it.
//!
//! # Short-circuit
//!
//! A unary interceptor that returns without calling [`Next::run`] skips the
//! remaining interceptors and the handler. A failing [`StreamInterceptor::on_open`]
//! rejects the stream before the handler starts.

use crate::context::CallContext;
use crate::errors::RpcError;
use crate::session::{CallInfo, MessageSink, MessageSource};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tonic::Request;

/// Innermost step of a unary call: the service method or the wire call.
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn call(&self, ctx: &CallContext, request: Request<Bytes>) -> Result<Bytes, RpcError>;
}

/// Wraps a unary call.
///
/// Implementations may inspect or replace the request, pass a derived
/// context to `next`, rewrite the response or error, or return early.
#[async_trait]
pub trait UnaryInterceptor: Send + Sync {
    async fn intercept(
        &self,
        info: &CallInfo,
        ctx: &CallContext,
        request: Request<Bytes>,
        next: Next<'_>,
    ) -> Result<Bytes, RpcError>;
}

/// The rest of the unary chain.
pub struct Next<'a> {
    info: &'a CallInfo,
    rest: &'a [Arc<dyn UnaryInterceptor>],
    terminal: &'a dyn UnaryHandler,
}

impl Next<'_> {
    /// Invoke the next interceptor, or the handler at the end of the chain.
    pub async fn run(self, ctx: &CallContext, request: Request<Bytes>) -> Result<Bytes, RpcError> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    info: self.info,
                    rest,
                    terminal: self.terminal,
                };
                head.intercept(self.info, ctx, request, next).await
            }
            None => self.terminal.call(ctx, request).await,
        }
    }
}

/// Wraps a streaming call.
///
/// Decorated sinks and sources must hand context-derived errors back to the
/// caller unchanged.
#[async_trait]
pub trait StreamInterceptor: Send + Sync {
    /// Admission check before the handler (server) or the open (client).
    async fn on_open(
        &self,
        _info: &CallInfo,
        _ctx: &CallContext,
        _request: &mut Request<()>,
    ) -> Result<(), RpcError> {
        Ok(())
    }

    fn wrap_sink(&self, _info: &CallInfo, inner: Box<dyn MessageSink>) -> Box<dyn MessageSink> {
        inner
    }

    fn wrap_source(
        &self,
        _info: &CallInfo,
        inner: Box<dyn MessageSource>,
    ) -> Box<dyn MessageSource> {
        inner
    }

    /// Called once with the call's outcome, innermost interceptor first.
    fn on_finish(&self, _info: &CallInfo, _ctx: &CallContext, _outcome: &Result<(), RpcError>) {}
}

/// Ordered unary and stream interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    unary: Vec<Arc<dyn UnaryInterceptor>>,
    stream: Vec<Arc<dyn StreamInterceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("unary", &self.unary.len())
            .field("stream", &self.stream.len())
            .finish()
    }
}

impl InterceptorChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_unary<I>(mut self, interceptor: I) -> Self
    where
        I: UnaryInterceptor + 'static,
    {
        self.unary.push(Arc::new(interceptor));
        self
    }

    #[must_use]
    pub fn with_stream<I>(mut self, interceptor: I) -> Self
    where
        I: StreamInterceptor + 'static,
    {
        self.stream.push(Arc::new(interceptor));
        self
    }

    /// Add one interceptor to both the unary and the stream chain.
    #[must_use]
    pub fn with<I>(mut self, interceptor: I) -> Self
    where
        I: UnaryInterceptor + StreamInterceptor + 'static,
    {
        let interceptor = Arc::new(interceptor);
        self.unary.push(Arc::clone(&interceptor) as Arc<dyn UnaryInterceptor>);
        self.stream.push(interceptor);
        self
    }

    /// Run a unary call through every unary interceptor to `terminal`.
    pub async fn invoke_unary(
        &self,
        info: &CallInfo,
        ctx: &CallContext,
        request: Request<Bytes>,
        terminal: &dyn UnaryHandler,
    ) -> Result<Bytes, RpcError> {
        Next {
            info,
            rest: &self.unary,
            terminal,
        }
        .run(ctx, request)
        .await
    }

    /// Run every `on_open` hook in order; the first rejection wins.
    pub async fn admit_stream(
        &self,
        info: &CallInfo,
        ctx: &CallContext,
        request: &mut Request<()>,
    ) -> Result<(), RpcError> {
        for interceptor in &self.stream {
            interceptor.on_open(info, ctx, request).await?;
        }
        Ok(())
    }

    /// Decorate raw session halves; the first interceptor ends up outermost.
    pub(crate) fn wrap_stream(
        &self,
        info: &CallInfo,
        sink: Box<dyn MessageSink>,
        source: Box<dyn MessageSource>,
    ) -> (Box<dyn MessageSink>, Box<dyn MessageSource>) {
        self.stream
            .iter()
            .rev()
            .fold((sink, source), |(sink, source), interceptor| {
                (
                    interceptor.wrap_sink(info, sink),
                    interceptor.wrap_source(info, source),
                )
            })
    }

    pub fn finish_stream(&self, info: &CallInfo, ctx: &CallContext, outcome: &Result<(), RpcError>) {
        for interceptor in self.stream.iter().rev() {
            interceptor.on_finish(info, ctx, outcome);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::session::{CallShape, Role};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        log: Log,
    }

    #[async_trait]
    impl UnaryInterceptor for Recording {
        async fn intercept(
            &self,
            _info: &CallInfo,
            ctx: &CallContext,
            request: Request<Bytes>,
            next: Next<'_>,
        ) -> Result<Bytes, RpcError> {
            self.log.lock().unwrap().push(format!("{}.pre", self.name));
            let result = next.run(ctx, request).await;
            self.log.lock().unwrap().push(format!("{}.post", self.name));
            result
        }
    }

    struct Reject;

    #[async_trait]
    impl UnaryInterceptor for Reject {
        async fn intercept(
            &self,
            _info: &CallInfo,
            _ctx: &CallContext,
            _request: Request<Bytes>,
            _next: Next<'_>,
        ) -> Result<Bytes, RpcError> {
            Err(RpcError::Unauthenticated("rejected".to_string()))
        }
    }

    struct Upper;

    #[async_trait]
    impl UnaryInterceptor for Upper {
        async fn intercept(
            &self,
            _info: &CallInfo,
            ctx: &CallContext,
            request: Request<Bytes>,
            next: Next<'_>,
        ) -> Result<Bytes, RpcError> {
            let reply = next.run(ctx, request).await?;
            Ok(Bytes::from(reply.to_ascii_uppercase()))
        }
    }

    struct Echo {
        log: Log,
    }

    #[async_trait]
    impl UnaryHandler for Echo {
        async fn call(&self, _ctx: &CallContext, request: Request<Bytes>) -> Result<Bytes, RpcError> {
            self.log.lock().unwrap().push("terminal".to_string());
            Ok(request.into_inner())
        }
    }

    fn info() -> CallInfo {
        CallInfo::new("/test.Chain/Call", CallShape::Unary, Role::Server)
    }

    #[tokio::test]
    async fn test_first_interceptor_is_outermost() {
        let log = Log::default();
        let chain = InterceptorChain::new()
            .with_unary(Recording {
                name: "A",
                log: Arc::clone(&log),
            })
            .with_unary(Recording {
                name: "B",
                log: Arc::clone(&log),
            });

        let reply = chain
            .invoke_unary(
                &info(),
                &CallContext::background(),
                Request::new(Bytes::from_static(b"hi")),
                &Echo {
                    log: Arc::clone(&log),
                },
            )
            .await
            .unwrap();

        assert_eq!(reply, Bytes::from_static(b"hi"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["A.pre", "B.pre", "terminal", "B.post", "A.post"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_interceptors_and_handler() {
        let log = Log::default();
        let chain = InterceptorChain::new()
            .with_unary(Recording {
                name: "A",
                log: Arc::clone(&log),
            })
            .with_unary(Reject)
            .with_unary(Recording {
                name: "C",
                log: Arc::clone(&log),
            });

        let err = chain
            .invoke_unary(
                &info(),
                &CallContext::background(),
                Request::new(Bytes::new()),
                &Echo {
                    log: Arc::clone(&log),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Unauthenticated(_)));
        assert_eq!(*log.lock().unwrap(), vec!["A.pre", "A.post"]);
    }

    #[tokio::test]
    async fn test_interceptor_can_rewrite_response() {
        let log = Log::default();
        let chain = InterceptorChain::new().with_unary(Upper);

        let reply = chain
            .invoke_unary(
                &info(),
                &CallContext::background(),
                Request::new(Bytes::from_static(b"quiet")),
                &Echo { log },
            )
            .await
            .unwrap();

        assert_eq!(reply, Bytes::from_static(b"QUIET"));
    }

    #[tokio::test]
    async fn test_empty_chain_calls_handler_directly() {
        let log = Log::default();
        let chain = InterceptorChain::new();

        chain
            .invoke_unary(
                &info(),
                &CallContext::background(),
                Request::new(Bytes::new()),
                &Echo {
                    log: Arc::clone(&log),
                },
            )
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["terminal"]);
    }

    struct Gate {
        name: &'static str,
        allow: bool,
        log: Log,
    }

    #[async_trait]
    impl StreamInterceptor for Gate {
        async fn on_open(
            &self,
            _info: &CallInfo,
            _ctx: &CallContext,
            _request: &mut Request<()>,
        ) -> Result<(), RpcError> {
            self.log.lock().unwrap().push(format!("{}.open", self.name));
            if self.allow {
                Ok(())
            } else {
                Err(RpcError::Unauthenticated("closed".to_string()))
            }
        }

        fn on_finish(&self, _info: &CallInfo, _ctx: &CallContext, _outcome: &Result<(), RpcError>) {
            self.log.lock().unwrap().push(format!("{}.finish", self.name));
        }
    }

    #[tokio::test]
    async fn test_stream_admission_stops_at_first_rejection() {
        let log = Log::default();
        let chain = InterceptorChain::new()
            .with_stream(Gate {
                name: "A",
                allow: false,
                log: Arc::clone(&log),
            })
            .with_stream(Gate {
                name: "B",
                allow: true,
                log: Arc::clone(&log),
            });

        let err = chain
            .admit_stream(&info(), &CallContext::background(), &mut Request::new(()))
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Unauthenticated(_)));
        assert_eq!(*log.lock().unwrap(), vec!["A.open"]);
    }

    #[test]
    fn test_finish_hooks_run_innermost_first() {
        let log = Log::default();
        let chain = InterceptorChain::new()
            .with_stream(Gate {
                name: "A",
                allow: true,
                log: Arc::clone(&log),
            })
            .with_stream(Gate {
                name: "B",
                allow: true,
                log: Arc::clone(&log),
            });

        chain.finish_stream(&info(), &CallContext::background(), &Ok(()));

        assert_eq!(*log.lock().unwrap(), vec!["B.finish", "A.finish"]);
    }

    #[test]
    fn test_chain_debug_shows_counts() {
        let chain = InterceptorChain::new().with_unary(Upper);
        let debug_str = format!("{chain:?}");
        assert!(debug_str.contains("unary: 1"));
        assert!(debug_str.contains("stream: 0"));
    }
}
