//! Per-call context carrying a deadline and a cancellation signal.
//!
//! A [`CallContext`] is created when a call starts and is handed by
//! reference (cloning shares the same context) to everything that runs on
//! behalf of that call, including a relay hop to a downstream service.
//!
//! # Termination
//!
//! A context terminates when it is cancelled explicitly, when an ancestor is
//! cancelled, or when its effective deadline passes. Termination is
//! permanent. The reported reason is whichever happened first.
//!
//! # Derivation
//!
//! [`CallContext::derive`] builds a child whose deadline is the earlier of
//! the parent's and the requested timeout. The child's cancellation token is
//! a child of the parent's token, so parent termination reaches the child but
//! cancelling the child leaves the parent untouched.

use crate::errors::RpcError;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a context terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// `cancel()` was called on this context or an ancestor.
    Cancelled,
    /// The effective deadline passed.
    DeadlineExceeded,
}

impl From<DoneReason> for RpcError {
    fn from(reason: DoneReason) -> Self {
        match reason {
            DoneReason::Cancelled => RpcError::ContextCancelled,
            DoneReason::DeadlineExceeded => RpcError::DeadlineExceeded,
        }
    }
}

/// Deadline and cancellation carrier for one call.
#[derive(Clone, Debug)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    call_id: Uuid,
    token: CancellationToken,
    /// Effective deadline, already folded with the parent's.
    deadline: Option<Instant>,
    /// Set once by `cancel()`.
    cancelled_at: OnceLock<Instant>,
    parent: Option<CallContext>,
}

impl CallContext {
    fn from_parts(
        token: CancellationToken,
        deadline: Option<Instant>,
        parent: Option<CallContext>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                call_id: Uuid::new_v4(),
                token,
                deadline,
                cancelled_at: OnceLock::new(),
                parent,
            }),
        }
    }

    /// Root context with no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::from_parts(CancellationToken::new(), None, None)
    }

    /// Root context that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            // Too far out to represent: no deadline.
            None => Self::background(),
        }
    }

    /// Root context that expires at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::from_parts(CancellationToken::new(), Some(deadline), None)
    }

    /// Child context terminating at the earlier of this context's termination
    /// and `now + timeout`. Never mutates `self`. A timeout too large to
    /// represent adds no deadline.
    #[must_use]
    pub fn derive(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.and_then(|t| Instant::now().checked_add(t));
        let deadline = earliest(self.inner.deadline, own);
        Self::from_parts(self.inner.token.child_token(), deadline, Some(self.clone()))
    }

    /// Identifier used to correlate log lines for this call.
    #[must_use]
    pub fn call_id(&self) -> Uuid {
        self.inner.call_id
    }

    /// Effective deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline. `Some(ZERO)` once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Mark the context terminal. Idempotent, safe from any task.
    pub fn cancel(&self) {
        // Record the instant before waking waiters so they observe a reason.
        let _ = self.inner.cancelled_at.set(Instant::now());
        self.inner.token.cancel();
    }

    /// True once the context (or an ancestor) terminated.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.reason().is_some()
    }

    /// Why the context terminated, or `None` while it is live.
    #[must_use]
    pub fn reason(&self) -> Option<DoneReason> {
        let expired = self.inner.deadline.filter(|d| *d <= Instant::now());
        match (self.cancelled_at(), expired) {
            (Some(cancelled), Some(deadline)) if deadline <= cancelled => {
                Some(DoneReason::DeadlineExceeded)
            }
            (Some(_), _) => Some(DoneReason::Cancelled),
            (None, Some(_)) => Some(DoneReason::DeadlineExceeded),
            (None, None) => None,
        }
    }

    /// The context-derived error, if terminated.
    #[must_use]
    pub fn err(&self) -> Option<RpcError> {
        self.reason().map(RpcError::from)
    }

    /// `Err` with the context-derived error if terminated.
    pub fn check(&self) -> Result<(), RpcError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves when the context terminates.
    pub async fn done(&self) -> DoneReason {
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.inner.token.cancelled() => {}
                    () = sleep_until(deadline) => {}
                }
            }
            None => self.inner.token.cancelled().await,
        }
        self.reason().unwrap_or(DoneReason::Cancelled)
    }

    /// Race `fut` against termination. Termination wins ties, and a context
    /// that is already terminal never polls `fut`.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, RpcError> {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.done() => Err(reason.into()),
            out = fut => Ok(out),
        }
    }

    /// Guard that cancels this context when dropped.
    #[must_use]
    pub fn cancel_on_drop(&self) -> ContextGuard {
        ContextGuard { ctx: self.clone() }
    }

    /// Earliest explicit cancellation of this context or any ancestor.
    fn cancelled_at(&self) -> Option<Instant> {
        let inherited = self
            .inner
            .parent
            .as_ref()
            .and_then(CallContext::cancelled_at);
        earliest(self.inner.cancelled_at.get().copied(), inherited)
    }
}

/// Cancels its context on drop.
#[derive(Debug)]
pub struct ContextGuard {
    ctx: CallContext,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
