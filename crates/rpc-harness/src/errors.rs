//! RPC harness error types.
//!
//! Every error maps to a gRPC status code so it can cross the wire in a
//! `Reset` frame and be reconstructed on the peer. Transport details are
//! logged locally but not exposed through [`RpcError::client_message`].

use thiserror::Error;
use tonic::{Code, Status};

/// Terminal result of a call, a session operation or an interceptor.
///
/// Maps to gRPC status codes:
/// - `ContextCancelled`: `CANCELLED`
/// - `DeadlineExceeded`: `DEADLINE_EXCEEDED`
/// - `Transport`: `UNAVAILABLE`
/// - `ProtocolViolation`: `INTERNAL`
/// - `Unauthenticated`: `UNAUTHENTICATED`
/// - `SessionClosed`: `FAILED_PRECONDITION`
/// - `Application`: the code chosen by the handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The governing call context was cancelled.
    #[error("Context cancelled")]
    ContextCancelled,

    /// The governing call context passed its deadline.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Connection-level failure. Fatal to the session, never retried here.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame arrived that the session state does not allow.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Rejected by the authentication interceptor.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Operation on a half that is already closed.
    #[error("Session closed")]
    SessionClosed,

    /// Raised by an application handler.
    #[error("Application error ({code:?}): {message}")]
    Application { code: Code, message: String },
}

impl RpcError {
    /// Application error with `INVALID_ARGUMENT`.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        RpcError::Application {
            code: Code::InvalidArgument,
            message: message.into(),
        }
    }

    /// Application error with `UNIMPLEMENTED`.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        RpcError::Application {
            code: Code::Unimplemented,
            message: message.into(),
        }
    }

    /// Application error with `RESOURCE_EXHAUSTED`.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        RpcError::Application {
            code: Code::ResourceExhausted,
            message: message.into(),
        }
    }

    /// Returns the gRPC status code for this error.
    pub fn code(&self) -> Code {
        match self {
            RpcError::ContextCancelled => Code::Cancelled,
            RpcError::DeadlineExceeded => Code::DeadlineExceeded,
            RpcError::Transport(_) => Code::Unavailable,
            RpcError::ProtocolViolation(_) => Code::Internal,
            RpcError::Unauthenticated(_) => Code::Unauthenticated,
            RpcError::SessionClosed => Code::FailedPrecondition,
            RpcError::Application { code, .. } => *code,
        }
    }

    /// True for errors raised by context termination.
    pub fn is_context_error(&self) -> bool {
        matches!(self, RpcError::ContextCancelled | RpcError::DeadlineExceeded)
    }

    /// Returns a message safe to send to the peer (no transport internals).
    pub fn client_message(&self) -> String {
        match self {
            RpcError::Transport(_) => "Connection unavailable".to_string(),
            RpcError::ProtocolViolation(msg) | RpcError::Unauthenticated(msg) => msg.clone(),
            RpcError::Application { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        Status::new(err.code(), err.client_message())
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::Cancelled => RpcError::ContextCancelled,
            Code::DeadlineExceeded => RpcError::DeadlineExceeded,
            Code::Unavailable => RpcError::Transport(message),
            Code::Internal => RpcError::ProtocolViolation(message),
            Code::Unauthenticated => RpcError::Unauthenticated(message),
            code => RpcError::Application { code, message },
        }
    }
}

impl From<prost::DecodeError> for RpcError {
    fn from(err: prost::DecodeError) -> Self {
        RpcError::ProtocolViolation(format!("malformed message: {err}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(RpcError::ContextCancelled.code(), Code::Cancelled);
        assert_eq!(RpcError::DeadlineExceeded.code(), Code::DeadlineExceeded);
        assert_eq!(
            RpcError::Transport("reset by peer".to_string()).code(),
            Code::Unavailable
        );
        assert_eq!(
            RpcError::ProtocolViolation("extra message".to_string()).code(),
            Code::Internal
        );
        assert_eq!(
            RpcError::Unauthenticated("missing".to_string()).code(),
            Code::Unauthenticated
        );
        assert_eq!(RpcError::SessionClosed.code(), Code::FailedPrecondition);
        assert_eq!(
            RpcError::invalid_argument("bad name").code(),
            Code::InvalidArgument
        );
    }

    #[test]
    fn test_status_conversion_preserves_context_errors() {
        let status: Status = RpcError::DeadlineExceeded.into();
        assert_eq!(RpcError::from(status), RpcError::DeadlineExceeded);

        let status: Status = RpcError::ContextCancelled.into();
        assert_eq!(RpcError::from(status), RpcError::ContextCancelled);
    }

    #[test]
    fn test_status_conversion_keeps_application_code() {
        let status: Status = RpcError::invalid_argument("request message not received").into();
        assert_eq!(status.code(), Code::InvalidArgument);

        let err = RpcError::from(status);
        assert_eq!(
            err,
            RpcError::Application {
                code: Code::InvalidArgument,
                message: "request message not received".to_string(),
            }
        );
    }

    #[test]
    fn test_client_message_hides_transport_details() {
        let err = RpcError::Transport("connection refused at 10.0.0.7:50051".to_string());
        assert!(!err.client_message().contains("10.0.0.7"));

        let status: Status = err.into();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "Connection unavailable");
    }

    #[test]
    fn test_is_context_error() {
        assert!(RpcError::ContextCancelled.is_context_error());
        assert!(RpcError::DeadlineExceeded.is_context_error());
        assert!(!RpcError::SessionClosed.is_context_error());
        assert!(!RpcError::Unauthenticated("no".to_string()).is_context_error());
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", RpcError::Transport("eof".to_string())),
            "Transport error: eof"
        );
        assert_eq!(format!("{}", RpcError::DeadlineExceeded), "Deadline exceeded");
    }
}
