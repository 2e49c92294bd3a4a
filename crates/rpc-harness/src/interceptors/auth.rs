//! Bearer-token authentication interceptor.
//!
//! Validates that every call carries `authorization: Bearer <token>` metadata
//! and that a [`CredentialValidator`] accepts the token. Applies to unary
//! calls and to stream admission.
//!
//! # Security
//!
//! - Credentials are evaluated before anything else in the chain runs
//! - On failure no inner interceptor and no handler is invoked
//! - Generic error messages prevent information leakage
//! - Failed authentication returns UNAUTHENTICATED status

use crate::context::CallContext;
use crate::errors::RpcError;
use crate::interceptor::{Next, StreamInterceptor, UnaryInterceptor};
use crate::session::CallInfo;
use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tonic::metadata::MetadataMap;
use tonic::Request;
use tracing::instrument;

/// Maximum accepted bearer token size in bytes (8KB).
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// Identity established by a successful authentication.
///
/// Inserted into the request extensions for handlers to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    pub subject: String,
}

/// Credential check consulted once per call.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<AuthenticatedIdentity, RpcError>;
}

/// Accepts exactly one configured token.
pub struct StaticTokenValidator {
    token: SecretString,
    subject: String,
}

impl StaticTokenValidator {
    pub fn new(token: SecretString, subject: impl Into<String>) -> Self {
        Self {
            token,
            subject: subject.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenValidator")
            .field("token", &"[REDACTED]")
            .field("subject", &self.subject)
            .finish()
    }
}

#[async_trait]
impl CredentialValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<AuthenticatedIdentity, RpcError> {
        // Length leaks; contents do not.
        let matches: bool = self
            .token
            .expose_secret()
            .as_bytes()
            .ct_eq(token.as_bytes())
            .into();
        if matches {
            Ok(AuthenticatedIdentity {
                subject: self.subject.clone(),
            })
        } else {
            Err(RpcError::Unauthenticated("Invalid token".to_string()))
        }
    }
}

/// Authentication interceptor for unary and streaming calls.
#[derive(Clone)]
pub struct AuthInterceptor {
    /// `None` when authorization is disabled.
    validator: Option<Arc<dyn CredentialValidator>>,
}

impl std::fmt::Debug for AuthInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInterceptor")
            .field("require_auth", &self.validator.is_some())
            .finish()
    }
}

impl AuthInterceptor {
    /// Create an auth interceptor with authorization required.
    pub fn new(validator: impl CredentialValidator + 'static) -> Self {
        Self {
            validator: Some(Arc::new(validator)),
        }
    }

    /// Create an auth interceptor that lets every call through.
    #[must_use]
    pub fn disabled() -> Self {
        Self { validator: None }
    }

    /// Extract the Bearer token from authorization metadata.
    fn extract_token(metadata: &MetadataMap) -> Result<&str, RpcError> {
        let auth_header = metadata.get("authorization").ok_or_else(|| {
            tracing::debug!(target: "rpc.auth", "Missing authorization metadata");
            RpcError::Unauthenticated("Missing authorization header".to_string())
        })?;

        let token = auth_header
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| {
                tracing::debug!(target: "rpc.auth", "Invalid authorization format");
                RpcError::Unauthenticated("Invalid authorization format".to_string())
            })?;

        if token.is_empty() {
            tracing::debug!(target: "rpc.auth", "Empty token");
            return Err(RpcError::Unauthenticated("Empty token".to_string()));
        }

        if token.len() > MAX_TOKEN_SIZE_BYTES {
            tracing::debug!(
                target: "rpc.auth",
                token_size = token.len(),
                "Token exceeds size limit"
            );
            return Err(RpcError::Unauthenticated("Invalid token".to_string()));
        }

        Ok(token)
    }

    /// Validate the call's credentials. `Ok(None)` when auth is disabled.
    #[instrument(skip_all, name = "rpc.auth.authenticate", fields(method = %info.method))]
    async fn authenticate(
        &self,
        info: &CallInfo,
        metadata: &MetadataMap,
    ) -> Result<Option<AuthenticatedIdentity>, RpcError> {
        let Some(validator) = &self.validator else {
            return Ok(None);
        };

        let token = Self::extract_token(metadata)?;
        let identity = validator.validate(token).await.inspect_err(|e| {
            tracing::debug!(target: "rpc.auth", error = %e, "Credential rejected");
        })?;

        tracing::trace!(
            target: "rpc.auth",
            subject = %identity.subject,
            "Authorization validated"
        );
        Ok(Some(identity))
    }
}

#[async_trait]
impl UnaryInterceptor for AuthInterceptor {
    async fn intercept(
        &self,
        info: &CallInfo,
        ctx: &CallContext,
        mut request: Request<Bytes>,
        next: Next<'_>,
    ) -> Result<Bytes, RpcError> {
        if let Some(identity) = self.authenticate(info, request.metadata()).await? {
            request.extensions_mut().insert(identity);
        }
        next.run(ctx, request).await
    }
}

#[async_trait]
impl StreamInterceptor for AuthInterceptor {
    async fn on_open(
        &self,
        info: &CallInfo,
        _ctx: &CallContext,
        request: &mut Request<()>,
    ) -> Result<(), RpcError> {
        if let Some(identity) = self.authenticate(info, request.metadata()).await? {
            request.extensions_mut().insert(identity);
        }
        Ok(())
    }
}
