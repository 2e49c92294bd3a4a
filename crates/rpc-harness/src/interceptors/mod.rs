//! Interceptors shipped with the harness.

pub mod auth;
pub mod logging;

pub use auth::{AuthInterceptor, AuthenticatedIdentity, CredentialValidator, StaticTokenValidator};
pub use logging::LoggingInterceptor;
