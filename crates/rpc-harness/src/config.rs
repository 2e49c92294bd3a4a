//! RPC harness configuration.
//!
//! Configuration is loaded from environment variables. The bearer token is
//! redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default client call timeout in milliseconds.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;

/// Default sleep for a `"delay"` request in milliseconds.
pub const DEFAULT_PROCESSING_DELAY_MS: u64 = 2_000;

/// Default wait before a relay hop forwards, in milliseconds.
pub const DEFAULT_RELAY_DELAY_MS: u64 = 800;

/// Default number of replies per server-streaming call.
pub const DEFAULT_SERVER_STREAM_REPLIES: usize = 10;

/// Default number of messages the demo client streams.
pub const DEFAULT_CLIENT_STREAM_MESSAGES: usize = 5;

/// Default per-session and per-link queue bound.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// RPC harness configuration.
#[derive(Clone)]
pub struct Config {
    /// Bearer token accepted by the server and sent by the demo client.
    /// Protected by `SecretString` to prevent accidental logging.
    pub auth_token: SecretString,

    /// Whether the auth interceptor is enforced (default: true).
    pub require_auth: bool,

    /// Default deadline for client calls.
    pub call_timeout: Duration,

    /// Sleep applied to `"delay"` requests.
    pub processing_delay: Duration,

    /// Sleep before a relay hop forwards.
    pub relay_delay: Duration,

    /// Replies per server-streaming call.
    pub server_stream_replies: usize,

    /// Messages the demo client sends on a client-streaming call.
    pub client_stream_messages: usize,

    /// Per-session and per-link queue bound.
    pub channel_capacity: usize,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("auth_token", &"[REDACTED]")
            .field("require_auth", &self.require_auth)
            .field("call_timeout", &self.call_timeout)
            .field("processing_delay", &self.processing_delay)
            .field("relay_delay", &self.relay_delay)
            .field("server_stream_replies", &self.server_stream_replies)
            .field("client_stream_messages", &self.client_stream_messages)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let auth_token = vars
            .get("RPC_AUTH_TOKEN")
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("RPC_AUTH_TOKEN".to_string()))?;
        let auth_token = SecretString::from(auth_token.clone());

        let require_auth = parse_or(vars, "RPC_REQUIRE_AUTH", true)?;

        let call_timeout = Duration::from_millis(parse_or(
            vars,
            "RPC_CALL_TIMEOUT_MS",
            DEFAULT_CALL_TIMEOUT_MS,
        )?);
        let processing_delay = Duration::from_millis(parse_or(
            vars,
            "RPC_PROCESSING_DELAY_MS",
            DEFAULT_PROCESSING_DELAY_MS,
        )?);
        let relay_delay = Duration::from_millis(parse_or(
            vars,
            "RPC_RELAY_DELAY_MS",
            DEFAULT_RELAY_DELAY_MS,
        )?);

        let server_stream_replies = parse_or(
            vars,
            "RPC_SERVER_STREAM_REPLIES",
            DEFAULT_SERVER_STREAM_REPLIES,
        )?;
        let client_stream_messages = parse_or(
            vars,
            "RPC_CLIENT_STREAM_MESSAGES",
            DEFAULT_CLIENT_STREAM_MESSAGES,
        )?;

        let channel_capacity = parse_or(vars, "RPC_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY)?;
        if channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "RPC_CHANNEL_CAPACITY must be at least 1".to_string(),
            ));
        }

        Ok(Config {
            auth_token,
            require_auth,
            call_timeout,
            processing_delay,
            relay_delay,
            server_stream_replies,
            client_stream_messages,
            channel_capacity,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "RPC_AUTH_TOKEN".to_string(),
            "some-secret-token".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.auth_token.expose_secret(), "some-secret-token");
        assert!(config.require_auth);
        assert_eq!(
            config.call_timeout,
            Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS)
        );
        assert_eq!(config.processing_delay, Duration::from_secs(2));
        assert_eq!(config.relay_delay, Duration::from_millis(800));
        assert_eq!(config.server_stream_replies, 10);
        assert_eq!(config.client_stream_messages, 5);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("RPC_REQUIRE_AUTH".to_string(), "false".to_string());
        vars.insert("RPC_CALL_TIMEOUT_MS".to_string(), "1500".to_string());
        vars.insert("RPC_PROCESSING_DELAY_MS".to_string(), "50".to_string());
        vars.insert("RPC_RELAY_DELAY_MS".to_string(), "10".to_string());
        vars.insert("RPC_SERVER_STREAM_REPLIES".to_string(), "3".to_string());
        vars.insert("RPC_CLIENT_STREAM_MESSAGES".to_string(), "7".to_string());
        vars.insert("RPC_CHANNEL_CAPACITY".to_string(), "8".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert!(!config.require_auth);
        assert_eq!(config.call_timeout, Duration::from_millis(1500));
        assert_eq!(config.processing_delay, Duration::from_millis(50));
        assert_eq!(config.relay_delay, Duration::from_millis(10));
        assert_eq!(config.server_stream_replies, 3);
        assert_eq!(config.client_stream_messages, 7);
        assert_eq!(config.channel_capacity, 8);
    }

    #[test]
    fn test_from_vars_missing_auth_token() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "RPC_AUTH_TOKEN"));
    }

    #[test]
    fn test_from_vars_empty_auth_token() {
        let vars = HashMap::from([("RPC_AUTH_TOKEN".to_string(), String::new())]);
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn test_from_vars_invalid_number() {
        let mut vars = base_vars();
        vars.insert("RPC_CALL_TIMEOUT_MS".to_string(), "soon".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("RPC_CALL_TIMEOUT_MS"))
        );
    }

    #[test]
    fn test_from_vars_zero_capacity_rejected() {
        let mut vars = base_vars();
        vars.insert("RPC_CHANNEL_CAPACITY".to_string(), "0".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("some-secret-token"));
    }
}
