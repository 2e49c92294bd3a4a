//! Observability for the RPC harness (metrics).

pub mod metrics;
