//! # RPC Test Utilities
//!
//! Shared test utilities for the RPC harness.
//!
//! ## Modules
//!
//! - `fixtures` - Test token, recording interceptor, counting service wrapper
//! - `server_harness` - Primary server plus relay target over in-process links
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rpc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::builder().spawn();
//!     let reply = harness
//!         .client()
//!         .unary_hello(&CallContext::background(), HelloRequest::new("world"))
//!         .await
//!         .unwrap();
//!     assert_eq!(reply.message, "world");
//! }
//! ```

pub mod fixtures;
pub mod server_harness;

pub use fixtures::*;
pub use server_harness::*;
