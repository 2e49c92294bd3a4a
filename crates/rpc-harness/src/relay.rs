//! Relay hop: forwarding a tagged request to a second service instance.
//!
//! The hop runs under the caller's [`CallContext`], so the downstream call
//! carries the same deadline and is cancelled together with the call that
//! triggered it.

use crate::client::HelloClient;
use crate::context::CallContext;
use crate::errors::RpcError;
use crate::proto::{HelloReply, HelloRequest};
use std::time::Duration;
use tracing::{debug, instrument};

/// Prefix that marks a request for forwarding.
pub const FORWARD_TAG: &str = "[propagate me]";

/// Payload to forward if `name` carries the relay tag.
#[must_use]
pub fn forward_target(name: &str) -> Option<&str> {
    name.strip_prefix(FORWARD_TAG)
}

/// Client side of one relay hop.
#[derive(Debug, Clone)]
pub struct RelayHop {
    client: HelloClient,
    delay: Duration,
}

impl RelayHop {
    /// `delay` is waited before forwarding, raced against the context.
    #[must_use]
    pub fn new(client: HelloClient, delay: Duration) -> Self {
        Self { client, delay }
    }

    /// Issue one unary call with `payload` and return the reply verbatim.
    ///
    /// # Errors
    ///
    /// The downstream failure, or the context's reason if it terminates
    /// during the pre-forward delay.
    #[instrument(skip_all, name = "rpc.relay.forward", fields(call_id = %ctx.call_id()))]
    pub async fn forward(&self, ctx: &CallContext, payload: &str) -> Result<HelloReply, RpcError> {
        ctx.run(tokio::time::sleep(self.delay)).await?;

        debug!(target: "rpc.relay", payload, "Forwarding to relay target");
        let reply = self
            .client
            .unary_hello(ctx, HelloRequest::new(payload))
            .await
            .inspect_err(|e| {
                debug!(target: "rpc.relay", error = %e, "Relay call failed");
            })?;
        debug!(target: "rpc.relay", reply = %reply.message, "Relay call succeeded");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_target_strips_tag() {
        assert_eq!(forward_target("[propagate me]suffix"), Some("suffix"));
        assert_eq!(forward_target("[propagate me]"), Some(""));
    }

    #[test]
    fn test_untagged_names_are_not_forwarded() {
        assert_eq!(forward_target("suffix"), None);
        assert_eq!(forward_target(" [propagate me]suffix"), None);
        assert_eq!(forward_target("[PROPAGATE ME]suffix"), None);
    }
}
