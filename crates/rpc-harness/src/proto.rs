//! Protocol Buffer messages for the Hello service and the session wire frames.
//!
//! Written with `prost` derives in the shape `prost-build` would generate,
//! so no `protoc` is needed at build time. Equivalent schema:
//!
//! ```text
//! package helloworld;
//!
//! message HelloRequest { string name = 1; }
//! message HelloReply   { string message = 1; }
//!
//! message Frame {
//!   uint64 session_id = 1;
//!   oneof kind {
//!     Open open = 2;
//!     bytes message = 3;
//!     EndOfStream end_of_stream = 4;
//!     Reset reset = 5;
//!   }
//! }
//! message Open {
//!   string method = 1;
//!   optional uint64 timeout_millis = 2;
//!   map<string, string> metadata = 3;
//! }
//! message EndOfStream {}
//! message Reset { int32 code = 1; string message = 2; }
//! ```

use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tonic::metadata::{Ascii, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};
use tracing::debug;

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

impl HelloRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloReply {
    #[prost(string, tag = "1")]
    pub message: String,
}

impl HelloReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One unit on the multiplexed link.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Frame {
    #[prost(uint64, tag = "1")]
    pub session_id: u64,
    #[prost(oneof = "frame::Kind", tags = "2, 3, 4, 5")]
    pub kind: Option<frame::Kind>,
}

pub mod frame {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "2")]
        Open(super::Open),
        #[prost(bytes = "bytes", tag = "3")]
        Message(::bytes::Bytes),
        #[prost(message, tag = "4")]
        EndOfStream(super::EndOfStream),
        #[prost(message, tag = "5")]
        Reset(super::Reset),
    }
}

/// Starts a session. Carries the caller's remaining deadline and metadata.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Open {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(uint64, optional, tag = "2")]
    pub timeout_millis: Option<u64>,
    #[prost(map = "string, string", tag = "3")]
    pub metadata: HashMap<String, String>,
}

/// The sender closed its send half.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EndOfStream {}

/// Terminates a session with a gRPC status.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Reset {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl Open {
    /// Open request for `method`. Binary metadata is not carried.
    pub fn new(
        method: impl Into<String>,
        timeout: Option<Duration>,
        metadata: &MetadataMap,
    ) -> Self {
        let metadata = metadata
            .iter()
            .filter_map(|entry| match entry {
                KeyAndValueRef::Ascii(key, value) => value
                    .to_str()
                    .ok()
                    .map(|value| (key.as_str().to_string(), value.to_string())),
                KeyAndValueRef::Binary(..) => None,
            })
            .collect();
        Self {
            method: method.into(),
            timeout_millis: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            metadata,
        }
    }

    /// Remaining time the caller allows for the call.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_millis.map(Duration::from_millis)
    }

    /// Metadata as a tonic map. Entries that are not valid metadata are skipped.
    #[must_use]
    pub fn metadata_map(&self) -> MetadataMap {
        let mut map = MetadataMap::new();
        for (key, value) in &self.metadata {
            let parsed = (
                MetadataKey::<Ascii>::from_bytes(key.as_bytes()),
                value.parse::<MetadataValue<Ascii>>(),
            );
            match parsed {
                (Ok(key), Ok(value)) => {
                    map.insert(key, value);
                }
                _ => debug!(target: "rpc.transport", key = %key, "Skipping invalid metadata entry"),
            }
        }
        map
    }
}

impl Frame {
    pub fn open(session_id: u64, open: Open) -> Self {
        Self {
            session_id,
            kind: Some(frame::Kind::Open(open)),
        }
    }

    pub fn message(session_id: u64, payload: Bytes) -> Self {
        Self {
            session_id,
            kind: Some(frame::Kind::Message(payload)),
        }
    }

    pub fn end_of_stream(session_id: u64) -> Self {
        Self {
            session_id,
            kind: Some(frame::Kind::EndOfStream(EndOfStream {})),
        }
    }

    pub fn reset(session_id: u64, status: &tonic::Status) -> Self {
        Self {
            session_id,
            kind: Some(frame::Kind::Reset(Reset {
                code: status.code() as i32,
                message: status.message().to_string(),
            })),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_open_frame_carries_timeout_and_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert("authorization".to_string(), "Bearer abc".to_string());
        let frame = Frame::open(
            7,
            Open {
                method: "/helloworld.Hello/UnaryHello".to_string(),
                timeout_millis: Some(250),
                metadata,
            },
        );

        let decoded = Frame::decode(frame.encode_to_vec().as_slice()).unwrap();

        assert_eq!(decoded.session_id, 7);
        match decoded.kind {
            Some(frame::Kind::Open(open)) => {
                assert_eq!(open.timeout_millis, Some(250));
                assert_eq!(
                    open.metadata.get("authorization").map(String::as_str),
                    Some("Bearer abc")
                );
            }
            other => panic!("unexpected frame kind: {other:?}"),
        }
    }

    #[test]
    fn test_reset_frame_keeps_status_code() {
        let status = tonic::Status::deadline_exceeded("too slow");
        let frame = Frame::reset(3, &status);

        let decoded = Frame::decode(frame.encode_to_vec().as_slice()).unwrap();
        match decoded.kind {
            Some(frame::Kind::Reset(reset)) => {
                assert_eq!(
                    tonic::Code::from(reset.code),
                    tonic::Code::DeadlineExceeded
                );
                assert_eq!(reset.message, "too slow");
            }
            other => panic!("unexpected frame kind: {other:?}"),
        }
    }

    #[test]
    fn test_open_converts_metadata_and_timeout() {
        let mut metadata = MetadataMap::new();
        metadata.insert("authorization", "Bearer token".parse().unwrap());
        metadata.insert("x-request-id", "42".parse().unwrap());

        let open = Open::new("/m", Some(Duration::from_millis(1500)), &metadata);
        assert_eq!(open.timeout_millis, Some(1500));
        assert_eq!(open.timeout(), Some(Duration::from_millis(1500)));

        let map = open.metadata_map();
        assert_eq!(
            map.get("authorization").unwrap().to_str().unwrap(),
            "Bearer token"
        );
        assert_eq!(map.get("x-request-id").unwrap().to_str().unwrap(), "42");
    }

    #[test]
    fn test_invalid_wire_metadata_is_skipped() {
        let mut open = Open::new("/m", None, &MetadataMap::new());
        open.metadata
            .insert("bad key".to_string(), "value".to_string());
        open.metadata.insert("good".to_string(), "value".to_string());

        let map = open.metadata_map();
        assert_eq!(map.len(), 1);
        assert!(map.get("good").is_some());
    }

    #[test]
    fn test_truncated_frame_fails_to_decode() {
        let frame = Frame::message(1, Bytes::from_static(b"hello world"));
        let encoded = frame.encode_to_vec();

        let truncated = encoded.get(..encoded.len() - 3).unwrap();
        assert!(Frame::decode(truncated).is_err());
    }
}
