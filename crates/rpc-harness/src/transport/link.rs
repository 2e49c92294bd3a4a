//! Frame-preserving byte link between two peers.
//!
//! A [`Link`] is the substrate a [`Connection`](super::Connection) runs on:
//! an ordered pair of bounded frame queues. It is either purely in-process
//! ([`Link::memory_pair`]) or adapted from any already-secured byte stream
//! ([`Link::from_io`]) using length-delimited framing.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

/// Maximum encoded frame size accepted from a byte stream (4MB).
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// One end of a bidirectional, ordered, frame-preserving link.
#[derive(Debug)]
pub struct Link {
    outbound: mpsc::Sender<Bytes>,
    inbound: mpsc::Receiver<Bytes>,
}

impl Link {
    /// Two connected in-process ends.
    #[must_use]
    pub fn memory_pair(capacity: usize) -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }

    /// Adapt a byte stream (TCP, TLS, ...) into a link.
    ///
    /// Spawns a reader task and a writer task. The link reports closure to
    /// its owner when the stream hits EOF or an I/O error.
    pub fn from_io<T>(io: T, capacity: usize) -> Link
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        let (mut sink, mut stream) = Framed::new(io, codec).split();

        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(capacity);
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(capacity);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!(target: "rpc.transport", error = %e, "Link write failed");
                    return;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(target: "rpc.transport", error = %e, "Link close failed");
            }
        });

        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(frame) => {
                        if in_tx.send(frame.freeze()).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(target: "rpc.transport", error = %e, "Link read failed");
                        return;
                    }
                }
            }
            debug!(target: "rpc.transport", "Link reached end of stream");
        });

        Link {
            outbound: out_tx,
            inbound: in_rx,
        }
    }

    pub(crate) fn into_parts(self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        (self.outbound, self.inbound)
    }
}
