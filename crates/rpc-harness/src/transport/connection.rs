//! Session multiplexer over a [`Link`].
//!
//! One demultiplexing task per connection decodes frames and routes them by
//! session id into bounded per-session queues. Outbound frames from every
//! session share the link's single outbound queue, so frames are written
//! whole and never interleave.
//!
//! # Flow control
//!
//! The demultiplexer never waits on a session. A message arriving for a
//! session whose queue is full resets that session with `RESOURCE_EXHAUSTED`
//! on both ends; every other session on the connection keeps flowing.
//! End-of-stream closes the session's queue instead of occupying a slot, so
//! it is applied even when the queue is full.
//!
//! # Session ids
//!
//! The client side allocates odd ids (1, 3, 5, ...). The server side only
//! accepts sessions and never opens them.
//!
//! # Peer termination
//!
//! A `Reset` frame does not travel through the message queue. It fires the
//! session's [`ResetSignal`] so a session whose owner is busy elsewhere (e.g.
//! sleeping inside a handler) still observes it through its supervisor.

use super::link::Link;
use crate::errors::RpcError;
use crate::observability::metrics;
use crate::proto::{frame::Kind, Frame, Open};
use bytes::Bytes;
use prost::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, warn};

/// Set-once peer termination for one session.
#[derive(Debug, Default)]
pub struct ResetSignal {
    error: OnceLock<RpcError>,
    fired: CancellationToken,
}

impl ResetSignal {
    /// Record `err` and wake waiters. Returns false if already fired.
    pub fn fire(&self, err: RpcError) -> bool {
        let first = self.error.set(err).is_ok();
        self.fired.cancel();
        first
    }

    /// The recorded error, once fired.
    pub fn error(&self) -> Option<RpcError> {
        self.error.get().cloned()
    }

    /// Resolves with the recorded error once fired.
    pub async fn fired(&self) -> RpcError {
        self.fired.cancelled().await;
        self.error()
            .unwrap_or_else(|| RpcError::Transport("session reset".to_string()))
    }
}

/// Per-session endpoint handed to the session layer.
///
/// `inbound` yields the peer's messages in order and ends once the queue is
/// drained after the peer's end-of-stream (`end_of_stream` set) or after the
/// route was torn down (`reset` fired).
#[derive(Debug)]
pub struct SessionChannel {
    pub session_id: u64,
    pub inbound: mpsc::Receiver<Bytes>,
    pub end_of_stream: Arc<AtomicBool>,
    pub reset: Arc<ResetSignal>,
}

/// A session opened by the remote peer.
#[derive(Debug)]
pub struct IncomingSession {
    pub open: Open,
    pub channel: SessionChannel,
}

struct Route {
    /// Dropped on the peer's end-of-stream.
    inbound: Option<mpsc::Sender<Bytes>>,
    end_of_stream: Arc<AtomicBool>,
    reset: Arc<ResetSignal>,
}

/// Cheaply cloneable handle to a multiplexed connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.inner.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

struct ConnectionInner {
    outbound: mpsc::Sender<Bytes>,
    routes: Mutex<HashMap<u64, Route>>,
    next_session_id: AtomicU64,
    capacity: usize,
    closed: CancellationToken,
}

impl Connection {
    /// Client end: opens sessions, never accepts them.
    #[must_use]
    pub fn client(link: Link, capacity: usize) -> Connection {
        Self::start(link, capacity, None)
    }

    /// Server end plus the stream of sessions opened by the peer.
    #[must_use]
    pub fn server(link: Link, capacity: usize) -> (Connection, mpsc::Receiver<IncomingSession>) {
        let (accept_tx, accept_rx) = mpsc::channel(capacity);
        (Self::start(link, capacity, Some(accept_tx)), accept_rx)
    }

    fn start(
        link: Link,
        capacity: usize,
        accept: Option<mpsc::Sender<IncomingSession>>,
    ) -> Connection {
        let (outbound, inbound) = link.into_parts();
        let inner = Arc::new(ConnectionInner {
            outbound,
            routes: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            capacity,
            closed: CancellationToken::new(),
        });
        tokio::spawn(demux(
            Arc::downgrade(&inner),
            inner.closed.clone(),
            inbound,
            accept,
        ));
        Connection { inner }
    }

    /// Open a new session: registers its route and sends the `Open` frame.
    pub async fn open(&self, open: Open) -> Result<SessionChannel, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Transport("connection closed".to_string()));
        }
        let session_id = self.inner.next_session_id.fetch_add(2, Ordering::Relaxed);
        let channel = self
            .inner
            .register(session_id)
            .ok_or_else(|| RpcError::ProtocolViolation("duplicate session id".to_string()))?;

        if let Err(e) = self.send_frame(Frame::open(session_id, open)).await {
            self.release(session_id);
            return Err(e);
        }
        Ok(channel)
    }

    /// Queue one encoded frame on the link.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Transport("connection closed".to_string()));
        }
        self.inner
            .outbound
            .send(Bytes::from(frame.encode_to_vec()))
            .await
            .map_err(|_| RpcError::Transport("connection closed".to_string()))
    }

    /// Best-effort, non-blocking send for paths that cannot await (drop).
    pub fn try_send_frame(&self, frame: Frame) {
        if let Err(e) = self
            .inner
            .outbound
            .try_send(Bytes::from(frame.encode_to_vec()))
        {
            debug!(target: "rpc.transport", error = %e, "Dropped best-effort frame");
        }
    }

    /// Forget a session's route. Late frames for it are discarded.
    pub fn release(&self, session_id: u64) {
        self.inner.release(session_id);
    }

    /// Stop routing and fail every open session with a transport error.
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.inner.shut_down();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Number of sessions currently routed.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.inner.routes().len()
    }
}

impl ConnectionInner {
    fn routes(&self) -> MutexGuard<'_, HashMap<u64, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, session_id: u64) -> Option<SessionChannel> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let end_of_stream = Arc::new(AtomicBool::new(false));
        let reset = Arc::new(ResetSignal::default());
        let active = {
            let mut routes = self.routes();
            if routes.contains_key(&session_id) {
                return None;
            }
            routes.insert(
                session_id,
                Route {
                    inbound: Some(tx),
                    end_of_stream: Arc::clone(&end_of_stream),
                    reset: Arc::clone(&reset),
                },
            );
            routes.len()
        };
        metrics::set_sessions_active(active);
        Some(SessionChannel {
            session_id,
            inbound: rx,
            end_of_stream,
            reset,
        })
    }

    fn release(&self, session_id: u64) {
        let active = {
            let mut routes = self.routes();
            routes.remove(&session_id);
            routes.len()
        };
        metrics::set_sessions_active(active);
    }

    fn shut_down(&self) {
        let routes: Vec<(u64, Route)> = self.routes().drain().collect();
        if routes.is_empty() {
            return;
        }
        debug!(
            target: "rpc.transport",
            sessions = routes.len(),
            "Connection closed, failing open sessions"
        );
        let status = Status::unavailable("connection closed");
        for (session_id, route) in routes {
            route
                .reset
                .fire(RpcError::Transport("connection closed".to_string()));
            let _ = self
                .outbound
                .try_send(Bytes::from(Frame::reset(session_id, &status).encode_to_vec()));
        }
        metrics::set_sessions_active(0);
    }

    async fn dispatch(&self, frame: Frame, accept: Option<&mpsc::Sender<IncomingSession>>) {
        let session_id = frame.session_id;
        match frame.kind {
            Some(Kind::Open(open)) => self.accept(session_id, open, accept).await,
            Some(Kind::Message(payload)) => {
                let routed = self.routes().get(&session_id).map(|route| {
                    match &route.inbound {
                        Some(inbound) => Ok(inbound.try_send(payload)),
                        None => Err(Arc::clone(&route.reset)),
                    }
                });
                match routed {
                    Some(Ok(Ok(()))) => {}
                    // Receiver gone means the session already finished locally.
                    Some(Ok(Err(TrySendError::Closed(_)))) => {}
                    Some(Ok(Err(TrySendError::Full(_)))) => self.overflow(session_id),
                    Some(Err(reset)) => {
                        let err = RpcError::ProtocolViolation(
                            "message received after end of stream".to_string(),
                        );
                        warn!(target: "rpc.transport", session_id, "Message after end of stream");
                        self.send_reset(session_id, &err);
                        reset.fire(err);
                    }
                    None => {
                        debug!(target: "rpc.transport", session_id, "Message for unknown session dropped");
                    }
                }
            }
            Some(Kind::EndOfStream(_)) => {
                let mut routes = self.routes();
                if let Some(route) = routes.get_mut(&session_id) {
                    if let Some(inbound) = route.inbound.take() {
                        // Flag first: the receiver reads it once the queue ends.
                        route.end_of_stream.store(true, Ordering::Release);
                        drop(inbound);
                    }
                }
            }
            Some(Kind::Reset(reset)) => {
                let signal = self
                    .routes()
                    .get(&session_id)
                    .map(|route| Arc::clone(&route.reset));
                if let Some(signal) = signal {
                    let status = Status::new(Code::from(reset.code), reset.message);
                    debug!(
                        target: "rpc.transport",
                        session_id,
                        code = ?status.code(),
                        "Peer reset session"
                    );
                    signal.fire(RpcError::from(status));
                }
            }
            None => {
                warn!(target: "rpc.transport", session_id, "Frame without kind ignored");
            }
        }
    }

    async fn accept(
        &self,
        session_id: u64,
        open: Open,
        accept: Option<&mpsc::Sender<IncomingSession>>,
    ) {
        let Some(accept) = accept else {
            warn!(target: "rpc.transport", session_id, "Peer tried to open a session on a client connection");
            let err = RpcError::ProtocolViolation("sessions are not accepted here".to_string());
            self.send_reset(session_id, &err);
            return;
        };
        let Some(channel) = self.register(session_id) else {
            let err = RpcError::ProtocolViolation("duplicate session id".to_string());
            self.send_reset(session_id, &err);
            return;
        };
        if accept
            .send(IncomingSession { open, channel })
            .await
            .is_err()
        {
            self.release(session_id);
            let err = RpcError::Transport("server is not accepting sessions".to_string());
            self.send_reset(session_id, &err);
        }
    }

    /// Fail one session whose receive queue is full.
    fn overflow(&self, session_id: u64) {
        let (route, active) = {
            let mut routes = self.routes();
            let route = routes.remove(&session_id);
            (route, routes.len())
        };
        metrics::set_sessions_active(active);
        warn!(target: "rpc.transport", session_id, "Session receive queue full, resetting");

        let err = RpcError::resource_exhausted("session receive queue full");
        self.send_reset(session_id, &err);
        // Fired before the route (and its queue sender) is dropped, so the
        // receiver sees the reason once it drains what was queued.
        if let Some(route) = route {
            route.reset.fire(err);
        }
    }

    /// Best effort: the demultiplexer never waits on the link either.
    fn send_reset(&self, session_id: u64, err: &RpcError) {
        let status = Status::from(err.clone());
        if let Err(e) = self
            .outbound
            .try_send(Bytes::from(Frame::reset(session_id, &status).encode_to_vec()))
        {
            debug!(target: "rpc.transport", session_id, error = %e, "Dropped reset frame");
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn demux(
    inner: Weak<ConnectionInner>,
    closed: CancellationToken,
    mut inbound: mpsc::Receiver<Bytes>,
    accept: Option<mpsc::Sender<IncomingSession>>,
) {
    loop {
        let raw = tokio::select! {
            () = closed.cancelled() => break,
            raw = inbound.recv() => match raw {
                Some(raw) => raw,
                None => {
                    debug!(target: "rpc.transport", "Link closed by peer");
                    break;
                }
            },
        };
        let Some(conn) = inner.upgrade() else {
            return;
        };
        match Frame::decode(raw) {
            Ok(frame) => conn.dispatch(frame, accept.as_ref()).await,
            Err(e) => {
                warn!(target: "rpc.transport", error = %e, "Undecodable frame, closing connection");
                conn.closed.cancel();
                break;
            }
        }
    }
    if let Some(conn) = inner.upgrade() {
        conn.closed.cancel();
        conn.shut_down();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn open(method: &str) -> Open {
        Open {
            method: method.to_string(),
            timeout_millis: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_open_reaches_server_with_odd_ids() {
        let (a, b) = Link::memory_pair(16);
        let client = Connection::client(a, 16);
        let (_server, mut incoming) = Connection::server(b, 16);

        let first = client.open(open("/test/First")).await.unwrap();
        let second = client.open(open("/test/Second")).await.unwrap();
        assert_eq!(first.session_id, 1);
        assert_eq!(second.session_id, 3);

        let accepted = incoming.recv().await.unwrap();
        assert_eq!(accepted.open.method, "/test/First");
        assert_eq!(accepted.channel.session_id, 1);
        assert_eq!(client.active_sessions(), 2);
    }

    #[tokio::test]
    async fn test_frames_route_by_session() {
        let (a, b) = Link::memory_pair(16);
        let client = Connection::client(a, 16);
        let (server, mut incoming) = Connection::server(b, 16);

        let mut session = client.open(open("/test/Echo")).await.unwrap();
        let accepted = incoming.recv().await.unwrap();

        server
            .send_frame(Frame::message(accepted.channel.session_id, Bytes::from_static(b"hi")))
            .await
            .unwrap();
        server
            .send_frame(Frame::end_of_stream(accepted.channel.session_id))
            .await
            .unwrap();

        assert_eq!(
            session.inbound.recv().await.unwrap(),
            Bytes::from_static(b"hi")
        );
        assert_eq!(session.inbound.recv().await, None);
        assert!(session.end_of_stream.load(Ordering::Acquire));
        assert!(session.reset.error().is_none());
    }

    #[tokio::test]
    async fn test_end_of_stream_applies_when_queue_is_full() {
        let (a, b) = Link::memory_pair(16);
        let client = Connection::client(a, 2);
        let (server, mut incoming) = Connection::server(b, 2);

        let mut session = client.open(open("/test/Full")).await.unwrap();
        let accepted = incoming.recv().await.unwrap();
        let id = accepted.channel.session_id;

        for payload in [&b"one"[..], &b"two"[..]] {
            server
                .send_frame(Frame::message(id, Bytes::copy_from_slice(payload)))
                .await
                .unwrap();
        }
        server.send_frame(Frame::end_of_stream(id)).await.unwrap();

        assert_eq!(session.inbound.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(session.inbound.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(session.inbound.recv().await, None);
        assert!(session.end_of_stream.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_overflowing_session_is_reset_alone() {
        let (a, b) = Link::memory_pair(64);
        let client = Connection::client(a, 2);
        let (server, mut incoming) = Connection::server(b, 2);

        let stalled = client.open(open("/test/Stalled")).await.unwrap();
        let mut healthy = client.open(open("/test/Healthy")).await.unwrap();
        let stalled_server = incoming.recv().await.unwrap();
        let _healthy_server = incoming.recv().await.unwrap();

        // Nobody reads the stalled session; the third message overflows it.
        for _ in 0..3 {
            client
                .send_frame(Frame::message(stalled.session_id, Bytes::from_static(b"x")))
                .await
                .unwrap();
        }
        server
            .send_frame(Frame::message(healthy.session_id, Bytes::from_static(b"still here")))
            .await
            .unwrap();

        assert_eq!(
            healthy.inbound.recv().await.unwrap(),
            Bytes::from_static(b"still here")
        );
        assert_eq!(
            stalled_server.channel.reset.fired().await.code(),
            Code::ResourceExhausted
        );
        assert_eq!(stalled.reset.fired().await.code(), Code::ResourceExhausted);
        assert!(healthy.reset.error().is_none());
    }

    #[tokio::test]
    async fn test_message_after_end_of_stream_resets_both_sides() {
        let (a, b) = Link::memory_pair(16);
        let client = Connection::client(a, 16);
        let (server, mut incoming) = Connection::server(b, 16);

        let session = client.open(open("/test/Violation")).await.unwrap();
        let accepted = incoming.recv().await.unwrap();
        let id = accepted.channel.session_id;

        server.send_frame(Frame::end_of_stream(id)).await.unwrap();
        server
            .send_frame(Frame::message(id, Bytes::from_static(b"late")))
            .await
            .unwrap();

        assert!(matches!(
            session.reset.fired().await,
            RpcError::ProtocolViolation(_)
        ));
        assert!(matches!(
            accepted.channel.reset.fired().await,
            RpcError::ProtocolViolation(_)
        ));
    }

    #[tokio::test]
    async fn test_peer_reset_fires_signal_with_status() {
        let (a, b) = Link::memory_pair(16);
        let client = Connection::client(a, 16);
        let (server, mut incoming) = Connection::server(b, 16);

        let session = client.open(open("/test/Reset")).await.unwrap();
        let accepted = incoming.recv().await.unwrap();

        server
            .send_frame(Frame::reset(
                accepted.channel.session_id,
                &Status::deadline_exceeded("too slow"),
            ))
            .await
            .unwrap();

        assert_eq!(session.reset.fired().await, RpcError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_dropping_peer_fails_open_sessions() {
        let (a, b) = Link::memory_pair(16);
        let client = Connection::client(a, 16);
        let (server, incoming) = Connection::server(b, 16);

        let session = client.open(open("/test/Drop")).await.unwrap();
        drop(incoming);
        drop(server);

        assert!(matches!(
            session.reset.fired().await,
            RpcError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_new_sessions() {
        let (a, _b) = Link::memory_pair(16);
        let client = Connection::client(a, 16);
        client.close();

        let err = client.open(open("/test/Closed")).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }
}
