//! Transport channel: a secured byte link plus the session multiplexer.
//!
//! The session layer consumes only [`Connection`]; certificate handling and
//! socket setup happen before a stream is handed to [`Link::from_io`].

pub mod connection;
pub mod link;

pub use connection::{Connection, IncomingSession, ResetSignal, SessionChannel};
pub use link::Link;
