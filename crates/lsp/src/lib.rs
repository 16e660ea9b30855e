//! The Live Sequence Protocol: reliable, ordered, exactly-once messaging
//! over an unreliable datagram substrate.
//!
//! A [`Server`] accepts many concurrent connections; each [`Client`] holds
//! exactly one. Every connection keeps at most one unacknowledged message in
//! flight (a sliding window of one), retransmits on a fixed epoch interval,
//! and declares the peer lost after a configured number of quiet epochs.

mod client;
mod conn;
mod message;
mod server;
mod socket;

pub use client::Client;
pub use message::{Message, MAX_PAYLOAD};
pub use server::Server;

use std::time::Duration;

/// Connection identifier, assigned by the server on CONNECT.
pub type ConnId = u16;

/// Retransmission and liveness parameters, fixed per endpoint at
/// construction. Peers may use different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    /// Interval driving retransmission and liveness checks.
    pub epoch: Duration,
    /// Consecutive quiet epochs after which the peer is declared lost.
    pub epoch_limit: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            epoch: Duration::from_millis(2000),
            epoch_limit: 5,
        }
    }
}

/// An application-visible read outcome from a [`Server`].
///
/// `Closed` is reported exactly once per connection, distinct from "no
/// payload available yet" (which simply keeps the read pending).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The next in-order payload from the identified connection.
    Data(ConnId, bytes::Bytes),
    /// The identified connection drained and closed, or its peer was lost.
    Closed(ConnId),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind datagram socket")]
    Bind(#[source] std::io::Error),
    #[error("connection {0} does not exist")]
    UnknownConn(ConnId),
    #[error("connection is closed")]
    Closed,
    #[error("connect was not acknowledged within the epoch limit")]
    ConnectTimeout,
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte maximum")]
    PayloadTooLarge(usize),
}
