//! TURN client support for Tokio
//!
//! [TURN](https://tools.ietf.org/html/rfc5766) (Traversal Using Relays
//! around NAT) lets a host behind a restrictive NAT exchange UDP datagrams
//! with peers through a public relay. This crate implements the client
//! side: it speaks STUN/TURN over one pre-established datagram transport to
//! one server and keeps the server-side state alive for you.
//!
//! The entry point is [`Client`]. From a client you lease an
//! [`Allocation`] (a public relayed address), from an allocation you
//! install a [`Permission`] (the right to talk to one peer IP), and from a
//! permission you open a [`PeerConnection`] (a stream-like endpoint for one
//! peer address). Each object owns the periodic refresh traffic that keeps
//! its server-side counterpart from expiring, and closing an object tears
//! down everything it owns.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use turn_client::{Client, Options};
//!
//! let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
//! socket.connect("turn.example.org:3478").await?;
//!
//! let client = Client::new(
//!     socket,
//!     Options {
//!         username: "user".into(),
//!         password: "secret".into(),
//!         ..Options::default()
//!     },
//! )?;
//! let allocation = client.allocate().await?;
//! let peer = "198.51.100.7:9000".parse()?;
//! let permission = allocation.create("198.51.100.7".parse()?).await?;
//! let conn = permission.create_udp(peer)?;
//! conn.write(b"hello").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(missing_debug_implementations)]

use std::io;

use thiserror::Error as ThisError;

mod allocation;
mod attr;
mod auth;
mod chandata;
mod client;
mod connection;
mod mux;
mod permission;
mod transport;


pub use crate::allocation::Allocation;
pub use crate::chandata::{MAX_CHANNEL_NUMBER, MIN_CHANNEL_NUMBER};
pub use crate::client::{Client, Options};
pub use crate::connection::PeerConnection;
pub use crate::permission::Permission;
pub use crate::transport::Conn;

/// Errors reported by client operations.
///
/// Background refresh loops never surface these; they log and keep going.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    /// The transport failed; the client is unusable.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bytecodec::Error),
    /// An inbound STUN message had a valid shape but a broken body.
    #[error("malformed STUN message")]
    MalformedMessage,
    /// No response arrived within the transaction deadline.
    #[error("transaction timed out")]
    TimedOut,
    /// The client, allocation, permission or connection is closed.
    #[error("closed")]
    Closed,
    /// The server answered with an unexpected method or class.
    #[error("unexpected response type {0}")]
    UnexpectedResponse(String),
    /// The server reported an error other than the ones handled internally.
    #[error("unexpected error response: {code} {reason}")]
    ErrorResponse {
        /// STUN error code, e.g. 400.
        code: u16,
        /// Server-supplied reason phrase.
        reason: String,
    },
    /// Authentication failed, or the server demanded credentials the
    /// client does not have.
    #[error("unauthorized")]
    Unauthorized,
    /// A required attribute was missing from a response.
    #[error("response missing attribute {0}")]
    MissingAttribute(&'static str),
    /// The client already has a live allocation.
    #[error("allocation already exists for this client")]
    AllocationInUse,
    /// The connection already has a bound channel number.
    #[error("channel already bound")]
    AlreadyBound,
    /// The operation requires a bound channel number.
    #[error("channel is not bound")]
    NotBound,
    /// Every channel number of the allocation has been issued.
    #[error("channel numbers exhausted")]
    ChannelsExhausted,
    /// The payload does not fit a single frame.
    #[error("payload too large for a single datagram")]
    PayloadTooLarge,
    /// Functionality that is not currently implemented.
    #[error("functionality not implemented")]
    NotImplemented,
}
