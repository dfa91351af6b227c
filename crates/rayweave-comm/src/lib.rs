#![warn(missing_docs)]

//! Tagged message transport for rayweave worlds.
//!
//! A world is `size` peers addressed by integer rank. Every message is
//! an [`Envelope`] header plus payload bytes, classified by a system
//! tag (system / user / vote) and a per-class user tag assigned once at
//! process start. The [`Communicator`] owns a send thread and a
//! dispatcher thread; the tracer never blocks on the wire.
//!
//! The wire itself is abstracted behind [`Transport`]; the in-process
//! [`ChannelWorld`] implementation provides a full mesh of FIFO
//! channels, which is what the tests and single-host multi-rank runs
//! use.

mod communicator;
mod message;
mod transport;
mod works;

use thiserror::Error;

pub use communicator::{Communicator, MessageHandler};
pub use message::{
    register_message_class, Envelope, Message, SystemTag, Work, ENVELOPE_SIZE, RAY_SCHEMA_VERSION,
};
pub use transport::{ChannelWorld, Transport};
pub use works::{Command, RemoteRays, TransferType, Vote, VoteKind};

/// Transport failures. All fatal: the frame cannot recover from a lost
/// or corrupt peer link.
#[derive(Error, Debug)]
pub enum CommError {
    /// Peer channel gone.
    #[error("peer {0} unreachable")]
    PeerUnreachable(i32),
    /// Inbound byte stream failed to decode.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The world has shut down.
    #[error("transport closed")]
    Closed,
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, CommError>;
