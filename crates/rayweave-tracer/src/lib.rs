#![warn(missing_docs)]

//! Domain-parallel frame loop, ray transfer plane, and termination
//! protocol.
//!
//! A frame proceeds rank-locally: primary rays are filtered into
//! per-instance queues, the heaviest owned queue is traced through its
//! mesh adapter, and outgoing rays are re-routed by the top-level BVH
//! into another local queue, across the wire to the owning rank, or
//! into the framebuffer. A two-phase-commit vote across ranks decides
//! when no ray exists anywhere, and only then does the frame composite.

mod config;
mod framebuffer;
mod instance_map;
mod queues;
mod tracer;
mod voter;

use thiserror::Error;

pub use config::TracerConfig;
pub use framebuffer::FrameBuffer;
pub use instance_map::InstanceMap;
pub use queues::RayQueueSet;
pub use tracer::{DomainTracer, FrameStats};
pub use voter::{TpcVoter, VoteLink, COORDINATOR};

/// Fatal frame errors.
///
/// Local recoverable conditions (empty queue on select, adapter-cache
/// miss) never surface here; they are ordinary control flow. Anything
/// that would corrupt global state is a panic, not an error value.
#[derive(Error, Debug)]
pub enum TraceError {
    /// Invalid scene or film setup; detected before tracing starts.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The transport failed; the frame cannot complete.
    #[error(transparent)]
    Transport(#[from] rayweave_comm::CommError),
}

/// Result type for tracer operations.
pub type Result<T> = std::result::Result<T, TraceError>;
