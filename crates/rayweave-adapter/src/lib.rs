#![warn(missing_docs)]

//! Per-mesh intersection adapters.
//!
//! An [`Adapter`] consumes a queue of rays for one instance and produces
//! the rays that leave it: escaping primaries and secondaries, plus
//! unoccluded shadow rays carrying pre-shaded color. All intersection
//! math happens in object space; the tracer never sees a triangle.
//!
//! The built-in [`MeshAdapter`] intersects indexed triangle meshes over
//! a per-mesh BVH. Adapters are cached per mesh and reused across the
//! frame via [`AdapterCache`].

mod cache;
mod mesh_adapter;
mod triangle;

use rayweave_core::{Instance, Light, RayVector};

pub use cache::AdapterCache;
pub use mesh_adapter::MeshAdapter;
pub use triangle::intersect_triangle;

/// Frame-wide context handed to every trace call.
///
/// Worker RNGs derive from `frame_seed ^ worker_index`, so a frame is
/// reproducible regardless of scheduling.
#[derive(Debug, Clone, Copy)]
pub struct TraceContext {
    /// Seed shared by the whole frame.
    pub frame_seed: u64,
    /// Worker threads per adapter call.
    pub threads: usize,
}

impl TraceContext {
    /// Context with the hardware thread count.
    pub fn new(frame_seed: u64) -> Self {
        Self {
            frame_seed,
            threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

/// The intersection contract between the tracer and a mesh backend.
///
/// `rays` is drained: every input ray is either appended to `moved`
/// (escaped, or forwarded as a secondary/shadow) or dropped because it
/// terminated with no contribution.
pub trait Adapter: Send + Sync {
    /// Trace a batch of rays against one instance.
    fn trace(
        &self,
        rays: &mut RayVector,
        moved: &mut RayVector,
        instance: &Instance,
        lights: &[Light],
        ctx: &TraceContext,
    );
}
