#![warn(missing_docs)]

//! Bounding volume hierarchies and domain routing for rayweave.
//!
//! Two layers share one SAH-built [`Bvh`]:
//!
//! - [`AccelIndex`], the top-level hierarchy over instance bounds that
//!   resolves, per ray, the next domain to visit;
//! - mesh adapters reuse the same tree over triangle bounds for
//!   object-space intersection.
//!
//! Construction uses a 12-bucket surface-area-heuristic sweep with a
//! midpoint fallback on degenerate partitions.

mod aabb;
mod bvh;
mod index;

pub use aabb::{Aabb, SlabRay};
pub use bvh::Bvh;
pub use index::{AccelIndex, DomainHit};
