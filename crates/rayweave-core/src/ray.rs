//! The packed ray struct that crosses queues and the wire.

use bytemuck::{Pod, Zeroable};
use rayweave_math::{Point3, Vec3};

/// Size of one ray on the wire, in bytes.
///
/// Rays are serialized by bitwise copy, so this is also `size_of::<Ray>()`;
/// a test asserts the two never drift apart.
pub const RAY_WIRE_SIZE: usize = 72;

/// Classification of a ray within the transport and shading pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RayKind {
    /// Camera ray, generated by the host for a film pixel.
    Primary = 0,
    /// Bounce ray spawned by Russian roulette at a hit point.
    Secondary = 1,
    /// Occlusion probe toward a light, carrying pre-shaded color.
    Shadow = 2,
}

/// A ray in flight.
///
/// Plain-old-data: every field is fixed width and the struct has no
/// padding, so a `RayVector` can be moved between ranks as raw bytes.
/// `weight` is the Russian-roulette survival weight in `(0, 1]`; `color`
/// accumulates shaded RGB plus the contribution alpha.
///
/// Invariant: a `Shadow` ray has finite `t_max` equal to its light
/// distance; `Primary` and `Secondary` rays carry `t_max = +inf` until
/// they hit.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Ray {
    /// Ray origin.
    pub origin: [f32; 3],
    /// Unit direction.
    pub direction: [f32; 3],
    /// Accumulated color (RGB) and contribution alpha.
    pub color: [f32; 4],
    /// Parametric distance of the current hit.
    pub t: f32,
    /// Maximum parametric distance.
    pub t_max: f32,
    /// Russian-roulette survival weight.
    pub weight: f32,
    /// Stable id across bounces; indexes the film pixel.
    pub id: i32,
    /// Remaining bounce budget.
    pub depth: i32,
    /// Discriminant for [`RayKind`].
    pub kind: i32,
    /// Visited-domain bitmask, bit `instance_id % 64`.
    pub visited: u64,
}

/// The unit of queueing and wire batching.
pub type RayVector = Vec<Ray>;

impl Ray {
    /// Create a primary ray for film pixel `id` with `depth` bounces left.
    pub fn primary(origin: Point3, direction: Vec3, id: i32, depth: i32) -> Self {
        let dir = direction.normalize();
        Self {
            origin: [origin.x, origin.y, origin.z],
            direction: [dir.x, dir.y, dir.z],
            color: [0.0; 4],
            t: 0.0,
            t_max: f32::INFINITY,
            weight: 1.0,
            id,
            depth,
            kind: RayKind::Primary as i32,
            visited: 0,
        }
    }

    /// The ray kind as an enum.
    #[inline]
    pub fn kind(&self) -> RayKind {
        match self.kind {
            0 => RayKind::Primary,
            1 => RayKind::Secondary,
            _ => RayKind::Shadow,
        }
    }

    /// Origin as a point.
    #[inline]
    pub fn origin_point(&self) -> Point3 {
        Point3::new(self.origin[0], self.origin[1], self.origin[2])
    }

    /// Direction as a vector.
    #[inline]
    pub fn direction_vec(&self) -> Vec3 {
        Vec3::new(self.direction[0], self.direction[1], self.direction[2])
    }

    /// Evaluate the ray at parameter `t`.
    #[inline]
    pub fn at(&self, t: f32) -> Point3 {
        self.origin_point() + self.direction_vec() * t
    }

    /// Advance the origin along the direction by `dist`.
    ///
    /// A finite `t_max` (shadow rays) shrinks by the same amount so it
    /// keeps measuring the distance left to the light.
    #[inline]
    pub fn advance(&mut self, dist: f32) {
        let p = self.at(dist);
        self.origin = [p.x, p.y, p.z];
        if self.t_max.is_finite() {
            self.t_max = (self.t_max - dist).max(0.0);
        }
    }

    /// Whether the domain bit for `instance_id` is set.
    #[inline]
    pub fn has_visited(&self, instance_id: i32) -> bool {
        self.visited & (1u64 << (instance_id.rem_euclid(64))) != 0
    }

    /// Mark `instance_id` as visited.
    #[inline]
    pub fn mark_visited(&mut self, instance_id: i32) {
        self.visited |= 1u64 << (instance_id.rem_euclid(64));
    }

    /// Clear the visited set (done when a secondary is spawned).
    #[inline]
    pub fn clear_visited(&mut self) {
        self.visited = 0;
    }
}
