//! Axis-aligned bounding boxes and the slab intersection test.

use rayweave_math::{Mat4, Point3, Vec3};
use rayweave_core::Ray;

/// An axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    /// Minimum corner.
    pub min: Point3,
    /// Maximum corner.
    pub max: Point3,
}

impl Aabb {
    /// The empty box (inverted bounds; any `include` fixes it up).
    pub fn empty() -> Self {
        Self {
            min: Point3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY),
            max: Point3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
        }
    }

    /// Box from explicit corners.
    pub fn new(min: Point3, max: Point3) -> Self {
        Self { min, max }
    }

    /// Tight box around a point set.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3>) -> Self {
        let mut b = Self::empty();
        for p in points {
            b.include_point(p);
        }
        b
    }

    /// Grow to include a point.
    pub fn include_point(&mut self, p: &Point3) {
        self.min = Point3::new(self.min.x.min(p.x), self.min.y.min(p.y), self.min.z.min(p.z));
        self.max = Point3::new(self.max.x.max(p.x), self.max.y.max(p.y), self.max.z.max(p.z));
    }

    /// Grow to include another box.
    pub fn include(&mut self, other: &Aabb) {
        self.include_point(&other.min);
        self.include_point(&other.max);
    }

    /// Center of the box.
    pub fn centroid(&self) -> Point3 {
        Point3::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
            (self.min.z + self.max.z) * 0.5,
        )
    }

    /// Surface area, the SAH cost measure.
    pub fn surface_area(&self) -> f32 {
        let d = self.max - self.min;
        if d.x < 0.0 || d.y < 0.0 || d.z < 0.0 {
            return 0.0;
        }
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// The box covering this box under an affine transform (transforms
    /// all eight corners).
    pub fn transformed(&self, m: &Mat4) -> Aabb {
        let mut out = Aabb::empty();
        for i in 0..8 {
            let corner = Point3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.include_point(&m.transform_point(&corner));
        }
        out
    }
}

/// A ray prepared for repeated slab tests: precomputed reciprocal
/// direction and sign bits.
#[derive(Debug, Clone, Copy)]
pub struct SlabRay {
    /// Ray origin.
    pub origin: Point3,
    inv_direction: Vec3,
    sign: [usize; 3],
    /// Upper bound on the usable parameter range.
    pub t_max: f32,
}

impl SlabRay {
    /// Prepare a ray for traversal.
    pub fn new(ray: &Ray) -> Self {
        Self::from_parts(ray.origin_point(), ray.direction_vec(), ray.t_max)
    }

    /// Prepare a raw origin/direction pair for traversal.
    ///
    /// The direction need not be normalized; adapters traverse in object
    /// space where the transformed direction keeps the world-space
    /// parameterization.
    pub fn from_parts(origin: Point3, dir: Vec3, t_max: f32) -> Self {
        let inv = Vec3::new(1.0 / dir.x, 1.0 / dir.y, 1.0 / dir.z);
        Self {
            origin,
            inv_direction: inv,
            sign: [
                (inv.x < 0.0) as usize,
                (inv.y < 0.0) as usize,
                (inv.z < 0.0) as usize,
            ],
            t_max,
        }
    }

    /// Slab test. Returns `Some((t_entry, t_exit))` clamped to the
    /// forward half-line, `None` on a miss. Axis-aligned rays produce
    /// infinities that fall out of the comparisons correctly.
    #[inline]
    pub fn intersect_aabb(&self, aabb: &Aabb) -> Option<(f32, f32)> {
        let bounds = [aabb.min, aabb.max];

        let tx1 = (bounds[self.sign[0]].x - self.origin.x) * self.inv_direction.x;
        let tx2 = (bounds[1 - self.sign[0]].x - self.origin.x) * self.inv_direction.x;

        let mut t_min = tx1;
        let mut t_max = tx2;

        let ty1 = (bounds[self.sign[1]].y - self.origin.y) * self.inv_direction.y;
        let ty2 = (bounds[1 - self.sign[1]].y - self.origin.y) * self.inv_direction.y;

        t_min = t_min.max(ty1);
        t_max = t_max.min(ty2);

        let tz1 = (bounds[self.sign[2]].z - self.origin.z) * self.inv_direction.z;
        let tz2 = (bounds[1 - self.sign[2]].z - self.origin.z) * self.inv_direction.z;

        t_min = t_min.max(tz1);
        t_max = t_max.min(tz2);

        if t_max >= t_min && t_max >= 0.0 {
            Some((t_min.max(0.0), t_max))
        } else {
            None
        }
    }
}
