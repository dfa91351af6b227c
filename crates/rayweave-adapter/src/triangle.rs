//! Ray-triangle intersection.

use rayweave_math::{Point3, Vec3};

/// Minimum accepted hit distance, to reject self-intersections at the
/// ray origin.
pub(crate) const T_MIN: f32 = 1e-5;

/// Möller–Trumbore ray-triangle intersection, both-sided.
///
/// Returns `(t, u, v)` with `t` in `(T_MIN, t_max)` and `(u, v)` the
/// barycentric coordinates of the hit, or `None`.
#[inline]
pub fn intersect_triangle(
    origin: Point3,
    dir: Vec3,
    v0: Point3,
    v1: Point3,
    v2: Point3,
    t_max: f32,
) -> Option<(f32, f32, f32)> {
    let e1 = v1 - v0;
    let e2 = v2 - v0;

    let p = dir.cross(&e2);
    let det = e1.dot(&p);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;

    let s = origin - v0;
    let u = s.dot(&p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(&e1);
    let v = dir.dot(&q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = e2.dot(&q) * inv_det;
    if t > T_MIN && t < t_max {
        Some((t, u, v))
    } else {
        None
    }
}
