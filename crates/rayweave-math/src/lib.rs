#![warn(missing_docs)]

//! Math types for the rayweave tracing kernel.
//!
//! Thin wrappers around nalgebra providing domain-specific types for
//! distributed ray tracing: points, vectors, directions, instance
//! transforms, and tolerance constants. Geometry is single precision
//! throughout because rays cross the wire as packed `f32` structs.

use nalgebra::{Matrix3, Matrix4, Unit, Vector3};

/// A point in 3D space.
pub type Point3 = nalgebra::Point3<f32>;

/// A vector in 3D space.
pub type Vec3 = Vector3<f32>;

/// A unit (normalized) direction vector in 3D space.
pub type Dir3 = Unit<Vector3<f32>>;

/// A 4x4 affine transformation matrix.
pub type Mat4 = Matrix4<f32>;

/// A 3x3 matrix (upper-left inverse transpose, used for normals).
pub type Mat3 = Matrix3<f32>;

/// Machine epsilon for `f32`, the unit used in self-intersection offsets.
pub const EPS: f32 = f32::EPSILON;

/// Tolerance below which an axis extent is treated as degenerate.
pub const DEGENERATE_EXTENT: f32 = 1e-10;

/// Compute the normal-transform matrix for an instance transform:
/// the transpose of the inverse of the upper-left 3x3 block.
///
/// Returns `None` when the linear part is singular.
pub fn normal_matrix(transform: &Mat4) -> Option<Mat3> {
    let linear = transform.fixed_view::<3, 3>(0, 0).into_owned();
    linear.try_inverse().map(|inv| inv.transpose())
}

/// Build an orthonormal basis `(x, y, z)` around a unit vector `y`.
///
/// The construction picks the smallest component of `y` as the helper
/// axis so the cross products stay well conditioned.
pub fn orthonormal_basis(y: Vec3) -> (Vec3, Vec3, Vec3) {
    let mut h = y;
    let ax = y.x.abs();
    let ay = y.y.abs();
    let az = y.z.abs();
    if ax <= ay && ax <= az {
        h.x = 1.0;
    } else if ay <= ax && ay <= az {
        h.y = 1.0;
    } else {
        h.z = 1.0;
    }
    let x = h.cross(&y).normalize();
    let z = x.cross(&y).normalize();
    (x, y, z)
}
