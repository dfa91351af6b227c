//! Instance: a placement of a mesh in the world.

use std::sync::Arc;

use rayweave_math::{normal_matrix, Mat3, Mat4};

use crate::Mesh;

/// A placement of a mesh with its own transform.
///
/// Created at scene load, immutable for the frame. The inverse and
/// normal matrices are computed once so adapters never invert per ray.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Instance id; doubles as the domain id for scheduling.
    pub id: i32,
    /// Object-to-world transform.
    pub transform: Mat4,
    /// World-to-object transform.
    pub inverse: Mat4,
    /// Upper-3x3 inverse transpose, for normals.
    pub normal_matrix: Mat3,
    /// The placed mesh.
    pub mesh: Arc<Mesh>,
    /// Position of the mesh in the ordered scene mesh list; drives
    /// rank ownership.
    pub data_index: usize,
}

impl Instance {
    /// Build an instance, precomputing the inverse transforms.
    ///
    /// Returns `None` when `transform` is singular.
    pub fn new(id: i32, mesh: Arc<Mesh>, data_index: usize, transform: Mat4) -> Option<Self> {
        let inverse = transform.try_inverse()?;
        let normal_matrix = normal_matrix(&transform)?;
        Some(Self {
            id,
            transform,
            inverse,
            normal_matrix,
            mesh,
            data_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Material;
    use rayweave_math::{Point3, Vec3};

    fn tri_mesh() -> Arc<Mesh> {
        Arc::new(Mesh::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2]],
            Material::lambert(Vec3::new(1.0, 1.0, 1.0)),
        ))
    }

    #[test]
    fn test_inverse_round_trip() {
        let m = Mat4::new_translation(&Vec3::new(3.0, 0.0, 0.0));
        let inst = Instance::new(0, tri_mesh(), 0, m).unwrap();
        let p = Point3::new(4.0, 0.0, 0.0);
        let local = inst.inverse.transform_point(&p);
        assert!((local.x - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_singular_transform_rejected() {
        let m = Mat4::new_nonuniform_scaling(&Vec3::new(1.0, 0.0, 1.0));
        assert!(Instance::new(0, tri_mesh(), 0, m).is_none());
    }
}
