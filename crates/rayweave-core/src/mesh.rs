//! Indexed triangle mesh.

use rayweave_math::{Point3, Vec3};

use crate::Material;

/// An indexed triangle mesh with a single material.
///
/// Created at scene load and shared behind `Arc`; immutable for the
/// frame. Per-vertex normals are generated area-weighted when the
/// source data carries none.
#[derive(Debug, Clone)]
pub struct Mesh {
    /// Vertex positions.
    pub positions: Vec<Point3>,
    /// Per-vertex unit normals, same length as `positions`.
    pub normals: Vec<Vec3>,
    /// Triangle vertex indices.
    pub indices: Vec<[u32; 3]>,
    /// Surface material.
    pub material: Material,
}

impl Mesh {
    /// Build a mesh from positions and triangle indices, generating
    /// area-weighted vertex normals.
    pub fn new(positions: Vec<Point3>, indices: Vec<[u32; 3]>, material: Material) -> Self {
        let mut mesh = Self {
            positions,
            normals: Vec::new(),
            indices,
            material,
        };
        mesh.generate_normals();
        mesh
    }

    /// Number of triangles.
    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    /// The three corner positions of triangle `i`.
    #[inline]
    pub fn triangle(&self, i: usize) -> [Point3; 3] {
        let [a, b, c] = self.indices[i];
        [
            self.positions[a as usize],
            self.positions[b as usize],
            self.positions[c as usize],
        ]
    }

    /// Interpolate the shading normal of triangle `i` at barycentric
    /// coordinates `(u, v)`.
    #[inline]
    pub fn shading_normal(&self, i: usize, u: f32, v: f32) -> Vec3 {
        let [a, b, c] = self.indices[i];
        let na = self.normals[a as usize];
        let nb = self.normals[b as usize];
        let nc = self.normals[c as usize];
        (na * (1.0 - u - v) + nb * u + nc * v).normalize()
    }

    /// Regenerate per-vertex normals, area-weighted by incident faces.
    pub fn generate_normals(&mut self) {
        let mut accum = vec![Vec3::zeros(); self.positions.len()];
        for [a, b, c] in &self.indices {
            let p0 = self.positions[*a as usize];
            let p1 = self.positions[*b as usize];
            let p2 = self.positions[*c as usize];
            // Cross product length carries the area weight.
            let n = (p1 - p0).cross(&(p2 - p0));
            accum[*a as usize] += n;
            accum[*b as usize] += n;
            accum[*c as usize] += n;
        }
        self.normals = accum
            .into_iter()
            .map(|n| {
                let len = n.norm();
                if len > 0.0 {
                    n / len
                } else {
                    Vec3::new(0.0, 0.0, 1.0)
                }
            })
            .collect();
    }
}
