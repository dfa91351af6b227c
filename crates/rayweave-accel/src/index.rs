//! Top-level domain router: which instance does a ray enter next?

use rayon::prelude::*;
use rayweave_core::{Instance, Ray};

use crate::aabb::{Aabb, SlabRay};
use crate::bvh::Bvh;

/// Result of routing one ray: the next instance to visit (or −1) and
/// the parametric entry distance into its bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainHit {
    /// Next instance id, −1 when the ray leaves the scene.
    pub next: i32,
    /// Entry distance into that instance's bounds.
    pub t_enter: f32,
}

impl DomainHit {
    /// The "leaves the scene" value.
    pub fn miss() -> Self {
        Self {
            next: -1,
            t_enter: 0.0,
        }
    }
}

/// Top-level BVH over instance world bounds, built once per frame.
///
/// Rays advanced into a domain sit slightly inside its box, so the
/// router must skip the instance just traced (`exclude`) and every
/// instance in the ray's visited mask; otherwise a ray would bounce
/// between overlapping boxes forever.
pub struct AccelIndex {
    bvh: Bvh,
    bounds: Vec<Aabb>,
    ids: Vec<i32>,
}

impl AccelIndex {
    /// Build the router over the instance list.
    pub fn build(instances: &[Instance]) -> Self {
        let mut bounds = Vec::with_capacity(instances.len());
        let mut ids = Vec::with_capacity(instances.len());
        let mut prims = Vec::with_capacity(instances.len());
        for (slot, inst) in instances.iter().enumerate() {
            let local = Aabb::from_points(&inst.mesh.positions);
            let world = local.transformed(&inst.transform);
            bounds.push(world);
            ids.push(inst.id);
            prims.push((slot as u32, world));
        }
        Self {
            bvh: Bvh::build(&prims),
            bounds,
            ids,
        }
    }

    /// Route a single ray.
    pub fn next_domain(&self, ray: &Ray, exclude: i32) -> DomainHit {
        let slab = SlabRay::new(ray);
        let hit = self.bvh.closest(&slab, |slot| {
            let id = self.ids[slot as usize];
            if id == exclude || ray.has_visited(id) {
                return None;
            }
            slab.intersect_aabb(&self.bounds[slot as usize])
                .map(|(t_entry, _)| t_entry)
                .filter(|&t| t < slab.t_max)
        });
        match hit {
            Some((slot, t)) => DomainHit {
                next: self.ids[slot as usize],
                t_enter: t,
            },
            None => DomainHit::miss(),
        }
    }

    /// Route a batch of rays in parallel chunks.
    ///
    /// Chunking matches the tracer's shuffle granularity so small
    /// batches stay on one thread.
    pub fn next_domains(&self, rays: &[Ray], exclude: i32) -> Vec<DomainHit> {
        if rays.is_empty() {
            return Vec::new();
        }
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let chunk = (rays.len() / (cores * 4)).max(2);
        rays.par_chunks(chunk)
            .flat_map_iter(|chunk| chunk.iter().map(|r| self.next_domain(r, exclude)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayweave_core::{Material, Mesh};
    use rayweave_math::{Mat4, Point3, Vec3};
    use std::sync::Arc;

    fn unit_cube_mesh() -> Arc<Mesh> {
        // Two corner triangles are enough to span the unit bounds.
        Arc::new(Mesh::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 1.0),
                Point3::new(0.0, 1.0, 1.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
            Material::lambert(Vec3::new(1.0, 1.0, 1.0)),
        ))
    }

    fn two_instances() -> Vec<Instance> {
        let mesh = unit_cube_mesh();
        vec![
            Instance::new(0, mesh.clone(), 0, Mat4::identity()).unwrap(),
            Instance::new(
                1,
                mesh,
                1,
                Mat4::new_translation(&Vec3::new(3.0, 0.0, 0.0)),
            )
            .unwrap(),
        ]
    }

    #[test]
    fn test_routes_to_nearest_instance() {
        let index = AccelIndex::build(&two_instances());
        let ray = Ray::primary(Point3::new(-2.0, 0.5, 0.5), Vec3::new(1.0, 0.0, 0.0), 0, 1);
        let hit = index.next_domain(&ray, -1);
        assert_eq!(hit.next, 0);
        assert!((hit.t_enter - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_exclude_skips_current_domain() {
        let index = AccelIndex::build(&two_instances());
        let ray = Ray::primary(Point3::new(-2.0, 0.5, 0.5), Vec3::new(1.0, 0.0, 0.0), 0, 1);
        let hit = index.next_domain(&ray, 0);
        assert_eq!(hit.next, 1);
        assert!((hit.t_enter - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_visited_mask_skips_domain() {
        let index = AccelIndex::build(&two_instances());
        let mut ray = Ray::primary(Point3::new(-2.0, 0.5, 0.5), Vec3::new(1.0, 0.0, 0.0), 0, 1);
        ray.mark_visited(0);
        ray.mark_visited(1);
        assert_eq!(index.next_domain(&ray, -1), DomainHit::miss());
    }

    #[test]
    fn test_escaping_ray_misses() {
        let index = AccelIndex::build(&two_instances());
        let ray = Ray::primary(Point3::new(-2.0, 0.5, 0.5), Vec3::new(-1.0, 0.0, 0.0), 0, 1);
        assert_eq!(index.next_domain(&ray, -1).next, -1);
    }

    #[test]
    fn test_shadow_t_max_bounds_routing() {
        let index = AccelIndex::build(&two_instances());
        let mut ray = Ray::primary(Point3::new(-2.0, 0.5, 0.5), Vec3::new(1.0, 0.0, 0.0), 0, 1);
        ray.t_max = 1.0; // light closer than any domain
        assert_eq!(index.next_domain(&ray, -1).next, -1);
    }

    #[test]
    fn test_routing_is_stable_after_advance() {
        // A ray advanced partway toward its entry point must route to
        // the same destination on the next pass.
        let index = AccelIndex::build(&two_instances());
        let mut ray = Ray::primary(Point3::new(-2.0, 0.5, 0.5), Vec3::new(1.0, 0.0, 0.0), 0, 1);
        let first = index.next_domain(&ray, -1);
        assert_eq!(first.next, 0);

        ray.advance(0.8 * first.t_enter);
        let second = index.next_domain(&ray, -1);
        assert_eq!(second.next, first.next);
        assert!(second.t_enter < first.t_enter);
    }

    #[test]
    fn test_batch_matches_single() {
        let index = AccelIndex::build(&two_instances());
        let rays: Vec<Ray> = (0..64)
            .map(|i| {
                Ray::primary(
                    Point3::new(-2.0, 0.5, 0.5),
                    Vec3::new(1.0, (i as f32) * 1e-4, 0.0),
                    i,
                    1,
                )
            })
            .collect();
        let batch = index.next_domains(&rays, -1);
        for (ray, hit) in rays.iter().zip(&batch) {
            assert_eq!(*hit, index.next_domain(ray, -1));
        }
    }
}
