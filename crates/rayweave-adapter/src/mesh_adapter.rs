//! The built-in triangle-mesh adapter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayweave_accel::{Aabb, Bvh, SlabRay};
use rayweave_core::{cosine_hemisphere, Instance, Light, Mesh, Ray, RayKind, RayVector};
use rayweave_math::{Point3, Vec3, EPS};

use crate::triangle::intersect_triangle;
use crate::{Adapter, TraceContext};

/// Offset factor keeping spawned rays on the correct side of the
/// surface, about 8 ULPs of `t`. Technique from "Robust BVH Ray
/// Traversal" (Ize).
const SELF_INTERSECT_MULTIPLIER: f32 = 1.0 - 16.0 * EPS;

/// Software intersector for an indexed triangle mesh.
///
/// Holds a SAH BVH over the mesh's triangles in object space. One
/// adapter serves every instance of its mesh; the instance transform
/// arrives with each trace call.
pub struct MeshAdapter {
    mesh: Arc<Mesh>,
    bvh: Bvh,
}

/// Object-space view of one incoming ray.
struct ObjectRay {
    origin: Point3,
    dir: Vec3,
}

impl MeshAdapter {
    /// Build the per-mesh BVH.
    pub fn new(mesh: Arc<Mesh>) -> Self {
        let prims: Vec<(u32, Aabb)> = (0..mesh.triangle_count())
            .map(|i| {
                let [a, b, c] = mesh.triangle(i);
                (i as u32, Aabb::from_points([&a, &b, &c]))
            })
            .collect();
        Self {
            bvh: Bvh::build(&prims),
            mesh,
        }
    }

    fn to_object(&self, ray: &Ray, instance: &Instance) -> ObjectRay {
        // Directions are transformed without renormalizing so object-space
        // t stays in world units.
        ObjectRay {
            origin: instance.inverse.transform_point(&ray.origin_point()),
            dir: instance.inverse.transform_vector(&ray.direction_vec()),
        }
    }

    /// Closest triangle hit in world-unit `t`, with barycentrics.
    fn closest_hit(&self, ray: &Ray, instance: &Instance) -> Option<(usize, f32, f32, f32)> {
        let obj = self.to_object(ray, instance);
        let slab = SlabRay::from_parts(obj.origin, obj.dir, ray.t_max);
        let (prim, t) = self.bvh.closest(&slab, |p| {
            let [v0, v1, v2] = self.mesh.triangle(p as usize);
            intersect_triangle(obj.origin, obj.dir, v0, v1, v2, ray.t_max).map(|(t, _, _)| t)
        })?;
        // Re-run the winning triangle to recover the barycentrics; the
        // bound must sit strictly above t at any magnitude.
        let [v0, v1, v2] = self.mesh.triangle(prim as usize);
        let (t, u, v) = intersect_triangle(obj.origin, obj.dir, v0, v1, v2, t * 1.001 + 1e-4)?;
        Some((prim as usize, t, u, v))
    }

    /// Whether anything blocks the ray before `t_max`.
    fn occluded(&self, ray: &Ray, instance: &Instance) -> bool {
        let obj = self.to_object(ray, instance);
        let slab = SlabRay::from_parts(obj.origin, obj.dir, ray.t_max);
        self.bvh.any_hit(&slab, |p| {
            let [v0, v1, v2] = self.mesh.triangle(p as usize);
            intersect_triangle(obj.origin, obj.dir, v0, v1, v2, ray.t_max).is_some()
        })
    }

    /// One pre-shaded shadow ray per light; positional lights are
    /// occlusion-tested against this mesh before dispatch, ambient
    /// contributions pass through with `t_max = 0` so the shuffle
    /// deposits them immediately.
    fn generate_shadow_rays(
        &self,
        ray: &Ray,
        normal: Vec3,
        instance: &Instance,
        lights: &[Light],
        dispatch: &mut RayVector,
    ) {
        let t_shadow = SELF_INTERSECT_MULTIPLIER * ray.t;
        let origin = ray.at(t_shadow);

        for light in lights {
            let mut shadow = *ray;
            shadow.kind = RayKind::Shadow as i32;
            shadow.origin = [origin.x, origin.y, origin.z];
            shadow.t = ray.t;
            // Fresh visited set: the probe must be occlusion-tested in
            // every domain its segment crosses, wherever the parent came
            // from.
            shadow.clear_visited();

            let positional = match light.sample_direction(origin) {
                Some((dir, dist)) => {
                    shadow.direction = [dir.x, dir.y, dir.z];
                    shadow.t_max = dist;
                    true
                }
                None => {
                    shadow.t_max = 0.0;
                    false
                }
            };

            let c = self.mesh.material.shade(&shadow, normal, light) * ray.weight;
            shadow.color = [c.x, c.y, c.z, 1.0];

            if !positional || !self.occluded(&shadow, instance) {
                dispatch.push(shadow);
            }
        }
    }

    /// Trace one ray to termination inside this domain.
    ///
    /// Secondaries replace the current ray and keep bouncing until the
    /// roulette kills them or they leave the mesh; the outer router then
    /// decides which domain sees them next.
    fn process_ray(
        &self,
        mut ray: Ray,
        instance: &Instance,
        lights: &[Light],
        rng: &mut SmallRng,
        dispatch: &mut RayVector,
    ) {
        if ray.kind() == RayKind::Shadow {
            if !self.occluded(&ray, instance) {
                dispatch.push(ray);
            }
            return;
        }

        loop {
            let Some((prim, t, u, v)) = self.closest_hit(&ray, instance) else {
                // No hit in this domain; pass the ray back to the router.
                dispatch.push(ray);
                return;
            };

            ray.t = t;
            let normal = (instance.normal_matrix * self.mesh.shading_normal(prim, u, v)).normalize();

            if ray.kind() == RayKind::Secondary {
                let att = if t > 1.0 { 1.0 / t } else { t };
                ray.weight *= att;
            }

            self.generate_shadow_rays(&ray, normal, instance, lights, dispatch);

            let ndepth = ray.depth - 1;
            let p: f32 = rng.gen();
            if ndepth > 0 && ray.weight > p {
                // Roulette survived: respawn in place as a secondary.
                ray.clear_visited();
                ray.kind = RayKind::Secondary as i32;
                ray.advance(SELF_INTERSECT_MULTIPLIER * ray.t);
                let dir = cosine_hemisphere(normal, rng);
                ray.direction = [dir.x, dir.y, dir.z];
                ray.weight *= dir.dot(&normal).max(0.0);
                ray.depth = ndepth;
            } else {
                // Terminated with no further contribution.
                return;
            }
        }
    }

    fn worker(
        &self,
        input: &[Ray],
        shared: &AtomicUsize,
        work_size: usize,
        worker_index: usize,
        instance: &Instance,
        lights: &[Light],
        ctx: &TraceContext,
    ) -> RayVector {
        let mut rng = SmallRng::seed_from_u64(ctx.frame_seed ^ worker_index as u64);
        let mut dispatch = RayVector::new();
        loop {
            let start = shared.fetch_add(work_size, Ordering::Relaxed);
            if start >= input.len() {
                return dispatch;
            }
            let end = (start + work_size).min(input.len());
            for ray in &input[start..end] {
                self.process_ray(*ray, instance, lights, &mut rng, &mut dispatch);
            }
        }
    }
}

impl Adapter for MeshAdapter {
    fn trace(
        &self,
        rays: &mut RayVector,
        moved: &mut RayVector,
        instance: &Instance,
        lights: &[Light],
        ctx: &TraceContext,
    ) {
        debug_assert!(Arc::ptr_eq(&self.mesh, &instance.mesh));
        if rays.is_empty() {
            return;
        }

        let shared = AtomicUsize::new(0);
        let threads = ctx.threads.max(1);
        let work_size = (rays.len() / (threads * 8)).max(8);
        let input: &[Ray] = rays.as_slice();

        let results: Vec<RayVector> = thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|w| {
                    let shared = &shared;
                    s.spawn(move || {
                        self.worker(input, shared, work_size, w, instance, lights, ctx)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("adapter worker panicked"))
                .collect()
        });

        for mut local in results {
            moved.append(&mut local);
        }
        rays.clear();
    }
}
