#![warn(missing_docs)]

//! rayweave: domain-parallel distributed ray tracing in Rust.
//!
//! Scene geometry is partitioned into instances ("domains") owned by
//! compute ranks; rays are routed between ranks by a top-level BVH
//! until every ray terminates, and a two-phase-commit vote decides when
//! the frame is globally done.
//!
//! # Example
//!
//! ```rust,no_run
//! use rayweave::{Camera, Scene, TracerConfig};
//! use rayweave::math::{Mat4, Point3, Vec3};
//!
//! let mut scene = Scene::new();
//! let quad = scene.add_mesh(rayweave::Mesh::new(
//!     vec![
//!         Point3::new(-1.0, -1.0, 0.0),
//!         Point3::new(1.0, -1.0, 0.0),
//!         Point3::new(1.0, 1.0, 0.0),
//!         Point3::new(-1.0, 1.0, 0.0),
//!     ],
//!     vec![[0, 1, 2], [0, 2, 3]],
//!     rayweave::Material::lambert(Vec3::new(0.8, 0.8, 0.8)),
//! ));
//! scene.add_instance(quad, Mat4::identity()).unwrap();
//! scene.add_point_light(Point3::new(0.0, 0.0, 5.0), Vec3::new(1.0, 1.0, 1.0));
//!
//! let camera = Camera::look_at(
//!     Point3::new(0.0, 0.0, 4.0),
//!     Point3::new(0.0, 0.0, 0.0),
//!     Vec3::new(0.0, 1.0, 0.0),
//!     55.0,
//! );
//! let config = TracerConfig::default();
//! let rays = camera.primary_rays(config.width, config.height, 2);
//! let image = rayweave::render_local(&scene, rays, config).unwrap();
//! ```

use std::sync::Arc;
use std::thread;

use thiserror::Error;

pub use rayweave_core::{Instance, Light, Material, Mesh, Ray, RayKind, RayVector};
pub use rayweave_tracer::{DomainTracer, FrameStats, TracerConfig};

/// Math types re-exported for hosts.
pub mod math {
    pub use rayweave_math::{Dir3, Mat3, Mat4, Point3, Vec3};
}

/// Transport plumbing for hosts that run their own worlds.
pub mod comm {
    pub use rayweave_comm::{ChannelWorld, Communicator, Transport};
}

use rayweave_comm::{ChannelWorld, Transport};
use rayweave_math::{Mat4, Point3, Vec3};

/// Top-level errors for scene assembly and rendering.
#[derive(Error, Debug)]
pub enum RayweaveError {
    /// Scene construction failed.
    #[error("scene error: {0}")]
    Scene(String),
    /// The tracer rejected the frame.
    #[error(transparent)]
    Trace(#[from] rayweave_tracer::TraceError),
}

/// Handle to a mesh registered in a [`Scene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshId(usize);

/// A scene under assembly: meshes, their placements, and lights.
///
/// The ordered mesh list drives instance ownership, so every rank must
/// assemble the identical scene.
#[derive(Default)]
pub struct Scene {
    meshes: Vec<Arc<Mesh>>,
    instances: Vec<Instance>,
    lights: Vec<Light>,
}

impl Scene {
    /// Empty scene.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mesh; its position in the registration order is its
    /// identity for domain ownership.
    pub fn add_mesh(&mut self, mesh: Mesh) -> MeshId {
        self.meshes.push(Arc::new(mesh));
        MeshId(self.meshes.len() - 1)
    }

    /// Place an instance of `mesh` with `transform`; returns its
    /// instance id.
    pub fn add_instance(&mut self, mesh: MeshId, transform: Mat4) -> Result<i32, RayweaveError> {
        let mesh_arc = self
            .meshes
            .get(mesh.0)
            .ok_or_else(|| RayweaveError::Scene(format!("unknown mesh id {}", mesh.0)))?
            .clone();
        let id = self.instances.len() as i32;
        let instance = Instance::new(id, mesh_arc, mesh.0, transform)
            .ok_or_else(|| RayweaveError::Scene(format!("instance {id} has a singular transform")))?;
        self.instances.push(instance);
        Ok(id)
    }

    /// Add a point light.
    pub fn add_point_light(&mut self, position: Point3, color: Vec3) {
        self.lights.push(Light::point(position, color));
    }

    /// Add an ambient light.
    pub fn add_ambient_light(&mut self, color: Vec3) {
        self.lights.push(Light::ambient(color));
    }

    /// The placed instances.
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// The scene lights.
    pub fn lights(&self) -> &[Light] {
        &self.lights
    }
}

/// Pinhole camera generating one primary ray per film pixel.
#[derive(Debug, Clone)]
pub struct Camera {
    position: Point3,
    forward: Vec3,
    right: Vec3,
    up: Vec3,
    fov_y_degrees: f32,
}

impl Camera {
    /// Camera at `position` looking at `target`.
    pub fn look_at(position: Point3, target: Point3, up: Vec3, fov_y_degrees: f32) -> Self {
        let forward = (target - position).normalize();
        let right = forward.cross(&up).normalize();
        let up = right.cross(&forward).normalize();
        Self {
            position,
            forward,
            right,
            up,
            fov_y_degrees,
        }
    }

    /// Generate primary rays for a `width` x `height` film, ray id =
    /// pixel index, each with `depth` bounces of budget.
    pub fn primary_rays(&self, width: usize, height: usize, depth: i32) -> RayVector {
        let aspect = width as f32 / height as f32;
        let half_h = (self.fov_y_degrees.to_radians() * 0.5).tan();
        let half_w = half_h * aspect;

        let mut rays = RayVector::with_capacity(width * height);
        for py in 0..height {
            for px in 0..width {
                // Pixel center in NDC, y flipped so row 0 is the top.
                let u = ((px as f32 + 0.5) / width as f32) * 2.0 - 1.0;
                let v = 1.0 - ((py as f32 + 0.5) / height as f32) * 2.0;
                let dir = self.forward + self.right * (u * half_w) + self.up * (v * half_h);
                rays.push(Ray::primary(
                    self.position,
                    dir,
                    (py * width + px) as i32,
                    depth,
                ));
            }
        }
        rays
    }
}

/// Render one frame on a single rank: no transfer plane, no voter.
pub fn render_local(
    scene: &Scene,
    rays: RayVector,
    config: TracerConfig,
) -> Result<Vec<u8>, RayweaveError> {
    let mut tracer = DomainTracer::new(
        scene.instances.clone(),
        scene.lights.clone(),
        config,
        None,
    )?;
    let image = tracer.render(rays)?;
    Ok(image.expect("single-rank render always yields the image"))
}

/// Render one frame across `world_size` in-process ranks.
///
/// Every rank assembles the same scene and the same primary set; the
/// local filter partitions the work by instance ownership, exactly as
/// a multi-host world would. Returns rank 0's composited image.
pub fn render_world(
    scene: &Scene,
    rays: RayVector,
    config: TracerConfig,
    world_size: usize,
) -> Result<Vec<u8>, RayweaveError> {
    if world_size <= 1 {
        return render_local(scene, rays, config);
    }

    let mut transports = ChannelWorld::new_world(world_size);
    transports.reverse();

    thread::scope(|s| {
        let mut handles = Vec::new();
        for _ in 0..world_size {
            let transport: Arc<dyn Transport> = Arc::new(transports.pop().expect("one per rank"));
            let instances = scene.instances.clone();
            let lights = scene.lights.clone();
            let rays = rays.clone();
            let config = config.clone();
            handles.push(s.spawn(move || -> Result<Option<Vec<u8>>, RayweaveError> {
                let mut tracer = DomainTracer::new(instances, lights, config, Some(transport))?;
                Ok(tracer.render(rays)?)
            }));
        }

        let mut image = None;
        for handle in handles {
            let result = handle.join().expect("rank thread panicked")?;
            if let Some(buf) = result {
                image = Some(buf);
            }
        }
        image.ok_or_else(|| RayweaveError::Scene("no rank produced an image".into()))
    })
}
