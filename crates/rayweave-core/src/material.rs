//! Tagged material variants and the hemisphere sampler.

use rand::Rng;
use rayweave_math::{orthonormal_basis, Vec3};

use crate::{Light, Ray};

/// Surface material.
///
/// Tagged variants rather than a trait hierarchy; the dispatch cost is
/// negligible against intersection cost.
#[derive(Debug, Clone, PartialEq)]
pub enum Material {
    /// Diffuse-only.
    Lambert {
        /// Diffuse reflectance.
        kd: Vec3,
    },
    /// Classic Phong specular model.
    Phong {
        /// Diffuse reflectance.
        kd: Vec3,
        /// Specular reflectance.
        ks: Vec3,
        /// Shininess exponent.
        alpha: f32,
    },
    /// Blinn-Phong half-vector variant.
    BlinnPhong {
        /// Diffuse reflectance.
        kd: Vec3,
        /// Specular reflectance.
        ks: Vec3,
        /// Shininess exponent.
        alpha: f32,
    },
    /// Material imported from a Wavefront OBJ/MTL file.
    WavefrontObj {
        /// Diffuse reflectance.
        kd: Vec3,
        /// Specular reflectance.
        ks: Vec3,
        /// Ambient reflectance.
        ka: Vec3,
        /// Shininess exponent.
        alpha: f32,
    },
}

impl Material {
    /// Shorthand for a Lambert material.
    pub fn lambert(kd: Vec3) -> Self {
        Material::Lambert { kd }
    }

    /// Shade a hit for one light.
    ///
    /// `ray` is the shadow ray already aimed at the light (its direction
    /// points from the hit toward the light), `normal` the shading normal
    /// at the hit. Ambient lights ignore geometry entirely.
    pub fn shade(&self, ray: &Ray, normal: Vec3, light: &Light) -> Vec3 {
        let light_color = light.color();
        let (dir, cos_theta) = match light {
            Light::Ambient { .. } => {
                return match self {
                    Material::WavefrontObj { ka, .. } => ka.component_mul(&light_color),
                    Material::Lambert { kd }
                    | Material::Phong { kd, .. }
                    | Material::BlinnPhong { kd, .. } => kd.component_mul(&light_color),
                };
            }
            Light::Point { .. } => {
                let dir = ray.direction_vec();
                (dir, normal.dot(&dir).max(0.0))
            }
        };

        match self {
            Material::Lambert { kd } => kd.component_mul(&light_color) * cos_theta,
            Material::Phong { kd, ks, alpha } => {
                let view = -ray.direction_vec();
                let reflected = (2.0 * normal.dot(&dir) * normal - dir).normalize();
                let spec = reflected.dot(&view).max(0.0).powf(*alpha);
                (kd * cos_theta + ks * spec).component_mul(&light_color)
            }
            Material::BlinnPhong { kd, ks, alpha } | Material::WavefrontObj { kd, ks, alpha, .. } => {
                let view = -ray.direction_vec();
                let half = (dir + view).normalize();
                let spec = normal.dot(&half).max(0.0).powf(*alpha);
                (kd * cos_theta + ks * spec).component_mul(&light_color)
            }
        }
    }
}

/// Draw a cosine-weighted direction on the hemisphere about `normal`.
///
/// `theta = acos(sqrt(1 - u1))`, `phi = 2*pi*u2`, rotated into an
/// orthonormal basis around the normal.
pub fn cosine_hemisphere<R: Rng>(normal: Vec3, rng: &mut R) -> Vec3 {
    let u1: f32 = rng.gen();
    let u2: f32 = rng.gen();

    let theta = (1.0 - u1).sqrt().acos();
    let phi = 2.0 * std::f32::consts::PI * u2;

    let xs = theta.sin() * phi.cos();
    let ys = theta.cos();
    let zs = theta.sin() * phi.sin();

    let (x, y, z) = orthonormal_basis(normal);
    (x * xs + y * ys + z * zs).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use rayweave_math::Point3;

    fn shadow_ray_toward(dir: Vec3) -> Ray {
        let mut r = Ray::primary(Point3::origin(), dir, 0, 1);
        r.kind = crate::RayKind::Shadow as i32;
        r
    }

    #[test]
    fn test_lambert_facing_light() {
        let m = Material::lambert(Vec3::new(1.0, 0.5, 0.25));
        let light = Light::point(Point3::new(0.0, 10.0, 0.0), Vec3::new(1.0, 1.0, 1.0));
        let ray = shadow_ray_toward(Vec3::new(0.0, 1.0, 0.0));
        let c = m.shade(&ray, Vec3::new(0.0, 1.0, 0.0), &light);
        assert!((c.x - 1.0).abs() < 1e-6);
        assert!((c.y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_lambert_grazing_is_dark() {
        let m = Material::lambert(Vec3::new(1.0, 1.0, 1.0));
        let light = Light::point(Point3::new(10.0, 0.0, 0.0), Vec3::new(1.0, 1.0, 1.0));
        let ray = shadow_ray_toward(Vec3::new(1.0, 0.0, 0.0));
        let c = m.shade(&ray, Vec3::new(0.0, 1.0, 0.0), &light);
        assert!(c.norm() < 1e-6);
    }

    #[test]
    fn test_ambient_ignores_normal() {
        let m = Material::lambert(Vec3::new(0.5, 0.5, 0.5));
        let light = Light::ambient(Vec3::new(0.2, 0.2, 0.2));
        let ray = shadow_ray_toward(Vec3::new(0.0, 1.0, 0.0));
        let c = m.shade(&ray, Vec3::new(1.0, 0.0, 0.0), &light);
        assert!((c.x - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_hemisphere_stays_above_surface() {
        let mut rng = SmallRng::seed_from_u64(7);
        let normal = Vec3::new(0.0, 0.0, 1.0);
        for _ in 0..256 {
            let d = cosine_hemisphere(normal, &mut rng);
            assert!(d.dot(&normal) >= 0.0);
            assert!((d.norm() - 1.0).abs() < 1e-5);
        }
    }
}
