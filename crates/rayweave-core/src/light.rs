//! Light variants.

use rayweave_math::{Point3, Vec3};

/// A scene light.
#[derive(Debug, Clone, PartialEq)]
pub enum Light {
    /// Omnidirectional point light.
    Point {
        /// World-space position.
        position: Point3,
        /// Emitted color.
        color: Vec3,
    },
    /// Constant ambient term; casts no shadows.
    Ambient {
        /// Emitted color.
        color: Vec3,
    },
}

impl Light {
    /// Shorthand for a point light.
    pub fn point(position: Point3, color: Vec3) -> Self {
        Light::Point { position, color }
    }

    /// Shorthand for an ambient light.
    pub fn ambient(color: Vec3) -> Self {
        Light::Ambient { color }
    }

    /// Emitted color.
    pub fn color(&self) -> Vec3 {
        match self {
            Light::Point { color, .. } | Light::Ambient { color } => *color,
        }
    }

    /// Unit direction and distance from `from` toward the light, or
    /// `None` for lights without a position (their contribution is
    /// unoccludable).
    pub fn sample_direction(&self, from: Point3) -> Option<(Vec3, f32)> {
        match self {
            Light::Point { position, .. } => {
                let to_light = position - from;
                let dist = to_light.norm();
                if dist > 0.0 {
                    Some((to_light / dist, dist))
                } else {
                    None
                }
            }
            Light::Ambient { .. } => None,
        }
    }
}
