use nalgebra::{Matrix3, Vector2, Vector3};

use crate::config::CameraConfig;

/// Rectified pinhole camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Stereo baseline in meters (0 for monocular).
    pub baseline: f64,
    pub width: f64,
    pub height: f64,
}

impl CameraModel {
    pub fn from_config(cfg: &CameraConfig) -> Self {
        Self {
            fx: cfg.fx,
            fy: cfg.fy,
            cx: cfg.cx,
            cy: cfg.cy,
            baseline: cfg.baseline(),
            width: cfg.width as f64,
            height: cfg.height as f64,
        }
    }

    /// Baseline times focal length.
    pub fn bf(&self) -> f64 {
        self.baseline * self.fx
    }

    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Project a camera-frame point. `None` behind the camera.
    pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p.z;
        Some(Vector2::new(
            self.fx * p.x * inv_z + self.cx,
            self.fy * p.y * inv_z + self.cy,
        ))
    }

    /// Right-image horizontal coordinate of a camera-frame point.
    pub fn project_right_u(&self, u: f64, depth: f64) -> f64 {
        u - self.bf() / depth
    }

    pub fn unproject(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        )
    }

    /// Normalized image coordinates.
    pub fn normalize(&self, u: f64, v: f64) -> Vector2<f64> {
        Vector2::new((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    pub fn in_image(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && v >= 0.0 && u < self.width && v < self.height
    }
}
