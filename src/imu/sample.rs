use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// Gravity magnitude (m/s^2).
pub const GRAVITY_MAGNITUDE: f64 = 9.81;

/// Gravity vector in world frame (m/s^2) before gravity alignment.
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE);

/// IMU noise parameters (continuous-time densities).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuNoise {
    /// Gyroscope noise density (rad/s/√Hz).
    pub sigma_gyro: f64,
    /// Accelerometer noise density (m/s²/√Hz).
    pub sigma_accel: f64,
    /// Gyroscope bias random walk (rad/s²/√Hz).
    pub sigma_gyro_walk: f64,
    /// Accelerometer bias random walk (m/s³/√Hz).
    pub sigma_accel_walk: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            // Approximate EuRoC noise values
            sigma_gyro: 1.7e-4,
            sigma_accel: 2.0e-3,
            sigma_gyro_walk: 1.9393e-5,
            sigma_accel_walk: 3.0e-3,
        }
    }
}

/// IMU biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
        }
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

/// Single IMU measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp_s: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp_s: f64, accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self {
            timestamp_s,
            accel,
            gyro,
        }
    }
}

/// Camera/IMU calibration shared by the preintegrators.
#[derive(Debug, Clone, Copy)]
pub struct ImuCalib {
    /// Camera-to-body transform: `p_body = t_bc.transform_point(&p_cam)`.
    pub t_bc: SE3,
    pub noise: ImuNoise,
}

impl ImuCalib {
    pub fn new(t_bc: SE3, noise: ImuNoise) -> Self {
        Self { t_bc, noise }
    }

    /// Body pose in world from a camera pose in world.
    pub fn body_pose(&self, t_wc: &SE3) -> SE3 {
        t_wc.compose(&self.t_bc.inverse())
    }

    /// Camera pose in world from a body pose in world.
    pub fn camera_pose(&self, t_wb: &SE3) -> SE3 {
        t_wb.compose(&self.t_bc)
    }
}

impl Default for ImuCalib {
    fn default() -> Self {
        Self::new(SE3::identity(), ImuNoise::default())
    }
}
