//! Inertial initialization of a map.
//!
//! Once a map holds enough keyframes spanning enough time, the preintegrated
//! deltas between consecutive keyframes give:
//! - the gravity direction in the map frame
//! - a gyroscope bias (first order, from rotation residuals)
//! - per-keyframe velocities from position differences
//!
//! Depth sensors give metric maps, so the scale stays 1.

use nalgebra::{Matrix3, Vector3};
use tracing::{debug, info};

use crate::atlas::map::{KeyFrameId, Map};
use crate::geometry::so3::log_so3;
use crate::imu::{GRAVITY_MAGNITUDE, ImuBias, ImuCalib};

pub const MIN_KEYFRAMES_FOR_INIT: usize = 10;
pub const MIN_TIME_SPAN_S: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct ImuInitResult {
    /// Gravity expressed in the map frame.
    pub gravity: Vector3<f64>,
    pub bias: ImuBias,
    pub scale: f64,
    pub velocities: Vec<(KeyFrameId, Vector3<f64>)>,
}

/// Estimate the inertial state of `map`. `None` while there is not enough
/// data.
pub fn estimate_imu_init(map: &Map, calib: &ImuCalib) -> Option<ImuInitResult> {
    if map.is_imu_initialized() {
        return None;
    }
    if map.num_keyframes() < MIN_KEYFRAMES_FOR_INIT || map.time_span_seconds() < MIN_TIME_SPAN_S {
        return None;
    }

    let keyframes = map.keyframes_temporal_order();

    // (R_wb of the previous keyframe, R_wb of the current one, preintegration)
    let pairs: Vec<_> = keyframes
        .windows(2)
        .filter_map(|w| {
            let preint = w[1].imu_preintegrated.as_ref()?;
            if preint.is_empty() {
                return None;
            }
            let r_prev = calib.body_pose(&w[0].pose).rotation_matrix();
            let r_curr = calib.body_pose(&w[1].pose).rotation_matrix();
            Some((r_prev, r_curr, preint))
        })
        .collect();
    if pairs.len() < 2 {
        return None;
    }

    // The accelerometer reads the reaction to gravity, so the rotated
    // velocity deltas point up.
    let mut dir_g = Vector3::zeros();
    for (r_prev, _, preint) in &pairs {
        dir_g -= r_prev * preint.delta_vel;
    }
    let norm = dir_g.norm();
    if norm < 1e-6 {
        return None;
    }
    let gravity = dir_g / norm * GRAVITY_MAGNITUDE;

    // Least squares on ΔR·exp(J·δbg) = R_prev^T·R_curr.
    let mut lhs = Matrix3::zeros();
    let mut rhs = Vector3::zeros();
    for (r_prev, r_curr, preint) in &pairs {
        let r_rel = r_prev.transpose() * r_curr;
        let residual = log_so3(&(preint.delta_rot.transpose() * r_rel));
        lhs += preint.jr_gyro.transpose() * preint.jr_gyro;
        rhs += preint.jr_gyro.transpose() * residual;
    }
    let base_bias = pairs[0].2.bias;
    let gyro = match lhs.try_inverse() {
        Some(inv) => base_bias.gyro + inv * rhs,
        None => base_bias.gyro,
    };
    let bias = ImuBias {
        gyro,
        accel: base_bias.accel,
    };

    let mut velocities = Vec::with_capacity(keyframes.len());
    for w in keyframes.windows(2) {
        let dt = w[1].timestamp - w[0].timestamp;
        if dt <= 1e-6 {
            continue;
        }
        let p_prev = calib.body_pose(&w[0].pose).translation;
        let p_curr = calib.body_pose(&w[1].pose).translation;
        velocities.push((w[0].id, (p_curr - p_prev) / dt));
    }
    if let (Some(&(_, last_vel)), Some(last)) = (velocities.last(), keyframes.last()) {
        velocities.push((last.id, last_vel));
    }

    debug!(
        "[ImuInit] {} intervals, gravity ({:.3}, {:.3}, {:.3}), gyro bias norm {:.4}",
        pairs.len(),
        gravity.x,
        gravity.y,
        gravity.z,
        bias.gyro.norm()
    );

    Some(ImuInitResult {
        gravity,
        bias,
        scale: 1.0,
        velocities,
    })
}

/// Write an estimate into the map and mark it initialized.
pub fn apply_imu_init(map: &mut Map, result: &ImuInitResult) {
    for (kf_id, vel) in &result.velocities {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            kf.velocity = *vel;
        }
    }
    let ids: Vec<KeyFrameId> = map.keyframe_ids().copied().collect();
    for id in ids {
        if let Some(kf) = map.get_keyframe_mut(id) {
            kf.imu_bias = result.bias;
        }
    }
    map.set_imu_initialized(result.gravity);

    info!(
        "IMU initialized in map {} from {} keyframes over {:.2}s",
        map.index,
        map.num_keyframes(),
        map.time_span_seconds()
    );
}
