//! On-manifold IMU preintegration.
//!
//! Folds a batch of inertial measurements into a relative motion delta
//! (ΔR, Δv, Δp) expressed in the body frame at the start of the interval,
//! together with:
//! - first-order Jacobians of the delta w.r.t. gyro and accel bias, so a
//!   later bias update is applied as a correction instead of re-integrating
//! - the 9×9 covariance of [δθ, δv, δp], propagated per measurement
//!
//! The delta never contains gravity; it is added at prediction time.

use nalgebra::{Matrix3, SMatrix, Vector3};

use crate::geometry::SE3;
use crate::geometry::so3::{exp_so3, normalize_rotation, right_jacobian_so3, skew};

use super::sample::{ImuBias, ImuNoise, ImuSample};

/// 9×9 covariance matrix for preintegrated state [δθ, δv, δp].
pub type Matrix9 = SMatrix<f64, 9, 9>;

type Matrix9x6 = SMatrix<f64, 9, 6>;
type Matrix6 = SMatrix<f64, 6, 6>;

/// One constant-rate measurement applied over `dt` seconds.
#[derive(Debug, Clone, Copy)]
pub struct ImuSegment {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
    pub dt: f64,
}

/// Split a time-ordered sample batch into integration segments covering
/// `[t_start, t_end]`.
///
/// Consecutive samples contribute their midpoint over the overlap of their
/// interval with the window; the first and last samples are held constant to
/// the window edges. An empty batch yields no segments.
pub fn segments_between(samples: &[ImuSample], t_start: f64, t_end: f64) -> Vec<ImuSegment> {
    let mut segments = Vec::new();
    if samples.is_empty() || t_end <= t_start {
        return segments;
    }

    let first = &samples[0];
    if first.timestamp_s > t_start {
        let dt = first.timestamp_s.min(t_end) - t_start;
        if dt > 0.0 {
            segments.push(ImuSegment {
                accel: first.accel,
                gyro: first.gyro,
                dt,
            });
        }
    }

    for pair in samples.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let start = a.timestamp_s.max(t_start);
        let end = b.timestamp_s.min(t_end);
        let dt = end - start;
        if dt <= 0.0 {
            continue;
        }
        segments.push(ImuSegment {
            accel: 0.5 * (a.accel + b.accel),
            gyro: 0.5 * (a.gyro + b.gyro),
            dt,
        });
    }

    if let Some(last) = samples.last() {
        if last.timestamp_s < t_end {
            let dt = t_end - last.timestamp_s.max(t_start);
            if dt > 0.0 {
                segments.push(ImuSegment {
                    accel: last.accel,
                    gyro: last.gyro,
                    dt,
                });
            }
        }
    }

    segments
}

/// Preintegrated motion between two instants.
#[derive(Debug, Clone, Copy)]
pub struct PreintegratedState {
    pub delta_rot: Matrix3<f64>,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    pub dt: f64,

    /// Bias the measurements were integrated with.
    pub bias: ImuBias,

    // ─────────────────────────────────────────────────────────────────────────
    // Bias Jacobians
    // ─────────────────────────────────────────────────────────────────────────
    pub jr_gyro: Matrix3<f64>,
    pub jv_gyro: Matrix3<f64>,
    pub jv_accel: Matrix3<f64>,
    pub jp_gyro: Matrix3<f64>,
    pub jp_accel: Matrix3<f64>,

    /// Covariance of [δθ, δv, δp].
    pub covariance: Matrix9,
}

impl PreintegratedState {
    pub fn identity(bias: ImuBias) -> Self {
        Self {
            delta_rot: Matrix3::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
            bias,
            jr_gyro: Matrix3::zeros(),
            jv_gyro: Matrix3::zeros(),
            jv_accel: Matrix3::zeros(),
            jp_gyro: Matrix3::zeros(),
            jp_accel: Matrix3::zeros(),
            covariance: Matrix9::zeros(),
        }
    }

    /// True when no measurement has been integrated.
    pub fn is_empty(&self) -> bool {
        self.dt <= 0.0
    }

    fn bias_delta(&self, bias: &ImuBias) -> (Vector3<f64>, Vector3<f64>) {
        (bias.gyro - self.bias.gyro, bias.accel - self.bias.accel)
    }

    /// ΔR corrected to first order for `bias`.
    pub fn corrected_delta_rotation(&self, bias: &ImuBias) -> Matrix3<f64> {
        let (dbg, _) = self.bias_delta(bias);
        normalize_rotation(&(self.delta_rot * exp_so3(&(self.jr_gyro * dbg))))
    }

    /// Δv corrected to first order for `bias`.
    pub fn corrected_delta_velocity(&self, bias: &ImuBias) -> Vector3<f64> {
        let (dbg, dba) = self.bias_delta(bias);
        self.delta_vel + self.jv_gyro * dbg + self.jv_accel * dba
    }

    /// Δp corrected to first order for `bias`.
    pub fn corrected_delta_position(&self, bias: &ImuBias) -> Vector3<f64> {
        let (dbg, dba) = self.bias_delta(bias);
        self.delta_pos + self.jp_gyro * dbg + self.jp_accel * dba
    }

    /// Propagate a body state `(T_wb, v_w)` across this delta.
    ///
    /// Returns the predicted body pose and world velocity at the end of the
    /// interval under `gravity` (world frame) and `bias`.
    pub fn predict(
        &self,
        t_wb: &SE3,
        velocity: &Vector3<f64>,
        gravity: &Vector3<f64>,
        bias: &ImuBias,
    ) -> (SE3, Vector3<f64>) {
        let r_wb1 = t_wb.rotation_matrix();
        let p1 = t_wb.translation;
        let dt = self.dt;

        let r_wb2 = normalize_rotation(&(r_wb1 * self.corrected_delta_rotation(bias)));
        let v2 = velocity + gravity * dt + r_wb1 * self.corrected_delta_velocity(bias);
        let p2 = p1
            + velocity * dt
            + 0.5 * gravity * dt * dt
            + r_wb1 * self.corrected_delta_position(bias);

        (SE3::from_rt(&r_wb2, &p2), v2)
    }
}

/// IMU preintegrator: integrates high-rate IMU into a relative motion prior.
#[derive(Debug, Clone)]
pub struct Preintegrator {
    pub noise: ImuNoise,
    pub state: PreintegratedState,
}

impl Preintegrator {
    pub fn new(bias: ImuBias, noise: ImuNoise) -> Self {
        Self {
            noise,
            state: PreintegratedState::identity(bias),
        }
    }

    /// Start a fresh interval integrated with `bias`.
    pub fn reset(&mut self, bias: ImuBias) {
        self.state = PreintegratedState::identity(bias);
    }

    pub fn bias(&self) -> ImuBias {
        self.state.bias
    }

    pub fn integrate_segments(&mut self, segments: &[ImuSegment]) {
        for seg in segments {
            self.integrate_measurement(&seg.accel, &seg.gyro, seg.dt);
        }
    }

    /// Integrate one measurement held constant over `dt`.
    ///
    /// Position and velocity are updated with the rotation at the start of
    /// the step; Jacobians and covariance follow the same ordering.
    pub fn integrate_measurement(&mut self, accel: &Vector3<f64>, gyro: &Vector3<f64>, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let s = &mut self.state;
        let acc = accel - s.bias.accel;
        let omega = gyro - s.bias.gyro;
        let dt2 = dt * dt;

        let mut a = Matrix9::identity();
        let mut b = Matrix9x6::zeros();
        let w_acc = skew(&acc);
        let dr = s.delta_rot;

        s.delta_pos += s.delta_vel * dt + 0.5 * dr * acc * dt2;
        s.delta_vel += dr * acc * dt;

        a.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-dr * w_acc * dt));
        a.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-0.5 * dr * w_acc * dt2));
        a.fixed_view_mut::<3, 3>(6, 3).copy_from(&(Matrix3::identity() * dt));
        b.fixed_view_mut::<3, 3>(3, 3).copy_from(&(dr * dt));
        b.fixed_view_mut::<3, 3>(6, 3).copy_from(&(0.5 * dr * dt2));

        s.jp_accel += s.jv_accel * dt - 0.5 * dr * dt2;
        s.jp_gyro += s.jv_gyro * dt - 0.5 * dr * w_acc * s.jr_gyro * dt2;
        s.jv_accel -= dr * dt;
        s.jv_gyro -= dr * w_acc * s.jr_gyro * dt;

        let d_ri = exp_so3(&(omega * dt));
        let jr = right_jacobian_so3(&(omega * dt));
        s.delta_rot = normalize_rotation(&(s.delta_rot * d_ri));

        a.fixed_view_mut::<3, 3>(0, 0).copy_from(&d_ri.transpose());
        b.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr * dt));

        let mut n = Matrix6::zeros();
        let ng2 = self.noise.sigma_gyro * self.noise.sigma_gyro / dt;
        let na2 = self.noise.sigma_accel * self.noise.sigma_accel / dt;
        for i in 0..3 {
            n[(i, i)] = ng2;
            n[(i + 3, i + 3)] = na2;
        }
        s.covariance = a * s.covariance * a.transpose() + b * n * b.transpose();

        s.jr_gyro = d_ri.transpose() * s.jr_gyro - jr * dt;
        s.dt += dt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::sample::GRAVITY;
    use approx::assert_relative_eq;

    fn sample(t: f64, accel: Vector3<f64>, gyro: Vector3<f64>) -> ImuSample {
        ImuSample::new(t, accel, gyro)
    }

    #[test]
    fn test_segments_cover_window() {
        let samples: Vec<_> = (0..5)
            .map(|i| sample(0.1 + i as f64 * 0.2, Vector3::zeros(), Vector3::zeros()))
            .collect();
        let segs = segments_between(&samples, 0.0, 1.0);
        let total: f64 = segs.iter().map(|s| s.dt).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_segments_empty_batch() {
        assert!(segments_between(&[], 0.0, 1.0).is_empty());
    }

    #[test]
    fn test_constant_rotation() {
        let mut pre = Preintegrator::new(ImuBias::zero(), ImuNoise::default());
        let omega = Vector3::new(0.0, 0.0, 0.5);
        for _ in 0..200 {
            pre.integrate_measurement(&Vector3::zeros(), &omega, 0.005);
        }
        let angle = crate::geometry::so3::log_so3(&pre.state.delta_rot);
        assert_relative_eq!(angle, Vector3::new(0.0, 0.0, 0.5), epsilon = 1e-9);
        assert!((pre.state.dt - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_constant_acceleration_without_rotation() {
        let mut pre = Preintegrator::new(ImuBias::zero(), ImuNoise::default());
        let acc = Vector3::new(1.0, 0.0, 0.0);
        for _ in 0..100 {
            pre.integrate_measurement(&acc, &Vector3::zeros(), 0.01);
        }
        assert!((pre.state.delta_vel.x - 1.0).abs() < 1e-10);
        assert!((pre.state.delta_pos.x - 0.5).abs() < 1e-10);
    }

    #[test]
    fn test_bias_correction_matches_reintegration() {
        let b0 = ImuBias::zero();
        let b1 = ImuBias {
            gyro: Vector3::new(0.001, -0.002, 0.0015),
            accel: Vector3::new(0.01, 0.02, -0.01),
        };
        let acc = Vector3::new(0.3, -0.2, 9.7);
        let gyro = Vector3::new(0.1, 0.05, -0.2);

        let mut pre0 = Preintegrator::new(b0, ImuNoise::default());
        let mut pre1 = Preintegrator::new(b1, ImuNoise::default());
        for _ in 0..100 {
            pre0.integrate_measurement(&acc, &gyro, 0.005);
            pre1.integrate_measurement(&acc, &gyro, 0.005);
        }

        let corrected_v = pre0.state.corrected_delta_velocity(&b1);
        let corrected_p = pre0.state.corrected_delta_position(&b1);
        assert!((corrected_v - pre1.state.delta_vel).norm() < 1e-4);
        assert!((corrected_p - pre1.state.delta_pos).norm() < 1e-4);

        let r_err = pre0.state.corrected_delta_rotation(&b1).transpose() * pre1.state.delta_rot;
        assert!(crate::geometry::so3::log_so3(&r_err).norm() < 1e-5);
    }

    #[test]
    fn test_stationary_prediction_cancels_gravity() {
        let mut pre = Preintegrator::new(ImuBias::zero(), ImuNoise::default());
        for _ in 0..50 {
            pre.integrate_measurement(&(-GRAVITY), &Vector3::zeros(), 0.01);
        }
        let (pose, vel) =
            pre.state
                .predict(&SE3::identity(), &Vector3::zeros(), &GRAVITY, &ImuBias::zero());
        assert!(vel.norm() < 1e-10);
        assert!(pose.translation.norm() < 1e-10);
    }

    #[test]
    fn test_covariance_grows() {
        let mut pre = Preintegrator::new(ImuBias::zero(), ImuNoise::default());
        pre.integrate_measurement(&Vector3::new(0.0, 0.0, 9.81), &Vector3::zeros(), 0.005);
        let c1 = pre.state.covariance.trace();
        for _ in 0..10 {
            pre.integrate_measurement(&Vector3::new(0.0, 0.0, 9.81), &Vector3::zeros(), 0.005);
        }
        assert!(pre.state.covariance.trace() > c1);
        assert!(c1 > 0.0);
    }

    #[test]
    fn test_empty_interval_is_identity() {
        let mut pre = Preintegrator::new(ImuBias::zero(), ImuNoise::default());
        pre.integrate_segments(&segments_between(&[], 0.0, 0.1));
        assert!(pre.state.is_empty());
        assert_relative_eq!(pre.state.delta_rot, Matrix3::identity(), epsilon = 1e-15);
    }
}
