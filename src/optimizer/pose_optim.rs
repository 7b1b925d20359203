//! Pose-only optimization for tracking.
//!
//! Refines the current camera pose against fixed landmark positions by
//! Gauss-Newton on the reprojection error. Follows the usual four-round
//! scheme: optimize with the current inlier set, reclassify every
//! observation by its chi2, repeat. The robust kernel is dropped for the
//! last rounds so the final estimate is a plain least-squares fit.
//!
//! An optional prior on the pose (from inertial prediction) is added as a
//! 6-DoF information-weighted residual.

use nalgebra::{Matrix3, Matrix6, SMatrix, Vector2, Vector3, Vector6};
use tracing::debug;

use crate::geometry::SE3;
use crate::geometry::so3::{log_so3, skew};
use crate::tracking::frame::CameraModel;

type Matrix3x6 = SMatrix<f64, 3, 6>;

pub struct PoseOptimConfig {
    pub rounds: usize,
    pub iterations_per_round: usize,
    /// 95% chi2 with 2 DOF.
    pub chi2_mono: f64,
    /// 95% chi2 with 3 DOF.
    pub chi2_stereo: f64,
    /// Rounds (from the first) that use the Huber kernel.
    pub robust_rounds: usize,
}

impl Default for PoseOptimConfig {
    fn default() -> Self {
        Self {
            rounds: 4,
            iterations_per_round: 10,
            chi2_mono: 5.991,
            chi2_stereo: 7.815,
            robust_rounds: 2,
        }
    }
}

/// One landmark-to-keypoint correspondence.
#[derive(Debug, Clone)]
pub struct PoseObservation {
    pub feature_idx: usize,
    pub uv: Vector2<f64>,
    /// Right-image u coordinate for stereo/RGB-D observations.
    pub u_right: Option<f64>,
    pub point_world: Vector3<f64>,
    /// 1/sigma² of the keypoint's pyramid level.
    pub inv_sigma2: f64,
}

/// Gaussian prior on the world-to-camera pose.
#[derive(Debug, Clone)]
pub struct PosePrior {
    pub pose_cw: SE3,
    /// Information matrix over [rotation, translation].
    pub information: Matrix6<f64>,
}

#[derive(Debug)]
pub struct PoseOptimResult {
    /// Optimized camera-to-world pose.
    pub pose: SE3,
    /// Per observation (same order as input): true if rejected.
    pub outliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Optimize a camera pose (T_wc) against fixed landmarks.
///
/// Fewer than 3 observations leave the pose untouched and report 0 inliers.
pub fn optimize_pose(
    initial_pose_wc: &SE3,
    observations: &[PoseObservation],
    camera: &CameraModel,
    prior: Option<&PosePrior>,
    config: &PoseOptimConfig,
) -> PoseOptimResult {
    let n = observations.len();
    if n < 3 {
        return PoseOptimResult {
            pose: *initial_pose_wc,
            outliers: vec![true; n],
            num_inliers: 0,
        };
    }

    let mut pose_cw = initial_pose_wc.inverse();
    let mut outliers = vec![false; n];

    for round in 0..config.rounds {
        let robust = round < config.robust_rounds;
        for _ in 0..config.iterations_per_round {
            let Some(delta) =
                gauss_newton_step(&pose_cw, observations, &outliers, camera, prior, config, robust)
            else {
                break;
            };
            pose_cw = SE3::exp(&delta).compose(&pose_cw);
            if delta.norm() < 1e-10 {
                break;
            }
        }

        for (i, obs) in observations.iter().enumerate() {
            outliers[i] = match residual(&pose_cw, obs, camera) {
                Some(r) => r.chi2 > threshold(obs, config),
                None => true,
            };
        }

        if outliers.iter().filter(|o| !**o).count() < 10 && round + 1 < config.rounds {
            break;
        }
    }

    let num_inliers = outliers.iter().filter(|o| !**o).count();
    debug!("[PoseOpt] inliers: {}/{}", num_inliers, n);

    PoseOptimResult {
        pose: pose_cw.inverse(),
        outliers,
        num_inliers,
    }
}

fn threshold(obs: &PoseObservation, config: &PoseOptimConfig) -> f64 {
    if obs.u_right.is_some() {
        config.chi2_stereo
    } else {
        config.chi2_mono
    }
}

struct Residual {
    /// obs - projection; third entry is zero for monocular observations.
    error: Vector3<f64>,
    /// d(error)/d(left perturbation of T_cw), rows match `error`.
    jacobian: Matrix3x6,
    chi2: f64,
}

fn residual(pose_cw: &SE3, obs: &PoseObservation, camera: &CameraModel) -> Option<Residual> {
    let p = pose_cw.transform_point(&obs.point_world);
    if p.z <= 1e-3 {
        return None;
    }
    let (x, y, z) = (p.x, p.y, p.z);
    let z_inv = 1.0 / z;
    let z_inv_sq = z_inv * z_inv;

    let u = camera.fx * x * z_inv + camera.cx;
    let v = camera.fy * y * z_inv + camera.cy;

    // d(projection)/d(p_cam)
    let mut j_proj = Matrix3::zeros();
    j_proj[(0, 0)] = camera.fx * z_inv;
    j_proj[(0, 2)] = -camera.fx * x * z_inv_sq;
    j_proj[(1, 1)] = camera.fy * z_inv;
    j_proj[(1, 2)] = -camera.fy * y * z_inv_sq;

    let mut error = Vector3::new(obs.uv.x - u, obs.uv.y - v, 0.0);
    if let Some(ur_obs) = obs.u_right {
        let ur = u - camera.bf() * z_inv;
        error.z = ur_obs - ur;
        j_proj[(2, 0)] = j_proj[(0, 0)];
        j_proj[(2, 2)] = j_proj[(0, 2)] + camera.bf() * z_inv_sq;
    }

    // p' = exp(δ) p  ⇒  dp/dω = -[p]×, dp/dυ = I
    let mut j_point = Matrix3x6::zeros();
    j_point.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(&p)));
    j_point
        .fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&Matrix3::identity());

    let jacobian = -(j_proj * j_point);
    let chi2 = error.norm_squared() * obs.inv_sigma2;
    Some(Residual {
        error,
        jacobian,
        chi2,
    })
}

fn gauss_newton_step(
    pose_cw: &SE3,
    observations: &[PoseObservation],
    outliers: &[bool],
    camera: &CameraModel,
    prior: Option<&PosePrior>,
    config: &PoseOptimConfig,
    robust: bool,
) -> Option<Vector6<f64>> {
    let mut h = Matrix6::<f64>::zeros();
    let mut b = Vector6::<f64>::zeros();
    let mut active = 0usize;

    for (obs, _) in observations.iter().zip(outliers).filter(|(_, o)| !**o) {
        let Some(r) = residual(pose_cw, obs, camera) else {
            continue;
        };
        let mut w = obs.inv_sigma2;
        if robust {
            let delta = threshold(obs, config).sqrt();
            let e = r.chi2.sqrt();
            if e > delta {
                w *= delta / e;
            }
        }
        h += r.jacobian.transpose() * r.jacobian * w;
        b += r.jacobian.transpose() * r.error * w;
        active += 1;
    }

    if let Some(p) = prior {
        let rel = pose_cw.compose(&p.pose_cw.inverse());
        let mut e = Vector6::zeros();
        e.fixed_view_mut::<3, 1>(0, 0)
            .copy_from(&log_so3(&rel.rotation_matrix()));
        e.fixed_view_mut::<3, 1>(3, 0).copy_from(&rel.translation);
        h += p.information;
        b += p.information * e;
    } else if active < 3 {
        return None;
    }

    h.lu().solve(&(-b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn camera() -> CameraModel {
        CameraModel {
            fx: 450.0,
            fy: 450.0,
            cx: 320.0,
            cy: 240.0,
            baseline: 0.1,
            width: 640.0,
            height: 480.0,
        }
    }

    fn grid_points() -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        for i in -3..=3 {
            for j in -2..=2 {
                let z = 4.0 + 0.3 * ((i + j) as f64).sin();
                pts.push(Vector3::new(i as f64 * 0.5, j as f64 * 0.4, z));
            }
        }
        pts
    }

    fn observe(pose_wc: &SE3, pts: &[Vector3<f64>], stereo: bool) -> Vec<PoseObservation> {
        let cam = camera();
        let pose_cw = pose_wc.inverse();
        pts.iter()
            .enumerate()
            .filter_map(|(i, pw)| {
                let pc = pose_cw.transform_point(pw);
                let uv = cam.project(&pc)?;
                Some(PoseObservation {
                    feature_idx: i,
                    uv,
                    u_right: stereo.then(|| cam.project_right_u(uv.x, pc.z)),
                    point_world: *pw,
                    inv_sigma2: 1.0,
                })
            })
            .collect()
    }

    #[test]
    fn test_recovers_perturbed_pose() {
        let truth = SE3::new(
            UnitQuaternion::from_euler_angles(0.02, -0.03, 0.01),
            Vector3::new(0.1, -0.05, 0.2),
        );
        let obs = observe(&truth, &grid_points(), false);
        let init = SE3::new(
            truth.rotation * UnitQuaternion::from_euler_angles(0.02, 0.01, -0.02),
            truth.translation + Vector3::new(0.05, 0.03, -0.04),
        );
        let res = optimize_pose(&init, &obs, &camera(), None, &PoseOptimConfig::default());
        let (angle, dist) = res.pose.distance_to(&truth);
        assert!(angle < 1e-6, "angle {}", angle);
        assert!(dist < 1e-6, "dist {}", dist);
        assert_eq!(res.num_inliers, obs.len());
    }

    #[test]
    fn test_flags_gross_outliers() {
        let truth = SE3::identity();
        let mut obs = observe(&truth, &grid_points(), true);
        obs[0].uv += Vector2::new(40.0, -30.0);
        obs[5].uv += Vector2::new(-25.0, 50.0);
        let res = optimize_pose(&truth, &obs, &camera(), None, &PoseOptimConfig::default());
        assert!(res.outliers[0]);
        assert!(res.outliers[5]);
        assert_eq!(res.num_inliers, obs.len() - 2);
    }

    #[test]
    fn test_too_few_observations() {
        let obs = observe(&SE3::identity(), &grid_points()[..2], false);
        let res = optimize_pose(&SE3::identity(), &obs, &camera(), None, &PoseOptimConfig::default());
        assert_eq!(res.num_inliers, 0);
    }

    #[test]
    fn test_prior_alone_pulls_pose() {
        let target = SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, 0.0, 0.01));
        let prior = PosePrior {
            pose_cw: target.inverse(),
            information: Matrix6::identity() * 1e4,
        };
        let obs = observe(&SE3::identity(), &grid_points()[..3], false);
        let res = optimize_pose(
            &SE3::identity(),
            &obs,
            &camera(),
            Some(&prior),
            &PoseOptimConfig::default(),
        );
        // Three exact observations at identity compete with the prior.
        assert!(res.pose.translation.z > 0.0);
        assert!(res.pose.translation.z < 0.01);
    }
}
