//! Pose estimate handed from one tracking stage to the next.
//!
//! Stages never mutate a shared pose: each takes an estimate by value and
//! returns a new one, bumping `version` whenever the pose was refined.

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::imu::ImuBias;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseEstimate {
    /// Camera-to-world transform (T_wc).
    pub pose: SE3,
    /// Body velocity in world frame. Zero for vision-only sessions.
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
    /// Number of refinements applied since the estimate was seeded.
    pub version: u32,
}

impl PoseEstimate {
    pub fn new(pose: SE3, velocity: Vector3<f64>, bias: ImuBias) -> Self {
        Self {
            pose,
            velocity,
            bias,
            version: 0,
        }
    }

    pub fn from_pose(pose: SE3) -> Self {
        Self::new(pose, Vector3::zeros(), ImuBias::zero())
    }

    /// Same estimate with a refined pose.
    pub fn refined(self, pose: SE3) -> Self {
        Self {
            pose,
            version: self.version + 1,
            ..self
        }
    }

    pub fn with_velocity(self, velocity: Vector3<f64>) -> Self {
        Self { velocity, ..self }
    }
}

/// What a tracking stage produced: the (possibly unchanged) estimate and
/// the number of inlier correspondences supporting it.
#[derive(Debug, Clone, Copy)]
pub struct StageOutcome {
    pub estimate: PoseEstimate,
    pub inliers: usize,
}

impl StageOutcome {
    pub fn failed(estimate: PoseEstimate) -> Self {
        Self {
            estimate,
            inliers: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_refined_bumps_version_only() {
        let e = PoseEstimate::from_pose(SE3::identity()).with_velocity(Vector3::new(1.0, 0.0, 0.0));
        let moved = SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, 0.0, 1.0));
        let r = e.refined(moved);
        assert_eq!(r.version, 1);
        assert_eq!(r.pose, moved);
        assert_eq!(r.velocity, e.velocity);
        assert_eq!(e.version, 0);
    }
}
