//! Velocity-based motion model for pose prediction.

use crate::geometry::SE3;

/// Constant velocity motion model.
///
/// Stores the relative motion between the two most recent tracked frames
/// and replays it on top of the last pose.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    /// Relative motion T_{w,last}⁻¹ · T_{w,curr} of the last tracked step.
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the model from two consecutive camera-to-world poses.
    pub fn update(&mut self, prev_pose: &SE3, pose: &SE3) {
        self.velocity = Some(prev_pose.inverse().compose(pose));
    }

    pub fn has_velocity(&self) -> bool {
        self.velocity.is_some()
    }

    pub fn velocity(&self) -> Option<SE3> {
        self.velocity
    }

    /// Predict the next pose from the last one, if a velocity is known.
    pub fn predict(&self, last_pose: &SE3) -> Option<SE3> {
        self.velocity.map(|v| last_pose.compose(&v))
    }

    /// Rescale the stored translation after the map scale changed.
    pub fn rescale(&mut self, scale: f64) {
        if let Some(v) = self.velocity.as_mut() {
            v.translation *= scale;
        }
    }

    /// Forget the velocity (after tracking loss or a reset).
    pub fn reset(&mut self) {
        self.velocity = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_constant_velocity_replay() {
        let step = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            Vector3::new(0.1, 0.0, 0.02),
        );
        let p0 = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, 0.0, 0.3),
            Vector3::new(1.0, 2.0, 0.5),
        );
        let p1 = p0.compose(&step);
        let p2 = p1.compose(&step);

        let mut model = MotionModel::new();
        assert!(model.predict(&p1).is_none());
        model.update(&p0, &p1);
        let predicted = model.predict(&p1).unwrap();
        assert_relative_eq!(predicted.translation, p2.translation, epsilon = 1e-12);
        let (angle, _) = predicted.distance_to(&p2);
        assert!(angle < 1e-9);

        model.reset();
        assert!(!model.has_velocity());
    }
}
