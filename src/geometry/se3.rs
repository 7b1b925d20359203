//! SE(3) rigid-body transform.
//!
//! Poses in this crate are stored as camera-to-world transforms (`T_wc`):
//! `p_world = pose.transform_point(&p_cam)`.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3, Vector6};

use super::so3::right_jacobian_so3;

/// Rigid transform with a unit-quaternion rotation and a translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a rotation matrix and a translation.
    ///
    /// The matrix is re-orthonormalized, so slightly drifted rotations are accepted.
    pub fn from_rt(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation: *translation,
        }
    }

    /// Exponential map of a twist `[ω, υ]` (rotation first).
    pub fn exp(xi: &Vector6<f64>) -> Self {
        let omega = Vector3::new(xi[0], xi[1], xi[2]);
        let upsilon = Vector3::new(xi[3], xi[4], xi[5]);
        // Left Jacobian of SO(3) equals the right Jacobian at -ω.
        let jl = right_jacobian_so3(&(-omega));
        Self {
            rotation: UnitQuaternion::from_scaled_axis(omega),
            translation: jl * upsilon,
        }
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Rotation angle (radians) and translation norm of `self⁻¹ ∘ other`.
    pub fn distance_to(&self, other: &SE3) -> (f64, f64) {
        let delta = self.inverse().compose(other);
        (delta.rotation.angle(), delta.translation.norm())
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let t = sample_pose();
        let id = t.compose(&t.inverse());
        assert!(id.rotation.angle() < 1e-12);
        assert!(id.translation.norm() < 1e-12);
    }

    #[test]
    fn test_transform_point_roundtrip() {
        let t = sample_pose();
        let p = Vector3::new(0.3, 0.4, 5.0);
        let back = t.inverse().transform_point(&t.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_small_twist_is_near_identity() {
        let xi = Vector6::new(1e-9, 0.0, 0.0, 1e-9, 0.0, 0.0);
        let t = SE3::exp(&xi);
        assert!(t.rotation.angle() < 1e-8);
        assert!(t.translation.norm() < 1e-8);
    }

    #[test]
    fn test_exp_pure_translation() {
        let xi = Vector6::new(0.0, 0.0, 0.0, 0.5, -1.0, 2.0);
        let t = SE3::exp(&xi);
        assert_relative_eq!(t.translation, Vector3::new(0.5, -1.0, 2.0), epsilon = 1e-12);
    }

    #[test]
    fn test_from_rt_matches_quaternion() {
        let t = sample_pose();
        let rebuilt = SE3::from_rt(&t.rotation_matrix(), &t.translation);
        let (angle, dist) = t.distance_to(&rebuilt);
        assert!(angle < 1e-10);
        assert!(dist < 1e-12);
    }
}
