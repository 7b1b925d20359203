//! Rotation helpers shared by preintegration, pose updates and inertial
//! initialization. Rotations are plain `Matrix3` values; rotation vectors
//! are axis times angle.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// Below this angle the series expansions replace the closed forms.
const EPS_ANGLE: f64 = 1e-6;

/// Cross-product matrix: `skew(a) * b == a.cross(&b)`.
#[inline]
pub fn skew(a: &Vector3<f64>) -> Matrix3<f64> {
    a.cross_matrix()
}

pub fn exp_so3(rotvec: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::from_scaled_axis(*rotvec).into_inner()
}

/// Rotation vector of `r`, which must already be a rotation. Inputs that
/// drifted go through `normalize_rotation` first.
///
/// Goes through the quaternion so the angle comes from `atan2` and keeps
/// full precision near identity.
pub fn log_so3(r: &Matrix3<f64>) -> Vector3<f64> {
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*r)).scaled_axis()
}

/// Closest rotation to a matrix that drifted off SO(3).
pub fn normalize_rotation(r: &Matrix3<f64>) -> Matrix3<f64> {
    Rotation3::from_matrix(r).into_inner()
}

/// Right Jacobian of the exponential map:
/// `exp(w + dw) ≈ exp(w) · exp(Jr(w) · dw)`.
pub fn right_jacobian_so3(rotvec: &Vector3<f64>) -> Matrix3<f64> {
    let angle = rotvec.norm();
    let w = skew(rotvec);
    if angle < EPS_ANGLE {
        return Matrix3::identity() - 0.5 * w;
    }
    let a = (1.0 - angle.cos()) / (angle * angle);
    let b = (angle - angle.sin()) / (angle * angle * angle);
    Matrix3::identity() - a * w + b * w * w
}
