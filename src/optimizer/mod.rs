//! Optimization used by tracking.
//!
//! Implements Gauss-Newton optimization for:
//! - Pose-only optimization (current frame against fixed landmarks)

pub mod pose_optim;

pub use pose_optim::{PoseObservation, PoseOptimConfig, PoseOptimResult, PosePrior, optimize_pose};
