//! Tracking: turns per-frame features (+ IMU) into poses and KeyFrames.
//!
//! This module implements the TRACKING component of ORB-SLAM3:
//! - Frame construction and feature grid
//! - Map initialization (depth sensors or two-view monocular)
//! - Initial pose estimation (IMU prediction, motion model, reference
//!   keyframe, relocalization)
//! - Track local map (projection-based search + pose refinement)
//! - Recovery state machine and new KeyFrame decision

pub mod estimate;
pub mod frame;
pub mod initializer;
pub mod keyframe_decision;
pub mod local_map;
pub mod matching;
pub mod motion_model;
pub mod refine;
pub mod relocalization;
pub mod result;
pub mod state;
pub mod tracker;
pub mod tracking_frame;
pub mod trajectory;

pub use estimate::{PoseEstimate, StageOutcome};
pub use result::{TimingStats, TrackingMetrics, TrackingResult};
pub use state::TrackingState;
pub use tracker::Tracker;
pub use trajectory::{TrajectoryEntry, TrajectoryHistory};
