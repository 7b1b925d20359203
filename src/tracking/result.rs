//! Tracking results and diagnostics structures.
//!
//! These types describe what happened during processing of a single frame:
//! - high level tracking state (OK / LOST / etc.)
//! - pose and velocity estimates
//! - correspondence counts and local map sizes
//! - timing information for profiling

use nalgebra::Vector3;

use crate::atlas::map::KeyFrameId;
use crate::geometry::SE3;
use crate::tracking::TrackingState;

/// Summary of tracking for a single frame.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub frame_id: u64,
    pub timestamp: f64,
    pub state: TrackingState,
    /// T_wc; `None` before initialization and while lost.
    pub pose: Option<SE3>,
    pub velocity: Vector3<f64>,
    pub reference_kf_id: Option<KeyFrameId>,
    /// Keyframe created from this frame, if any.
    pub new_keyframe: Option<KeyFrameId>,
    pub metrics: TrackingMetrics,
    pub timing: TimingStats,
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingMetrics {
    pub n_features: usize,
    pub n_map_point_matches: usize,
    pub n_inliers: usize,
    pub n_local_keyframes: usize,
    pub n_local_map_points: usize,
    pub delta_translation_m: f64,
    pub delta_rotation_deg: f64,
}

/// Timing breakdown for a frame, in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingStats {
    pub total_ms: f64,
    pub extract_ms: f64,
    pub preintegrate_ms: f64,
    pub track_ms: f64,
    pub local_map_ms: f64,
    pub relocal_ms: f64,
    pub keyframe_ms: f64,
}

impl TimingStats {
    pub fn zero() -> Self {
        Self::default()
    }
}
