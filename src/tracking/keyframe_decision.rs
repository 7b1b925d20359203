//! KeyFrame decision criteria.
//!
//! A keyframe is needed when enough frames passed since the last one, when
//! the frame tracks noticeably fewer landmarks than its reference keyframe
//! (novel viewpoint), or on a time cadence for inertial sessions. A needed
//! keyframe is deferred while the refiner's queue is saturated, except before
//! inertial initialization where insertion is forced so initialization can
//! make progress.

use crate::config::TrackingConfig;

/// Cap on tracked close points below which depth sensors want a keyframe.
const CLOSE_TRACKED_MAX: usize = 100;
/// Minimum creatable close points for the close-point trigger.
const CLOSE_UNTRACKED_MIN: usize = 70;
/// Inliers below which the viewpoint counts as novel.
const MIN_INLIERS_FOR_KEYFRAME: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFrameDecision {
    Insert,
    /// Needed, but the refiner is backlogged. Retried on the next frame.
    Deferred,
    NotNeeded,
}

/// Everything the decision looks at for one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyFrameInputs {
    pub frame_id: u64,
    pub timestamp: f64,
    pub last_kf_frame_id: u64,
    pub last_kf_timestamp: f64,
    pub last_reloc_frame_id: Option<u64>,
    pub num_keyframes: usize,
    /// Inlier landmark matches of the current frame.
    pub inliers: usize,
    /// Landmarks of the reference keyframe with enough observations.
    pub reference_tracked: usize,
    /// Depth sensors: close features already linked to a landmark.
    pub tracked_close: usize,
    /// Depth sensors: close features that could become new landmarks.
    pub untracked_close: usize,
    pub refiner_idle: bool,
    pub refiner_queue_len: usize,
    pub imu_initialized: bool,
    pub recently_lost: bool,
}

/// Minimum observations for a reference-keyframe landmark to count as tracked.
pub fn min_observations(num_keyframes: usize) -> usize {
    if num_keyframes <= 2 { 2 } else { 3 }
}

pub struct KeyFramePolicy {
    min_frames: u64,
    max_frames: u64,
    queue_limit: usize,
    interval_before_imu_init: f64,
    interval_after_imu_init: f64,
    monocular: bool,
    inertial: bool,
    localization_only: bool,
    /// A keyframe was deferred and is still owed.
    pending: bool,
}

impl KeyFramePolicy {
    pub fn new(config: &TrackingConfig) -> Self {
        let t = &config.tracking;
        Self {
            min_frames: t.min_frames,
            max_frames: t.max_frames,
            queue_limit: t.refiner_queue_limit,
            interval_before_imu_init: t.keyframe_interval_before_imu_init_s,
            interval_after_imu_init: t.keyframe_interval_after_imu_init_s,
            monocular: config.is_monocular(),
            inertial: config.is_inertial(),
            localization_only: false,
            pending: false,
        }
    }

    pub fn set_localization_only(&mut self, on: bool) {
        self.localization_only = on;
        if on {
            self.pending = false;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn reset(&mut self) {
        self.pending = false;
    }

    pub fn decide(&mut self, inputs: &KeyFrameInputs) -> KeyFrameDecision {
        if self.localization_only {
            return KeyFrameDecision::NotNeeded;
        }

        let forced = self.inertial && !inputs.imu_initialized;
        if forced {
            let elapsed = inputs.timestamp - inputs.last_kf_timestamp;
            if elapsed >= self.interval_before_imu_init {
                self.pending = false;
                return KeyFrameDecision::Insert;
            }
            return KeyFrameDecision::NotNeeded;
        }

        if inputs.frame_id < inputs.last_kf_frame_id + self.min_frames {
            return KeyFrameDecision::NotNeeded;
        }

        if !self.pending && !self.need_new_keyframe(inputs) {
            return KeyFrameDecision::NotNeeded;
        }

        let saturated = inputs.refiner_queue_len >= self.queue_limit
            || (self.monocular && !inputs.refiner_idle);
        if inputs.refiner_idle || !saturated {
            self.pending = false;
            KeyFrameDecision::Insert
        } else {
            self.pending = true;
            KeyFrameDecision::Deferred
        }
    }

    fn need_new_keyframe(&self, i: &KeyFrameInputs) -> bool {
        // Right after relocalization the map is trusted only once it is large.
        if let Some(reloc) = i.last_reloc_frame_id {
            if i.frame_id < reloc + self.max_frames && i.num_keyframes as u64 > self.max_frames {
                return false;
            }
        }

        let need_close = !self.monocular
            && i.tracked_close < CLOSE_TRACKED_MAX
            && i.untracked_close > CLOSE_UNTRACKED_MIN;

        let ref_ratio = if i.num_keyframes < 2 {
            0.4
        } else if self.monocular {
            if self.inertial && i.inliers > 350 { 0.75 } else { 0.9 }
        } else {
            0.75
        };
        let ref_matches = i.reference_tracked as f64;
        let inliers = i.inliers as f64;

        let c1a = i.frame_id >= i.last_kf_frame_id + self.max_frames;
        let c1b = i.frame_id >= i.last_kf_frame_id + self.min_frames && i.refiner_idle;
        let c1c = !self.monocular && (inliers < ref_matches * 0.25 || need_close);
        let c2 = (inliers < ref_matches * ref_ratio || need_close)
            && i.inliers > MIN_INLIERS_FOR_KEYFRAME;
        let c3 = self.inertial && i.timestamp - i.last_kf_timestamp >= self.interval_after_imu_init;
        let c4 = self.inertial
            && self.monocular
            && ((i.inliers < 75 && i.inliers > MIN_INLIERS_FOR_KEYFRAME) || i.recently_lost);

        ((c1a || c1b || c1c) && c2) || c3 || c4
    }
}
