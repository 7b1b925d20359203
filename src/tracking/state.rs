//! Tracking state machine.
//!
//! All transitions between the tracking states happen here. The tracker
//! reports what each frame achieved and acts on the returned
//! [`RecoveryAction`]; it never assigns a state directly.

use tracing::{debug, info, warn};

/// State of the tracking thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// Session not started, or a reset is in progress.
    #[default]
    SystemNotReady,
    NoImagesYet,
    /// Waiting for map initialization.
    NotInitialized,
    Ok,
    /// Tracking failed; inertial prediction carries the pose for a grace period.
    RecentlyLost,
    /// Needs relocalization.
    Lost,
    /// Localization-only mode tracking with too few map landmarks.
    OkKlt,
}

impl TrackingState {
    /// The frame has a usable pose.
    pub fn is_tracking(&self) -> bool {
        matches!(self, Self::Ok | Self::OkKlt | Self::RecentlyLost)
    }
}

/// What the tracking stages achieved on one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Normal tracking reached the inlier threshold.
    Tracked,
    /// Pose recovered by relocalization.
    Relocalized,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Continue,
    /// Relocalization kept failing: retire the active map and start over.
    StartNewMap,
}

pub struct RecoveryController {
    inertial: bool,
    grace_s: f64,
    max_relocalization_failures: usize,

    state: TrackingState,
    last_processed: TrackingState,
    /// Orthogonal visual-odometry flag (localization-only mode).
    vo: bool,
    /// Timestamp of the last frame tracked successfully.
    last_ok_timestamp: Option<f64>,
    relocalization_failures: usize,
    /// State to return to if a pending reset is abandoned.
    before_reset: Option<TrackingState>,
}

impl RecoveryController {
    pub fn new(inertial: bool, grace_s: f64, max_relocalization_failures: usize) -> Self {
        Self {
            inertial,
            grace_s,
            max_relocalization_failures: max_relocalization_failures.max(1),
            state: TrackingState::SystemNotReady,
            last_processed: TrackingState::SystemNotReady,
            vo: false,
            last_ok_timestamp: None,
            relocalization_failures: 0,
            before_reset: None,
        }
    }

    /// Internal state. Localization-only VO is reported as `Ok` here.
    pub fn state(&self) -> TrackingState {
        self.state
    }

    /// State as reported to callers.
    pub fn reported_state(&self) -> TrackingState {
        if self.state == TrackingState::Ok && self.vo {
            TrackingState::OkKlt
        } else {
            self.state
        }
    }

    pub fn last_processed_state(&self) -> TrackingState {
        self.last_processed
    }

    pub fn is_vo(&self) -> bool {
        self.vo
    }

    pub fn set_vo(&mut self, vo: bool) {
        if vo != self.vo {
            debug!("[Recovery] visual odometry flag {}", if vo { "raised" } else { "cleared" });
        }
        self.vo = vo;
    }

    pub fn relocalization_failures(&self) -> usize {
        self.relocalization_failures
    }

    /// Threads are up; frames may arrive.
    pub fn mark_ready(&mut self) {
        if self.state == TrackingState::SystemNotReady {
            self.state = TrackingState::NoImagesYet;
        }
    }

    /// Called at the start of every frame.
    pub fn begin_frame(&mut self) {
        self.last_processed = self.state;
        if matches!(self.state, TrackingState::SystemNotReady | TrackingState::NoImagesYet) {
            self.state = TrackingState::NotInitialized;
        }
    }

    pub fn on_initialized(&mut self, timestamp: f64) {
        info!("[Recovery] map initialized at t={:.3}", timestamp);
        self.transition(TrackingState::Ok);
        self.last_ok_timestamp = Some(timestamp);
        self.relocalization_failures = 0;
        self.vo = false;
    }

    /// Fold the outcome of an initialized frame into the state.
    pub fn on_frame(&mut self, outcome: FrameOutcome, timestamp: f64) -> RecoveryAction {
        match outcome {
            FrameOutcome::Tracked | FrameOutcome::Relocalized => {
                if outcome == FrameOutcome::Relocalized {
                    info!(
                        "[Recovery] relocalized after {} failed attempts",
                        self.relocalization_failures
                    );
                }
                self.transition(TrackingState::Ok);
                self.last_ok_timestamp = Some(timestamp);
                self.relocalization_failures = 0;
                RecoveryAction::Continue
            }
            FrameOutcome::Failed => self.on_failure(timestamp),
        }
    }

    fn on_failure(&mut self, timestamp: f64) -> RecoveryAction {
        match self.state {
            TrackingState::Ok | TrackingState::OkKlt => {
                if self.inertial && !self.grace_elapsed(timestamp) {
                    self.transition(TrackingState::RecentlyLost);
                } else {
                    self.transition(TrackingState::Lost);
                }
                RecoveryAction::Continue
            }
            TrackingState::RecentlyLost => {
                if self.grace_elapsed(timestamp) {
                    self.transition(TrackingState::Lost);
                }
                RecoveryAction::Continue
            }
            TrackingState::Lost => {
                self.relocalization_failures += 1;
                if self.relocalization_failures >= self.max_relocalization_failures {
                    warn!(
                        "[Recovery] {} consecutive relocalization failures, starting a new map",
                        self.relocalization_failures
                    );
                    self.relocalization_failures = 0;
                    self.last_ok_timestamp = None;
                    self.vo = false;
                    self.transition(TrackingState::NotInitialized);
                    RecoveryAction::StartNewMap
                } else {
                    RecoveryAction::Continue
                }
            }
            TrackingState::SystemNotReady | TrackingState::NoImagesYet | TrackingState::NotInitialized => {
                RecoveryAction::Continue
            }
        }
    }

    /// The grace period is measured from the last successfully tracked frame
    /// in sensor time.
    fn grace_elapsed(&self, timestamp: f64) -> bool {
        self.last_ok_timestamp
            .is_none_or(|t| timestamp - t > self.grace_s)
    }

    /// The active map was discarded outside of the failure path.
    pub fn on_map_reset(&mut self) {
        self.relocalization_failures = 0;
        self.last_ok_timestamp = None;
        self.vo = false;
        self.transition(TrackingState::NotInitialized);
    }

    pub fn begin_reset(&mut self) {
        self.before_reset.get_or_insert(self.state);
        self.transition(TrackingState::SystemNotReady);
    }

    /// The reset was abandoned before anything was cleared.
    pub fn abort_reset(&mut self) {
        if let Some(previous) = self.before_reset.take() {
            self.transition(previous);
        }
    }

    pub fn finish_reset(&mut self) {
        self.before_reset = None;
        self.relocalization_failures = 0;
        self.last_ok_timestamp = None;
        self.vo = false;
        self.transition(TrackingState::NoImagesYet);
    }

    fn transition(&mut self, next: TrackingState) {
        if next != self.state {
            info!("[Recovery] {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized(inertial: bool, grace_s: f64) -> RecoveryController {
        let mut rc = RecoveryController::new(inertial, grace_s, 3);
        rc.mark_ready();
        rc.begin_frame();
        rc.on_initialized(0.0);
        rc
    }

    #[test]
    fn test_startup_sequence() {
        let mut rc = RecoveryController::new(false, 1.0, 3);
        assert_eq!(rc.state(), TrackingState::SystemNotReady);
        rc.mark_ready();
        assert_eq!(rc.state(), TrackingState::NoImagesYet);
        rc.begin_frame();
        assert_eq!(rc.state(), TrackingState::NotInitialized);
        assert_eq!(rc.last_processed_state(), TrackingState::NoImagesYet);
    }

    #[test]
    fn test_vision_only_is_lost_immediately() {
        let mut rc = initialized(false, 5.0);
        rc.on_frame(FrameOutcome::Failed, 0.05);
        assert_eq!(rc.state(), TrackingState::Lost);
    }

    #[test]
    fn test_inertial_grace_period() {
        // Grace covers three frames at 20 Hz.
        let mut rc = initialized(true, 0.175);
        for k in 1..=3 {
            rc.on_frame(FrameOutcome::Failed, k as f64 * 0.05);
            assert_eq!(rc.state(), TrackingState::RecentlyLost, "frame {k}");
        }
        rc.on_frame(FrameOutcome::Failed, 0.2);
        assert_eq!(rc.state(), TrackingState::Lost);
    }

    #[test]
    fn test_recovery_within_grace() {
        let mut rc = initialized(true, 1.0);
        rc.on_frame(FrameOutcome::Failed, 0.1);
        assert_eq!(rc.state(), TrackingState::RecentlyLost);
        rc.on_frame(FrameOutcome::Tracked, 0.2);
        assert_eq!(rc.state(), TrackingState::Ok);
        // Grace restarts from the recovered frame.
        rc.on_frame(FrameOutcome::Failed, 1.0);
        assert_eq!(rc.state(), TrackingState::RecentlyLost);
    }

    #[test]
    fn test_repeated_relocalization_failure_starts_new_map() {
        let mut rc = initialized(false, 0.0);
        rc.on_frame(FrameOutcome::Failed, 0.1);
        assert_eq!(rc.on_frame(FrameOutcome::Failed, 0.2), RecoveryAction::Continue);
        assert_eq!(rc.on_frame(FrameOutcome::Failed, 0.3), RecoveryAction::Continue);
        assert_eq!(rc.on_frame(FrameOutcome::Failed, 0.4), RecoveryAction::StartNewMap);
        assert_eq!(rc.state(), TrackingState::NotInitialized);
    }

    #[test]
    fn test_relocalization_resets_failure_count() {
        let mut rc = initialized(false, 0.0);
        rc.on_frame(FrameOutcome::Failed, 0.1);
        rc.on_frame(FrameOutcome::Failed, 0.2);
        assert_eq!(rc.relocalization_failures(), 1);
        rc.on_frame(FrameOutcome::Relocalized, 0.3);
        assert_eq!(rc.state(), TrackingState::Ok);
        assert_eq!(rc.relocalization_failures(), 0);
    }

    #[test]
    fn test_vo_reported_as_ok_klt() {
        let mut rc = initialized(false, 0.0);
        rc.set_vo(true);
        assert_eq!(rc.state(), TrackingState::Ok);
        assert_eq!(rc.reported_state(), TrackingState::OkKlt);
    }

    #[test]
    fn test_reset_handshake_states() {
        let mut rc = initialized(true, 1.0);
        rc.begin_reset();
        assert_eq!(rc.state(), TrackingState::SystemNotReady);
        rc.finish_reset();
        assert_eq!(rc.state(), TrackingState::NoImagesYet);
    }

    #[test]
    fn test_aborted_reset_restores_state() {
        let mut rc = initialized(true, 1.0);
        rc.on_frame(FrameOutcome::Failed, 0.1);
        let before = rc.state();
        assert_eq!(before, TrackingState::RecentlyLost);
        rc.begin_reset();
        rc.begin_reset();
        assert_eq!(rc.state(), TrackingState::SystemNotReady);
        rc.abort_reset();
        assert_eq!(rc.state(), before);

        // Nothing to restore once a reset completed.
        rc.begin_reset();
        rc.finish_reset();
        rc.abort_reset();
        assert_eq!(rc.state(), TrackingState::NoImagesYet);
    }
}
