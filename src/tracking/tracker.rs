//! Main tracker: orchestrates frame processing and pose estimation.
//!
//! This implementation follows the ORB-SLAM3 design:
//! - Holds the `Atlas` write lock for the whole frame, so the background
//!   threads never observe a half-tracked frame
//! - Predicts the pose from the constant-velocity model or, once the map is
//!   inertially initialized, from IMU preintegration
//! - Falls back to matching against the reference keyframe, then to
//!   relocalization
//! - Refines every pose against the local map
//! - Hands new keyframes to local mapping without blocking

use std::sync::Arc;
use std::time::Instant;

use nalgebra::{Matrix6, Vector3};
use tracing::{debug, info, warn};

use crate::atlas::Atlas;
use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::config::{SensorKind, TrackingConfig};
use crate::geometry::SE3;
use crate::imu::{ImuBias, ImuCalib, ImuSample, Preintegrator, segments_between};
use crate::optimizer::PosePrior;
use crate::system::backend::MappingBackend;
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::SharedState;
use crate::tracking::TrackingState;
use crate::tracking::estimate::PoseEstimate;
use crate::tracking::frame::{CameraModel, FeatureSet};
use crate::tracking::initializer::{InitOutcome, Initializer};
use crate::tracking::keyframe_decision::{
    KeyFrameDecision, KeyFrameInputs, KeyFramePolicy, min_observations,
};
use crate::tracking::local_map::{LocalMap, compute_local_map};
use crate::tracking::matching::{
    APPEARANCE_NN_RATIO, search_by_appearance, search_by_projection_last_frame,
    search_local_points,
};
use crate::tracking::motion_model::MotionModel;
use crate::tracking::refine::{count_map_matches, discard_outliers, optimize_frame_pose};
use crate::tracking::relocalization::Relocalizer;
use crate::tracking::result::{TimingStats, TrackingMetrics, TrackingResult};
use crate::tracking::state::{FrameOutcome, RecoveryAction, RecoveryController};
use crate::tracking::tracking_frame::Frame;
use crate::tracking::trajectory::{TrajectoryEntry, TrajectoryHistory};

/// Projection matches the motion model needs before optimizing.
const MIN_MOTION_MATCHES: usize = 20;
/// Appearance matches needed to track against the reference keyframe.
const MIN_REFERENCE_MATCHES: usize = 15;
/// Inliers observed by keyframes that a frame-to-frame stage needs.
const MIN_MAP_MATCHES: usize = 10;
/// Close depth points always considered, even beyond `close_depth`.
const MIN_CLOSE_POINTS: usize = 100;
/// Inertial sessions treat larger timestamp gaps as a sensor dropout.
const MAX_FRAME_GAP_S: f64 = 1.0;

fn elapsed_ms(t: Instant) -> f64 {
    t.elapsed().as_secs_f64() * 1000.0
}

/// Links, outlier flags and estimate of a frame, saved while an alternative
/// stage runs on the same frame.
type FrameSnapshot = (Vec<Option<MapPointId>>, Vec<bool>, Option<PoseEstimate>);

/// Clear outlier links and stamp their landmarks as seen by `frame`, so the
/// local-map search does not offer them again.
fn discard_and_mark(frame: &mut Frame, map: &mut Map) {
    for id in discard_outliers(frame) {
        if let Some(mp) = map.get_map_point_mut(id) {
            mp.last_frame_seen = Some(frame.id);
        }
    }
}

/// Depth features sorted by increasing depth.
fn features_by_depth(frame: &Frame) -> Vec<(f64, usize)> {
    let mut by_depth: Vec<(f64, usize)> = (0..frame.num_features())
        .filter_map(|i| frame.point_cam(i).map(|p| (p.z, i)))
        .filter(|(z, _)| *z > 0.0)
        .collect();
    by_depth.sort_by(|a, b| a.0.total_cmp(&b.0));
    by_depth
}

/// Main tracking structure.
pub struct Tracker {
    config: Arc<TrackingConfig>,
    camera: CameraModel,
    calib: ImuCalib,

    shared: Arc<SharedState>,
    backend: Box<dyn MappingBackend>,

    recovery: RecoveryController,
    initializer: Initializer,
    relocalizer: Relocalizer,
    keyframe_policy: KeyFramePolicy,
    motion_model: MotionModel,
    trajectory: Arc<TrajectoryHistory>,

    localization_only: bool,
    next_frame_id: u64,

    last_frame: Option<Frame>,
    /// Last frame pose expressed in its reference keyframe.
    last_relative: Option<(KeyFrameId, SE3)>,
    reference_kf: Option<KeyFrameId>,
    local_map: LocalMap,
    /// Frame-only landmarks created for the current frame.
    temporal_points: Vec<MapPointId>,

    last_kf_id: Option<KeyFrameId>,
    last_kf_frame_id: u64,
    last_kf_timestamp: f64,
    last_reloc_frame_id: Option<u64>,
    last_inliers: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Inertial state
    // ─────────────────────────────────────────────────────────────────────────
    bias: ImuBias,
    /// Accumulates everything since the last keyframe.
    kf_preintegrator: Preintegrator,
    /// Last sample of the previous drain, bridging consecutive frames.
    last_imu_sample: Option<ImuSample>,
}

impl Tracker {
    pub fn new(
        config: Arc<TrackingConfig>,
        shared: Arc<SharedState>,
        backend: Box<dyn MappingBackend>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let camera = CameraModel::from_config(&config.camera);
        let calib = config.imu_calib()?;
        let t = &config.tracking;

        Ok(Self {
            camera,
            calib,
            recovery: RecoveryController::new(
                config.is_inertial(),
                t.recently_lost_grace_s,
                t.max_relocalization_failures,
            ),
            initializer: Initializer::new(&config, camera),
            relocalizer: Relocalizer::new(
                camera,
                config.features.clone(),
                t.min_inliers_after_relocalization,
                t.relocalization_seed,
            ),
            keyframe_policy: KeyFramePolicy::new(&config),
            motion_model: MotionModel::new(),
            trajectory: Arc::new(TrajectoryHistory::new()),
            localization_only: false,
            next_frame_id: 0,
            last_frame: None,
            last_relative: None,
            reference_kf: None,
            local_map: LocalMap::default(),
            temporal_points: Vec::new(),
            last_kf_id: None,
            last_kf_frame_id: 0,
            last_kf_timestamp: 0.0,
            last_reloc_frame_id: None,
            last_inliers: 0,
            bias: ImuBias::zero(),
            kf_preintegrator: Preintegrator::new(ImuBias::zero(), calib.noise),
            last_imu_sample: None,
            shared,
            backend,
            config,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> TrackingState {
        self.recovery.reported_state()
    }

    pub fn last_processed_state(&self) -> TrackingState {
        self.recovery.last_processed_state()
    }

    pub fn is_vo(&self) -> bool {
        self.recovery.is_vo()
    }

    /// Landmark inliers of the last processed frame.
    pub fn inlier_count(&self) -> usize {
        self.last_inliers
    }

    /// Landmarks of the current local map.
    pub fn local_landmarks(&self) -> Vec<MapPointId> {
        self.local_map.points.clone()
    }

    pub fn local_map(&self) -> &LocalMap {
        &self.local_map
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.reference_kf
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    pub fn trajectory(&self) -> Arc<TrajectoryHistory> {
        Arc::clone(&self.trajectory)
    }

    pub fn bias(&self) -> ImuBias {
        self.bias
    }

    pub fn is_localization_only(&self) -> bool {
        self.localization_only
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Control
    // ─────────────────────────────────────────────────────────────────────────

    /// Background threads are running; accept frames.
    pub fn mark_ready(&mut self) {
        self.recovery.mark_ready();
    }

    /// Disable (or re-enable) map growth.
    pub fn set_localization_only(&mut self, on: bool) {
        info!(
            "[Tracking] localization-only mode {}",
            if on { "on" } else { "off" }
        );
        self.localization_only = on;
        self.keyframe_policy.set_localization_only(on);
        if !on {
            self.recovery.set_vo(false);
        }
    }

    pub fn begin_reset(&mut self) {
        self.recovery.begin_reset();
    }

    /// The map was left untouched; resume where tracking stopped.
    pub fn abort_reset(&mut self) {
        self.recovery.abort_reset();
    }

    /// Forget all per-map state after the atlas was reset.
    pub fn finish_reset(&mut self, clear_trajectory: bool) {
        self.forget_map();
        self.last_imu_sample = None;
        self.bias = ImuBias::zero();
        self.kf_preintegrator.reset(self.bias);
        if clear_trajectory {
            self.trajectory.clear();
        }
        self.recovery.finish_reset();
    }

    /// The active map was emptied or retired; the next frame initializes.
    pub fn on_active_map_reset(&mut self) {
        self.forget_map();
        self.recovery.on_map_reset();
    }

    fn forget_map(&mut self) {
        self.initializer.reset();
        self.keyframe_policy.reset();
        self.motion_model.reset();
        self.last_frame = None;
        self.last_relative = None;
        self.reference_kf = None;
        self.local_map = LocalMap::default();
        self.temporal_points.clear();
        self.last_kf_id = None;
        self.last_kf_frame_id = 0;
        self.last_kf_timestamp = 0.0;
        self.last_reloc_frame_id = None;
        self.last_inliers = 0;
        self.recovery.set_vo(false);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Per-frame entry point
    // ─────────────────────────────────────────────────────────────────────────

    /// Track one frame of extracted features.
    pub fn track(&mut self, features: FeatureSet, timestamp: f64) -> TrackingResult {
        let t_start = Instant::now();
        let mut timing = TimingStats::zero();

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        let mut frame = Frame::new(frame_id, timestamp, features, &self.camera);
        let prev_pose = self.last_frame.as_ref().and_then(Frame::pose);

        let last_ts = self.last_frame.as_ref().map(|f| f.timestamp);
        if self.config.is_inertial() && last_ts.is_some_and(|t| timestamp <= t) {
            warn!(
                "[Tracking] frame {} at t={:.6} does not advance time, ignored",
                frame_id, timestamp
            );
            return self.build_result(&frame, None, None, timing, t_start);
        }

        self.recovery.begin_frame();

        let shared = Arc::clone(&self.shared);
        let mut atlas = shared.atlas.write();

        if self.config.is_inertial() {
            let t = Instant::now();
            self.handle_timestamp_gap(timestamp, &mut atlas);
            self.preintegrate_imu(&mut frame);
            timing.preintegrate_ms = elapsed_ms(t);
        }

        let map_updated = self.backend.map_updated_since_last_check();
        self.apply_imu_update(atlas.active_map_index());

        let new_keyframe = if self.recovery.state() == TrackingState::NotInitialized {
            let t = Instant::now();
            let kf = self.initialize(&mut frame, &mut atlas);
            timing.track_ms = elapsed_ms(t);
            kf
        } else {
            self.track_initialized(&mut frame, &mut atlas, map_updated, &mut timing)
        };

        self.record_trajectory(&frame, atlas.active_map());
        drop(atlas);

        let result = self.build_result(&frame, new_keyframe, prev_pose, timing, t_start);
        self.last_frame = Some(frame);
        result
    }

    /// Inertial sessions cannot bridge a long sensor gap.
    fn handle_timestamp_gap(&mut self, timestamp: f64, atlas: &mut Atlas) {
        let Some(last_ts) = self.last_frame.as_ref().map(|f| f.timestamp) else {
            return;
        };
        if timestamp - last_ts <= MAX_FRAME_GAP_S {
            return;
        }
        warn!(
            "[Tracking] {:.3}s without frames, abandoning the active map",
            timestamp - last_ts
        );
        if atlas.active_map().is_imu_initialized() {
            atlas.create_new_map();
        } else {
            atlas.reset_active_map();
        }
        self.on_active_map_reset();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inertial
    // ─────────────────────────────────────────────────────────────────────────

    /// Fill both inertial deltas of `frame` from the pending samples.
    fn preintegrate_imu(&mut self, frame: &mut Frame) {
        let drained = self.shared.imu_queue.drain_until(frame.timestamp);
        let mut batch: Vec<ImuSample> = Vec::with_capacity(drained.len() + 1);
        batch.extend(self.last_imu_sample);
        batch.extend(drained);
        self.last_imu_sample = batch.last().copied();

        let Some(last_ts) = self.last_frame.as_ref().map(|f| f.timestamp) else {
            self.kf_preintegrator.reset(self.bias);
            return;
        };
        let segments = segments_between(&batch, last_ts, frame.timestamp);
        if segments.is_empty() {
            debug!("[Tracking] frame {}: no inertial samples", frame.id);
        }

        let mut from_last = Preintegrator::new(self.bias, self.calib.noise);
        from_last.integrate_segments(&segments);
        self.kf_preintegrator.integrate_segments(&segments);

        frame.preint_from_last_frame = Some(from_last.state);
        frame.preint_from_last_kf = Some(self.kf_preintegrator.state);
    }

    /// Adopt a bias (and scale) published by local mapping.
    ///
    /// Deltas already integrated keep their linearization bias; predictions
    /// correct them to first order.
    fn apply_imu_update(&mut self, active_map: usize) {
        let Some(update) = self.shared.take_imu_update() else {
            return;
        };
        if update.map_index != active_map {
            debug!("[Tracking] ignoring inertial update for map {}", update.map_index);
            return;
        }
        info!(
            "[Tracking] new bias gyro=[{:.4}, {:.4}, {:.4}] accel=[{:.4}, {:.4}, {:.4}], scale {:.4}",
            update.bias.gyro.x,
            update.bias.gyro.y,
            update.bias.gyro.z,
            update.bias.accel.x,
            update.bias.accel.y,
            update.bias.accel.z,
            update.scale
        );
        self.bias = update.bias;

        let last_estimate = self.last_frame.as_mut().and_then(|f| f.estimate.as_mut());
        if let Some(est) = last_estimate {
            est.bias = update.bias;
            est.pose.translation *= update.scale;
            est.velocity *= update.scale;
        }
        if let Some((_, rel)) = self.last_relative.as_mut() {
            rel.translation *= update.scale;
        }
        self.motion_model.rescale(update.scale);
    }

    fn inertial_ready(&self, map: &Map) -> bool {
        self.config.is_inertial() && map.is_imu_initialized()
    }

    /// Predict the frame state from inertial data.
    ///
    /// After a map update the prediction starts from the last keyframe,
    /// whose state local mapping may have corrected.
    fn predict_from_imu(&self, frame: &Frame, map: &Map, map_updated: bool) -> Option<PoseEstimate> {
        if !self.inertial_ready(map) {
            return None;
        }
        let last_kf = self
            .last_kf_id
            .filter(|_| map_updated)
            .and_then(|id| map.get_keyframe(id));

        let (base_pose, base_vel, delta) = match last_kf {
            Some(kf) => (kf.pose, kf.velocity, frame.preint_from_last_kf?),
            None => {
                let last = self.last_frame.as_ref()?.estimate?;
                (last.pose, last.velocity, frame.preint_from_last_frame?)
            }
        };
        if delta.is_empty() {
            return None;
        }

        let t_wb = self.calib.body_pose(&base_pose);
        let (t_wb2, v2) = delta.predict(&t_wb, &base_vel, &map.gravity(), &self.bias);
        Some(PoseEstimate::new(self.calib.camera_pose(&t_wb2), v2, self.bias))
    }

    /// Gaussian pose prior from the inertial prediction.
    fn inertial_prior(&self, frame: &Frame, predicted: &PoseEstimate) -> Option<PosePrior> {
        let cov = frame.preint_from_last_frame?.covariance;
        let mut information = Matrix6::zeros();
        for i in 0..3 {
            information[(i, i)] = 1.0 / cov[(i, i)].max(1e-9);
            information[(i + 3, i + 3)] = 1.0 / cov[(i + 6, i + 6)].max(1e-9);
        }
        Some(PosePrior {
            pose_cw: predicted.pose.inverse(),
            information,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    fn initialize(&mut self, frame: &mut Frame, atlas: &mut Atlas) -> Option<KeyFrameId> {
        let seed = PoseEstimate::new(SE3::identity(), Vector3::zeros(), self.bias);
        let outcome = if self.config.has_depth() {
            self.initializer.initialize_with_depth(frame, atlas, seed)
        } else {
            self.initializer.initialize_monocular(frame, atlas, seed)
        };
        let InitOutcome::Initialized {
            reference,
            keyframes,
            ..
        } = outcome
        else {
            self.last_inliers = 0;
            return None;
        };

        let map_index = atlas.active_map_index();
        let map = atlas.active_map_mut();
        for kf_id in &keyframes {
            let Some(kf) = map.get_keyframe_mut(*kf_id) else {
                continue;
            };
            kf.imu_bias = self.bias;
            let timestamp = kf.timestamp;
            self.backend.enqueue(NewKeyFrameMsg {
                keyframe_id: *kf_id,
                map_index,
                timestamp,
            });
        }

        self.kf_preintegrator.reset(self.bias);
        self.motion_model.reset();
        self.reference_kf = Some(reference);
        self.last_kf_id = Some(reference);
        self.last_kf_frame_id = frame.id;
        self.last_kf_timestamp = frame.timestamp;
        self.local_map = compute_local_map(
            &frame.map_points,
            map,
            Some(reference),
            self.config.tracking.max_local_keyframes,
            false,
        );
        self.last_inliers = frame.num_matches();
        self.recovery.on_initialized(frame.timestamp);
        Some(reference)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────────

    fn track_initialized(
        &mut self,
        frame: &mut Frame,
        atlas: &mut Atlas,
        map_updated: bool,
        timing: &mut TimingStats,
    ) -> Option<KeyFrameId> {
        let t = Instant::now();
        self.check_replaced_in_last_frame(atlas.active_map());
        let imu_prediction = self.predict_from_imu(frame, atlas.active_map(), map_updated);

        let (mut ok, relocalized) = if self.localization_only {
            self.track_localization_only(frame, atlas, imu_prediction, timing)
        } else {
            self.track_pose(frame, atlas, imu_prediction, timing)
        };
        timing.track_ms = elapsed_ms(t) - timing.relocal_ms;

        if frame.reference_kf.is_none() {
            frame.reference_kf = self.reference_kf;
        }

        let t = Instant::now();
        if ok && !self.recovery.is_vo() {
            ok = self.track_local_map(frame, atlas.active_map_mut(), imu_prediction);
        } else if ok {
            self.last_inliers = frame.num_inlier_matches();
        } else {
            self.last_inliers = 0;
        }
        timing.local_map_ms = elapsed_ms(t);

        let outcome = match (ok, relocalized) {
            (true, true) => FrameOutcome::Relocalized,
            (true, false) => FrameOutcome::Tracked,
            (false, _) => FrameOutcome::Failed,
        };

        if !ok {
            // While recently lost the inertial prediction stands in for the pose.
            let fallback = imu_prediction.filter(|_| self.recovery.state() != TrackingState::Lost);
            frame.estimate = fallback;
            if fallback.is_none() {
                frame.clear_matches();
            }
        }

        if self.recovery.on_frame(outcome, frame.timestamp) == RecoveryAction::StartNewMap {
            self.delete_temporal_points(atlas.active_map_mut());
            atlas.create_new_map();
            self.forget_map();
            frame.estimate = None;
            frame.reference_kf = None;
            frame.clear_matches();
            return None;
        }

        let state = self.recovery.state();
        let has_pose = frame.estimate.is_some() && state.is_tracking();
        self.update_motion(frame, atlas.active_map(), has_pose);

        // Frame-only landmarks never reach a keyframe.
        let map = atlas.active_map_mut();
        for (slot, outlier) in frame.map_points.iter_mut().zip(frame.outliers.iter_mut()) {
            let Some(id) = *slot else { continue };
            if map.get_map_point(id).is_none_or(|mp| mp.num_observations() == 0) {
                *slot = None;
                *outlier = false;
            }
        }
        self.delete_temporal_points(map);

        let may_insert = (ok && state == TrackingState::Ok)
            || (has_pose && state == TrackingState::RecentlyLost && self.config.is_inertial());
        if !may_insert || !self.need_new_keyframe(frame, atlas.active_map()) {
            return None;
        }
        let t = Instant::now();
        let kf = self.create_keyframe(frame, atlas);
        timing.keyframe_ms = elapsed_ms(t);
        kf
    }

    /// Pose tracking with map growth enabled. Returns (ok, relocalized).
    fn track_pose(
        &mut self,
        frame: &mut Frame,
        atlas: &mut Atlas,
        imu_prediction: Option<PoseEstimate>,
        timing: &mut TimingStats,
    ) -> (bool, bool) {
        match self.recovery.state() {
            TrackingState::Ok | TrackingState::OkKlt => {
                let just_relocalized = self.last_reloc_frame_id.is_some_and(|r| frame.id < r + 2);
                let can_predict = self.motion_model.has_velocity() || imu_prediction.is_some();

                let mut ok = false;
                if can_predict && !just_relocalized {
                    ok = self.track_with_motion_model(frame, atlas.active_map_mut(), imu_prediction);
                }
                if !ok {
                    ok = self.track_reference_keyframe(frame, atlas.active_map_mut());
                }
                (ok, false)
            }
            TrackingState::RecentlyLost => {
                if self.track_with_motion_model(frame, atlas.active_map_mut(), imu_prediction) {
                    return (true, false);
                }
                let ok = self.relocalize(frame, atlas, timing);
                (ok, ok)
            }
            TrackingState::Lost => {
                let ok = self.relocalize(frame, atlas, timing);
                (ok, ok)
            }
            _ => (false, false),
        }
    }

    /// Pose tracking without map growth.
    ///
    /// With too few map matches the visual-odometry flag is raised; while it
    /// is set relocalization is retried every frame alongside the motion
    /// model, and wins when it succeeds.
    fn track_localization_only(
        &mut self,
        frame: &mut Frame,
        atlas: &mut Atlas,
        imu_prediction: Option<PoseEstimate>,
        timing: &mut TimingStats,
    ) -> (bool, bool) {
        if self.recovery.state() == TrackingState::Lost {
            let ok = self.relocalize(frame, atlas, timing);
            return (ok, ok);
        }
        let can_predict = self.motion_model.has_velocity() || imu_prediction.is_some();

        if !self.recovery.is_vo() {
            let mut ok = false;
            if can_predict {
                ok = self.track_with_motion_model(frame, atlas.active_map_mut(), imu_prediction);
            }
            if !ok {
                ok = self.track_reference_keyframe(frame, atlas.active_map_mut());
            }
            return (ok, false);
        }

        let mut ok_motion = false;
        let mut snapshot: Option<FrameSnapshot> = None;
        if can_predict {
            ok_motion = self.track_with_motion_model(frame, atlas.active_map_mut(), imu_prediction);
            snapshot = Some((frame.map_points.clone(), frame.outliers.clone(), frame.estimate));
        }

        if self.relocalize(frame, atlas, timing) {
            self.recovery.set_vo(false);
            return (true, true);
        }

        if ok_motion {
            if let Some((links, outliers, estimate)) = snapshot {
                frame.map_points = links;
                frame.outliers = outliers;
                frame.estimate = estimate;
            }
            let map = atlas.active_map_mut();
            for (slot, outlier) in frame.map_points.iter().zip(&frame.outliers) {
                let Some(id) = *slot else { continue };
                if *outlier {
                    continue;
                }
                if let Some(mp) = map.get_map_point_mut(id) {
                    mp.increase_found(1);
                }
            }
        }
        (ok_motion, false)
    }

    /// Redirect links of the previous frame to landmarks that replaced them;
    /// drop links to culled landmarks.
    fn check_replaced_in_last_frame(&mut self, map: &Map) {
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        let mut cleared = 0;
        for slot in last.map_points.iter_mut() {
            let Some(id) = *slot else { continue };
            *slot = map.resolve(id);
            if slot.is_none() {
                cleared += 1;
            }
        }
        if cleared > 0 {
            debug!("[Tracking] cleared {} stale links of frame {}", cleared, last.id);
        }
    }

    /// Re-anchor the last frame on its reference keyframe and, in
    /// localization-only mode with depth, give it temporary landmarks.
    fn update_last_frame(&mut self, map: &mut Map) {
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        if let Some((kf_id, rel)) = self.last_relative {
            let kf_pose = map.get_keyframe(kf_id).map(|kf| kf.pose);
            if let (Some(kf_pose), Some(est)) = (kf_pose, last.estimate.as_mut()) {
                est.pose = kf_pose.compose(&rel);
            }
        }

        if !self.localization_only || !self.config.has_depth() || last.id == self.last_kf_frame_id {
            return;
        }
        let (Some(pose), Some(reference)) = (last.pose(), self.reference_kf) else {
            return;
        };

        let close_depth = self.config.camera.close_depth;
        let mut n_points = 0;
        for (z, idx) in features_by_depth(last) {
            let needs_point = last.map_points[idx]
                .is_none_or(|id| map.get_map_point(id).is_none_or(|mp| mp.num_observations() == 0));
            if needs_point {
                let Some(p_cam) = last.point_cam(idx) else {
                    continue;
                };
                let mp_id = map.create_temporary_map_point(
                    pose.transform_point(&p_cam),
                    last.features.descriptors[idx],
                    reference,
                );
                last.map_points[idx] = Some(mp_id);
                last.outliers[idx] = false;
                self.temporal_points.push(mp_id);
            }
            n_points += 1;
            if z > close_depth && n_points > MIN_CLOSE_POINTS {
                break;
            }
        }
    }

    fn delete_temporal_points(&mut self, map: &mut Map) {
        for id in self.temporal_points.drain(..) {
            map.remove_map_point_full(id);
        }
    }

    /// Predict the pose and match the previous frame's landmarks.
    fn track_with_motion_model(
        &mut self,
        frame: &mut Frame,
        map: &mut Map,
        imu_prediction: Option<PoseEstimate>,
    ) -> bool {
        self.update_last_frame(map);
        let Some(last) = self.last_frame.as_ref() else {
            return false;
        };
        let Some(last_est) = last.estimate else {
            return false;
        };

        let predicted = match imu_prediction {
            Some(p) => p,
            None => match self.motion_model.predict(&last_est.pose) {
                Some(pose) => PoseEstimate::new(pose, last_est.velocity, self.bias),
                None => return false,
            },
        };
        frame.clear_matches();
        frame.estimate = Some(predicted);

        let monocular = self.config.is_monocular();
        let th = if monocular {
            self.config.tracking.motion_search_radius_mono
        } else {
            self.config.tracking.motion_search_radius_stereo
        };
        let features = &self.config.features;
        let mut n = search_by_projection_last_frame(frame, last, map, &self.camera, features, th, monocular);
        if n < MIN_MOTION_MATCHES {
            frame.clear_matches();
            n = search_by_projection_last_frame(
                frame,
                last,
                map,
                &self.camera,
                features,
                2.0 * th,
                monocular,
            );
        }
        if n < MIN_MOTION_MATCHES {
            debug!("[Tracking] frame {}: motion model found {} matches", frame.id, n);
            return self.config.is_inertial();
        }

        let prior = imu_prediction.and_then(|p| self.inertial_prior(frame, &p));
        let outcome = optimize_frame_pose(
            frame,
            predicted,
            map,
            &self.camera,
            &self.config.features,
            prior.as_ref(),
        );
        discard_and_mark(frame, map);
        let n_map = count_map_matches(frame, map);

        if self.localization_only {
            self.recovery.set_vo(n_map < MIN_MAP_MATCHES);
            return outcome.inliers > MIN_MOTION_MATCHES;
        }
        self.inertial_ready(map) || n_map >= MIN_MAP_MATCHES
    }

    /// Match the reference keyframe by appearance and optimize from the
    /// last pose.
    fn track_reference_keyframe(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        let Some(seed) = self.last_frame.as_ref().and_then(|f| f.estimate) else {
            return false;
        };
        let Some(reference) = self.reference_kf else {
            return false;
        };
        let Some(kf) = map.get_keyframe(reference) else {
            return false;
        };

        let n = search_by_appearance(kf, frame, map, APPEARANCE_NN_RATIO);
        if n < MIN_REFERENCE_MATCHES {
            debug!("[Tracking] frame {}: {} matches to reference {}", frame.id, n, reference);
            frame.clear_matches();
            return false;
        }

        optimize_frame_pose(frame, seed, map, &self.camera, &self.config.features, None);
        discard_and_mark(frame, map);
        self.config.is_inertial() || count_map_matches(frame, map) >= MIN_MAP_MATCHES
    }

    fn relocalize(&mut self, frame: &mut Frame, atlas: &Atlas, timing: &mut TimingStats) -> bool {
        let t = Instant::now();
        let seed = PoseEstimate::new(SE3::identity(), Vector3::zeros(), self.bias);
        let result = self
            .relocalizer
            .relocalize(frame, atlas.active_map(), &atlas.keyframe_db, seed);
        timing.relocal_ms += elapsed_ms(t);

        let Some(reloc) = result else {
            debug!("[Tracking] frame {}: relocalization failed", frame.id);
            return false;
        };
        info!(
            "[Tracking] frame {} relocalized against keyframe {} ({} inliers)",
            frame.id, reloc.keyframe, reloc.inliers
        );
        frame.estimate = Some(reloc.estimate);
        frame.reference_kf = Some(reloc.keyframe);
        self.reference_kf = Some(reloc.keyframe);
        self.last_reloc_frame_id = Some(frame.id);
        self.motion_model.reset();
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local map
    // ─────────────────────────────────────────────────────────────────────────

    /// Window scale for the local-map search.
    fn local_search_radius(&self, frame_id: u64, inertial_ready: bool) -> f64 {
        let mut th = if self.config.sensor.kind == SensorKind::Rgbd {
            3.0
        } else {
            1.0
        };
        if self.config.is_inertial() {
            th = if inertial_ready { 2.0 } else { 10.0 };
        }
        if self.last_reloc_frame_id.is_some_and(|r| frame_id < r + 2) {
            th = 5.0;
        }
        if matches!(
            self.recovery.state(),
            TrackingState::Lost | TrackingState::RecentlyLost
        ) {
            th = 15.0;
        }
        th * self.config.tracking.local_search_radius
    }

    /// Project the local map into the frame, refine, and apply the inlier
    /// threshold of the current situation.
    fn track_local_map(
        &mut self,
        frame: &mut Frame,
        map: &mut Map,
        imu_prediction: Option<PoseEstimate>,
    ) -> bool {
        let Some(estimate) = frame.estimate else {
            return false;
        };
        let inertial_ready = self.inertial_ready(map);

        let local = compute_local_map(
            &frame.map_points,
            map,
            self.reference_kf,
            self.config.tracking.max_local_keyframes,
            self.config.is_inertial(),
        );
        if let Some(reference) = local.reference {
            self.reference_kf = Some(reference);
            frame.reference_kf = Some(reference);
        }

        for id in frame.map_points.iter().flatten() {
            if let Some(mp) = map.get_map_point_mut(*id) {
                mp.increase_visible(1);
                mp.last_frame_seen = Some(frame.id);
            }
        }

        let mut candidates = Vec::new();
        for id in &local.points {
            let Some(mp) = map.get_map_point(*id).filter(|mp| !mp.is_bad) else {
                continue;
            };
            if mp.last_frame_seen == Some(frame.id) {
                continue;
            }
            if let Some(proj) = frame.is_in_frustum(mp, &estimate.pose, &self.camera, &self.config.features) {
                candidates.push((*id, proj));
            }
        }
        for (id, _) in &candidates {
            if let Some(mp) = map.get_map_point_mut(*id) {
                mp.increase_visible(1);
            }
        }

        let th = self.local_search_radius(frame.id, inertial_ready);
        let found = search_local_points(frame, &candidates, map, &self.camera, &self.config.features, th);
        debug!(
            "[Tracking] frame {}: {} local keyframes, {} in view, {} new matches",
            frame.id,
            local.keyframes.len(),
            candidates.len(),
            found
        );

        let prior = imu_prediction
            .filter(|_| inertial_ready)
            .and_then(|p| self.inertial_prior(frame, &p));
        optimize_frame_pose(
            frame,
            estimate,
            map,
            &self.camera,
            &self.config.features,
            prior.as_ref(),
        );

        let mut inliers = 0;
        for (slot, outlier) in frame.map_points.iter().zip(&frame.outliers) {
            let Some(id) = *slot else { continue };
            if *outlier {
                continue;
            }
            let Some(mp) = map.get_map_point_mut(id) else {
                continue;
            };
            mp.increase_found(1);
            if self.localization_only || mp.num_observations() > 0 {
                inliers += 1;
            }
        }
        discard_and_mark(frame, map);
        self.last_inliers = inliers;
        self.local_map = local;

        let t = &self.config.tracking;
        let after_relocalization = self
            .last_reloc_frame_id
            .is_some_and(|r| frame.id < r + t.max_frames);
        if after_relocalization && inliers < t.min_inliers_after_relocalization {
            return false;
        }
        if self.recovery.state() == TrackingState::RecentlyLost {
            return inliers >= t.min_inliers_recently_lost;
        }
        if inertial_ready {
            inliers >= t.min_inliers_inertial
        } else {
            inliers >= t.min_inliers
        }
    }

    /// Refresh the motion model and, before inertial initialization, the
    /// frame velocity from consecutive poses.
    fn update_motion(&mut self, frame: &mut Frame, map: &Map, has_pose: bool) {
        let prev = self
            .last_frame
            .as_ref()
            .and_then(|f| f.pose().map(|p| (p, f.timestamp)));
        let inertial_ready = self.inertial_ready(map);
        match (has_pose, prev, frame.estimate.as_mut()) {
            (true, Some((prev_pose, prev_ts)), Some(est)) => {
                self.motion_model.update(&prev_pose, &est.pose);
                let dt = frame.timestamp - prev_ts;
                if !inertial_ready && dt > 0.0 {
                    est.velocity = (est.pose.translation - prev_pose.translation) / dt;
                }
            }
            _ => self.motion_model.reset(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keyframes
    // ─────────────────────────────────────────────────────────────────────────

    /// Close depth features split into (tracked, creatable).
    fn close_point_counts(&self, frame: &Frame) -> (usize, usize) {
        let close_depth = self.config.camera.close_depth;
        let mut tracked = 0;
        let mut untracked = 0;
        for idx in 0..frame.num_features() {
            let Some(p) = frame.point_cam(idx) else {
                continue;
            };
            if p.z <= 0.0 || p.z >= close_depth {
                continue;
            }
            if frame.map_points[idx].is_some() && !frame.outliers[idx] {
                tracked += 1;
            } else {
                untracked += 1;
            }
        }
        (tracked, untracked)
    }

    fn need_new_keyframe(&mut self, frame: &Frame, map: &Map) -> bool {
        let num_keyframes = map.num_keyframes();
        let reference_tracked = self
            .reference_kf
            .map_or(0, |r| map.tracked_map_points(r, min_observations(num_keyframes)));
        let (tracked_close, untracked_close) = if self.config.has_depth() {
            self.close_point_counts(frame)
        } else {
            (0, 0)
        };

        let inputs = KeyFrameInputs {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            last_kf_frame_id: self.last_kf_frame_id,
            last_kf_timestamp: self.last_kf_timestamp,
            last_reloc_frame_id: self.last_reloc_frame_id,
            num_keyframes,
            inliers: self.last_inliers,
            reference_tracked,
            tracked_close,
            untracked_close,
            refiner_idle: self.backend.is_idle(),
            refiner_queue_len: self.backend.queue_length(),
            imu_initialized: map.is_imu_initialized(),
            recently_lost: self.recovery.state() == TrackingState::RecentlyLost,
        };
        match self.keyframe_policy.decide(&inputs) {
            KeyFrameDecision::Insert => true,
            KeyFrameDecision::Deferred => {
                debug!(
                    "[Tracking] frame {}: keyframe deferred, {} queued",
                    frame.id, inputs.refiner_queue_len
                );
                false
            }
            KeyFrameDecision::NotNeeded => false,
        }
    }

    /// Promote `frame` to a keyframe and hand it to local mapping.
    ///
    /// The frame's links are rewritten to exactly the keyframe's
    /// associations, including landmarks created from close depth points.
    fn create_keyframe(&mut self, frame: &mut Frame, atlas: &mut Atlas) -> Option<KeyFrameId> {
        let estimate = frame.estimate?;
        let map_index = atlas.active_map_index();
        let (map, db) = atlas.active_map_and_db_mut();

        let kf_id = map.create_keyframe(
            frame.id,
            frame.timestamp,
            estimate.pose,
            frame.features.clone(),
            frame.bow.clone(),
        );

        for idx in 0..frame.num_features() {
            let Some(mp_id) = frame.map_points[idx] else {
                continue;
            };
            let usable = !frame.outliers[idx]
                && map
                    .get_map_point(mp_id)
                    .is_some_and(|mp| !mp.is_bad && !mp.is_temporary);
            if !usable || !map.associate(kf_id, idx, mp_id) {
                frame.map_points[idx] = None;
                frame.outliers[idx] = false;
            }
        }

        let mut n_new = 0;
        if self.config.has_depth() {
            let close_depth = self.config.camera.close_depth;
            let mut n_points = 0;
            for (z, idx) in features_by_depth(frame) {
                if frame.map_points[idx].is_none() {
                    let Some(p_cam) = frame.point_cam(idx) else {
                        continue;
                    };
                    let mp_id = map.create_map_point(
                        estimate.pose.transform_point(&p_cam),
                        frame.features.descriptors[idx],
                        kf_id,
                    );
                    map.associate(kf_id, idx, mp_id);
                    map.update_map_point_normal_and_depth(mp_id);
                    frame.map_points[idx] = Some(mp_id);
                    n_new += 1;
                }
                n_points += 1;
                if z > close_depth && n_points > MIN_CLOSE_POINTS {
                    break;
                }
            }
        }

        if let Some(kf) = map.get_keyframe_mut(kf_id) {
            kf.velocity = estimate.velocity;
            kf.imu_bias = self.bias;
            kf.imu_preintegrated = frame.preint_from_last_kf;
        }
        map.update_connections(kf_id);
        db.add(kf_id, frame.bow.clone(), map_index);

        self.backend.enqueue(NewKeyFrameMsg {
            keyframe_id: kf_id,
            map_index,
            timestamp: frame.timestamp,
        });
        debug!(
            "[Tracking] keyframe {} from frame {} ({} new landmarks)",
            kf_id, frame.id, n_new
        );

        self.kf_preintegrator.reset(self.bias);
        self.reference_kf = Some(kf_id);
        frame.reference_kf = Some(kf_id);
        self.last_kf_id = Some(kf_id);
        self.last_kf_frame_id = frame.id;
        self.last_kf_timestamp = frame.timestamp;
        Some(kf_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Output
    // ─────────────────────────────────────────────────────────────────────────

    fn record_trajectory(&mut self, frame: &Frame, map: &Map) {
        let reference = frame.reference_kf.and_then(|id| map.get_keyframe(id));
        match (frame.pose(), reference) {
            (Some(pose), Some(kf)) if self.recovery.state().is_tracking() => {
                let relative = kf.pose.inverse().compose(&pose);
                self.last_relative = Some((kf.id, relative));
                self.trajectory.push(TrajectoryEntry {
                    timestamp: frame.timestamp,
                    relative_pose: relative,
                    reference_kf: Some(kf.id),
                    lost: false,
                });
            }
            _ if !self.trajectory.is_empty() => self.trajectory.push_lost(frame.timestamp),
            _ => {}
        }
    }

    fn build_result(
        &self,
        frame: &Frame,
        new_keyframe: Option<KeyFrameId>,
        prev_pose: Option<SE3>,
        mut timing: TimingStats,
        t_start: Instant,
    ) -> TrackingResult {
        let state = self.state();
        let pose = frame.pose().filter(|_| state.is_tracking());
        let (delta_rotation_deg, delta_translation_m) = match (prev_pose, pose) {
            (Some(a), Some(b)) => {
                let (angle, dist) = a.distance_to(&b);
                (angle.to_degrees(), dist)
            }
            _ => (0.0, 0.0),
        };
        timing.total_ms = elapsed_ms(t_start);

        TrackingResult {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            state,
            pose,
            velocity: frame.estimate.map_or_else(Vector3::zeros, |e| e.velocity),
            reference_kf_id: frame.reference_kf,
            new_keyframe,
            metrics: TrackingMetrics {
                n_features: frame.num_features(),
                n_map_point_matches: frame.num_matches(),
                n_inliers: self.last_inliers,
                n_local_keyframes: self.local_map.keyframes.len(),
                n_local_map_points: self.local_map.points.len(),
                delta_translation_m,
                delta_rotation_deg,
            },
            timing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::frame::{Descriptor, KeyPoint};
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<NewKeyFrameMsg>>,
    }

    struct TestBackend(Arc<Recorder>);

    impl MappingBackend for TestBackend {
        fn enqueue(&self, msg: NewKeyFrameMsg) {
            self.0.sent.lock().push(msg);
        }
        fn queue_length(&self) -> usize {
            0
        }
        fn is_idle(&self) -> bool {
            true
        }
        fn map_updated_since_last_check(&self) -> bool {
            false
        }
    }

    fn tracker(kind: SensorKind, use_imu: bool) -> (Tracker, Arc<SharedState>, Arc<Recorder>) {
        let config = Arc::new(TrackingConfig::for_sensor(kind, use_imu));
        let shared = SharedState::new(config.features.scale_factor, config.features.n_levels);
        let recorder = Arc::new(Recorder::default());
        let mut tracker = Tracker::new(
            config,
            Arc::clone(&shared),
            Box::new(TestBackend(Arc::clone(&recorder))),
        )
        .unwrap();
        tracker.mark_ready();
        (tracker, shared, recorder)
    }

    /// Depth features on a regular grid, all at 2 m.
    fn depth_features(n: usize) -> FeatureSet {
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        let mut points_cam = Vec::new();
        for i in 0..n {
            let u = 20.0 + (i % 30) as f64 * 23.0;
            let v = 20.0 + (i / 30) as f64 * 18.0;
            keypoints.push(KeyPoint::new(u, v, 0));
            let mut d = [0u8; 32];
            d[..8].copy_from_slice(&(i as u64).to_le_bytes());
            d[8..16].copy_from_slice(&(i as u64).wrapping_mul(2_654_435_761).to_le_bytes());
            descriptors.push(d);
            points_cam.push(Some(Vector3::new(
                (u - 376.0) * 2.0 / 458.0,
                (v - 240.0) * 2.0 / 458.0,
                2.0,
            )));
        }
        FeatureSet {
            keypoints,
            descriptors,
            points_cam,
        }
    }

    /// Static landmarks on a pixel grid, rendered exactly for a camera that
    /// translates along x.
    struct Scene {
        points: Vec<Vector3<f64>>,
        descriptors: Vec<Descriptor>,
    }

    impl Scene {
        fn new(n: usize, depth: (f64, f64), seed: u64) -> Self {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut points = Vec::with_capacity(n);
            let mut descriptors = Vec::with_capacity(n);
            for i in 0..n {
                let u = 20.0 + (i % 30) as f64 * 24.0;
                let v = 20.0 + ((i / 30) % 20) as f64 * 22.0;
                let z = depth.0 + (depth.1 - depth.0) * ((i * 7) % 11) as f64 / 10.0;
                points.push(Vector3::new((u - 367.0) * z / 458.0, (v - 248.0) * z / 457.0, z));
                let mut d = [0u8; 32];
                rng.fill(&mut d[..]);
                descriptors.push(d);
            }
            Self { points, descriptors }
        }

        fn render_into(&self, features: &mut FeatureSet, camera_x: f64) {
            for (p, d) in self.points.iter().zip(&self.descriptors) {
                let p_cam = p - Vector3::new(camera_x, 0.0, 0.0);
                let u = 458.0 * p_cam.x / p_cam.z + 367.0;
                let v = 457.0 * p_cam.y / p_cam.z + 248.0;
                if !(1.0..751.0).contains(&u) || !(1.0..479.0).contains(&v) {
                    continue;
                }
                features.keypoints.push(KeyPoint::new(u, v, 0));
                features.descriptors.push(*d);
                features.points_cam.push(Some(p_cam));
            }
        }

        fn render(&self, camera_x: f64) -> FeatureSet {
            let mut features = FeatureSet::default();
            self.render_into(&mut features, camera_x);
            features
        }

        /// Same view without depth.
        fn render_monocular(&self, camera_x: f64) -> FeatureSet {
            let features = self.render(camera_x);
            FeatureSet::monocular(features.keypoints, features.descriptors)
        }
    }

    #[test]
    fn test_depth_initialization_creates_keyframe() {
        let (mut tracker, shared, recorder) = tracker(SensorKind::Stereo, false);
        let result = tracker.track(depth_features(600), 0.0);

        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.new_keyframe.is_some());
        assert_eq!(recorder.sent.lock().len(), 1);
        assert_eq!(shared.atlas.read().active_map().num_keyframes(), 1);
        assert_eq!(tracker.trajectory().len(), 1);
    }

    #[test]
    fn test_first_frame_without_depth_stays_uninitialized() {
        let (mut tracker, _, recorder) = tracker(SensorKind::Stereo, false);
        let result = tracker.track(FeatureSet::default(), 0.0);
        assert_eq!(result.state, TrackingState::NotInitialized);
        assert!(result.pose.is_none());
        assert!(recorder.sent.lock().is_empty());
        assert!(tracker.trajectory().is_empty());
    }

    #[test]
    fn test_monocular_frames_without_features_stay_uninitialized() {
        let (mut tracker, shared, recorder) = tracker(SensorKind::Monocular, false);
        for t in [0.0, 0.05] {
            let result = tracker.track(FeatureSet::default(), t);
            assert_eq!(result.state, TrackingState::NotInitialized);
            assert!(result.new_keyframe.is_none());
        }
        assert!(recorder.sent.lock().is_empty());
        assert_eq!(shared.atlas.read().active_map().num_keyframes(), 0);
    }

    #[test]
    fn test_monocular_two_view_initialization() {
        let (mut tracker, shared, recorder) = tracker(SensorKind::Monocular, false);
        let scene = Scene::new(600, (4.5, 6.0), 8);
        let results: Vec<TrackingResult> = (0..6)
            .map(|i| tracker.track(scene.render_monocular(0.08 * i as f64), 0.05 * i as f64))
            .collect();

        assert_eq!(results[0].state, TrackingState::NotInitialized);
        let first_ok = results
            .iter()
            .position(|r| r.state == TrackingState::Ok)
            .unwrap();
        assert!(first_ok <= 3);
        assert!(results[first_ok].new_keyframe.is_some());
        assert!(results[first_ok..].iter().all(|r| r.state == TrackingState::Ok));

        let sent = recorder.sent.lock();
        assert!(sent.len() >= 2);
        let (kf_a, kf_b) = (sent[0].keyframe_id, sent[1].keyframe_id);
        let atlas = shared.atlas.read();
        let kf = atlas.active_map().get_keyframe(kf_b).unwrap();
        assert!(kf.get_covisibility_weight(kf_a) >= 50);
    }

    #[test]
    fn test_inertial_session_ignores_stale_timestamps() {
        let (mut tracker, _, _) = tracker(SensorKind::Stereo, true);
        tracker.track(FeatureSet::default(), 1.0);
        let result = tracker.track(FeatureSet::default(), 1.0);
        assert_eq!(result.frame_id, 1);
        assert_eq!(tracker.last_frame().map(|f| f.id), Some(0));
    }

    #[test]
    fn test_vision_only_loses_track_on_empty_frame() {
        let (mut tracker, _, _) = tracker(SensorKind::Stereo, false);
        tracker.track(depth_features(600), 0.0);
        let result = tracker.track(FeatureSet::default(), 0.05);
        assert_eq!(result.state, TrackingState::Lost);
        assert!(result.pose.is_none());
        assert_eq!(tracker.inlier_count(), 0);
        assert_eq!(
            tracker.trajectory().entries().last().map(|e| e.lost),
            Some(true)
        );
    }

    #[test]
    fn test_vision_only_stays_lost_without_features() {
        let (mut tracker, _, _) = tracker(SensorKind::Stereo, false);
        tracker.track(depth_features(600), 0.0);
        for i in 1..=50 {
            let result = tracker.track(FeatureSet::default(), 0.05 * i as f64);
            assert_eq!(result.state, TrackingState::Lost, "frame {}", i);
        }
        assert!(tracker.trajectory().entries().iter().skip(1).all(|e| e.lost));
    }

    #[test]
    fn test_finish_reset_forgets_map_state() {
        let (mut tracker, shared, _) = tracker(SensorKind::Stereo, false);
        tracker.track(depth_features(600), 0.0);
        tracker.begin_reset();
        assert_eq!(tracker.state(), TrackingState::SystemNotReady);
        shared.atlas.write().clear();
        tracker.finish_reset(true);

        assert_eq!(tracker.state(), TrackingState::NoImagesYet);
        assert!(tracker.reference_keyframe().is_none());
        assert!(tracker.local_landmarks().is_empty());
        assert!(tracker.trajectory().is_empty());
    }

    #[test]
    fn test_constant_velocity_tracking() {
        let (mut tracker, _, _) = tracker(SensorKind::Stereo, false);
        let scene = Scene::new(600, (4.5, 6.0), 1);
        let mut last = None;
        for i in 0..10 {
            let result = tracker.track(scene.render(0.01 * i as f64), 0.05 * i as f64);
            assert_eq!(result.state, TrackingState::Ok, "frame {}", i);
            last = result.pose;
        }

        let pose = last.unwrap();
        assert!((pose.translation - Vector3::new(0.09, 0.0, 0.0)).norm() < 1e-3);
        assert!(tracker.inlier_count() >= 30);
        assert_eq!(tracker.trajectory().len(), 10);
        assert!(!tracker.local_landmarks().is_empty());
    }

    #[test]
    fn test_keyframe_links_match_frame_links() {
        let (mut tracker, shared, recorder) = tracker(SensorKind::Stereo, false);
        let far = Scene::new(600, (4.5, 6.0), 2);
        let near = Scene::new(120, (2.0, 2.0), 3);
        tracker.track(far.render(0.0), 0.0);

        // Untracked close points call for a keyframe.
        let mut features = far.render(0.01);
        near.render_into(&mut features, 0.01);
        let result = tracker.track(features, 0.05);
        assert_eq!(result.state, TrackingState::Ok);
        let kf_id = result.new_keyframe.unwrap();
        assert_eq!(recorder.sent.lock().len(), 2);

        let atlas = shared.atlas.read();
        let map = atlas.active_map();
        let kf = map.get_keyframe(kf_id).unwrap();
        let frame = tracker.last_frame().unwrap();
        let frame_pose = frame.pose().unwrap();
        assert!((kf.pose.translation - frame_pose.translation).norm() < 1e-12);
        assert!(kf.pose.rotation.angle_to(&frame_pose.rotation) < 1e-12);
        for (idx, link) in frame.map_points.iter().enumerate() {
            assert_eq!(kf.get_map_point(idx), *link, "feature {}", idx);
        }
        assert!(kf.num_map_points() >= 700);
        assert_eq!(map.num_keyframes(), 2);
        assert!(kf.get_covisibility_weight(KeyFrameId::new(0)) >= 500);
    }

    #[test]
    fn test_localization_only_never_creates_keyframes() {
        let (mut tracker, shared, recorder) = tracker(SensorKind::Stereo, false);
        let far = Scene::new(600, (4.5, 6.0), 4);
        let near = Scene::new(120, (2.0, 2.0), 5);
        tracker.track(far.render(0.0), 0.0);
        tracker.set_localization_only(true);

        let mut features = far.render(0.01);
        near.render_into(&mut features, 0.01);
        let result = tracker.track(features, 0.05);
        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.new_keyframe.is_none());
        assert_eq!(recorder.sent.lock().len(), 1);
        assert_eq!(shared.atlas.read().active_map().num_keyframes(), 1);
    }

    #[test]
    fn test_relocalizes_on_revisited_view() {
        let (mut tracker, _, _) = tracker(SensorKind::Stereo, false);
        let scene = Scene::new(600, (4.5, 6.0), 6);
        tracker.track(scene.render(0.0), 0.0);
        assert_eq!(tracker.track(FeatureSet::default(), 0.05).state, TrackingState::Lost);
        assert_eq!(tracker.track(FeatureSet::default(), 0.10).state, TrackingState::Lost);

        let result = tracker.track(scene.render(0.0), 0.15);
        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.pose.unwrap().translation.norm() < 1e-3);
        assert!(tracker.inlier_count() >= 50);
    }

    #[test]
    fn test_inertial_grace_period_then_lost() {
        let mut config = TrackingConfig::for_sensor(SensorKind::Stereo, true);
        config.tracking.recently_lost_grace_s = 0.125;
        let shared = SharedState::new(config.features.scale_factor, config.features.n_levels);
        let recorder = Arc::new(Recorder::default());
        let mut tracker =
            Tracker::new(Arc::new(config), shared, Box::new(TestBackend(recorder))).unwrap();
        tracker.mark_ready();

        tracker.track(depth_features(600), 0.0);
        let states: Vec<TrackingState> = [0.05, 0.10, 0.15, 0.20]
            .iter()
            .map(|t| tracker.track(FeatureSet::default(), *t).state)
            .collect();
        assert_eq!(
            states,
            vec![
                TrackingState::RecentlyLost,
                TrackingState::RecentlyLost,
                TrackingState::Lost,
                TrackingState::Lost,
            ]
        );
    }

    #[test]
    fn test_relocalization_failures_start_a_new_map() {
        let mut config = TrackingConfig::for_sensor(SensorKind::Stereo, false);
        config.tracking.max_relocalization_failures = 2;
        let shared = SharedState::new(config.features.scale_factor, config.features.n_levels);
        let recorder = Arc::new(Recorder::default());
        let mut tracker = Tracker::new(
            Arc::new(config),
            Arc::clone(&shared),
            Box::new(TestBackend(recorder)),
        )
        .unwrap();
        tracker.mark_ready();

        tracker.track(depth_features(600), 0.0);
        let states: Vec<TrackingState> = [0.05, 0.10, 0.15]
            .iter()
            .map(|t| tracker.track(FeatureSet::default(), *t).state)
            .collect();
        assert_eq!(
            states,
            vec![TrackingState::Lost, TrackingState::Lost, TrackingState::NotInitialized]
        );
        assert_eq!(shared.atlas.read().num_maps(), 2);

        let result = tracker.track(depth_features(600), 0.20);
        assert_eq!(result.state, TrackingState::Ok);
        assert_eq!(shared.atlas.read().active_map_index(), 1);
    }
}
