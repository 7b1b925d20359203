//! Local Mapper - background refinement of the map around new keyframes.
//!
//! For each keyframe received from tracking:
//! 1. Refresh the viewing direction and scale range of its landmarks
//! 2. Cull recently created landmarks that tracking fails to find again
//! 3. Fuse duplicate landmarks with neighbouring keyframes
//! 4. Initialize the inertial state once the map allows it
//! 5. Forward the keyframe to loop closing
//!
//! Structural edits raise the shared map-updated flag tracking consumes.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::imu::ImuCalib;
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::{ImuUpdate, SharedState, Worker};
use crate::tracking::frame::CameraModel;

use super::imu_init::{apply_imu_init, estimate_imu_init};
use super::search_in_neighbors::search_in_neighbors;

/// Timeout for receiving keyframes. Allows periodic shutdown and reset checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Landmarks found in fewer than this share of the frames predicting them are culled.
const MIN_FOUND_RATIO: f64 = 0.25;

/// Keyframes a new landmark stays under probation.
const PROBATION_KEYFRAMES: usize = 3;

pub struct LocalMapper {
    camera: CameraModel,
    calib: ImuCalib,
    inertial: bool,
    monocular: bool,

    /// Landmarks under probation with the keyframe count at their creation.
    recent_points: Vec<(MapPointId, usize)>,
    processed: usize,

    lc_sender: Option<Sender<NewKeyFrameMsg>>,
}

impl LocalMapper {
    pub fn new(
        camera: CameraModel,
        calib: ImuCalib,
        inertial: bool,
        monocular: bool,
        lc_sender: Option<Sender<NewKeyFrameMsg>>,
    ) -> Self {
        Self {
            camera,
            calib,
            inertial,
            monocular,
            recent_points: Vec::new(),
            processed: 0,
            lc_sender,
        }
    }

    /// Main thread loop. Runs until shutdown is requested or the channel closes.
    pub fn run(&mut self, kf_receiver: Receiver<NewKeyFrameMsg>, shared: Arc<SharedState>) {
        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            if let Some(generation) = shared.pending_reset(Worker::LocalMapping) {
                self.reset(&kf_receiver);
                shared.acknowledge_reset(Worker::LocalMapping, generation);
                continue;
            }

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    shared.set_refiner_idle(false);
                    self.process_keyframe(msg, &shared);
                    shared.set_refiner_idle(kf_receiver.is_empty());
                }
                Err(RecvTimeoutError::Timeout) => {
                    shared.set_refiner_idle(true);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        shared.set_refiner_idle(true);
        info!("[LocalMapping] stopped after {} keyframes", self.processed);
    }

    /// Drop queued work and probation state.
    fn reset(&mut self, kf_receiver: &Receiver<NewKeyFrameMsg>) {
        let dropped = kf_receiver.try_iter().count();
        self.recent_points.clear();
        info!("[LocalMapping] reset, {} queued keyframes dropped", dropped);
    }

    pub fn process_keyframe(&mut self, msg: NewKeyFrameMsg, shared: &SharedState) {
        let mut atlas = shared.atlas.write();
        let Some(map) = atlas.get_map_mut(msg.map_index) else {
            debug!("[LocalMapping] map {} is gone", msg.map_index);
            return;
        };
        if map.get_keyframe(msg.keyframe_id).is_none() {
            debug!("[LocalMapping] KF {} is gone", msg.keyframe_id.0);
            return;
        }

        self.process_new_keyframe(map, msg.keyframe_id);
        let culled = self.cull_recent_points(map);
        let fusion = search_in_neighbors(map, msg.keyframe_id, &self.camera, self.inertial);

        let mut updated = culled > 0 || fusion.changed_map();

        if self.inertial && !map.is_imu_initialized() {
            if let Some(result) = estimate_imu_init(map, &self.calib) {
                apply_imu_init(map, &result);
                shared.publish_imu_update(ImuUpdate {
                    map_index: msg.map_index,
                    bias: result.bias,
                    scale: result.scale,
                });
                updated = true;
            }
        }
        drop(atlas);

        if updated {
            shared.set_map_updated();
        }
        self.processed += 1;
        debug!(
            "[LocalMapping] KF {}: {} culled, {} fused, {} observations added",
            msg.keyframe_id.0, culled, fusion.num_fused, fusion.num_observations_added
        );

        if let Some(sender) = &self.lc_sender {
            if sender.send(msg).is_err() {
                warn!("[LocalMapping] loop closing is gone");
            }
        }
    }

    /// Refresh landmark geometry and put the keyframe's new landmarks on probation.
    fn process_new_keyframe(&mut self, map: &mut Map, kf_id: KeyFrameId) {
        let points: Vec<MapPointId> = map
            .get_keyframe(kf_id)
            .map(|kf| kf.get_map_point_indices().map(|(_, id)| id).collect())
            .unwrap_or_default();
        for mp_id in points {
            if map.get_map_point(mp_id).is_some_and(|mp| mp.first_kf_id == kf_id) {
                self.recent_points.push((mp_id, self.processed));
            }
            map.update_map_point_normal_and_depth(mp_id);
        }
    }

    /// Cull probation landmarks that are rarely found or weakly observed.
    fn cull_recent_points(&mut self, map: &mut Map) -> usize {
        // Stereo observations constrain depth on their own.
        let min_observers = if self.monocular { 3 } else { 2 };
        let current = self.processed;
        let mut culled = 0;

        self.recent_points.retain(|&(mp_id, created)| {
            let Some(mp) = map.get_map_point(mp_id) else {
                return false;
            };
            let age = current - created;
            let cull = mp.is_bad
                || mp.found_ratio() < MIN_FOUND_RATIO
                || (age >= 2 && mp.num_observations() < min_observers);
            if cull {
                map.remove_map_point_full(mp_id);
                culled += 1;
                return false;
            }
            age < PROBATION_KEYFRAMES
        });
        culled
    }
}
