//! LoopCloser - place recognition thread.
//!
//! Receives keyframes forwarded by local mapping, queries the keyframe
//! database for places seen before and reports candidates that stay
//! consistent over consecutive keyframes. Loop and merge correction are not
//! performed here.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::{SharedState, Worker};

use super::detector::{ConsistencyChecker, LoopCandidate, LoopDetectorConfig, detect_loop_candidates};

/// Timeout for receiving keyframes from the channel.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    pub keyframes_processed: usize,
    pub candidates_detected: usize,
    /// Consistent candidates in the keyframe's own map.
    pub loops_detected: usize,
    /// Consistent candidates in another map.
    pub merges_detected: usize,
}

pub struct LoopCloser {
    consistency_checker: ConsistencyChecker,
    config: LoopDetectorConfig,
    stats: LoopCloserStats,
}

impl LoopCloser {
    pub fn new(config: LoopDetectorConfig) -> Self {
        Self {
            consistency_checker: ConsistencyChecker::new(config.clone()),
            config,
            stats: LoopCloserStats::default(),
        }
    }

    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }

    /// Process keyframes until shutdown is requested or the channel closes.
    pub fn run(&mut self, kf_receiver: Receiver<NewKeyFrameMsg>, shared: Arc<SharedState>) {
        info!("LoopCloser thread started");

        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            if let Some(generation) = shared.pending_reset(Worker::LoopClosing) {
                let dropped = kf_receiver.try_iter().count();
                self.consistency_checker.clear();
                info!("[LoopClosing] reset, {} queued keyframes dropped", dropped);
                shared.acknowledge_reset(Worker::LoopClosing, generation);
                continue;
            }

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    self.process_keyframe(msg, &shared);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("LoopCloser channel disconnected");
                    break;
                }
            }
        }

        info!(
            "LoopCloser thread exiting. Stats: processed={}, candidates={}, loops={}, merges={}",
            self.stats.keyframes_processed,
            self.stats.candidates_detected,
            self.stats.loops_detected,
            self.stats.merges_detected
        );
    }

    pub fn process_keyframe(&mut self, msg: NewKeyFrameMsg, shared: &SharedState) -> Option<LoopCandidate> {
        self.stats.keyframes_processed += 1;

        let candidates = {
            let atlas = shared.atlas.read();
            detect_loop_candidates(&atlas, msg.map_index, msg.keyframe_id, &self.config)
        };
        self.stats.candidates_detected += candidates.len();
        debug!(
            "[LoopClosing] KF {}: {} candidates",
            msg.keyframe_id.0,
            candidates.len()
        );

        let candidate = self.consistency_checker.add_and_check(&candidates)?;
        if candidate.map_index == msg.map_index {
            self.stats.loops_detected += 1;
            info!(
                "Loop candidate: KF {} -> KF {} (score {:.3})",
                candidate.current_kf_id.0, candidate.loop_kf_id.0, candidate.bow_score
            );
        } else {
            self.stats.merges_detected += 1;
            info!(
                "Merge candidate: KF {} -> KF {} in map {} (score {:.3})",
                candidate.current_kf_id.0,
                candidate.loop_kf_id.0,
                candidate.map_index,
                candidate.bow_score
            );
        }
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::keyframe_db::bow_from_descriptors;
    use crate::atlas::map::KeyFrameId;
    use crate::geometry::SE3;
    use crate::tracking::frame::{FeatureSet, KeyPoint};
    use nalgebra::Vector3;

    /// Keyframe whose descriptors spell `place`, sharing one landmark with
    /// the previous keyframe so every keyframe has a covisible.
    fn add_keyframe(shared: &SharedState, place: u8, shared_point: Option<(u64, usize)>) -> KeyFrameId {
        let mut atlas = shared.atlas.write();
        let descs: Vec<[u8; 32]> = (0..8u8)
            .map(|i| {
                let mut d = [0u8; 32];
                d[0] = place;
                d[1] = i;
                d
            })
            .collect();
        let kps = (0..8).map(|i| KeyPoint::new(10.0 * i as f64, 10.0, 0)).collect();
        let bow = bow_from_descriptors(&descs);
        let map_index = atlas.active_map_index();
        let (map, db) = atlas.active_map_and_db_mut();
        let kf = map.create_keyframe(0, 0.0, SE3::identity(), FeatureSet::monocular(kps, descs), bow.clone());
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 1.0), [0; 32], kf);
        map.associate(kf, 7, mp);
        if let Some((prev, idx)) = shared_point {
            let prev_mp = map.get_keyframe(KeyFrameId::new(prev)).unwrap().get_map_point(idx).unwrap();
            map.associate(kf, 6, prev_mp);
        }
        map.update_connections(kf);
        db.add(kf, bow, map_index);
        kf
    }

    #[test]
    fn test_revisit_is_reported_once_consistent() {
        let shared = SharedState::new(1.2, 8);
        // A long run through new places, then back to the first ones.
        let mut ids = Vec::new();
        for place in 0..20u8 {
            let prev = ids.last().map(|id: &KeyFrameId| (id.0, 7));
            ids.push(add_keyframe(&shared, place, prev));
        }

        let mut lc = LoopCloser::new(LoopDetectorConfig::default());
        let mut found = None;
        for place in 0..3u8 {
            let prev = ids.last().map(|id| (id.0, 7));
            let kf = add_keyframe(&shared, place, prev);
            ids.push(kf);
            found = lc.process_keyframe(
                NewKeyFrameMsg {
                    keyframe_id: kf,
                    map_index: 0,
                    timestamp: 0.0,
                },
                &shared,
            );
        }

        let candidate = found.expect("loop after three consistent keyframes");
        assert_eq!(candidate.map_index, 0);
        assert!(candidate.loop_kf_id.0 < 3);
        assert_eq!(lc.stats().loops_detected, 1);
    }
}
