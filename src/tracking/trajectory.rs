//! Per-frame trajectory log.
//!
//! Frames are stored relative to their reference keyframe, so the exported
//! trajectory follows the keyframe poses as the background threads correct
//! them.

use parking_lot::Mutex;

use crate::atlas::map::{KeyFrameId, Map};
use crate::geometry::SE3;

#[derive(Debug, Clone, Copy)]
pub struct TrajectoryEntry {
    pub timestamp: f64,
    /// T_ref_c: frame pose expressed in its reference keyframe.
    pub relative_pose: SE3,
    pub reference_kf: Option<KeyFrameId>,
    pub lost: bool,
}

#[derive(Debug, Default)]
pub struct TrajectoryHistory {
    entries: Mutex<Vec<TrajectoryEntry>>,
}

impl TrajectoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: TrajectoryEntry) {
        self.entries.lock().push(entry);
    }

    /// Repeat the previous entry for a frame without a pose.
    pub fn push_lost(&self, timestamp: f64) {
        let mut entries = self.entries.lock();
        let entry = match entries.last() {
            Some(last) => TrajectoryEntry {
                timestamp,
                lost: true,
                ..*last
            },
            None => TrajectoryEntry {
                timestamp,
                relative_pose: SE3::identity(),
                reference_kf: None,
                lost: true,
            },
        };
        entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn entries(&self) -> Vec<TrajectoryEntry> {
        self.entries.lock().clone()
    }

    /// Camera poses (T_wc) through the current pose of each reference
    /// keyframe. Entries whose keyframe is gone from `map` are skipped.
    pub fn camera_trajectory(&self, map: &Map) -> Vec<(f64, SE3)> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| {
                let kf = map.get_keyframe(e.reference_kf?)?;
                Some((e.timestamp, kf.pose.compose(&e.relative_pose)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    use crate::atlas::keyframe_db::BowVector;
    use crate::tracking::frame::FeatureSet;

    #[test]
    fn test_trajectory_follows_keyframe_correction() {
        let mut map = Map::new();
        let kf = map.create_keyframe(
            0,
            0.0,
            SE3::identity(),
            FeatureSet::default(),
            BowVector::new(),
        );
        let history = TrajectoryHistory::new();
        history.push(TrajectoryEntry {
            timestamp: 0.1,
            relative_pose: SE3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0)),
            reference_kf: Some(kf),
            lost: false,
        });
        history.push_lost(0.2);
        assert_eq!(history.len(), 2);
        assert!(history.entries()[1].lost);

        map.get_keyframe_mut(kf).unwrap().pose =
            SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, 2.0, 0.0));
        let traj = history.camera_trajectory(&map);
        assert_eq!(traj.len(), 2);
        assert!((traj[0].1.translation - Vector3::new(1.0, 2.0, 0.0)).norm() < 1e-12);
    }
}
