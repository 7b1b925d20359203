//! KeyFrame - a tracked frame promoted into the permanent map.
//!
//! KeyFrames are the nodes of the map graph. They keep:
//! - the frame's features, depth and pose at promotion time
//! - landmark links per feature
//! - the inertial delta since the previous keyframe
//! - covisibility weights and spanning-tree links

use std::collections::{BTreeSet, HashMap};

use nalgebra::Vector3;

use crate::atlas::keyframe_db::BowVector;
use crate::geometry::SE3;
use crate::imu::{ImuBias, PreintegratedState};
use crate::tracking::frame::{Descriptor, FeatureSet, KeyPoint};

use super::types::{KeyFrameId, MapPointId};

#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Id of the frame this keyframe was promoted from.
    pub frame_id: u64,

    /// Sensor timestamp in seconds.
    pub timestamp: f64,

    /// Camera-to-world transform (T_wc).
    pub pose: SE3,

    /// Body velocity in world frame (m/s).
    pub velocity: Vector3<f64>,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// 3D points in camera frame for depth sensors.
    pub points_cam: Vec<Option<Vector3<f64>>>,
    /// Appearance descriptor for place recognition.
    pub bow: BowVector,

    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // IMU Data
    // ─────────────────────────────────────────────────────────────────────────
    /// Preintegrated IMU from the previous KeyFrame to this one.
    pub imu_preintegrated: Option<PreintegratedState>,
    pub imu_bias: ImuBias,

    /// Temporal neighbours.
    pub prev_kf: Option<KeyFrameId>,
    pub next_kf: Option<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    covisibility_weights: HashMap<KeyFrameId, usize>,
    /// Covisibles by weight descending, then most recent first. Rebuilt on every edit.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────
    pub parent_id: Option<KeyFrameId>,
    pub children_ids: BTreeSet<KeyFrameId>,

    pub is_bad: bool,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        frame_id: u64,
        timestamp: f64,
        pose: SE3,
        features: FeatureSet,
        bow: BowVector,
    ) -> Self {
        let num_features = features.keypoints.len();
        Self {
            id,
            frame_id,
            timestamp,
            pose,
            velocity: Vector3::zeros(),
            keypoints: features.keypoints,
            descriptors: features.descriptors,
            points_cam: features.points_cam,
            bow,
            map_point_ids: vec![None; num_features],
            imu_preintegrated: None,
            imu_bias: ImuBias::zero(),
            prev_kf: None,
            next_kf: None,
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            parent_id: None,
            children_ids: BTreeSet::new(),
            is_bad: false,
        }
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Returns the previous association, if any.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or overwrite a covisibility edge.
    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.rebuild_ordered_covisibles();
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.rebuild_ordered_covisibles();
        }
    }

    /// Replace all covisibility edges at once.
    pub fn set_covisibilities(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility_weights = weights;
        self.covisibility_weights.remove(&self.id);
        self.rebuild_ordered_covisibles();
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// The `n` strongest covisible keyframes.
    pub fn get_best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn get_covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    fn rebuild_ordered_covisibles(&mut self) {
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }

    /// Oldest child in the spanning tree.
    pub fn first_child(&self) -> Option<KeyFrameId> {
        self.children_ids.iter().next().copied()
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spatial Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Feature indices within `radius` pixels of (u, v), optionally restricted
    /// to an inclusive pyramid level window.
    pub fn get_features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        self.keypoints
            .iter()
            .enumerate()
            .filter(|(_, kp)| {
                if min_level.is_some_and(|min| kp.octave < min) {
                    return false;
                }
                if max_level.is_some_and(|max| kp.octave > max) {
                    return false;
                }
                let du = kp.x - u;
                let dv = kp.y - v;
                du * du + dv * dv <= radius_sq
            })
            .map(|(i, _)| i)
            .collect()
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("frame_id", &self.frame_id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent_id)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyframe_with_features(id: u64, n: usize) -> KeyFrame {
        let kps = (0..n)
            .map(|i| KeyPoint::new(10.0 * i as f64, 5.0, i % 3))
            .collect();
        KeyFrame::new(
            KeyFrameId::new(id),
            id,
            id as f64 * 0.1,
            SE3::identity(),
            FeatureSet::monocular(kps, vec![[0u8; 32]; n]),
            BowVector::new(),
        )
    }

    #[test]
    fn test_map_point_association() {
        let mut kf = keyframe_with_features(1, 10);

        kf.set_map_point(3, MapPointId::new(100));
        assert_eq!(kf.get_map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.num_map_points(), 1);

        let prev = kf.set_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));

        assert_eq!(kf.erase_map_point(3), Some(MapPointId::new(200)));
        assert_eq!(kf.get_map_point(3), None);
        assert_eq!(kf.set_map_point(42, MapPointId::new(1)), None);
    }

    #[test]
    fn test_best_covisibles_tie_breaks_by_recency() {
        let mut kf = keyframe_with_features(1, 0);
        kf.add_covisibility(KeyFrameId::new(2), 50);
        kf.add_covisibility(KeyFrameId::new(3), 100);
        kf.add_covisibility(KeyFrameId::new(4), 50);
        kf.add_covisibility(KeyFrameId::new(1), 500);

        assert_eq!(
            kf.get_best_covisibles(3),
            vec![KeyFrameId::new(3), KeyFrameId::new(4), KeyFrameId::new(2)]
        );
        assert_eq!(kf.get_covisibles_above_weight(60), vec![KeyFrameId::new(3)]);
    }

    #[test]
    fn test_first_child_is_oldest() {
        let mut kf = keyframe_with_features(1, 0);
        kf.add_child(KeyFrameId::new(9));
        kf.add_child(KeyFrameId::new(4));
        assert_eq!(kf.first_child(), Some(KeyFrameId::new(4)));
    }

    #[test]
    fn test_features_in_area_level_window() {
        let kf = keyframe_with_features(1, 6);
        // keypoints at x = 0,10,..,50 with octaves 0,1,2,0,1,2
        let idx = kf.get_features_in_area(20.0, 5.0, 10.5, Some(1), Some(2));
        assert_eq!(idx, vec![1, 2]);
    }
}
