//! Map - arena of KeyFrames and MapPoints.
//!
//! Entities are owned by the map and addressed by id. Every cross-reference
//! (keyframe → landmark, landmark → observer, covisibility, spanning tree)
//! is an id, so a holder must look the entity up again before each use and
//! treat a miss as "culled".
//!
//! The map also records landmark replacements made by the refiner's
//! fusion step, so stale links can be redirected instead of dropped.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::imu::GRAVITY;
use crate::tracking::frame::{Descriptor, FeatureSet};

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};
use crate::atlas::keyframe_db::BowVector;

/// Minimum shared landmarks for a covisibility edge.
const COVISIBILITY_MIN_WEIGHT: usize = 15;

pub struct Map {
    /// Index of this map in the atlas.
    pub index: usize,

    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    /// old → new landmark redirections left by fusion. Every target is a
    /// landmark still in the map.
    replaced: HashMap<MapPointId, MapPointId>,

    /// Inverse of `replaced`: target → ids redirected to it.
    redirected_from: HashMap<MapPointId, Vec<MapPointId>>,

    next_kf_id: u64,
    next_mp_id: u64,

    orb_scale_factor: f64,
    orb_num_levels: usize,

    imu_initialized: bool,
    /// Gravity in this map's world frame.
    gravity: Vector3<f64>,

    /// Tail of the temporal keyframe chain.
    last_keyframe_id: Option<KeyFrameId>,
    /// First keyframe created in this map.
    origin_keyframe_id: Option<KeyFrameId>,
}

impl Map {
    pub fn new() -> Self {
        Self::with_params(0, 0, 0, 1.2, 8)
    }

    /// Create a map whose ids continue after `kf_base`/`mp_base`, so ids stay
    /// unique across the whole atlas.
    pub fn with_params(
        index: usize,
        kf_base: u64,
        mp_base: u64,
        scale_factor: f64,
        num_levels: usize,
    ) -> Self {
        Self {
            index,
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            replaced: HashMap::new(),
            redirected_from: HashMap::new(),
            next_kf_id: kf_base,
            next_mp_id: mp_base,
            orb_scale_factor: scale_factor,
            orb_num_levels: num_levels,
            imu_initialized: false,
            gravity: GRAVITY,
            last_keyframe_id: None,
            origin_keyframe_id: None,
        }
    }

    pub fn id_counters(&self) -> (u64, u64) {
        (self.next_kf_id, self.next_mp_id)
    }

    pub fn orb_params(&self) -> (f64, usize) {
        (self.orb_scale_factor, self.orb_num_levels)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // IMU Initialization State
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_imu_initialized(&self) -> bool {
        self.imu_initialized
    }

    /// Mark inertial initialization done with the estimated world gravity.
    pub fn set_imu_initialized(&mut self, gravity: Vector3<f64>) {
        self.imu_initialized = true;
        self.gravity = gravity;
    }

    pub fn gravity(&self) -> Vector3<f64> {
        self.gravity
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a KeyFrame and append it to the temporal chain.
    pub fn create_keyframe(
        &mut self,
        frame_id: u64,
        timestamp: f64,
        pose: SE3,
        features: FeatureSet,
        bow: BowVector,
    ) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        let mut kf = KeyFrame::new(id, frame_id, timestamp, pose, features, bow);

        if let Some(prev_id) = self.last_keyframe_id {
            kf.prev_kf = Some(prev_id);
            if let Some(prev_kf) = self.keyframes.get_mut(&prev_id) {
                prev_kf.next_kf = Some(id);
            }
        }
        if self.origin_keyframe_id.is_none() {
            self.origin_keyframe_id = Some(id);
        }

        self.keyframes.insert(id, kf);
        self.last_keyframe_id = Some(id);
        id
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.last_keyframe_id
    }

    pub fn origin_keyframe_id(&self) -> Option<KeyFrameId> {
        self.origin_keyframe_id
    }

    /// Keyframes oldest to newest, following the temporal chain.
    pub fn keyframes_temporal_order(&self) -> Vec<&KeyFrame> {
        let mut result = Vec::new();
        let mut current = self
            .origin_keyframe_id
            .and_then(|id| self.keyframes.get(&id));
        while let Some(kf) = current {
            result.push(kf);
            current = kf.next_kf.and_then(|id| self.keyframes.get(&id));
        }
        result
    }

    /// The `n` most recent keyframes, newest first.
    pub fn recent_keyframes(&self, n: usize) -> Vec<KeyFrameId> {
        let mut out = Vec::with_capacity(n);
        let mut current = self.last_keyframe_id;
        while let Some(id) = current {
            if out.len() >= n {
                break;
            }
            let Some(kf) = self.keyframes.get(&id) else {
                break;
            };
            out.push(id);
            current = kf.prev_kf;
        }
        out
    }

    /// Seconds between the first and last keyframe.
    pub fn time_span_seconds(&self) -> f64 {
        let kfs = self.keyframes_temporal_order();
        match (kfs.first(), kfs.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => 0.0,
        }
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.keyframes.keys()
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// Link `child` under `parent` in the spanning tree.
    pub fn set_parent(&mut self, child: KeyFrameId, parent: KeyFrameId) {
        if child == parent {
            return;
        }
        let old_parent = self.keyframes.get(&child).and_then(|kf| kf.parent_id);
        if let Some(old) = old_parent {
            if let Some(kf) = self.keyframes.get_mut(&old) {
                kf.erase_child(child);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&child) {
            kf.set_parent(parent);
        }
        if let Some(kf) = self.keyframes.get_mut(&parent) {
            kf.add_child(child);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        let mp = MapPoint::new(id, position, descriptor, first_kf_id);
        self.map_points.insert(id, mp);
        id
    }

    /// Create a frame-owned visual-odometry point that no keyframe observes.
    pub fn create_temporary_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        reference_kf: KeyFrameId,
    ) -> MapPointId {
        let id = self.create_map_point(position, descriptor, reference_kf);
        if let Some(mp) = self.map_points.get_mut(&id) {
            mp.is_temporary = true;
        }
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_point_ids(&self) -> impl Iterator<Item = &MapPointId> {
        self.map_points.keys()
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Live, non-bad landmark for `id`, following replacements.
    ///
    /// Returns `None` when the landmark (or its replacement) has been culled.
    pub fn resolve(&self, id: MapPointId) -> Option<MapPointId> {
        let target = if self.map_points.contains_key(&id) {
            id
        } else {
            *self.replaced.get(&id)?
        };
        self.map_points
            .get(&target)
            .is_some_and(|mp| !mp.is_bad)
            .then_some(target)
    }

    pub fn is_live(&self, id: MapPointId) -> bool {
        self.map_points.get(&id).is_some_and(|mp| !mp.is_bad)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Link a keyframe feature and a landmark in both directions.
    ///
    /// Covisibility is incremented with every keyframe already observing the point.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        if !self.keyframes.contains_key(&kf_id) {
            return false;
        }
        let existing_observers: Vec<KeyFrameId> = match self.map_points.get(&mp_id) {
            Some(mp) => mp.observations.keys().copied().collect(),
            None => return false,
        };
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }

        for other_kf_id in existing_observers {
            if other_kf_id == kf_id {
                continue;
            }
            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.add_covisibility(kf_id, new_weight);
            }
        }
        true
    }

    /// Remove a keyframe feature's landmark link in both directions.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get(&kf_id)?.get_map_point(feature_idx)?;
        let other_observers: Vec<KeyFrameId> = self
            .map_points
            .get(&mp_id)
            .map(|mp| {
                mp.observations
                    .keys()
                    .filter(|&&id| id != kf_id)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.erase_map_point(feature_idx);
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id);
        }

        for other_kf_id in other_observers {
            let current_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0);
            if current_weight <= 1 {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_covisibility(other_kf_id);
                }
                if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                    other_kf.erase_covisibility(kf_id);
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.add_covisibility(other_kf_id, current_weight - 1);
                }
                if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                    other_kf.add_covisibility(kf_id, current_weight - 1);
                }
            }
        }
        Some(mp_id)
    }

    /// Recompute a keyframe's covisibility edges from its landmark observations.
    ///
    /// Edges need `COVISIBILITY_MIN_WEIGHT` shared points; when none qualifies
    /// the single strongest edge is kept. A keyframe without a parent is hung
    /// under its strongest covisible keyframe.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in kf.get_map_point_indices() {
            let Some(mp) = self.map_points.get(&mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }
            for obs_kf in mp.observations.keys() {
                if *obs_kf != kf_id {
                    *counter.entry(*obs_kf).or_insert(0) += 1;
                }
            }
        }
        if counter.is_empty() {
            return;
        }

        let best = counter
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
            .map(|(id, w)| (*id, *w));
        let mut edges: HashMap<KeyFrameId, usize> = counter
            .iter()
            .filter(|(_, w)| **w >= COVISIBILITY_MIN_WEIGHT)
            .map(|(id, w)| (*id, *w))
            .collect();
        if edges.is_empty() {
            if let Some((id, w)) = best {
                edges.insert(id, w);
            }
        }

        for (other, w) in &edges {
            if let Some(other_kf) = self.keyframes.get_mut(other) {
                other_kf.add_covisibility(kf_id, *w);
            }
        }
        let needs_parent = self
            .keyframes
            .get(&kf_id)
            .is_some_and(|kf| kf.parent_id.is_none() && Some(kf_id) != self.origin_keyframe_id);
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_covisibilities(edges);
        }
        if needs_parent {
            if let Some((parent, _)) = best {
                self.set_parent(kf_id, parent);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// The `n` strongest covisible keyframes of `kf_id`.
    pub fn get_local_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.get_best_covisibles(n))
            .unwrap_or_default()
    }

    /// Landmarks observed by `kf_ids`, deduplicated, in first-seen order.
    pub fn get_map_points_from_keyframes(&self, kf_ids: &[KeyFrameId]) -> Vec<MapPointId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for kf_id in kf_ids {
            let Some(kf) = self.keyframes.get(kf_id) else {
                continue;
            };
            for (_, mp_id) in kf.get_map_point_indices() {
                if self.is_live(mp_id) && seen.insert(mp_id) {
                    out.push(mp_id);
                }
            }
        }
        out
    }

    /// Landmarks of a keyframe observed by at least `min_obs` keyframes.
    pub fn tracked_map_points(&self, kf_id: KeyFrameId, min_obs: usize) -> usize {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return 0;
        };
        kf.get_map_point_indices()
            .filter(|(_, mp_id)| {
                self.map_points
                    .get(mp_id)
                    .is_some_and(|mp| !mp.is_bad && mp.num_observations() >= min_obs)
            })
            .count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replacement and Culling
    // ─────────────────────────────────────────────────────────────────────────

    /// Merge landmark `old` into `new`.
    ///
    /// Observations of `old` move to `new` unless the keyframe already sees
    /// `new`, in which case the duplicate link is dropped. The redirection is
    /// remembered so frames still holding `old` can follow it.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) {
        if old == new || !self.map_points.contains_key(&new) {
            return;
        }
        let Some(old_mp) = self.map_points.remove(&old) else {
            return;
        };

        let mut touched = Vec::new();
        for (kf_id, feat_idx) in &old_mp.observations {
            let already_sees_new = self
                .map_points
                .get(&new)
                .is_some_and(|mp| mp.observations.contains_key(kf_id));
            if let Some(kf) = self.keyframes.get_mut(kf_id) {
                if already_sees_new {
                    kf.erase_map_point(*feat_idx);
                } else {
                    kf.set_map_point(*feat_idx, new);
                }
            }
            if !already_sees_new {
                if let Some(mp) = self.map_points.get_mut(&new) {
                    mp.add_observation(*kf_id, *feat_idx);
                }
            }
            touched.push(*kf_id);
        }

        if let Some(mp) = self.map_points.get_mut(&new) {
            mp.increase_visible(old_mp.visible_count);
            mp.increase_found(old_mp.found_count);
        }
        // Ids that led to `old` now lead straight to `new`.
        let mut sources = self.redirected_from.remove(&old).unwrap_or_default();
        for id in &sources {
            self.replaced.insert(*id, new);
        }
        sources.push(old);
        self.replaced.insert(old, new);
        self.redirected_from.entry(new).or_default().extend(sources);

        for kf_id in touched {
            self.update_connections(kf_id);
        }
    }

    /// Remove landmarks failing the quality criteria. Temporary points are
    /// owned by the tracker and skipped.
    pub fn cull_bad_map_points(&mut self, min_found_ratio: f64, min_observations: usize) -> usize {
        let to_cull: Vec<MapPointId> = self
            .map_points
            .iter()
            .filter(|(_, mp)| !mp.is_temporary && mp.should_cull(min_found_ratio, min_observations))
            .map(|(&id, _)| id)
            .collect();
        let count = to_cull.len();
        for mp_id in to_cull {
            self.remove_map_point_full(mp_id);
        }
        count
    }

    /// Remove a landmark and every keyframe link to it.
    pub fn remove_map_point_full(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = self
            .map_points
            .get(&mp_id)
            .map(|mp| mp.observations.iter().map(|(&k, &i)| (k, i)).collect())
            .unwrap_or_default();
        for (kf_id, feat_idx) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if kf.get_map_point(feat_idx) == Some(mp_id) {
                    kf.erase_map_point(feat_idx);
                }
            }
        }
        self.map_points.remove(&mp_id);
        for id in self.redirected_from.remove(&mp_id).unwrap_or_default() {
            self.replaced.remove(&id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let centers: Vec<Vector3<f64>> = mp
            .observations
            .keys()
            .filter_map(|kf_id| self.keyframes.get(kf_id).map(|kf| kf.camera_center()))
            .collect();
        let reference = self.keyframes.get(&mp.first_kf_id).and_then(|kf| {
            let idx = mp.observations.get(&kf.id)?;
            kf.keypoints.get(*idx).map(|kp| (kf.camera_center(), kp.octave))
        });

        let (scale, levels) = (self.orb_scale_factor, self.orb_num_levels);
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(centers.iter(), reference, scale, levels);
        }
    }

    /// Drop every entity but keep the id counters running.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.replaced.clear();
        self.redirected_from.clear();
        self.last_keyframe_id = None;
        self.origin_keyframe_id = None;
        self.imu_initialized = false;
        self.gravity = GRAVITY;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("index", &self.index)
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("imu_initialized", &self.imu_initialized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::frame::KeyPoint;

    fn features(n: usize) -> FeatureSet {
        let kps = (0..n).map(|i| KeyPoint::new(i as f64, 0.0, 0)).collect();
        FeatureSet::monocular(kps, vec![[0u8; 32]; n])
    }

    fn add_kf(map: &mut Map, n: usize) -> KeyFrameId {
        let t = map.num_keyframes() as f64 * 0.1;
        map.create_keyframe(0, t, SE3::identity(), features(n), BowVector::new())
    }

    fn add_mp(map: &mut Map, kf: KeyFrameId) -> MapPointId {
        map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kf)
    }

    #[test]
    fn test_temporal_chain() {
        let mut map = Map::new();
        let a = add_kf(&mut map, 2);
        let b = add_kf(&mut map, 2);
        let c = add_kf(&mut map, 2);
        let order: Vec<_> = map.keyframes_temporal_order().iter().map(|k| k.id).collect();
        assert_eq!(order, vec![a, b, c]);
        assert_eq!(map.recent_keyframes(2), vec![c, b]);
        assert!((map.time_span_seconds() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_associate_updates_covisibility() {
        let mut map = Map::new();
        let kf1 = add_kf(&mut map, 10);
        let kf2 = add_kf(&mut map, 10);
        for i in 0..3 {
            let mp = add_mp(&mut map, kf1);
            assert!(map.associate(kf1, i, mp));
            assert!(map.associate(kf2, i, mp));
        }
        assert_eq!(map.get_keyframe(kf1).unwrap().get_covisibility_weight(kf2), 3);

        map.disassociate(kf2, 0);
        assert_eq!(map.get_keyframe(kf1).unwrap().get_covisibility_weight(kf2), 2);
    }

    #[test]
    fn test_update_connections_sets_parent() {
        let mut map = Map::new();
        let kf1 = add_kf(&mut map, 20);
        let kf2 = add_kf(&mut map, 20);
        for i in 0..20 {
            let mp = add_mp(&mut map, kf1);
            map.associate(kf1, i, mp);
            map.associate(kf2, i, mp);
        }
        map.update_connections(kf2);
        assert_eq!(map.get_keyframe(kf2).unwrap().parent_id, Some(kf1));
        assert_eq!(map.get_keyframe(kf1).unwrap().first_child(), Some(kf2));
        assert_eq!(map.get_local_keyframes(kf1, 5), vec![kf2]);
    }

    #[test]
    fn test_replace_and_resolve() {
        let mut map = Map::new();
        let kf1 = add_kf(&mut map, 5);
        let kf2 = add_kf(&mut map, 5);
        let old = add_mp(&mut map, kf1);
        let new = add_mp(&mut map, kf2);
        map.associate(kf1, 0, old);
        map.associate(kf2, 1, new);

        map.replace_map_point(old, new);
        assert!(map.get_map_point(old).is_none());
        assert_eq!(map.resolve(old), Some(new));
        assert_eq!(map.get_keyframe(kf1).unwrap().get_map_point(0), Some(new));
        assert_eq!(map.get_map_point(new).unwrap().num_observations(), 2);

        map.remove_map_point_full(new);
        assert_eq!(map.resolve(old), None);
        assert_eq!(map.get_keyframe(kf1).unwrap().get_map_point(0), None);
    }

    #[test]
    fn test_redirections_stay_flat_and_die_with_target() {
        let mut map = Map::new();
        let kf = add_kf(&mut map, 5);
        let a = add_mp(&mut map, kf);
        let b = add_mp(&mut map, kf);
        let c = add_mp(&mut map, kf);
        map.associate(kf, 0, a);
        map.associate(kf, 1, b);
        map.associate(kf, 2, c);

        map.replace_map_point(a, b);
        map.replace_map_point(b, c);
        assert_eq!(map.resolve(a), Some(c));
        assert_eq!(map.resolve(b), Some(c));
        assert_eq!(map.replaced.get(&a), Some(&c));
        assert_eq!(map.replaced.len(), 2);

        map.remove_map_point_full(c);
        assert!(map.replaced.is_empty());
        assert!(map.redirected_from.is_empty());
        assert_eq!(map.resolve(a), None);
    }

    #[test]
    fn test_cull_skips_temporary() {
        let mut map = Map::new();
        let kf = add_kf(&mut map, 5);
        let tmp = map.create_temporary_map_point(Vector3::new(0.0, 0.0, 1.0), [0u8; 32], kf);
        let lonely = add_mp(&mut map, kf);
        assert_eq!(map.cull_bad_map_points(0.25, 1), 1);
        assert!(map.get_map_point(tmp).is_some());
        assert!(map.get_map_point(lonely).is_none());
    }

    #[test]
    fn test_tracked_map_points() {
        let mut map = Map::new();
        let kf1 = add_kf(&mut map, 4);
        let kf2 = add_kf(&mut map, 4);
        let shared = add_mp(&mut map, kf1);
        let single = add_mp(&mut map, kf1);
        map.associate(kf1, 0, shared);
        map.associate(kf2, 0, shared);
        map.associate(kf1, 1, single);
        assert_eq!(map.tracked_map_points(kf1, 1), 2);
        assert_eq!(map.tracked_map_points(kf1, 2), 1);
    }

    #[test]
    fn test_ids_continue_from_base() {
        let mut map = Map::with_params(1, 100, 500, 1.2, 8);
        let kf = add_kf(&mut map, 1);
        assert_eq!(kf, KeyFrameId::new(100));
        assert_eq!(add_mp(&mut map, kf), MapPointId::new(500));
    }
}
