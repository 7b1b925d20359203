//! Landmark fusion between a new keyframe and its neighbours.
//!
//! Every landmark of the new keyframe is projected into each neighbour and
//! vice versa. A projection landing on a feature with a close descriptor
//! either merges two duplicate landmarks or adds a missing observation.

use std::collections::HashSet;

use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::tracking::frame::{CameraModel, TH_LOW, descriptor_distance};

pub struct FusionConfig {
    /// Best covisible keyframes taken as first-order neighbours.
    pub nn_covisibles: usize,
    /// Neighbour count the temporal chain tops up to in inertial maps.
    pub min_neighbors_inertial: usize,
    /// Search radius in pixels at pyramid level 0.
    pub radius: f64,
    pub desc_threshold: u32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            nn_covisibles: 10,
            min_neighbors_inertial: 20,
            radius: 3.0,
            desc_threshold: TH_LOW,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FusionStats {
    /// Duplicate landmarks merged.
    pub num_fused: usize,
    /// Observations added to existing landmarks.
    pub num_observations_added: usize,
}

impl FusionStats {
    pub fn changed_map(&self) -> bool {
        self.num_fused > 0 || self.num_observations_added > 0
    }
}

pub fn search_in_neighbors(
    map: &mut Map,
    kf_id: KeyFrameId,
    camera: &CameraModel,
    is_inertial: bool,
) -> FusionStats {
    search_in_neighbors_with_config(map, kf_id, camera, is_inertial, &FusionConfig::default())
}

pub fn search_in_neighbors_with_config(
    map: &mut Map,
    kf_id: KeyFrameId,
    camera: &CameraModel,
    is_inertial: bool,
    config: &FusionConfig,
) -> FusionStats {
    let neighbors = collect_neighbors(map, kf_id, is_inertial, config);
    if neighbors.is_empty() {
        return FusionStats::default();
    }

    let mut stats = FusionStats::default();

    // Forward: current landmarks into the neighbours.
    let own_points = landmarks_of(map, kf_id);
    fuse_into_keyframes(map, &own_points, &neighbors, camera, config, &mut stats);

    // Backward: neighbour landmarks into the current keyframe.
    let mut candidates = Vec::new();
    let mut seen = HashSet::new();
    for &nb in &neighbors {
        for mp_id in landmarks_of(map, nb) {
            if seen.insert(mp_id) {
                candidates.push(mp_id);
            }
        }
    }
    fuse_into_keyframes(map, &candidates, &[kf_id], camera, config, &mut stats);

    for mp_id in landmarks_of(map, kf_id) {
        map.update_map_point_normal_and_depth(mp_id);
    }
    map.update_connections(kf_id);

    debug!(
        "[Fusion] KF {}: {} neighbours, {} fused, {} observations added",
        kf_id.0,
        neighbors.len(),
        stats.num_fused,
        stats.num_observations_added
    );
    stats
}

fn landmarks_of(map: &Map, kf_id: KeyFrameId) -> Vec<MapPointId> {
    map.get_keyframe(kf_id)
        .map(|kf| kf.get_map_point_indices().map(|(_, id)| id).collect())
        .unwrap_or_default()
}

/// First and second order covisibles, topped up with temporal predecessors
/// for inertial maps.
fn collect_neighbors(
    map: &Map,
    kf_id: KeyFrameId,
    is_inertial: bool,
    config: &FusionConfig,
) -> Vec<KeyFrameId> {
    let Some(kf) = map.get_keyframe(kf_id) else {
        return Vec::new();
    };

    let mut visited: HashSet<KeyFrameId> = HashSet::from([kf_id]);
    let mut neighbors = Vec::new();

    for nb in kf.get_best_covisibles(config.nn_covisibles) {
        if visited.insert(nb) {
            neighbors.push(nb);
        }
    }
    let first_order = neighbors.clone();
    for nb in first_order {
        let Some(nb_kf) = map.get_keyframe(nb) else {
            continue;
        };
        for second in nb_kf.get_best_covisibles(config.nn_covisibles / 2) {
            if visited.insert(second) {
                neighbors.push(second);
            }
        }
    }

    if is_inertial {
        let mut prev = kf.prev_kf;
        while neighbors.len() < config.min_neighbors_inertial {
            let Some(prev_id) = prev else { break };
            let Some(prev_kf) = map.get_keyframe(prev_id) else {
                break;
            };
            if visited.insert(prev_id) {
                neighbors.push(prev_id);
            }
            prev = prev_kf.prev_kf;
        }
    }

    neighbors.retain(|id| map.get_keyframe(*id).is_some_and(|kf| !kf.is_bad));
    neighbors
}

fn fuse_into_keyframes(
    map: &mut Map,
    points: &[MapPointId],
    targets: &[KeyFrameId],
    camera: &CameraModel,
    config: &FusionConfig,
    stats: &mut FusionStats,
) {
    let (scale_factor, num_levels) = map.orb_params();

    for &mp_id in points {
        for &target in targets {
            // Earlier merges may have removed the point.
            let Some(mp) = map.get_map_point(mp_id) else {
                break;
            };
            if mp.is_bad || mp.is_temporary || mp.observations.contains_key(&target) {
                continue;
            }
            let Some(kf) = map.get_keyframe(target) else {
                continue;
            };

            let p_cam = kf.pose.inverse().transform_point(&mp.position);
            let Some(uv) = camera.project(&p_cam) else {
                continue;
            };
            if !camera.in_image(uv.x, uv.y) {
                continue;
            }
            let distance = (mp.position - kf.camera_center()).norm();
            if !mp.is_in_distance_range(distance) {
                continue;
            }

            let level = mp.predict_scale(distance, scale_factor, num_levels);
            let radius = config.radius * scale_factor.powi(level as i32);
            let window = kf.get_features_in_area(
                uv.x,
                uv.y,
                radius,
                Some(level.saturating_sub(1)),
                Some(level),
            );

            let best = window
                .into_iter()
                .map(|idx| (idx, descriptor_distance(&mp.descriptor, &kf.descriptors[idx])))
                .filter(|&(_, dist)| dist <= config.desc_threshold)
                .min_by_key(|&(_, dist)| dist);
            let Some((feat_idx, _)) = best else {
                continue;
            };

            match kf.get_map_point(feat_idx) {
                Some(existing) if existing == mp_id => {}
                Some(existing) => {
                    let existing_obs = map
                        .get_map_point(existing)
                        .map_or(0, |p| p.num_observations());
                    let ours = mp.num_observations();
                    if existing_obs > ours {
                        map.replace_map_point(mp_id, existing);
                        stats.num_fused += 1;
                        break;
                    }
                    map.replace_map_point(existing, mp_id);
                    stats.num_fused += 1;
                }
                None => {
                    if map.associate(target, feat_idx, mp_id) {
                        stats.num_observations_added += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::keyframe_db::bow_from_descriptors;
    use crate::config::{SensorKind, TrackingConfig};
    use crate::geometry::SE3;
    use crate::tracking::frame::{FeatureSet, KeyPoint};
    use nalgebra::{UnitQuaternion, Vector3};

    fn camera() -> CameraModel {
        CameraModel::from_config(&TrackingConfig::for_sensor(SensorKind::Stereo, false).camera)
    }

    fn keyframe_seeing(map: &mut Map, cam: &CameraModel, pose: SE3, point: &Vector3<f64>) -> KeyFrameId {
        let uv = cam
            .project(&pose.inverse().transform_point(point))
            .unwrap();
        let desc = [0x5a; 32];
        let features = FeatureSet::monocular(vec![KeyPoint::new(uv.x, uv.y, 0)], vec![desc]);
        let bow = bow_from_descriptors(&features.descriptors);
        map.create_keyframe(0, 0.0, pose, features, bow)
    }

    #[test]
    fn test_duplicate_landmarks_are_merged() {
        let cam = camera();
        let mut map = Map::new();
        let world = Vector3::new(0.0, 0.0, 2.0);

        let kf_a = keyframe_seeing(&mut map, &cam, SE3::identity(), &world);
        let kf_b = keyframe_seeing(
            &mut map,
            &cam,
            SE3::new(UnitQuaternion::identity(), Vector3::new(0.1, 0.0, 0.0)),
            &world,
        );

        let mp_a = map.create_map_point(world, [0x5a; 32], kf_a);
        map.associate(kf_a, 0, mp_a);
        map.update_map_point_normal_and_depth(mp_a);
        let mp_b = map.create_map_point(world + Vector3::new(0.001, 0.0, 0.0), [0x5a; 32], kf_b);
        map.associate(kf_b, 0, mp_b);
        map.update_map_point_normal_and_depth(mp_b);
        assert_eq!(map.num_map_points(), 2);

        // Not covisible yet: only the temporal chain links them.
        let stats = search_in_neighbors(&mut map, kf_b, &cam, true);
        assert_eq!(stats.num_fused, 1);
        assert_eq!(map.num_map_points(), 1);

        let survivor = map.get_keyframe(kf_b).unwrap().get_map_point(0).unwrap();
        assert_eq!(map.get_keyframe(kf_a).unwrap().get_map_point(0), Some(survivor));
        assert_eq!(map.get_map_point(survivor).unwrap().num_observations(), 2);
    }

    #[test]
    fn test_vision_only_needs_covisibility() {
        let cam = camera();
        let mut map = Map::new();
        let world = Vector3::new(0.0, 0.0, 2.0);
        let kf_a = keyframe_seeing(&mut map, &cam, SE3::identity(), &world);
        let kf_b = keyframe_seeing(&mut map, &cam, SE3::identity(), &world);
        let mp_a = map.create_map_point(world, [0x5a; 32], kf_a);
        map.associate(kf_a, 0, mp_a);
        let mp_b = map.create_map_point(world, [0x5a; 32], kf_b);
        map.associate(kf_b, 0, mp_b);

        let stats = search_in_neighbors(&mut map, kf_b, &cam, false);
        assert!(!stats.changed_map());
        assert_eq!(map.num_map_points(), 2);
    }
}
