//! Landmark-to-feature matching used by the tracking stages.
//!
//! All searches write into `Frame::map_points` and return how many new links
//! they made. They only read the map; stale ids resolve to "no match".

use std::collections::HashSet;

use crate::atlas::map::{KeyFrame, Map, MapPointId};
use crate::config::FeatureConfig;
use crate::geometry::SE3;
use crate::tracking::frame::{CameraModel, Descriptor, TH_HIGH, TH_LOW, descriptor_distance};
use crate::tracking::tracking_frame::{Frame, ProjectionInfo};

/// Ratio test used when matching the local map.
pub const LOCAL_MAP_NN_RATIO: f64 = 0.8;
/// Ratio test used for appearance matching against a keyframe.
pub const APPEARANCE_NN_RATIO: f64 = 0.7;

/// Best and second-best candidate of a descriptor search.
struct BestMatch {
    idx: Option<usize>,
    dist: u32,
    level: usize,
    second_dist: u32,
    second_level: Option<usize>,
}

impl BestMatch {
    fn new() -> Self {
        Self {
            idx: None,
            dist: u32::MAX,
            level: 0,
            second_dist: u32::MAX,
            second_level: None,
        }
    }

    fn offer(&mut self, idx: usize, dist: u32, level: usize) {
        if dist < self.dist {
            self.second_dist = self.dist;
            self.second_level = self.idx.map(|_| self.level);
            self.dist = dist;
            self.level = level;
            self.idx = Some(idx);
        } else if dist < self.second_dist {
            self.second_dist = dist;
            self.second_level = Some(level);
        }
    }
}

/// A frame slot may be (re)assigned unless it already holds a landmark that
/// some keyframe observes. Temporary points can be overwritten.
fn slot_is_free(frame: &Frame, map: &Map, idx: usize) -> bool {
    match frame.map_points[idx] {
        None => true,
        Some(id) => map
            .get_map_point(id)
            .is_none_or(|mp| mp.num_observations() == 0),
    }
}

/// Project the previous frame's landmarks into `current` (whose estimate must
/// be set) and match within `th` pixels scaled by the source octave.
///
/// For depth sensors, forward/backward motion narrows the searched octaves.
pub fn search_by_projection_last_frame(
    current: &mut Frame,
    last: &Frame,
    map: &Map,
    camera: &CameraModel,
    features: &FeatureConfig,
    th: f64,
    monocular: bool,
) -> usize {
    let (Some(pose_wc), Some(last_pose_wc)) = (current.pose(), last.pose()) else {
        return 0;
    };
    let pose_cw = pose_wc.inverse();

    // Current camera center seen from the last camera.
    let t_lc = last_pose_wc.inverse().transform_point(&pose_wc.translation);
    let forward = !monocular && t_lc.z > camera.baseline;
    let backward = !monocular && -t_lc.z > camera.baseline;

    let mut n_matches = 0;
    for (last_idx, mp_id) in last.map_points.iter().enumerate() {
        let Some(mp_id) = mp_id else { continue };
        if last.outliers[last_idx] {
            continue;
        }
        let Some(mp) = map.get_map_point(*mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };

        let p_cam = pose_cw.transform_point(&mp.position);
        let Some(uv) = camera.project(&p_cam) else {
            continue;
        };
        if !camera.in_image(uv.x, uv.y) {
            continue;
        }

        let last_octave = last.keypoints()[last_idx].octave;
        let radius = th * features.level_scale(last_octave);
        let candidates = if forward {
            current.get_features_in_area(uv.x, uv.y, radius, Some(last_octave), None)
        } else if backward {
            current.get_features_in_area(uv.x, uv.y, radius, None, Some(last_octave))
        } else {
            current.get_features_in_area(
                uv.x,
                uv.y,
                radius,
                Some(last_octave.saturating_sub(1)),
                Some(last_octave + 1),
            )
        };

        let ur = (camera.bf() > 0.0).then(|| camera.project_right_u(uv.x, p_cam.z));
        let mut best = BestMatch::new();
        for idx in candidates {
            if !slot_is_free(current, map, idx) {
                continue;
            }
            if let (Some(ur), Some(ur_obs)) = (ur, current.u_right(idx, camera)) {
                if (ur - ur_obs).abs() > radius {
                    continue;
                }
            }
            let dist = descriptor_distance(&mp.descriptor, &current.features.descriptors[idx]);
            best.offer(idx, dist, current.keypoints()[idx].octave);
        }

        if let Some(idx) = best.idx.filter(|_| best.dist <= TH_HIGH) {
            current.map_points[idx] = Some(*mp_id);
            current.outliers[idx] = false;
            n_matches += 1;
        }
    }
    n_matches
}

/// Search radius factor from the viewing angle: near-frontal views get a
/// tighter window.
fn radius_by_viewing_cos(view_cos: f64) -> f64 {
    if view_cos > 0.998 { 2.5 } else { 4.0 }
}

/// Match local-map landmarks that passed the frustum test.
///
/// `th` scales the base window (1.0 for the normal case).
pub fn search_local_points(
    frame: &mut Frame,
    candidates: &[(MapPointId, ProjectionInfo)],
    map: &Map,
    camera: &CameraModel,
    features: &FeatureConfig,
    th: f64,
) -> usize {
    let mut n_matches = 0;
    for (mp_id, proj) in candidates {
        let Some(mp) = map.get_map_point(*mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        let level = proj.predicted_level;
        let mut r = radius_by_viewing_cos(proj.view_cos);
        if th != 1.0 {
            r *= th;
        }
        let radius = r * features.level_scale(level);

        let area = frame.get_features_in_area(
            proj.u,
            proj.v,
            radius,
            Some(level.saturating_sub(1)),
            Some(level),
        );

        let mut best = BestMatch::new();
        for idx in area {
            if !slot_is_free(frame, map, idx) {
                continue;
            }
            if let (Some(ur), Some(ur_obs)) = (proj.u_right, frame.u_right(idx, camera)) {
                if (ur - ur_obs).abs() > radius {
                    continue;
                }
            }
            let dist = descriptor_distance(&mp.descriptor, &frame.features.descriptors[idx]);
            best.offer(idx, dist, frame.keypoints()[idx].octave);
        }

        let Some(idx) = best.idx else { continue };
        if best.dist > TH_HIGH {
            continue;
        }
        if best.second_level == Some(best.level)
            && best.dist as f64 > LOCAL_MAP_NN_RATIO * best.second_dist as f64
        {
            continue;
        }
        frame.map_points[idx] = Some(*mp_id);
        frame.outliers[idx] = false;
        n_matches += 1;
    }
    n_matches
}

/// Match a keyframe's landmarks to the frame by descriptor only.
///
/// Each frame feature receives at most one landmark; the first keyframe
/// feature to claim it wins.
pub fn search_by_appearance(kf: &KeyFrame, frame: &mut Frame, map: &Map, nn_ratio: f64) -> usize {
    frame.clear_matches();
    let mut n_matches = 0;
    for (kf_idx, mp_id) in kf.get_map_point_indices() {
        let Some(mp_id) = map.resolve(mp_id) else {
            continue;
        };
        let desc: &Descriptor = &kf.descriptors[kf_idx];

        let mut best = BestMatch::new();
        for (idx, frame_desc) in frame.features.descriptors.iter().enumerate() {
            if frame.map_points[idx].is_some() {
                continue;
            }
            best.offer(idx, descriptor_distance(desc, frame_desc), 0);
        }

        let Some(idx) = best.idx else { continue };
        if best.dist <= TH_LOW && (best.dist as f64) < nn_ratio * best.second_dist as f64 {
            frame.map_points[idx] = Some(mp_id);
            n_matches += 1;
        }
    }
    n_matches
}

/// Project a keyframe's landmarks (except `already_found`) into the frame
/// at its current estimate. Used to extend relocalization hypotheses.
pub fn search_by_projection_keyframe(
    frame: &mut Frame,
    kf: &KeyFrame,
    map: &Map,
    already_found: &HashSet<MapPointId>,
    camera: &CameraModel,
    features: &FeatureConfig,
    th: f64,
    max_descriptor_dist: u32,
) -> usize {
    let Some(pose_wc) = frame.pose() else {
        return 0;
    };
    let pose_cw: SE3 = pose_wc.inverse();

    let mut n_matches = 0;
    for (_, mp_id) in kf.get_map_point_indices() {
        let Some(mp_id) = map.resolve(mp_id) else {
            continue;
        };
        if already_found.contains(&mp_id) || frame.map_points.contains(&Some(mp_id)) {
            continue;
        }
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };

        let p_cam = pose_cw.transform_point(&mp.position);
        let Some(uv) = camera.project(&p_cam) else {
            continue;
        };
        if !camera.in_image(uv.x, uv.y) {
            continue;
        }
        let dist_3d = (mp.position - pose_wc.translation).norm();
        if dist_3d < 0.8 * mp.min_distance || dist_3d > 1.2 * mp.max_distance {
            continue;
        }

        let level = mp.predict_scale(dist_3d, features.scale_factor, features.n_levels);
        let radius = th * features.level_scale(level);
        let area = frame.get_features_in_area(
            uv.x,
            uv.y,
            radius,
            Some(level.saturating_sub(1)),
            Some(level + 1),
        );

        let mut best = BestMatch::new();
        for idx in area {
            if frame.map_points[idx].is_some() {
                continue;
            }
            let dist = descriptor_distance(&mp.descriptor, &frame.features.descriptors[idx]);
            best.offer(idx, dist, 0);
        }
        if let Some(idx) = best.idx.filter(|_| best.dist <= max_descriptor_dist) {
            frame.map_points[idx] = Some(mp_id);
            frame.outliers[idx] = false;
            n_matches += 1;
        }
    }
    n_matches
}
