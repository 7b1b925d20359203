//! Depth recovery for stereo and RGB-D feature sets.

use nalgebra::Vector3;

use super::camera::CameraModel;
use super::features::{Descriptor, FeatureSet, KeyPoint, TH_HIGH, descriptor_distance};

const MIN_DEPTH: f64 = 0.1; // meters
const MAX_DEPTH: f64 = 40.0; // meters
const VERTICAL_MARGIN: f64 = 2.0; // pixels tolerance for y-coordinate
const STEREO_RATIO: f64 = 0.9;

/// Attach depth to left-image features by matching against the right image
/// of a rectified pair.
///
/// For each left feature, search along the epipolar line (same row within a
/// margin) constrained by the disparity range implied by the depth range.
pub fn match_stereo(
    left_kps: &[KeyPoint],
    left_desc: &[Descriptor],
    right_kps: &[KeyPoint],
    right_desc: &[Descriptor],
    cam: &CameraModel,
) -> FeatureSet {
    let max_disparity = cam.bf() / MIN_DEPTH;
    let min_disparity = cam.bf() / MAX_DEPTH;

    let mut points_cam = vec![None; left_kps.len()];

    for (li, (lkp, ld)) in left_kps.iter().zip(left_desc).enumerate() {
        let mut best_dist = TH_HIGH;
        let mut second_best_dist = TH_HIGH;
        let mut best_right: Option<usize> = None;

        for (ri, (rkp, rd)) in right_kps.iter().zip(right_desc).enumerate() {
            if (lkp.y - rkp.y).abs() > VERTICAL_MARGIN {
                continue;
            }
            let disparity = lkp.x - rkp.x;
            if disparity < min_disparity || disparity > max_disparity {
                continue;
            }
            let dist = descriptor_distance(ld, rd);
            if dist < best_dist {
                second_best_dist = best_dist;
                best_dist = dist;
                best_right = Some(ri);
            } else if dist < second_best_dist {
                second_best_dist = dist;
            }
        }

        if let Some(ri) = best_right {
            let passes_ratio = (best_dist as f64) < STEREO_RATIO * second_best_dist as f64
                || second_best_dist == TH_HIGH;
            if passes_ratio {
                let disparity = lkp.x - right_kps[ri].x;
                let z = cam.bf() / disparity;
                points_cam[li] = Some(cam.unproject(lkp.x, lkp.y, z));
            }
        }
    }

    FeatureSet {
        keypoints: left_kps.to_vec(),
        descriptors: left_desc.to_vec(),
        points_cam,
    }
    .normalized()
}

/// Attach depth to features from a registered depth image sample.
///
/// `raw_depth[i]` is the depth reading under keypoint `i` in sensor units;
/// readings that are non-positive or non-finite leave the keypoint without depth.
pub fn attach_depth(
    keypoints: Vec<KeyPoint>,
    descriptors: Vec<Descriptor>,
    raw_depth: &[f64],
    depth_map_factor: f64,
    cam: &CameraModel,
) -> FeatureSet {
    let points_cam: Vec<Option<Vector3<f64>>> = keypoints
        .iter()
        .enumerate()
        .map(|(i, kp)| {
            let d = raw_depth.get(i).copied()? / depth_map_factor;
            (d.is_finite() && d > 0.0).then(|| cam.unproject(kp.x, kp.y, d))
        })
        .collect();
    FeatureSet {
        keypoints,
        descriptors,
        points_cam,
    }
    .normalized()
}
