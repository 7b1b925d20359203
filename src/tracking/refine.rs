//! Glue between a tracked `Frame` and the pose-only optimizer.

use crate::atlas::map::{Map, MapPointId};
use crate::config::FeatureConfig;
use crate::optimizer::{PoseObservation, PoseOptimConfig, PosePrior, optimize_pose};
use crate::tracking::estimate::{PoseEstimate, StageOutcome};
use crate::tracking::frame::CameraModel;
use crate::tracking::tracking_frame::Frame;

/// One optimizer observation per linked feature whose landmark is live.
///
/// Stale links (culled landmarks) are skipped here and cleared by the caller.
pub fn pose_observations(
    frame: &Frame,
    map: &Map,
    camera: &CameraModel,
    features: &FeatureConfig,
) -> Vec<PoseObservation> {
    frame
        .map_points
        .iter()
        .enumerate()
        .filter_map(|(idx, mp_id)| {
            let mp = map.get_map_point((*mp_id)?).filter(|mp| !mp.is_bad)?;
            let kp = frame.keypoints()[idx];
            Some(PoseObservation {
                feature_idx: idx,
                uv: nalgebra::Vector2::new(kp.x, kp.y),
                u_right: frame.u_right(idx, camera),
                point_world: mp.position,
                inv_sigma2: features.inv_level_sigma2(kp.octave),
            })
        })
        .collect()
}

/// Optimize the frame pose starting from `estimate` and mark outliers.
///
/// Links to landmarks that no longer exist are cleared first.
pub fn optimize_frame_pose(
    frame: &mut Frame,
    estimate: PoseEstimate,
    map: &Map,
    camera: &CameraModel,
    features: &FeatureConfig,
    prior: Option<&PosePrior>,
) -> StageOutcome {
    for slot in frame.map_points.iter_mut() {
        if slot.is_some_and(|id| !map.is_live(id)) {
            *slot = None;
        }
    }
    frame.outliers.iter_mut().for_each(|o| *o = false);

    let observations = pose_observations(frame, map, camera, features);
    let result = optimize_pose(
        &estimate.pose,
        &observations,
        camera,
        prior,
        &PoseOptimConfig::default(),
    );
    for (obs, outlier) in observations.iter().zip(&result.outliers) {
        frame.outliers[obs.feature_idx] = *outlier;
    }

    let refined = if result.num_inliers > 0 {
        estimate.refined(result.pose)
    } else {
        estimate
    };
    frame.estimate = Some(refined);
    StageOutcome {
        estimate: refined,
        inliers: result.num_inliers,
    }
}

/// Clear outlier links. Returns the landmarks that were dropped.
pub fn discard_outliers(frame: &mut Frame) -> Vec<MapPointId> {
    let mut dropped = Vec::new();
    for (slot, outlier) in frame.map_points.iter_mut().zip(frame.outliers.iter_mut()) {
        if *outlier {
            if let Some(id) = slot.take() {
                dropped.push(id);
            }
            *outlier = false;
        }
    }
    dropped
}

/// Inlier links to landmarks observed by at least one keyframe.
pub fn count_map_matches(frame: &Frame, map: &Map) -> usize {
    frame
        .map_points
        .iter()
        .zip(&frame.outliers)
        .filter(|(slot, outlier)| {
            !**outlier
                && slot
                    .and_then(|id| map.get_map_point(id))
                    .is_some_and(|mp| mp.num_observations() > 0)
        })
        .count()
}
