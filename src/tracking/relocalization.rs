//! Relocalization: recover the camera pose from appearance alone.
//!
//! Candidate keyframes come from the place-recognition database. Each one is
//! matched by descriptor, pose hypotheses are drawn RANSAC-style from minimal
//! subsets of the matches, and the best hypothesis is refined and extended
//! by projection until it gathers enough inliers or the candidate is dropped.

use std::collections::HashSet;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use tracing::debug;

use crate::atlas::keyframe_db::KeyFrameDatabase;
use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::config::FeatureConfig;
use crate::geometry::SE3;
use crate::optimizer::{PoseObservation, PoseOptimConfig, optimize_pose};
use crate::tracking::estimate::PoseEstimate;
use crate::tracking::frame::CameraModel;
use crate::tracking::matching::{search_by_appearance, search_by_projection_keyframe};
use crate::tracking::refine::{discard_outliers, optimize_frame_pose, pose_observations};
use crate::tracking::tracking_frame::Frame;

/// Appearance matches a candidate needs before hypotheses are drawn.
const MIN_APPEARANCE_MATCHES: usize = 15;
const APPEARANCE_RATIO: f64 = 0.75;
const MAX_CANDIDATES: usize = 10;
const RANSAC_ITERATIONS: usize = 60;
const MIN_SET: usize = 6;
/// Inliers a hypothesis needs to be refined at all.
const MIN_HYPOTHESIS_INLIERS: usize = 10;
/// Chi2 gate (2 DOF, 95%) for hypothesis scoring.
const CHI2_MONO: f64 = 5.991;

#[derive(Debug, Clone, Copy)]
pub struct Relocalization {
    pub keyframe: KeyFrameId,
    pub estimate: PoseEstimate,
    pub inliers: usize,
}

pub struct Relocalizer {
    rng: StdRng,
    camera: CameraModel,
    features: FeatureConfig,
    /// Inliers required to accept a relocalization.
    min_inliers: usize,
}

impl Relocalizer {
    pub fn new(camera: CameraModel, features: FeatureConfig, min_inliers: usize, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            camera,
            features,
            min_inliers,
        }
    }

    /// Try every candidate of the active map in order of appearance score.
    ///
    /// On success the frame's links hold the verified inliers and its
    /// estimate is set. On failure all links are cleared.
    pub fn relocalize(
        &mut self,
        frame: &mut Frame,
        map: &Map,
        db: &KeyFrameDatabase,
        seed: PoseEstimate,
    ) -> Option<Relocalization> {
        let candidates = db.detect_candidates(&frame.bow, &HashSet::new(), Some(map.index), MAX_CANDIDATES);
        if candidates.is_empty() {
            debug!("[Reloc] frame {}: no candidates", frame.id);
            return None;
        }

        for cand in candidates {
            let Some(kf) = map.get_keyframe(cand.keyframe_id).filter(|kf| !kf.is_bad) else {
                continue;
            };
            let n = search_by_appearance(kf, frame, map, APPEARANCE_RATIO);
            if n < MIN_APPEARANCE_MATCHES {
                continue;
            }

            let Some(pose) = self.best_hypothesis(frame, map, &kf.pose) else {
                continue;
            };
            let start = PoseEstimate { pose, ..seed };

            let mut outcome = optimize_frame_pose(frame, start, map, &self.camera, &self.features, None);
            if outcome.inliers < MIN_HYPOTHESIS_INLIERS {
                continue;
            }
            discard_outliers(frame);

            if outcome.inliers < self.min_inliers {
                let found: HashSet<MapPointId> = frame.map_points.iter().flatten().copied().collect();
                let added = search_by_projection_keyframe(
                    frame, kf, map, &found, &self.camera, &self.features, 10.0, 100,
                );
                if added + outcome.inliers >= self.min_inliers {
                    outcome =
                        optimize_frame_pose(frame, outcome.estimate, map, &self.camera, &self.features, None);

                    // Close: one more, narrower search at the refined pose.
                    if outcome.inliers > 30 && outcome.inliers < self.min_inliers {
                        let found: HashSet<MapPointId> =
                            frame.map_points.iter().flatten().copied().collect();
                        let added = search_by_projection_keyframe(
                            frame, kf, map, &found, &self.camera, &self.features, 3.0, 64,
                        );
                        if outcome.inliers + added >= self.min_inliers {
                            outcome = optimize_frame_pose(
                                frame,
                                outcome.estimate,
                                map,
                                &self.camera,
                                &self.features,
                                None,
                            );
                        }
                    }
                    discard_outliers(frame);
                }
            }

            if outcome.inliers >= self.min_inliers {
                debug!(
                    "[Reloc] frame {} relocalized against {} with {} inliers",
                    frame.id, kf.id, outcome.inliers
                );
                return Some(Relocalization {
                    keyframe: kf.id,
                    estimate: outcome.estimate,
                    inliers: outcome.inliers,
                });
            }
        }

        frame.clear_matches();
        None
    }

    /// Draw pose hypotheses from minimal subsets and return the one with
    /// the most inliers over all current matches.
    fn best_hypothesis(&mut self, frame: &Frame, map: &Map, initial: &SE3) -> Option<SE3> {
        let observations = pose_observations(frame, map, &self.camera, &self.features);
        if observations.len() < MIN_SET {
            return None;
        }
        let config = PoseOptimConfig {
            rounds: 1,
            robust_rounds: 0,
            ..Default::default()
        };

        let mut best: Option<(SE3, usize)> = None;
        let mut subset: Vec<PoseObservation> = Vec::with_capacity(MIN_SET);
        for _ in 0..RANSAC_ITERATIONS {
            subset.clear();
            for idx in sample(&mut self.rng, observations.len(), MIN_SET) {
                subset.push(observations[idx].clone());
            }
            let hypothesis = optimize_pose(initial, &subset, &self.camera, None, &config);
            if hypothesis.num_inliers < MIN_SET / 2 {
                continue;
            }
            let score = count_inliers(&hypothesis.pose, &observations, &self.camera);
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((hypothesis.pose, score));
            }
            if score == observations.len() {
                break;
            }
        }

        best.filter(|(_, s)| *s >= MIN_HYPOTHESIS_INLIERS)
            .map(|(pose, _)| pose)
    }
}

fn count_inliers(pose_wc: &SE3, observations: &[PoseObservation], camera: &CameraModel) -> usize {
    let pose_cw = pose_wc.inverse();
    observations
        .iter()
        .filter(|obs| {
            let p = pose_cw.transform_point(&obs.point_world);
            camera
                .project(&p)
                .is_some_and(|uv| (uv - obs.uv).norm_squared() * obs.inv_sigma2 <= CHI2_MONO)
        })
        .count()
}
