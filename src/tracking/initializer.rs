//! Map initialization.
//!
//! Sensors with depth bootstrap from a single frame: every depth-backed
//! feature becomes a landmark of the first keyframe. Monocular sessions need
//! two views: features of a stored anchor frame are followed across later
//! frames, and once enough correspondences survive, a two-view reconstruction
//! yields the relative pose and an initial landmark set at unit median depth.
//! Whenever an attempt fails for good, the current frame becomes the new
//! anchor.

use nalgebra::Vector2;
use tracing::{debug, info};

use crate::atlas::Atlas;
use crate::atlas::map::KeyFrameId;
use crate::config::TrackingConfig;
use crate::geometry::{SE3, TwoViewReconstructor};
use crate::tracking::estimate::PoseEstimate;
use crate::tracking::frame::{CameraModel, FeatureSet, TH_LOW, descriptor_distance};
use crate::tracking::tracking_frame::Frame;

/// Pixel window searched around the last known position of an anchor feature.
const INIT_SEARCH_WINDOW: f64 = 100.0;
const INIT_NN_RATIO: f64 = 0.9;
/// Landmarks the second keyframe must end up tracking.
const MIN_INITIAL_LANDMARKS: usize = 50;
const TWO_VIEW_ITERATIONS: usize = 200;
const MIN_PARALLAX_DEG: f64 = 1.0;

pub enum InitOutcome {
    /// The map was bootstrapped and the frame is tracked against `reference`.
    Initialized {
        reference: KeyFrameId,
        keyframes: Vec<KeyFrameId>,
        estimate: PoseEstimate,
    },
    /// Waiting for (more) frames.
    Pending,
}

struct Anchor {
    frame_id: u64,
    timestamp: f64,
    features: FeatureSet,
    /// Latest position of each anchor feature in the frames that followed.
    prev_matched: Vec<Vector2<f64>>,
    failed_attempts: usize,
}

pub struct Initializer {
    min_depth_features: usize,
    min_anchor_features: usize,
    min_matches: usize,
    max_attempts: usize,
    reconstructor: TwoViewReconstructor,
    anchor: Option<Anchor>,
}

impl Initializer {
    pub fn new(config: &TrackingConfig, camera: CameraModel) -> Self {
        let t = &config.tracking;
        Self {
            min_depth_features: t.init_min_depth_features,
            min_anchor_features: t.init_min_anchor_features,
            min_matches: t.init_min_matches,
            max_attempts: t.init_max_attempts.max(1),
            reconstructor: TwoViewReconstructor::new(
                camera.k(),
                TWO_VIEW_ITERATIONS,
                MIN_INITIAL_LANDMARKS,
                MIN_PARALLAX_DEG,
                t.relocalization_seed,
            ),
            anchor: None,
        }
    }

    pub fn reset(&mut self) {
        self.anchor = None;
    }

    /// Frame id of the stored monocular anchor, if any.
    pub fn anchor_frame_id(&self) -> Option<u64> {
        self.anchor.as_ref().map(|a| a.frame_id)
    }

    /// Single-frame initialization for stereo and RGB-D.
    pub fn initialize_with_depth(
        &mut self,
        frame: &mut Frame,
        atlas: &mut Atlas,
        estimate: PoseEstimate,
    ) -> InitOutcome {
        let n_depth = frame.features.num_with_depth();
        if n_depth < self.min_depth_features {
            debug!(
                "[Init] frame {}: {} depth features, need {}",
                frame.id, n_depth, self.min_depth_features
            );
            return InitOutcome::Pending;
        }

        let map_index = atlas.active_map_index();
        let map = atlas.active_map_mut();
        let kf_id = map.create_keyframe(
            frame.id,
            frame.timestamp,
            estimate.pose,
            frame.features.clone(),
            frame.bow.clone(),
        );

        for idx in 0..frame.num_features() {
            let Some(p_cam) = frame.point_cam(idx) else {
                continue;
            };
            let p_world = estimate.pose.transform_point(&p_cam);
            let mp_id = map.create_map_point(p_world, frame.features.descriptors[idx], kf_id);
            map.associate(kf_id, idx, mp_id);
            map.update_map_point_normal_and_depth(mp_id);
            frame.map_points[idx] = Some(mp_id);
        }
        let n_points = map.num_map_points();
        atlas.keyframe_db.add(kf_id, frame.bow.clone(), map_index);

        info!(
            "[Init] map {} initialized from frame {} with {} landmarks",
            map_index, frame.id, n_points
        );
        frame.reference_kf = Some(kf_id);
        frame.estimate = Some(estimate);
        InitOutcome::Initialized {
            reference: kf_id,
            keyframes: vec![kf_id],
            estimate,
        }
    }

    /// Two-view initialization for monocular sessions.
    pub fn initialize_monocular(
        &mut self,
        frame: &mut Frame,
        atlas: &mut Atlas,
        estimate: PoseEstimate,
    ) -> InitOutcome {
        let Some(anchor) = self.anchor.as_mut() else {
            self.set_anchor(frame);
            return InitOutcome::Pending;
        };

        if frame.num_features() <= self.min_anchor_features {
            debug!("[Init] frame {}: too few features, dropping anchor", frame.id);
            self.anchor = None;
            return InitOutcome::Pending;
        }

        let matches = match_to_anchor(anchor, frame);
        let n_matches = matches.iter().filter(|m| m.is_some()).count();
        if n_matches < self.min_matches {
            debug!(
                "[Init] frame {}: {} matches to anchor {}, re-anchoring",
                frame.id, n_matches, anchor.frame_id
            );
            self.set_anchor(frame);
            return InitOutcome::Pending;
        }

        let matched: Vec<(usize, usize)> = matches
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.map(|j| (i, j)))
            .collect();
        let pairs: Vec<(Vector2<f64>, Vector2<f64>)> = matched
            .iter()
            .map(|&(i, j)| {
                let a = anchor.features.keypoints[i];
                let b = frame.keypoints()[j];
                (Vector2::new(a.x, a.y), Vector2::new(b.x, b.y))
            })
            .collect();

        let reconstruction = self
            .reconstructor
            .reconstruct(&pairs)
            .and_then(|rec| {
                let depths: Vec<f64> = rec.points.iter().flatten().map(|p| p.z).collect();
                let median = median(depths)?;
                (median > 0.0 && rec.num_triangulated() >= MIN_INITIAL_LANDMARKS).then_some((rec, median))
            });

        let Some((rec, median_depth)) = reconstruction else {
            anchor.failed_attempts += 1;
            if anchor.failed_attempts >= self.max_attempts {
                debug!("[Init] anchor {} exhausted, re-anchoring on {}", anchor.frame_id, frame.id);
                self.set_anchor(frame);
            }
            return InitOutcome::Pending;
        };

        let Some(anchor) = self.anchor.take() else {
            return InitOutcome::Pending;
        };

        // Anchor camera is the world origin; scale so the median depth is 1.
        let inv_median = 1.0 / median_depth;
        let anchor_pose = SE3::identity();
        let t21 = SE3::new(rec.t21.rotation, rec.t21.translation * inv_median);
        let current_pose = anchor_pose.compose(&t21.inverse());

        let map_index = atlas.active_map_index();
        let map = atlas.active_map_mut();
        let anchor_bow = crate::atlas::keyframe_db::bow_from_descriptors(&anchor.features.descriptors);
        let kf_ini = map.create_keyframe(
            anchor.frame_id,
            anchor.timestamp,
            anchor_pose,
            anchor.features.clone(),
            anchor_bow.clone(),
        );
        let kf_cur = map.create_keyframe(
            frame.id,
            frame.timestamp,
            current_pose,
            frame.features.clone(),
            frame.bow.clone(),
        );

        frame.clear_matches();
        let mut created = Vec::new();
        for (k, &(i, j)) in matched.iter().enumerate() {
            let Some(p1) = rec.points[k] else { continue };
            let p_world = anchor_pose.transform_point(&(p1 * inv_median));
            let mp_id = map.create_map_point(p_world, anchor.features.descriptors[i], kf_ini);
            map.associate(kf_ini, i, mp_id);
            map.associate(kf_cur, j, mp_id);
            frame.map_points[j] = Some(mp_id);
            created.push(mp_id);
        }
        for mp_id in &created {
            map.update_map_point_normal_and_depth(*mp_id);
        }
        map.update_connections(kf_ini);
        map.update_connections(kf_cur);

        atlas.keyframe_db.add(kf_ini, anchor_bow, map_index);
        atlas.keyframe_db.add(kf_cur, frame.bow.clone(), map_index);

        info!(
            "[Init] monocular map {} initialized: frames {}-{}, {} landmarks, parallax {:.2} deg",
            map_index,
            anchor.frame_id,
            frame.id,
            created.len(),
            rec.parallax_deg
        );

        let estimate = estimate.refined(current_pose);
        frame.reference_kf = Some(kf_cur);
        frame.estimate = Some(estimate);
        InitOutcome::Initialized {
            reference: kf_cur,
            keyframes: vec![kf_ini, kf_cur],
            estimate,
        }
    }

    fn set_anchor(&mut self, frame: &Frame) {
        if frame.num_features() <= self.min_anchor_features {
            self.anchor = None;
            return;
        }
        self.anchor = Some(Anchor {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            features: frame.features.clone(),
            prev_matched: frame
                .keypoints()
                .iter()
                .map(|kp| Vector2::new(kp.x, kp.y))
                .collect(),
            failed_attempts: 0,
        });
    }
}

/// Match finest-level anchor features into the frame around their last
/// known position. One-to-one: a later, better claim on a frame feature
/// evicts the earlier one.
fn match_to_anchor(anchor: &mut Anchor, frame: &Frame) -> Vec<Option<usize>> {
    let n = anchor.features.len();
    let mut matches12: Vec<Option<usize>> = vec![None; n];
    let mut matches21: Vec<Option<usize>> = vec![None; frame.num_features()];
    let mut dist21: Vec<u32> = vec![u32::MAX; frame.num_features()];

    for i in 0..n {
        let kp = anchor.features.keypoints[i];
        if kp.octave > 0 {
            continue;
        }
        let center = anchor.prev_matched[i];
        let candidates =
            frame.get_features_in_area(center.x, center.y, INIT_SEARCH_WINDOW, Some(0), Some(0));

        let desc = &anchor.features.descriptors[i];
        let mut best = (u32::MAX, None::<usize>);
        let mut second = u32::MAX;
        for j in candidates {
            let d = descriptor_distance(desc, &frame.features.descriptors[j]);
            if dist21[j] <= d {
                continue;
            }
            if d < best.0 {
                second = best.0;
                best = (d, Some(j));
            } else if d < second {
                second = d;
            }
        }

        let (best_dist, Some(j)) = best else { continue };
        if best_dist > TH_LOW || best_dist as f64 >= INIT_NN_RATIO * second as f64 {
            continue;
        }
        if let Some(prev) = matches21[j] {
            matches12[prev] = None;
        }
        matches12[i] = Some(j);
        matches21[j] = Some(i);
        dist21[j] = best_dist;
    }

    for (i, m) in matches12.iter().enumerate() {
        if let Some(j) = m {
            let kp = frame.keypoints()[*j];
            anchor.prev_matched[i] = Vector2::new(kp.x, kp.y);
        }
    }
    matches12
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(values[values.len() / 2])
}
