//! MapPoint - a 3D landmark observed by KeyFrames.
//!
//! Each MapPoint tracks the keyframes observing it, the statistics the
//! refiner uses for culling, and the scale-invariance distance range used
//! by the tracker's frustum test.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::tracking::frame::Descriptor;

use super::types::{KeyFrameId, MapPointId};

#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative ORB descriptor.
    pub descriptor: Descriptor,

    /// observations[kf_id] = feature index of this point in that keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    pub min_distance: f64,
    pub max_distance: f64,

    /// Times the point fell inside a tracked frame's frustum.
    pub visible_count: u32,
    /// Times the point was matched as an inlier.
    pub found_count: u32,

    /// KeyFrame that created this point.
    pub first_kf_id: KeyFrameId,

    /// Last frame id where this point was discarded as an outlier or seen.
    pub last_frame_seen: Option<u64>,

    /// Visual-odometry point owned by a single frame; never observed by a keyframe.
    pub is_temporary: bool,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            first_kf_id,
            last_frame_seen: None,
            is_temporary: false,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// found / visible, 1.0 before the point has been seen.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    /// Whether the refiner should drop this point.
    pub fn should_cull(&self, min_found_ratio: f64, min_observations: usize) -> bool {
        if self.is_bad {
            return true;
        }
        if self.num_observations() < min_observations {
            return true;
        }
        self.found_ratio() < min_found_ratio
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    /// Recompute the mean viewing direction and scale-invariance range.
    ///
    /// `reference` is the creating keyframe's center and the pyramid level the
    /// point was detected at there; the range spans the whole pyramid around it.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        observer_centers: impl Iterator<Item = &'a Vector3<f64>>,
        reference: Option<(Vector3<f64>, usize)>,
        scale_factor: f64,
        num_levels: usize,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0usize;
        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }
        if n > 0 {
            let norm = normal_sum.norm();
            if norm > 1e-10 {
                self.normal = normal_sum / norm;
            }
        }

        if let Some((ref_center, level)) = reference {
            let dist = (self.position - ref_center).norm();
            let level_scale = scale_factor.powi(level as i32);
            let top = scale_factor.powi(num_levels.saturating_sub(1) as i32);
            self.max_distance = dist * level_scale;
            self.min_distance = self.max_distance / top;
        }
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }

    /// Pyramid level at which the point is expected at `distance`.
    pub fn predict_scale(&self, distance: f64, scale_factor: f64, num_levels: usize) -> usize {
        if distance <= 0.0 || !self.max_distance.is_finite() {
            return 0;
        }
        let ratio = self.max_distance / distance;
        let level = (ratio.ln() / scale_factor.ln()).ceil();
        level.clamp(0.0, num_levels.saturating_sub(1) as f64) as usize
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible_count", &self.visible_count)
            .field("found_count", &self.found_count)
            .field("is_temporary", &self.is_temporary)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
