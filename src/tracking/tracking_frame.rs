//! Tracking `Frame` representation.
//!
//! A `Frame` is what the Tracker operates on for one sensor sample: the
//! extracted features (with optional depth), an appearance vector, the
//! per-feature landmark links found so far, and the current pose estimate.
//! Frames are discarded after tracking unless promoted to a KeyFrame.

use nalgebra::Vector3;

use crate::atlas::keyframe_db::{BowVector, bow_from_descriptors};
use crate::atlas::map::{KeyFrameId, MapPoint, MapPointId};
use crate::config::FeatureConfig;
use crate::geometry::SE3;
use crate::imu::PreintegratedState;
use crate::tracking::estimate::PoseEstimate;
use crate::tracking::frame::{CameraModel, FeatureSet, KeyPoint};

/// Minimum cosine between the landmark's mean viewing direction and the
/// current viewing ray (60 degrees).
pub const VIEWING_COS_LIMIT: f64 = 0.5;

/// Spatial grid for O(1) feature lookup.
///
/// The grid divides the image into GRID_COLS x GRID_ROWS cells.
/// Each cell stores indices of features whose keypoints fall within that cell.
#[derive(Clone)]
pub struct FeatureGrid {
    /// Stored as row-major: cell[row * GRID_COLS + col]
    cells: Vec<Vec<usize>>,
    grid_element_width_inv: f64,
    grid_element_height_inv: f64,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    pub fn new(keypoints: &[KeyPoint], img_width: f64, img_height: f64) -> Self {
        let grid_element_width_inv = Self::GRID_COLS as f64 / img_width.max(1.0);
        let grid_element_height_inv = Self::GRID_ROWS as f64 / img_height.max(1.0);

        let mut cells: Vec<Vec<usize>> = vec![Vec::new(); Self::GRID_COLS * Self::GRID_ROWS];

        for (idx, kp) in keypoints.iter().enumerate() {
            // Keypoints outside the image are never indexed.
            if kp.x < 0.0 || kp.y < 0.0 {
                continue;
            }
            let cell_x = (kp.x * grid_element_width_inv) as usize;
            let cell_y = (kp.y * grid_element_height_inv) as usize;
            if cell_x >= Self::GRID_COLS || cell_y >= Self::GRID_ROWS {
                continue;
            }
            cells[cell_y * Self::GRID_COLS + cell_x].push(idx);
        }

        Self {
            cells,
            grid_element_width_inv,
            grid_element_height_inv,
        }
    }

    /// Feature indices inside the square window of half-size `r` around
    /// (x, y), optionally restricted to an inclusive pyramid level window.
    pub fn get_features_in_area(
        &self,
        keypoints: &[KeyPoint],
        x: f64,
        y: f64,
        r: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        let min_cell_x = ((x - r) * self.grid_element_width_inv).floor().max(0.0) as usize;
        let max_cell_x = ((x + r) * self.grid_element_width_inv).ceil();
        let min_cell_y = ((y - r) * self.grid_element_height_inv).floor().max(0.0) as usize;
        let max_cell_y = ((y + r) * self.grid_element_height_inv).ceil();
        if max_cell_x < 0.0 || max_cell_y < 0.0 {
            return Vec::new();
        }
        let max_cell_x = (max_cell_x as usize).min(Self::GRID_COLS - 1);
        let max_cell_y = (max_cell_y as usize).min(Self::GRID_ROWS - 1);

        let mut indices = Vec::new();
        for cell_y in min_cell_y..=max_cell_y {
            for cell_x in min_cell_x..=max_cell_x {
                for &idx in &self.cells[cell_y * Self::GRID_COLS + cell_x] {
                    let kp = &keypoints[idx];
                    if min_level.is_some_and(|min| kp.octave < min)
                        || max_level.is_some_and(|max| kp.octave > max)
                    {
                        continue;
                    }
                    if (kp.x - x).abs() < r && (kp.y - y).abs() < r {
                        indices.push(idx);
                    }
                }
            }
        }
        indices
    }
}

/// Where a landmark lands in a frame, as computed by the frustum test.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionInfo {
    pub u: f64,
    pub v: f64,
    /// Right-image u for sensors with depth.
    pub u_right: Option<f64>,
    pub predicted_level: usize,
    pub view_cos: f64,
}

/// A frame being tracked (not yet a KeyFrame).
pub struct Frame {
    pub id: u64,
    /// Sensor timestamp in seconds.
    pub timestamp: f64,
    pub features: FeatureSet,
    pub bow: BowVector,
    /// map_points[i] = Some(mp_id) if feature i is linked to a landmark.
    pub map_points: Vec<Option<MapPointId>>,
    /// Marked by pose optimization; outlier links are dropped afterwards.
    pub outliers: Vec<bool>,
    /// `None` until some tracking stage produced a pose.
    pub estimate: Option<PoseEstimate>,
    pub reference_kf: Option<KeyFrameId>,
    /// Inertial delta from the previous frame.
    pub preint_from_last_frame: Option<PreintegratedState>,
    /// Inertial delta accumulated since the last keyframe.
    pub preint_from_last_kf: Option<PreintegratedState>,
    grid: FeatureGrid,
}

impl Frame {
    pub fn new(id: u64, timestamp: f64, features: FeatureSet, camera: &CameraModel) -> Self {
        let features = features.normalized();
        let n = features.len();
        let grid = FeatureGrid::new(&features.keypoints, camera.width, camera.height);
        let bow = bow_from_descriptors(&features.descriptors);
        Self {
            id,
            timestamp,
            features,
            bow,
            map_points: vec![None; n],
            outliers: vec![false; n],
            estimate: None,
            reference_kf: None,
            preint_from_last_frame: None,
            preint_from_last_kf: None,
            grid,
        }
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn keypoints(&self) -> &[KeyPoint] {
        &self.features.keypoints
    }

    /// Camera-to-world pose, if estimated.
    pub fn pose(&self) -> Option<SE3> {
        self.estimate.map(|e| e.pose)
    }

    pub fn point_cam(&self, idx: usize) -> Option<Vector3<f64>> {
        self.features.points_cam.get(idx).copied().flatten()
    }

    /// Right-image u coordinate of a depth-backed feature.
    pub fn u_right(&self, idx: usize, camera: &CameraModel) -> Option<f64> {
        let p = self.point_cam(idx)?;
        let kp = self.features.keypoints.get(idx)?;
        (camera.bf() > 0.0).then(|| camera.project_right_u(kp.x, p.z))
    }

    pub fn get_features_in_area(
        &self,
        x: f64,
        y: f64,
        r: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        self.grid
            .get_features_in_area(&self.features.keypoints, x, y, r, min_level, max_level)
    }

    /// Drop every landmark link.
    pub fn clear_matches(&mut self) {
        self.map_points.iter_mut().for_each(|m| *m = None);
        self.outliers.iter_mut().for_each(|o| *o = false);
    }

    pub fn num_matches(&self) -> usize {
        self.map_points.iter().filter(|m| m.is_some()).count()
    }

    /// Linked features that were not rejected by the last optimization.
    pub fn num_inlier_matches(&self) -> usize {
        self.map_points
            .iter()
            .zip(&self.outliers)
            .filter(|(m, o)| m.is_some() && !**o)
            .count()
    }

    /// Project a landmark with the given pose and check that it is visible:
    /// in front of the camera, inside the image, within its scale-invariance
    /// range, and seen from a direction close to its mean viewing direction.
    pub fn is_in_frustum(
        &self,
        mp: &MapPoint,
        pose_wc: &SE3,
        camera: &CameraModel,
        features: &FeatureConfig,
    ) -> Option<ProjectionInfo> {
        let pose_cw = pose_wc.inverse();
        let p_cam = pose_cw.transform_point(&mp.position);
        let uv = camera.project(&p_cam)?;
        if !camera.in_image(uv.x, uv.y) {
            return None;
        }

        let ray = mp.position - pose_wc.translation;
        let dist = ray.norm();
        if dist < 0.8 * mp.min_distance || dist > 1.2 * mp.max_distance {
            return None;
        }

        let view_cos = ray.dot(&mp.normal) / dist;
        if view_cos < VIEWING_COS_LIMIT {
            return None;
        }

        let predicted_level = mp.predict_scale(dist, features.scale_factor, features.n_levels);
        let u_right = (camera.bf() > 0.0).then(|| camera.project_right_u(uv.x, p_cam.z));

        Some(ProjectionInfo {
            u: uv.x,
            v: uv.y,
            u_right,
            predicted_level,
            view_cos,
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_matches", &self.num_matches())
            .field("reference_kf", &self.reference_kf)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::KeyFrameId;

    fn camera() -> CameraModel {
        CameraModel {
            fx: 450.0,
            fy: 450.0,
            cx: 320.0,
            cy: 240.0,
            baseline: 0.0,
            width: 640.0,
            height: 480.0,
        }
    }

    fn frame_with(kps: Vec<KeyPoint>) -> Frame {
        let n = kps.len();
        Frame::new(0, 0.0, FeatureSet::monocular(kps, vec![[0u8; 32]; n]), &camera())
    }

    #[test]
    fn test_grid_window_and_levels() {
        let frame = frame_with(vec![
            KeyPoint::new(100.0, 100.0, 0),
            KeyPoint::new(104.0, 98.0, 2),
            KeyPoint::new(130.0, 100.0, 0),
            KeyPoint::new(639.5, 479.5, 1),
        ]);
        let mut idx = frame.get_features_in_area(101.0, 100.0, 5.0, None, None);
        idx.sort();
        assert_eq!(idx, vec![0, 1]);
        assert_eq!(frame.get_features_in_area(101.0, 100.0, 5.0, Some(1), None), vec![1]);
        assert_eq!(frame.get_features_in_area(639.0, 479.0, 2.0, None, None), vec![3]);
        assert!(frame.get_features_in_area(-50.0, -50.0, 5.0, None, None).is_empty());
    }

    #[test]
    fn test_frustum_checks_view_angle_and_range() {
        let frame = frame_with(vec![]);
        let features = FeatureConfig::default();
        let mut mp = MapPoint::new(
            MapPointId::new(1),
            Vector3::new(0.0, 0.0, 4.0),
            [0u8; 32],
            KeyFrameId::new(0),
        );
        mp.normal = Vector3::new(0.0, 0.0, 1.0);
        mp.min_distance = 1.0;
        mp.max_distance = 8.0;

        let info = frame
            .is_in_frustum(&mp, &SE3::identity(), &camera(), &features)
            .expect("visible");
        assert!((info.u - 320.0).abs() < 1e-9);
        assert!(info.u_right.is_none());

        // Seen from the side: ray ⟂ normal.
        mp.normal = Vector3::new(1.0, 0.0, 0.0);
        assert!(frame.is_in_frustum(&mp, &SE3::identity(), &camera(), &features).is_none());

        mp.normal = Vector3::new(0.0, 0.0, 1.0);
        mp.max_distance = 2.0;
        assert!(frame.is_in_frustum(&mp, &SE3::identity(), &camera(), &features).is_none());
    }
}
