//! Session configuration.
//!
//! Calibration and tracking thresholds are loaded once from YAML, validated,
//! and shared read-only (behind an `Arc`) with every component.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, bail};
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::imu::{ImuCalib, ImuNoise};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Monocular,
    Stereo,
    Rgbd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub kind: SensorKind,
    #[serde(default)]
    pub use_imu: bool,
}

/// Pinhole intrinsics plus depth parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
    /// Stereo baseline times fx. Required for stereo and RGB-D.
    #[serde(default)]
    pub bf: f64,
    /// Raw depth units per meter (RGB-D only).
    #[serde(default = "default_depth_map_factor")]
    pub depth_map_factor: f64,
    /// Points closer than this (meters) count as "close" for depth sensors.
    #[serde(default = "default_close_depth")]
    pub close_depth: f64,
}

fn default_depth_map_factor() -> f64 {
    1.0
}

fn default_close_depth() -> f64 {
    3.5
}

impl CameraConfig {
    pub fn baseline(&self) -> f64 {
        if self.fx > 0.0 { self.bf / self.fx } else { 0.0 }
    }
}

/// ORB scale pyramid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub scale_factor: f64,
    pub n_levels: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.2,
            n_levels: 8,
        }
    }
}

impl FeatureConfig {
    pub fn level_scale(&self, level: usize) -> f64 {
        self.scale_factor.powi(level as i32)
    }

    pub fn level_sigma2(&self, level: usize) -> f64 {
        self.scale_factor.powi(2 * level as i32)
    }

    pub fn inv_level_sigma2(&self, level: usize) -> f64 {
        1.0 / self.level_sigma2(level)
    }
}

/// Inertial sensor block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImuConfig {
    #[serde(default = "default_imu_rate")]
    pub rate_hz: f64,
    #[serde(default)]
    pub noise: ImuNoise,
    /// Row-major 4x4 camera-to-body transform.
    #[serde(rename = "T_bc", default = "identity_transform")]
    pub t_bc: Vec<f64>,
}

fn default_imu_rate() -> f64 {
    200.0
}

fn identity_transform() -> Vec<f64> {
    Matrix4::<f64>::identity().transpose().as_slice().to_vec()
}

impl ImuConfig {
    pub fn calib(&self) -> Result<ImuCalib> {
        Ok(ImuCalib::new(transform_from(&self.t_bc)?, self.noise))
    }
}

fn transform_from(data: &[f64]) -> Result<SE3> {
    if data.len() != 16 {
        bail!("Expected 16 elements for transform, got {}", data.len());
    }
    let mat = Matrix4::from_row_slice(data);
    let rot = mat.fixed_view::<3, 3>(0, 0).into_owned();
    let trans = mat.fixed_view::<3, 1>(0, 3).into_owned();
    Ok(SE3::from_rt(&rot, &trans))
}

/// Tracking thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingParams {
    /// Minimum frames between keyframes.
    pub min_frames: u64,
    /// Frames after which a keyframe is forced.
    pub max_frames: u64,

    pub min_inliers: usize,
    /// Used once inertial initialization has completed.
    pub min_inliers_inertial: usize,
    /// Used for frames shortly after a relocalization.
    pub min_inliers_after_relocalization: usize,
    pub min_inliers_recently_lost: usize,

    /// Seconds an inertial session may stay in RecentlyLost.
    pub recently_lost_grace_s: f64,
    /// Consecutive failed relocalizations before a new map is started.
    pub max_relocalization_failures: usize,

    pub max_local_keyframes: usize,
    /// Refiner queue length at which keyframe insertion is deferred.
    pub refiner_queue_limit: usize,
    pub keyframe_interval_before_imu_init_s: f64,
    pub keyframe_interval_after_imu_init_s: f64,

    pub init_min_depth_features: usize,
    pub init_min_anchor_features: usize,
    pub init_min_matches: usize,
    pub init_max_attempts: usize,

    /// Motion-model search radius (pixels at level 0) for stereo/RGB-D.
    pub motion_search_radius_stereo: f64,
    pub motion_search_radius_mono: f64,
    /// Radius multiplier for local-map projection search.
    pub local_search_radius: f64,

    pub relocalization_seed: u64,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            min_frames: 0,
            max_frames: 30,
            min_inliers: 30,
            min_inliers_inertial: 15,
            min_inliers_after_relocalization: 50,
            min_inliers_recently_lost: 10,
            recently_lost_grace_s: 5.0,
            max_relocalization_failures: 100,
            max_local_keyframes: 80,
            refiner_queue_limit: 3,
            keyframe_interval_before_imu_init_s: 0.25,
            keyframe_interval_after_imu_init_s: 0.5,
            init_min_depth_features: 500,
            init_min_anchor_features: 100,
            init_min_matches: 100,
            init_max_attempts: 10,
            motion_search_radius_stereo: 7.0,
            motion_search_radius_mono: 15.0,
            local_search_radius: 1.0,
            relocalization_seed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub sensor: SensorConfig,
    pub camera: CameraConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub imu: Option<ImuConfig>,
    #[serde(default)]
    pub tracking: TrackingParams,
}

impl TrackingConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: TrackingConfig =
            serde_yaml::from_str(s).context("Failed to parse tracking configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: TrackingConfig = serde_yaml::from_reader(
            File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
        )
        .with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject calibrations and thresholds the tracker cannot run with.
    pub fn validate(&self) -> Result<()> {
        let cam = &self.camera;
        if cam.fx <= 0.0 || cam.fy <= 0.0 {
            bail!("Focal lengths must be positive (fx={}, fy={})", cam.fx, cam.fy);
        }
        if cam.width == 0 || cam.height == 0 {
            bail!("Image size must be non-zero ({}x{})", cam.width, cam.height);
        }
        if self.has_depth() && cam.bf <= 0.0 {
            bail!("{:?} sensor requires a positive bf, got {}", self.sensor.kind, cam.bf);
        }
        if self.sensor.kind == SensorKind::Rgbd && cam.depth_map_factor <= 0.0 {
            bail!("depth_map_factor must be positive, got {}", cam.depth_map_factor);
        }
        if self.features.scale_factor <= 1.0 {
            bail!("Pyramid scale factor must exceed 1, got {}", self.features.scale_factor);
        }
        if self.features.n_levels == 0 {
            bail!("Pyramid needs at least one level");
        }
        let t = &self.tracking;
        if t.min_frames > t.max_frames {
            bail!("min_frames ({}) exceeds max_frames ({})", t.min_frames, t.max_frames);
        }
        if t.max_local_keyframes == 0 {
            bail!("max_local_keyframes must be positive");
        }
        if t.recently_lost_grace_s < 0.0 {
            bail!("recently_lost_grace_s must be non-negative");
        }
        if self.sensor.use_imu {
            match &self.imu {
                None => bail!("Inertial session configured without an imu block"),
                Some(imu) => {
                    if imu.rate_hz <= 0.0 {
                        bail!("IMU rate must be positive, got {}", imu.rate_hz);
                    }
                    imu.calib()?;
                }
            }
        }
        Ok(())
    }

    pub fn is_inertial(&self) -> bool {
        self.sensor.use_imu
    }

    pub fn is_monocular(&self) -> bool {
        self.sensor.kind == SensorKind::Monocular
    }

    /// Stereo and RGB-D sensors yield per-keypoint depth.
    pub fn has_depth(&self) -> bool {
        matches!(self.sensor.kind, SensorKind::Stereo | SensorKind::Rgbd)
    }

    /// Calibration for inertial sessions, identity extrinsics otherwise.
    pub fn imu_calib(&self) -> Result<ImuCalib> {
        match &self.imu {
            Some(imu) => imu.calib(),
            None => Ok(ImuCalib::default()),
        }
    }

    /// Minimal valid configuration for a sensor kind.
    pub fn for_sensor(kind: SensorKind, use_imu: bool) -> Self {
        Self {
            sensor: SensorConfig { kind, use_imu },
            camera: CameraConfig {
                fx: 458.0,
                fy: 457.0,
                cx: 367.0,
                cy: 248.0,
                width: 752,
                height: 480,
                bf: if kind == SensorKind::Monocular { 0.0 } else { 50.4 },
                depth_map_factor: default_depth_map_factor(),
                close_depth: default_close_depth(),
            },
            features: FeatureConfig::default(),
            imu: use_imu.then(|| ImuConfig {
                rate_hz: default_imu_rate(),
                noise: ImuNoise::default(),
                t_bc: identity_transform(),
            }),
            tracking: TrackingParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEREO_YAML: &str = r#"
sensor:
  kind: stereo
  use_imu: true
camera:
  fx: 458.654
  fy: 457.296
  cx: 367.215
  cy: 248.375
  width: 752
  height: 480
  bf: 50.4
imu:
  rate_hz: 200.0
  noise:
    sigma_gyro: 1.7e-4
    sigma_accel: 2.0e-3
  T_bc: [1, 0, 0, 0.1,
         0, 1, 0, 0,
         0, 0, 1, 0,
         0, 0, 0, 1]
tracking:
  recently_lost_grace_s: 2.0
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let cfg = TrackingConfig::from_yaml_str(STEREO_YAML).unwrap();
        assert_eq!(cfg.sensor.kind, SensorKind::Stereo);
        assert!(cfg.is_inertial());
        assert_eq!(cfg.tracking.recently_lost_grace_s, 2.0);
        assert_eq!(cfg.tracking.min_inliers, 30);
        assert_eq!(cfg.features.n_levels, 8);
        let calib = cfg.imu_calib().unwrap();
        assert!((calib.t_bc.translation.x - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_focal() {
        let mut cfg = TrackingConfig::for_sensor(SensorKind::Monocular, false);
        cfg.camera.fx = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_stereo_without_baseline() {
        let mut cfg = TrackingConfig::for_sensor(SensorKind::Stereo, false);
        cfg.camera.bf = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_inertial_without_imu_block() {
        let mut cfg = TrackingConfig::for_sensor(SensorKind::Stereo, true);
        cfg.imu = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_frame_spacing() {
        let mut cfg = TrackingConfig::for_sensor(SensorKind::Rgbd, false);
        cfg.tracking.min_frames = 40;
        cfg.tracking.max_frames = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_default_configs_validate() {
        for kind in [SensorKind::Monocular, SensorKind::Stereo, SensorKind::Rgbd] {
            for imu in [false, true] {
                assert!(TrackingConfig::for_sensor(kind, imu).validate().is_ok());
            }
        }
    }
}
