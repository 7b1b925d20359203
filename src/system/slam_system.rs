//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` is the top-level struct that users interact with. It
//! owns the shared state, runs tracking on the caller's thread and spawns the
//! Local Mapping and Loop Closing threads.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, unbounded};
use tracing::{info, warn};

use crate::atlas::map::MapPointId;
use crate::config::TrackingConfig;
use crate::imu::ImuSample;
use crate::local_mapping::LocalMapper;
use crate::loop_closing::{LoopCloser, LoopDetectorConfig};
use crate::tracking::frame::{CameraModel, FeatureExtractor};
use crate::tracking::{Tracker, TrackingResult, TrackingState, TrajectoryHistory};

use super::backend::ChannelBackend;
use super::messages::NewKeyFrameMsg;
use super::shared_state::{SharedState, Worker};

/// Interval between warnings while a reset waits for the background threads.
const RESET_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SlamSystem<E: FeatureExtractor> {
    config: Arc<TrackingConfig>,
    shared: Arc<SharedState>,
    extractor: E,

    /// The tracker runs in the calling thread.
    tracker: Tracker,

    local_mapping_handle: Option<JoinHandle<()>>,
    loop_closing_handle: Option<JoinHandle<()>>,
}

impl<E: FeatureExtractor> SlamSystem<E> {
    /// Validate the configuration, build the tracker and spawn the
    /// background threads.
    pub fn new(config: TrackingConfig, extractor: E) -> Result<Self> {
        config.validate().context("Invalid tracking configuration")?;
        let config = Arc::new(config);
        let shared = SharedState::new(config.features.scale_factor, config.features.n_levels);

        let (kf_sender, kf_receiver) = unbounded::<NewKeyFrameMsg>();
        let (lc_sender, lc_receiver) = unbounded::<NewKeyFrameMsg>();

        let backend = ChannelBackend::new(kf_sender, Arc::clone(&shared));
        let mut tracker = Tracker::new(Arc::clone(&config), Arc::clone(&shared), Box::new(backend))?;

        let local_mapper = LocalMapper::new(
            CameraModel::from_config(&config.camera),
            config.imu_calib()?,
            config.is_inertial(),
            config.is_monocular(),
            Some(lc_sender),
        );
        let local_mapping_handle =
            Self::spawn_local_mapping(local_mapper, kf_receiver, Arc::clone(&shared));
        let loop_closing_handle = Self::spawn_loop_closing(lc_receiver, Arc::clone(&shared));

        tracker.mark_ready();
        info!(
            "SLAM system started ({:?}, inertial: {})",
            config.sensor.kind,
            config.is_inertial()
        );

        Ok(Self {
            config,
            shared,
            extractor,
            tracker,
            local_mapping_handle: Some(local_mapping_handle),
            loop_closing_handle: Some(loop_closing_handle),
        })
    }

    fn spawn_local_mapping(
        mut local_mapper: LocalMapper,
        kf_receiver: Receiver<NewKeyFrameMsg>,
        shared: Arc<SharedState>,
    ) -> JoinHandle<()> {
        thread::spawn(move || local_mapper.run(kf_receiver, shared))
    }

    fn spawn_loop_closing(
        kf_receiver: Receiver<NewKeyFrameMsg>,
        shared: Arc<SharedState>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut loop_closer = LoopCloser::new(LoopDetectorConfig::default());
            loop_closer.run(kf_receiver, shared);
        })
    }

    /// Extract features from `image` and track them.
    ///
    /// Only feature extraction can fail; tracking trouble is reported through
    /// the returned state.
    pub fn ingest(&mut self, image: &E::Image, timestamp: f64) -> Result<TrackingResult> {
        let t_extract = Instant::now();
        let features = self
            .extractor
            .extract(image)
            .with_context(|| format!("Feature extraction failed at t={timestamp:.6}"))?;
        let extract_ms = t_extract.elapsed().as_secs_f64() * 1000.0;

        let mut result = self.tracker.track(features, timestamp);
        result.timing.extract_ms = extract_ms;
        result.timing.total_ms += extract_ms;
        Ok(result)
    }

    /// Queue an inertial sample for the next frame.
    pub fn ingest_inertial(&self, sample: ImuSample) {
        self.shared.imu_queue.push(sample);
    }

    pub fn current_state(&self) -> TrackingState {
        self.tracker.state()
    }

    pub fn inlier_count(&self) -> usize {
        self.tracker.inlier_count()
    }

    pub fn local_landmarks(&self) -> Vec<MapPointId> {
        self.tracker.local_landmarks()
    }

    pub fn set_localization_only(&mut self, on: bool) {
        self.tracker.set_localization_only(on);
    }

    pub fn trajectory(&self) -> Arc<TrajectoryHistory> {
        self.tracker.trajectory()
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Shared state for display layers.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Reset tracking and the map.
    ///
    /// Both background threads acknowledge before anything is cleared. With
    /// `preserve_map` the current map is retired into the atlas and a fresh
    /// one is started; otherwise the whole atlas is dropped.
    ///
    /// Waits as long as the threads are alive. If one of them has stopped
    /// the reset is abandoned, the map is left as it was and an error is
    /// returned.
    pub fn reset(&mut self, preserve_map: bool) -> Result<()> {
        info!("[System] reset requested (preserve map: {})", preserve_map);
        self.tracker.begin_reset();

        let generation = self.shared.request_reset();
        let workers = [Worker::LocalMapping, Worker::LoopClosing];
        while !self
            .shared
            .wait_for_reset_acks(generation, &workers, RESET_ACK_TIMEOUT)
        {
            if self.shared.is_shutdown_requested() || self.background_stopped() {
                self.shared.finish_reset();
                self.tracker.abort_reset();
                bail!("Reset {generation} abandoned: background threads are not running");
            }
            warn!("[System] still waiting for reset {} acknowledgements", generation);
        }

        {
            let mut atlas = self.shared.atlas.write();
            if preserve_map {
                let index = atlas.create_new_map();
                info!("[System] map {} started, {} maps kept", index, atlas.num_maps());
            } else {
                atlas.clear();
            }
        }
        self.shared.imu_queue.clear();
        self.shared.take_map_updated();
        self.shared.take_imu_update();

        self.tracker.finish_reset(!preserve_map);
        self.shared.finish_reset();
        info!("[System] reset {} done", generation);
        Ok(())
    }

    fn background_stopped(&self) -> bool {
        [&self.local_mapping_handle, &self.loop_closing_handle]
            .into_iter()
            .any(|handle| handle.as_ref().is_none_or(JoinHandle::is_finished))
    }

    /// Empty the active map only; other maps are kept.
    pub fn reset_active_map(&mut self) {
        {
            let mut atlas = self.shared.atlas.write();
            atlas.reset_active_map();
        }
        self.tracker.on_active_map_reset();
        info!("[System] active map reset");
    }

    /// Signal the background threads to stop and wait for them.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        for handle in [self.local_mapping_handle.take(), self.loop_closing_handle.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                warn!("[System] background thread panicked");
            }
        }
    }
}

impl<E: FeatureExtractor> Drop for SlamSystem<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorKind;
    use crate::tracking::frame::{FeatureSet, KeyPoint};
    use nalgebra::Vector3;

    /// Images are pre-extracted feature sets; `None` fails extraction.
    struct PassThrough;

    impl FeatureExtractor for PassThrough {
        type Image = Option<FeatureSet>;

        fn extract(&mut self, image: &Self::Image) -> Result<FeatureSet> {
            match image {
                Some(features) => Ok(features.clone()),
                None => bail!("unreadable image"),
            }
        }
    }

    fn depth_grid(n: usize) -> FeatureSet {
        let mut features = FeatureSet::default();
        let cols = 30;
        for i in 0..n {
            let (u, v) = (20.0 + (i % cols) as f64 * 23.0, 20.0 + (i / cols) as f64 * 20.0);
            let mut desc = [0u8; 32];
            desc[..8].copy_from_slice(&(i as u64).to_le_bytes());
            features.keypoints.push(KeyPoint::new(u, v, 0));
            features.descriptors.push(desc);
            features
                .points_cam
                .push(Some(Vector3::new((u - 367.0) * 2.0 / 458.0, (v - 248.0) * 2.0 / 457.0, 2.0)));
        }
        features
    }

    #[test]
    fn test_invalid_config_aborts_startup() {
        let mut config = TrackingConfig::for_sensor(SensorKind::Stereo, false);
        config.camera.fx = 0.0;
        assert!(SlamSystem::new(config, PassThrough).is_err());
    }

    #[test]
    fn test_ingest_reset_and_extraction_errors() {
        let config = TrackingConfig::for_sensor(SensorKind::Stereo, false);
        let mut system = SlamSystem::new(config, PassThrough).unwrap();
        assert_eq!(system.current_state(), TrackingState::NoImagesYet);

        let result = system.ingest(&Some(depth_grid(600)), 0.0).unwrap();
        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.new_keyframe.is_some());

        assert!(system.ingest(&None, 0.05).is_err());

        system.reset(true).unwrap();
        assert_eq!(system.current_state(), TrackingState::NoImagesYet);
        assert_eq!(system.shared_state().atlas.read().num_maps(), 2);

        system.reset(false).unwrap();
        assert!(system.trajectory().is_empty());
        system.shutdown();
    }

    #[test]
    fn test_reset_without_background_threads_keeps_the_map() {
        let config = TrackingConfig::for_sensor(SensorKind::Stereo, false);
        let mut system = SlamSystem::new(config, PassThrough).unwrap();
        system.ingest(&Some(depth_grid(600)), 0.0).unwrap();
        assert_eq!(system.current_state(), TrackingState::Ok);

        system.shutdown();
        assert!(system.reset(false).is_err());

        let atlas = system.shared_state().atlas.read();
        assert_eq!(atlas.num_maps(), 1);
        assert_eq!(atlas.active_map().num_keyframes(), 1);
        drop(atlas);
        assert_eq!(system.current_state(), TrackingState::Ok);
        assert!(!system.shared_state().is_reset_in_progress());
    }
}
