//! Visual-inertial tracking front-end in the style of ORB-SLAM3.
//!
//! Per-frame pose tracking, keyframe policy and tracking-failure recovery
//! over a shared multi-map atlas, with lightweight local mapping and loop
//! detection threads behind it.

pub mod atlas;
pub mod config;
pub mod geometry;
pub mod imu;
pub mod local_mapping;
pub mod loop_closing;
pub mod optimizer;
pub mod system;
pub mod tracking;

pub use config::{SensorKind, TrackingConfig};
pub use system::SlamSystem;
pub use tracking::{Tracker, TrackingResult, TrackingState};
