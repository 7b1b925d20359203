//! Local mapping: the background refiner fed with keyframes by tracking.
//!
//! - Landmark probation and culling
//! - Duplicate landmark fusion with neighbouring keyframes
//! - Inertial initialization of the map

mod imu_init;
mod local_mapper;
mod search_in_neighbors;

pub use imu_init::{ImuInitResult, apply_imu_init, estimate_imu_init};
pub use local_mapper::LocalMapper;
pub use search_in_neighbors::{
    FusionConfig, FusionStats, search_in_neighbors, search_in_neighbors_with_config,
};
