//! Inertial sensing: samples, bias/noise models, the thread-safe sample
//! queue fed by the IMU producer, and on-manifold preintegration.

pub mod preintegration;
pub mod queue;
pub mod sample;

pub use preintegration::{ImuSegment, PreintegratedState, Preintegrator, segments_between};
pub use queue::ImuQueue;
pub use sample::{GRAVITY, GRAVITY_MAGNITUDE, ImuBias, ImuCalib, ImuNoise, ImuSample};
