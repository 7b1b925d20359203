//! SLAM system orchestration and thread management.
//!
//! The top-level `SlamSystem` runs tracking on the caller's thread and
//! coordinates the Local Mapping and Loop Closing threads through the shared
//! state, the keyframe channels and the reset handshake.

pub mod backend;
pub mod messages;
pub mod shared_state;
mod slam_system;

pub use backend::{ChannelBackend, MappingBackend};
pub use messages::NewKeyFrameMsg;
pub use shared_state::{ImuUpdate, SharedState, Worker};
pub use slam_system::SlamSystem;
