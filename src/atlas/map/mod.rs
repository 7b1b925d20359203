//! Map graph: keyframes, landmarks and their id-addressed relations.
//!
//! - [`KeyFrame`] - promoted frames with covisibility and spanning-tree links
//! - [`MapPoint`] - 3D landmarks with observation bookkeeping
//! - [`Map`] - arena owning both, plus association, replacement and culling
//!
//! KeyFrames observe MapPoints (`KeyFrame::map_point_ids`) and MapPoints
//! track their observers (`MapPoint::observations`); `Map` keeps both sides
//! consistent.

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
