//! Atlas - multi-map container shared by tracking, local mapping and loop closing.
//!
//! - [`map`] - keyframe/landmark arena of a single map
//! - [`atlas::Atlas`] - active map plus retired maps kept for later reconciliation
//! - [`keyframe_db`] - appearance database used for relocalization and loop queries

pub mod atlas;
pub mod keyframe_db;
pub mod map;

pub use atlas::{Atlas, MapIndex};
pub use keyframe_db::{BowVector, Candidate, KeyFrameDatabase};
pub use map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
