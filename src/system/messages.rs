//! Inter-thread message types.
//!
//! Keyframes are created in the map by tracking; the messages only carry
//! ids, so a receiver always looks the keyframe up again and treats a miss
//! as "culled or reset".

use crate::atlas::MapIndex;
use crate::atlas::map::KeyFrameId;

/// Sent from tracking to local mapping, and forwarded to loop closing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewKeyFrameMsg {
    pub keyframe_id: KeyFrameId,
    /// Map the keyframe was created in.
    pub map_index: MapIndex,
    /// Sensor timestamp in seconds.
    pub timestamp: f64,
}
