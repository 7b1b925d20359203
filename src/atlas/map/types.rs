//! Stable identifiers for map entities.
//!
//! Ids are handed out by the map that creates the entity and are unique across
//! every map of the atlas, so a stale id held by the tracker can never alias a
//! newer entity. Holders re-validate liveness through the map before use.

/// Identifier of a KeyFrame.
///
/// Ordered by creation: a larger id means a more recent keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Identifier of a MapPoint (landmark).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl MapPointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_ids_order_by_creation() {
        let mut ids = vec![KeyFrameId::new(7), KeyFrameId::new(2), KeyFrameId::new(5)];
        ids.sort();
        assert_eq!(ids, vec![KeyFrameId::new(2), KeyFrameId::new(5), KeyFrameId::new(7)]);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", MapPointId::new(123)), "MP123");
        assert_eq!(format!("{}", KeyFrameId::new(4)), "KF4");
    }
}
