//! Local map: the per-frame working set of keyframes and landmarks.
//!
//! Rebuilt from scratch every frame from the current frame's landmark links
//! and the covisibility graph. Never patched incrementally, so concurrent
//! edits by the refiner can at worst make a rebuild see a slightly older
//! graph, never a half-updated one.

use std::collections::{HashMap, HashSet};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};

/// Covisible neighbours pulled in per voted keyframe.
const NEIGHBOURS_PER_KEYFRAME: usize = 10;
/// Temporal keyframes added for inertial sessions.
const TEMPORAL_KEYFRAMES: usize = 20;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalMap {
    /// Local keyframes: voters ordered by votes (desc) then recency, then
    /// their neighbours in discovery order.
    pub keyframes: Vec<KeyFrameId>,
    /// Landmarks observed by `keyframes`, deduplicated.
    pub points: Vec<MapPointId>,
    /// Most-voted keyframe.
    pub reference: Option<KeyFrameId>,
}

impl LocalMap {
    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }
}

/// Compute the local map for a frame whose features link to `links`.
///
/// When no keyframe receives a vote the previous reference is kept and the
/// local map is built around it alone.
pub fn compute_local_map(
    links: &[Option<MapPointId>],
    map: &Map,
    previous_reference: Option<KeyFrameId>,
    max_keyframes: usize,
    include_temporal: bool,
) -> LocalMap {
    let mut votes: HashMap<KeyFrameId, usize> = HashMap::new();
    for mp_id in links.iter().flatten() {
        let Some(mp) = map.get_map_point(*mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        for kf_id in mp.observations.keys() {
            *votes.entry(*kf_id).or_insert(0) += 1;
        }
    }

    let mut voters: Vec<(KeyFrameId, usize)> = votes
        .into_iter()
        .filter(|(id, _)| map.get_keyframe(*id).is_some_and(|kf| !kf.is_bad))
        .collect();
    voters.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));

    let reference = voters
        .first()
        .map(|(id, _)| *id)
        .or(previous_reference.filter(|id| map.get_keyframe(*id).is_some()));

    let mut keyframes: Vec<KeyFrameId> = Vec::new();
    let mut included: HashSet<KeyFrameId> = HashSet::new();
    if voters.is_empty() {
        if let Some(r) = reference {
            keyframes.push(r);
            included.insert(r);
        }
    }
    for (id, _) in &voters {
        if included.insert(*id) {
            keyframes.push(*id);
        }
    }

    // Expand with covisibility neighbours, spanning-tree child and parent.
    let seeds = keyframes.clone();
    for seed in seeds {
        if keyframes.len() >= max_keyframes {
            break;
        }
        let Some(kf) = map.get_keyframe(seed) else {
            continue;
        };
        for neighbour in kf.get_best_covisibles(NEIGHBOURS_PER_KEYFRAME) {
            if map.get_keyframe(neighbour).is_some_and(|k| !k.is_bad) && included.insert(neighbour) {
                keyframes.push(neighbour);
            }
        }
        for child in &kf.children_ids {
            if map.get_keyframe(*child).is_some_and(|k| !k.is_bad) && included.insert(*child) {
                keyframes.push(*child);
                break;
            }
        }
        if let Some(parent) = kf.parent_id {
            if map.get_keyframe(parent).is_some_and(|k| !k.is_bad) && included.insert(parent) {
                keyframes.push(parent);
            }
        }
    }

    if include_temporal {
        for id in map.recent_keyframes(TEMPORAL_KEYFRAMES) {
            if included.insert(id) {
                keyframes.push(id);
            }
        }
    }

    keyframes.truncate(max_keyframes.max(1));
    let points = map.get_map_points_from_keyframes(&keyframes);

    LocalMap {
        keyframes,
        points,
        reference,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    use crate::atlas::keyframe_db::BowVector;
    use crate::geometry::SE3;
    use crate::tracking::frame::{FeatureSet, KeyPoint};

    fn add_kf(map: &mut Map, n: usize) -> KeyFrameId {
        let kps = (0..n).map(|i| KeyPoint::new(i as f64, 0.0, 0)).collect();
        map.create_keyframe(
            0,
            0.0,
            SE3::identity(),
            FeatureSet::monocular(kps, vec![[0u8; 32]; n]),
            BowVector::new(),
        )
    }

    /// kf_a sees points 0..20, kf_b sees 10..30, kf_c sees 25..30.
    fn build() -> (Map, Vec<MapPointId>, [KeyFrameId; 3]) {
        let mut map = Map::new();
        let a = add_kf(&mut map, 30);
        let b = add_kf(&mut map, 30);
        let c = add_kf(&mut map, 30);
        let mut mps = Vec::new();
        for i in 0..30 {
            let mp = map.create_map_point(Vector3::new(i as f64, 0.0, 5.0), [0u8; 32], a);
            if i < 20 {
                map.associate(a, i, mp);
            }
            if i >= 10 {
                map.associate(b, i, mp);
            }
            if i >= 25 {
                map.associate(c, i, mp);
            }
            mps.push(mp);
        }
        for kf in [a, b, c] {
            map.update_connections(kf);
        }
        (map, mps, [a, b, c])
    }

    #[test]
    fn test_reference_is_most_voted() {
        let (map, mps, [a, b, c]) = build();
        // Frame sees 0..15: a gets 15 votes, b gets 5.
        let links: Vec<Option<MapPointId>> = mps.iter().take(15).map(|m| Some(*m)).collect();
        let local = compute_local_map(&links, &map, None, 80, false);
        assert_eq!(local.reference, Some(a));
        assert_eq!(local.keyframes[0], a);
        assert!(local.keyframes.contains(&b));
        // c shares no point with the frame but is b's covisible neighbour.
        assert!(local.keyframes.contains(&c));
        assert_eq!(local.points.len(), map.get_map_points_from_keyframes(&local.keyframes).len());
    }

    #[test]
    fn test_tie_breaks_towards_recent_keyframe() {
        let (map, mps, [_, b, c]) = build();
        // Points 25..30 are seen by b and c only.
        let links: Vec<Option<MapPointId>> = mps[25..].iter().map(|m| Some(*m)).collect();
        let local = compute_local_map(&links, &map, None, 80, false);
        assert_eq!(local.reference, Some(c));
        assert_eq!(local.keyframes[1], b);
    }

    #[test]
    fn test_idempotent_without_map_changes() {
        let (map, mps, _) = build();
        let links: Vec<Option<MapPointId>> = mps.iter().step_by(2).map(|m| Some(*m)).collect();
        let first = compute_local_map(&links, &map, None, 80, true);
        let second = compute_local_map(&links, &map, first.reference, 80, true);
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_votes_keeps_previous_reference() {
        let (map, _, [_, b, _]) = build();
        let local = compute_local_map(&[None, None], &map, Some(b), 80, false);
        assert_eq!(local.reference, Some(b));
        assert_eq!(local.keyframes[0], b);
    }
}
