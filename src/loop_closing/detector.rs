//! Loop detection using Bag-of-Words with temporal consistency checking.
//!
//! Candidates come from the atlas keyframe database. Keyframes connected to
//! the query are excluded, and a candidate must score at least as well as
//! the weakest covisible keyframe. Candidates in another map are merge
//! candidates rather than loops.

use std::collections::HashSet;

use crate::atlas::keyframe_db::bow_score;
use crate::atlas::map::{KeyFrameId, Map};
use crate::atlas::{Atlas, MapIndex};

#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// Consecutive keyframes that must agree on a candidate region.
    pub consistency_threshold: usize,

    /// Covisible keyframes needed before a score threshold is trusted.
    pub min_covisibles_for_threshold: usize,

    /// Candidates pulled from the database per query.
    pub max_candidates: usize,

    /// Minimum id gap to a candidate in the same map.
    pub min_temporal_gap: u64,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            consistency_threshold: 3,
            min_covisibles_for_threshold: 1,
            max_candidates: 10,
            min_temporal_gap: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopCandidate {
    pub current_kf_id: KeyFrameId,

    /// The older keyframe the current one looks like.
    pub loop_kf_id: KeyFrameId,

    /// Map owning `loop_kf_id`.
    pub map_index: MapIndex,

    pub bow_score: f64,

    /// Covisible keyframes of the loop keyframe.
    pub loop_covisibles: Vec<KeyFrameId>,
}

/// Tracks temporal consistency of loop detections.
///
/// Each candidate spans a group (the keyframe and its covisibles). A group
/// overlapping a group of the previous keyframe extends that streak; a
/// candidate is accepted once its streak reaches `consistency_threshold`.
pub struct ConsistencyChecker {
    config: LoopDetectorConfig,

    /// Groups of the previous keyframe with their streak length.
    groups: Vec<(HashSet<KeyFrameId>, usize)>,
}

impl ConsistencyChecker {
    pub fn new(config: LoopDetectorConfig) -> Self {
        Self {
            config,
            groups: Vec::new(),
        }
    }

    /// Record the candidates of a new keyframe; returns the best candidate
    /// that is now consistent.
    pub fn add_and_check(&mut self, candidates: &[LoopCandidate]) -> Option<LoopCandidate> {
        let mut next_groups = Vec::with_capacity(candidates.len());
        let mut best: Option<&LoopCandidate> = None;

        for candidate in candidates {
            let mut group: HashSet<KeyFrameId> = HashSet::from([candidate.loop_kf_id]);
            group.extend(candidate.loop_covisibles.iter().copied());

            let streak = self
                .groups
                .iter()
                .filter(|(prev, _)| !prev.is_disjoint(&group))
                .map(|(_, n)| *n)
                .max()
                .unwrap_or(0)
                + 1;

            if streak >= self.config.consistency_threshold
                && best.is_none_or(|b| candidate.bow_score > b.bow_score)
            {
                best = Some(candidate);
            }
            next_groups.push((group, streak));
        }

        if let Some(candidate) = best {
            // One report per loop.
            let result = candidate.clone();
            self.clear();
            return Some(result);
        }
        // No candidates breaks every running streak.
        self.groups = next_groups;
        None
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

/// Keyframes whose similarity says nothing about a loop: the keyframe
/// itself, its covisibles, spanning-tree relatives and temporal neighbours.
fn connected_keyframes(kf_id: KeyFrameId, map: &Map) -> HashSet<KeyFrameId> {
    let mut connected = HashSet::from([kf_id]);
    if let Some(kf) = map.get_keyframe(kf_id) {
        connected.extend(kf.covisibility_weights().keys().copied());
        connected.extend(kf.parent_id);
        connected.extend(kf.children_ids.iter().copied());
        connected.extend(kf.prev_kf);
        connected.extend(kf.next_kf);
    }
    connected
}

/// Loop and merge candidates of `kf_id`, best first.
pub fn detect_loop_candidates(
    atlas: &Atlas,
    map_index: MapIndex,
    kf_id: KeyFrameId,
    config: &LoopDetectorConfig,
) -> Vec<LoopCandidate> {
    let Some(map) = atlas.get_map(map_index) else {
        return Vec::new();
    };
    let Some(kf) = map.get_keyframe(kf_id) else {
        return Vec::new();
    };

    let covisible_scores: Vec<f64> = kf
        .covisibility_weights()
        .keys()
        .filter_map(|id| map.get_keyframe(*id))
        .map(|cov| bow_score(&kf.bow, &cov.bow))
        .collect();
    if covisible_scores.len() < config.min_covisibles_for_threshold {
        return Vec::new();
    }
    let min_score = covisible_scores.iter().copied().fold(f64::INFINITY, f64::min);

    let exclude = connected_keyframes(kf_id, map);
    atlas
        .keyframe_db
        .detect_candidates(&kf.bow, &exclude, None, config.max_candidates)
        .into_iter()
        .filter(|c| c.score >= min_score)
        .filter(|c| c.map_index != map_index || kf_id.0.abs_diff(c.keyframe_id.0) >= config.min_temporal_gap)
        .filter_map(|c| {
            let cand_kf = atlas.get_map(c.map_index)?.get_keyframe(c.keyframe_id)?;
            Some(LoopCandidate {
                current_kf_id: kf_id,
                loop_kf_id: c.keyframe_id,
                map_index: c.map_index,
                bow_score: c.score,
                loop_covisibles: cand_kf.get_best_covisibles(10),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(loop_kf: u64, score: f64) -> LoopCandidate {
        LoopCandidate {
            current_kf_id: KeyFrameId::new(100),
            loop_kf_id: KeyFrameId::new(loop_kf),
            map_index: 0,
            bow_score: score,
            loop_covisibles: vec![KeyFrameId::new(loop_kf + 1)],
        }
    }

    #[test]
    fn test_needs_consecutive_detections() {
        let mut checker = ConsistencyChecker::new(LoopDetectorConfig::default());
        assert!(checker.add_and_check(&[candidate(5, 0.5)]).is_none());
        // Region {4, 5} overlaps the previous one through keyframe 5.
        assert!(checker.add_and_check(&[candidate(4, 0.5)]).is_none());
        let hit = checker.add_and_check(&[candidate(5, 0.6)]).unwrap();
        assert_eq!(hit.loop_kf_id, KeyFrameId::new(5));

        // History was cleared after the report.
        assert!(checker.add_and_check(&[candidate(5, 0.6)]).is_none());
    }

    #[test]
    fn test_gap_breaks_the_streak() {
        let mut checker = ConsistencyChecker::new(LoopDetectorConfig::default());
        assert!(checker.add_and_check(&[candidate(5, 0.5)]).is_none());
        assert!(checker.add_and_check(&[]).is_none());
        assert!(checker.add_and_check(&[candidate(5, 0.5)]).is_none());
        assert!(checker.add_and_check(&[candidate(5, 0.5)]).is_none());
        assert!(checker.add_and_check(&[candidate(5, 0.5)]).is_some());
    }
}
