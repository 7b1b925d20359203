//! KeyFrameDatabase - appearance-based place recognition.
//!
//! Keyframes are indexed by a sparse bag-of-words histogram. Visual words are
//! taken directly from the descriptor bits, so no trained vocabulary is
//! needed; scoring is the dot product of L2-normalized histograms.

use std::collections::{HashMap, HashSet};

use crate::atlas::map::KeyFrameId;
use crate::tracking::frame::Descriptor;

/// Bag-of-Words vector: word_id -> weight.
pub type BowVector = HashMap<u32, f64>;

/// Visual word of a descriptor: its leading 16 bits.
pub fn word_of(desc: &Descriptor) -> u32 {
    (u32::from(desc[0]) << 8) | u32::from(desc[1])
}

/// Term-frequency histogram of a descriptor set, L2-normalized.
pub fn bow_from_descriptors(descriptors: &[Descriptor]) -> BowVector {
    let mut bow = BowVector::new();
    for d in descriptors {
        *bow.entry(word_of(d)).or_insert(0.0) += 1.0;
    }
    let norm = bow.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm > 0.0 {
        for w in bow.values_mut() {
            *w /= norm;
        }
    }
    bow
}

pub fn bow_score(a: &BowVector, b: &BowVector) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(word, w)| large.get(word).map(|o| w * o))
        .sum()
}

/// Candidate keyframe with similarity score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub map_index: usize,
    pub score: f64,
}

#[derive(Debug, Default)]
pub struct KeyFrameDatabase {
    /// For each keyframe, its BoW vector and owning map index.
    entries: HashMap<KeyFrameId, (BowVector, usize)>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a keyframe entry.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: BowVector, map_idx: usize) {
        self.entries.insert(kf_id, (bow, map_idx));
    }

    /// Drop every keyframe belonging to map `map_idx`.
    pub fn erase_map(&mut self, map_idx: usize) {
        self.entries.retain(|_, (_, idx)| *idx != map_idx);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keyframes similar to `query`, best first.
    ///
    /// `exclude` removes specific keyframes (e.g. covisible ones for loop
    /// detection); `only_map` restricts the search to one map. Ties are
    /// broken towards the more recent keyframe.
    pub fn detect_candidates(
        &self,
        query: &BowVector,
        exclude: &HashSet<KeyFrameId>,
        only_map: Option<usize>,
        max_results: usize,
    ) -> Vec<Candidate> {
        let mut cands: Vec<Candidate> = self
            .entries
            .iter()
            .filter(|(kf_id, (_, map_idx))| {
                !exclude.contains(kf_id) && only_map.is_none_or(|m| m == *map_idx)
            })
            .filter_map(|(kf_id, (bow, map_idx))| {
                let score = bow_score(query, bow);
                (score > 0.0).then_some(Candidate {
                    keyframe_id: *kf_id,
                    map_index: *map_idx,
                    score,
                })
            })
            .collect();

        cands.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.keyframe_id.cmp(&a.keyframe_id))
        });
        cands.truncate(max_results);
        cands
    }

    /// Best single candidate, if any.
    pub fn query(
        &self,
        query: &BowVector,
        exclude: &HashSet<KeyFrameId>,
        only_map: Option<usize>,
    ) -> Option<Candidate> {
        self.detect_candidates(query, exclude, only_map, 1)
            .into_iter()
            .next()
    }
}
