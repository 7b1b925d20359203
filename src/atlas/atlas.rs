//! Atlas - multi-map container.
//!
//! The Atlas owns one or more `Map` instances:
//! - one **active** map where tracking, local mapping and loop closing operate
//! - zero or more retired maps, kept after tracking gave up on them so the
//!   background threads can still reconcile them later
//!
//! It also owns the `KeyFrameDatabase` used for place recognition.

use tracing::info;

use crate::atlas::map::Map;

use super::keyframe_db::KeyFrameDatabase;

/// Index of a map inside the Atlas.
pub type MapIndex = usize;

pub struct Atlas {
    maps: Vec<Map>,
    active_map_idx: MapIndex,
    pub keyframe_db: KeyFrameDatabase,
    scale_factor: f64,
    num_levels: usize,
}

impl Atlas {
    /// Create an Atlas with a single empty active map.
    pub fn new(scale_factor: f64, num_levels: usize) -> Self {
        Self {
            maps: vec![Map::with_params(0, 0, 0, scale_factor, num_levels)],
            active_map_idx: 0,
            keyframe_db: KeyFrameDatabase::new(),
            scale_factor,
            num_levels,
        }
    }

    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }

    pub fn active_map_index(&self) -> MapIndex {
        self.active_map_idx
    }

    pub fn active_map(&self) -> &Map {
        &self.maps[self.active_map_idx]
    }

    pub fn active_map_mut(&mut self) -> &mut Map {
        &mut self.maps[self.active_map_idx]
    }

    pub fn get_map(&self, idx: MapIndex) -> Option<&Map> {
        self.maps.get(idx)
    }

    pub fn get_map_mut(&mut self, idx: MapIndex) -> Option<&mut Map> {
        self.maps.get_mut(idx)
    }

    /// Active map and the keyframe database, borrowed together.
    pub fn active_map_and_db_mut(&mut self) -> (&mut Map, &mut KeyFrameDatabase) {
        (&mut self.maps[self.active_map_idx], &mut self.keyframe_db)
    }

    pub fn all_maps(&self) -> &[Map] {
        &self.maps
    }

    /// Ids the next map must start from to stay unique across the atlas.
    fn next_id_bases(&self) -> (u64, u64) {
        self.maps.iter().fold((0, 0), |(kf, mp), m| {
            let (k, p) = m.id_counters();
            (kf.max(k), mp.max(p))
        })
    }

    /// Retire the active map and start a fresh one. Returns its index.
    ///
    /// An empty active map is reused instead of piling up empty maps.
    pub fn create_new_map(&mut self) -> MapIndex {
        if self.active_map().num_keyframes() == 0 {
            return self.active_map_idx;
        }
        let (kf_base, mp_base) = self.next_id_bases();
        let idx = self.maps.len();
        self.maps.push(Map::with_params(
            idx,
            kf_base,
            mp_base,
            self.scale_factor,
            self.num_levels,
        ));
        info!(
            "Atlas: retired map {} ({} keyframes), new active map {}",
            self.active_map_idx,
            self.maps[self.active_map_idx].num_keyframes(),
            idx
        );
        self.active_map_idx = idx;
        idx
    }

    /// Empty the active map and drop its keyframes from the database.
    pub fn reset_active_map(&mut self) {
        let idx = self.active_map_idx;
        self.keyframe_db.erase_map(idx);
        self.maps[idx].clear();
    }

    /// Drop every map and start over with a single empty one.
    ///
    /// Id counters keep running so stale ids never alias new entities.
    pub fn clear(&mut self) {
        let (kf_base, mp_base) = self.next_id_bases();
        self.maps = vec![Map::with_params(
            0,
            kf_base,
            mp_base,
            self.scale_factor,
            self.num_levels,
        )];
        self.active_map_idx = 0;
        self.keyframe_db.clear();
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self::new(1.2, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::keyframe_db::BowVector;
    use crate::geometry::SE3;
    use crate::tracking::frame::FeatureSet;

    fn add_kf(atlas: &mut Atlas) {
        let idx = atlas.active_map_index();
        let id = atlas.active_map_mut().create_keyframe(
            0,
            0.0,
            SE3::identity(),
            FeatureSet::default(),
            BowVector::new(),
        );
        let mut bow = BowVector::new();
        bow.insert(1, 1.0);
        atlas.keyframe_db.add(id, bow, idx);
    }

    #[test]
    fn test_new_map_keeps_old_and_continues_ids() {
        let mut atlas = Atlas::default();
        add_kf(&mut atlas);
        add_kf(&mut atlas);
        let idx = atlas.create_new_map();
        assert_eq!(idx, 1);
        assert_eq!(atlas.num_maps(), 2);
        assert_eq!(atlas.all_maps()[0].num_keyframes(), 2);
        let id = atlas.active_map_mut().create_keyframe(
            0,
            0.0,
            SE3::identity(),
            FeatureSet::default(),
            BowVector::new(),
        );
        assert_eq!(id.0, 2);
    }

    #[test]
    fn test_empty_active_map_is_reused() {
        let mut atlas = Atlas::default();
        assert_eq!(atlas.create_new_map(), 0);
        assert_eq!(atlas.num_maps(), 1);
    }

    #[test]
    fn test_reset_active_map_clears_database_entries() {
        let mut atlas = Atlas::default();
        add_kf(&mut atlas);
        atlas.create_new_map();
        add_kf(&mut atlas);
        assert_eq!(atlas.keyframe_db.len(), 2);
        atlas.reset_active_map();
        assert_eq!(atlas.keyframe_db.len(), 1);
        assert_eq!(atlas.active_map().num_keyframes(), 0);
        assert_eq!(atlas.num_maps(), 2);
    }

    #[test]
    fn test_clear_wipes_all_maps() {
        let mut atlas = Atlas::default();
        add_kf(&mut atlas);
        atlas.create_new_map();
        add_kf(&mut atlas);
        atlas.clear();
        assert_eq!(atlas.num_maps(), 1);
        assert!(atlas.keyframe_db.is_empty());
    }
}
