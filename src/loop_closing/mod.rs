//! Loop closing: place recognition over the keyframe database.
//!
//! The LoopCloser runs in its own thread and receives keyframes from local
//! mapping. Candidates are scored by bag-of-words similarity and accepted
//! after temporal consistency (`detector.rs`). Keyframes in other maps of
//! the atlas surface as merge candidates.

pub mod detector;
pub mod loop_closer;

pub use detector::{ConsistencyChecker, LoopCandidate, LoopDetectorConfig, detect_loop_candidates};
pub use loop_closer::{LoopCloser, LoopCloserStats};
