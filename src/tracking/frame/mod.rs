//! Frame-level inputs: camera model, features, depth recovery.

pub mod camera;
pub mod features;
pub mod stereo;

pub use camera::CameraModel;
pub use features::{
    Descriptor, FeatureExtractor, FeatureSet, KeyPoint, NN_RATIO, TH_HIGH, TH_LOW,
    descriptor_distance,
};
pub use stereo::{attach_depth, match_stereo};
