//! Geometry utilities: SE3 transforms, SO(3) maps, two-view reconstruction.

pub mod se3;
pub mod so3;
pub mod two_view;

pub use se3::SE3;
pub use two_view::{TwoViewReconstruction, TwoViewReconstructor, triangulate_dlt};
