//! Keypoints, binary descriptors and the feature-extractor seam.

use anyhow::Result;
use nalgebra::Vector3;

/// 256-bit ORB descriptor.
pub type Descriptor = [u8; 32];

/// ORB matching thresholds
pub const TH_HIGH: u32 = 100; // Max descriptor distance for acceptance
pub const TH_LOW: u32 = 50; // Stricter threshold
pub const NN_RATIO: f64 = 0.75; // Ratio test threshold (best/second_best)

/// Undistorted keypoint in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f64,
    pub y: f64,
    /// Pyramid level the keypoint was detected at.
    pub octave: usize,
}

impl KeyPoint {
    pub fn new(x: f64, y: f64, octave: usize) -> Self {
        Self { x, y, octave }
    }
}

/// Features extracted from one image (left image for stereo).
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// 3D point in camera frame per keypoint, for sensors that measure depth.
    pub points_cam: Vec<Option<Vector3<f64>>>,
}

impl FeatureSet {
    /// Feature set without depth.
    pub fn monocular(keypoints: Vec<KeyPoint>, descriptors: Vec<Descriptor>) -> Self {
        let n = keypoints.len();
        Self {
            keypoints,
            descriptors,
            points_cam: vec![None; n],
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn num_with_depth(&self) -> usize {
        self.points_cam.iter().filter(|p| p.is_some()).count()
    }

    /// Drop inconsistent trailing entries so all per-keypoint vectors align.
    pub fn normalized(mut self) -> Self {
        let n = self.keypoints.len().min(self.descriptors.len());
        self.keypoints.truncate(n);
        self.descriptors.truncate(n);
        self.points_cam.resize(n, None);
        self
    }
}

/// Turns a raw image into keypoints and descriptors.
///
/// Implementations own whatever detector state they need; the tracker only
/// calls `extract` once per frame on the ingest thread.
pub trait FeatureExtractor: Send {
    type Image;

    fn extract(&mut self, image: &Self::Image) -> Result<FeatureSet>;
}

/// Hamming distance between two ORB descriptors.
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(descriptor_distance(&a, &b), 0);
        b[0] = 0b1010_1010;
        b[31] = 0xff;
        assert_eq!(descriptor_distance(&a, &b), 12);
    }

    #[test]
    fn test_normalized_aligns_lengths() {
        let fs = FeatureSet {
            keypoints: vec![KeyPoint::new(1.0, 2.0, 0); 3],
            descriptors: vec![[0u8; 32]; 2],
            points_cam: vec![],
        }
        .normalized();
        assert_eq!(fs.len(), 2);
        assert_eq!(fs.points_cam.len(), 2);
    }
}
