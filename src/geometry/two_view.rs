//! Two-view geometric reconstruction used to bootstrap monocular maps.
//!
//! Estimates the fundamental matrix with a normalized eight-point RANSAC,
//! upgrades it to an essential matrix with the intrinsics, and selects the
//! one of its four (R, t) decompositions that places the most points in front
//! of both cameras with low reprojection error.

use nalgebra::{Matrix3, SMatrix, Vector2, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use tracing::debug;

use super::SE3;

/// Chi-square (1 DOF, 95%) threshold on squared epipolar distance in pixels².
const CHI2_EPIPOLAR: f64 = 3.841;

/// Squared reprojection error (pixels²) accepted when checking triangulated points.
const TH_REPROJECTION_SQ: f64 = 4.0;

/// Relative pose and triangulated structure recovered from two views.
#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    /// Transform from the first camera to the second (`x₂ = R x₁ + t`).
    pub t21: SE3,
    /// Triangulated points in the first camera frame, one slot per input pair.
    pub points: Vec<Option<Vector3<f64>>>,
    /// Median parallax in degrees of the accepted points.
    pub parallax_deg: f64,
}

impl TwoViewReconstruction {
    pub fn num_triangulated(&self) -> usize {
        self.points.iter().filter(|p| p.is_some()).count()
    }
}

/// RANSAC two-view reconstructor on a pinhole camera.
pub struct TwoViewReconstructor {
    k: Matrix3<f64>,
    iterations: usize,
    min_triangulated: usize,
    min_parallax_deg: f64,
    rng: StdRng,
}

impl TwoViewReconstructor {
    pub fn new(
        k: Matrix3<f64>,
        iterations: usize,
        min_triangulated: usize,
        min_parallax_deg: f64,
        seed: u64,
    ) -> Self {
        Self {
            k,
            iterations: iterations.max(1),
            min_triangulated,
            min_parallax_deg,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reconstruct from matched pixel pairs `(p₁, p₂)`.
    ///
    /// Returns `None` when too few pairs are given, no fundamental matrix
    /// gathers enough support, or no decomposition is clearly best.
    pub fn reconstruct(&mut self, pairs: &[(Vector2<f64>, Vector2<f64>)]) -> Option<TwoViewReconstruction> {
        let n = pairs.len();
        if n < 8 {
            return None;
        }

        let (norm1, t1) = normalize_points(pairs.iter().map(|p| p.0));
        let (norm2, t2) = normalize_points(pairs.iter().map(|p| p.1));

        let mut best_inliers: Vec<bool> = Vec::new();
        let mut best_count = 0usize;
        let mut best_f = Matrix3::zeros();

        for _ in 0..self.iterations {
            let idx = sample(&mut self.rng, n, 8);
            let set: Vec<usize> = idx.into_iter().collect();
            let fn_ = match eight_point(&set, &norm1, &norm2) {
                Some(f) => f,
                None => continue,
            };
            let f = t2.transpose() * fn_ * t1;
            let (inliers, count) = check_fundamental(&f, pairs);
            if count > best_count {
                best_count = count;
                best_inliers = inliers;
                best_f = f;
            }
        }

        if best_count < self.min_triangulated {
            debug!("two-view: fundamental support {} below {}", best_count, self.min_triangulated);
            return None;
        }

        let e = self.k.transpose() * best_f * self.k;
        self.reconstruct_from_essential(&e, pairs, &best_inliers)
    }

    fn reconstruct_from_essential(
        &self,
        e: &Matrix3<f64>,
        pairs: &[(Vector2<f64>, Vector2<f64>)],
        inliers: &[bool],
    ) -> Option<TwoViewReconstruction> {
        let n_inliers = inliers.iter().filter(|&&b| b).count();
        let (r1, r2, t) = decompose_essential(e)?;

        let hypotheses = [(r1, t), (r1, -t), (r2, t), (r2, -t)];
        let mut results: Vec<(usize, Vec<Option<Vector3<f64>>>, f64, SE3)> = hypotheses
            .iter()
            .map(|(r, t)| {
                let t21 = SE3::from_rt(r, t);
                let (good, points, parallax) = self.check_rt(&t21, pairs, inliers);
                (good, points, parallax, t21)
            })
            .collect();

        results.sort_by(|a, b| b.0.cmp(&a.0));
        let max_good = results[0].0;
        let min_good = ((0.9 * n_inliers as f64) as usize).max(self.min_triangulated);
        let similar = results
            .iter()
            .filter(|r| r.0 as f64 > 0.7 * max_good as f64)
            .count();

        if max_good < min_good || similar > 1 {
            debug!(
                "two-view: ambiguous decomposition (best {} of {}, {} similar)",
                max_good, n_inliers, similar
            );
            return None;
        }

        let (_, points, parallax_deg, t21) = results.swap_remove(0);
        if parallax_deg < self.min_parallax_deg {
            debug!("two-view: parallax {:.2} deg too low", parallax_deg);
            return None;
        }

        Some(TwoViewReconstruction {
            t21,
            points,
            parallax_deg,
        })
    }

    /// Count points triangulated in front of both cameras with small reprojection error.
    fn check_rt(
        &self,
        t21: &SE3,
        pairs: &[(Vector2<f64>, Vector2<f64>)],
        inliers: &[bool],
    ) -> (usize, Vec<Option<Vector3<f64>>>, f64) {
        let k_inv = self.k.try_inverse().unwrap_or_else(Matrix3::identity);
        let pose1 = SE3::identity();
        let pose2 = t21.inverse();
        let o2 = pose2.translation;

        let mut points = vec![None; pairs.len()];
        let mut parallaxes = Vec::new();

        for (i, (p1, p2)) in pairs.iter().enumerate() {
            if !inliers[i] {
                continue;
            }
            let xn1 = k_inv * Vector3::new(p1.x, p1.y, 1.0);
            let xn2 = k_inv * Vector3::new(p2.x, p2.y, 1.0);
            let x1 = match triangulate_dlt(&xn1, &xn2, &pose1, &pose2) {
                Some(x) if x.iter().all(|v| v.is_finite()) => x,
                _ => continue,
            };

            let ray1 = x1;
            let ray2 = x1 - o2;
            let cos_parallax = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());

            let x2 = t21.transform_point(&x1);
            if x1.z <= 0.0 || x2.z <= 0.0 {
                continue;
            }

            let e1 = self.reproject(&x1) - p1;
            let e2 = self.reproject(&x2) - p2;
            if e1.norm_squared() > TH_REPROJECTION_SQ || e2.norm_squared() > TH_REPROJECTION_SQ {
                continue;
            }

            parallaxes.push(cos_parallax.clamp(-1.0, 1.0).acos().to_degrees());
            points[i] = Some(x1);
        }

        let good = parallaxes.len();
        let parallax = if parallaxes.is_empty() {
            0.0
        } else {
            parallaxes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            parallaxes[parallaxes.len() / 2]
        };
        (good, points, parallax)
    }

    fn reproject(&self, p: &Vector3<f64>) -> Vector2<f64> {
        let uvw = self.k * p;
        Vector2::new(uvw.x / uvw.z, uvw.y / uvw.z)
    }
}

/// Hartley normalization: zero mean, unit mean absolute deviation per axis.
fn normalize_points(points: impl Iterator<Item = Vector2<f64>>) -> (Vec<Vector2<f64>>, Matrix3<f64>) {
    let pts: Vec<Vector2<f64>> = points.collect();
    let n = pts.len().max(1) as f64;
    let mean = pts.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;

    let mut dev = Vector2::zeros();
    for p in &pts {
        dev.x += (p.x - mean.x).abs();
        dev.y += (p.y - mean.y).abs();
    }
    dev /= n;
    let sx = if dev.x > 1e-12 { 1.0 / dev.x } else { 1.0 };
    let sy = if dev.y > 1e-12 { 1.0 / dev.y } else { 1.0 };

    let normalized = pts
        .iter()
        .map(|p| Vector2::new((p.x - mean.x) * sx, (p.y - mean.y) * sy))
        .collect();
    let t = Matrix3::new(sx, 0.0, -mean.x * sx, 0.0, sy, -mean.y * sy, 0.0, 0.0, 1.0);
    (normalized, t)
}

/// Linear eight-point estimate of F on normalized points, with rank-2 enforcement.
fn eight_point(set: &[usize], p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for &i in set {
        let (a, b) = (p1[i], p2[i]);
        let row = SMatrix::<f64, 1, 9>::from_row_slice(&[
            b.x * a.x,
            b.x * a.y,
            b.x,
            b.y * a.x,
            b.y * a.y,
            b.y,
            a.x,
            a.y,
            1.0,
        ]);
        ata += row.transpose() * row;
    }

    let svd = ata.svd(false, true);
    let v_t = svd.v_t?;
    let k = svd.singular_values.imin();
    let f = v_t.row(k);
    let f_pre = Matrix3::new(f[0], f[1], f[2], f[3], f[4], f[5], f[6], f[7], f[8]);

    let svd_f = f_pre.svd(true, true);
    let (u, v_t) = (svd_f.u?, svd_f.v_t?);
    let mut s = svd_f.singular_values;
    let smallest = s.imin();
    s[smallest] = 0.0;
    Some(u * Matrix3::from_diagonal(&s) * v_t)
}

/// Symmetric epipolar check; returns the inlier mask and count.
fn check_fundamental(f: &Matrix3<f64>, pairs: &[(Vector2<f64>, Vector2<f64>)]) -> (Vec<bool>, usize) {
    let mut inliers = vec![false; pairs.len()];
    let mut count = 0;
    for (i, (p1, p2)) in pairs.iter().enumerate() {
        let x1 = Vector3::new(p1.x, p1.y, 1.0);
        let x2 = Vector3::new(p2.x, p2.y, 1.0);

        let l2 = f * x1;
        let num2 = x2.dot(&l2);
        let d2 = num2 * num2 / (l2.x * l2.x + l2.y * l2.y);

        let l1 = f.transpose() * x2;
        let num1 = x1.dot(&l1);
        let d1 = num1 * num1 / (l1.x * l1.x + l1.y * l1.y);

        if d1.is_finite() && d2.is_finite() && d1 < CHI2_EPIPOLAR && d2 < CHI2_EPIPOLAR {
            inliers[i] = true;
            count += 1;
        }
    }
    (inliers, count)
}

/// Split E into its two candidate rotations and the translation direction.
fn decompose_essential(e: &Matrix3<f64>) -> Option<(Matrix3<f64>, Matrix3<f64>, Vector3<f64>)> {
    let svd = e.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let k = svd.singular_values.imin();

    let t = u.column(k).into_owned();
    let t = t / t.norm();

    // Reorder so the null direction sits in the last column, as the W trick expects.
    let mut order = [0usize, 1, 2];
    order.swap(k, 2);
    let u = Matrix3::from_columns(&[
        u.column(order[0]).into_owned(),
        u.column(order[1]).into_owned(),
        u.column(order[2]).into_owned(),
    ]);
    let v = v_t.transpose();
    let v = Matrix3::from_columns(&[
        v.column(order[0]).into_owned(),
        v.column(order[1]).into_owned(),
        v.column(order[2]).into_owned(),
    ]);

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let mut r1 = u * w * v.transpose();
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    let mut r2 = u * w.transpose() * v.transpose();
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }
    Some((r1, r2, t))
}

/// Linear triangulation of one correspondence from normalized image coordinates.
///
/// `pose1` and `pose2` are camera-to-world transforms; the point is returned
/// in world coordinates.
pub fn triangulate_dlt(
    xn1: &Vector3<f64>,
    xn2: &Vector3<f64>,
    pose1: &SE3,
    pose2: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = projection_matrix(&pose1.inverse());
    let p2 = projection_matrix(&pose2.inverse());

    let mut a = nalgebra::Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = xn1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = xn1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = xn2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = xn2.y * p2[(2, j)] - p2[(1, j)];
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(svd.singular_values.imin());
    if h[3].abs() < 1e-12 {
        return None;
    }
    Some(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}

/// 3x4 projection matrix `[R | t]` of a world-to-camera transform.
fn projection_matrix(pose_cw: &SE3) -> SMatrix<f64, 3, 4> {
    let r = pose_cw.rotation_matrix();
    let t = pose_cw.translation;
    SMatrix::<f64, 3, 4>::from_columns(&[
        r.column(0).into_owned(),
        r.column(1).into_owned(),
        r.column(2).into_owned(),
        t,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;
    use rand::Rng;

    fn intrinsics() -> Matrix3<f64> {
        Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0)
    }

    fn project(k: &Matrix3<f64>, p: &Vector3<f64>) -> Vector2<f64> {
        let uvw = k * p;
        Vector2::new(uvw.x / uvw.z, uvw.y / uvw.z)
    }

    #[test]
    fn test_triangulate_dlt_recovers_point() {
        let pose1 = SE3::identity();
        let pose2 = SE3::new(UnitQuaternion::identity(), Vector3::new(0.5, 0.0, 0.0));
        let p = Vector3::new(0.2, -0.1, 4.0);
        let xn1 = p / p.z;
        let pc2 = pose2.inverse().transform_point(&p);
        let xn2 = pc2 / pc2.z;

        let x = triangulate_dlt(&xn1, &xn2, &pose1, &pose2).unwrap();
        assert!((x - p).norm() < 1e-9);
    }

    #[test]
    fn test_reconstruct_recovers_translation_direction() {
        let k = intrinsics();
        let t21 = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.02, 0.0),
            Vector3::new(-0.4, 0.0, 0.05),
        );
        let mut rng = StdRng::seed_from_u64(7);
        let mut pairs = Vec::new();
        while pairs.len() < 150 {
            let p = Vector3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(4.0..8.0),
            );
            let p2 = t21.transform_point(&p);
            let (a, b) = (project(&k, &p), project(&k, &p2));
            if a.x < 0.0 || a.x > 640.0 || b.x < 0.0 || b.x > 640.0 {
                continue;
            }
            pairs.push((a, b));
        }

        let mut recon = TwoViewReconstructor::new(k, 200, 50, 1.0, 3);
        let result = recon.reconstruct(&pairs).expect("reconstruction should succeed");

        let dir_true = t21.translation.normalize();
        let dir_est = result.t21.translation.normalize();
        assert!(dir_true.dot(&dir_est) > 0.999);
        assert!(result.num_triangulated() > 130);
        assert!(result.t21.rotation.angle_to(&t21.rotation) < 1e-3);
    }

    #[test]
    fn test_reconstruct_rejects_pure_rotation() {
        let k = intrinsics();
        let t21 = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0), Vector3::zeros());
        let mut rng = StdRng::seed_from_u64(11);
        let pairs: Vec<_> = (0..100)
            .map(|_| {
                let p = Vector3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(4.0..8.0),
                );
                (project(&k, &p), project(&k, &t21.transform_point(&p)))
            })
            .collect();

        let mut recon = TwoViewReconstructor::new(k, 100, 50, 1.0, 5);
        assert!(recon.reconstruct(&pairs).is_none());
    }

    #[test]
    fn test_eight_point_is_rank_two_and_epipolar() {
        let t21 = SE3::new(
            UnitQuaternion::from_euler_angles(0.01, -0.03, 0.02),
            Vector3::new(0.3, -0.05, 0.1),
        );
        let mut rng = StdRng::seed_from_u64(19);
        let (mut p1, mut p2) = (Vec::new(), Vec::new());
        for _ in 0..20 {
            let p = Vector3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(3.0..6.0),
            );
            let q = t21.transform_point(&p);
            p1.push(Vector2::new(p.x / p.z, p.y / p.z));
            p2.push(Vector2::new(q.x / q.z, q.y / q.z));
        }
        let set: Vec<usize> = (0..20).collect();

        let f = eight_point(&set, &p1, &p2).unwrap();
        let f = f / f.norm();
        assert!(f.determinant().abs() < 1e-9);
        for (a, b) in p1.iter().zip(&p2) {
            let residual = b.push(1.0).dot(&(f * a.push(1.0)));
            assert!(residual.abs() < 1e-6);
        }
    }

    #[test]
    fn test_reconstruct_needs_eight_pairs() {
        let mut recon = TwoViewReconstructor::new(intrinsics(), 10, 5, 1.0, 0);
        let pairs = vec![(Vector2::new(1.0, 1.0), Vector2::new(2.0, 2.0)); 5];
        assert!(recon.reconstruct(&pairs).is_none());
    }
}
