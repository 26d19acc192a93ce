use crate::GeometryError;
use nalgebra::{DMatrix, Matrix3, Point2, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

/// Smallest `|w|` accepted by the guarded projective divide.
pub const PROJECTIVE_EPS: f64 = 1e-9;

/// Two control points closer than this fraction of the point-set extent are duplicates.
const DUPLICATE_REL: f64 = 1e-6;

/// Three control points whose doubled triangle area is below this fraction of
/// the squared extent are treated as collinear.
const COLLINEAR_REL: f64 = 1e-6;

/// 3x3 projective transform acting on homogeneous pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn to_array(&self) -> [[f64; 3]; 3] {
        [
            [self.h[(0, 0)], self.h[(0, 1)], self.h[(0, 2)]],
            [self.h[(1, 0)], self.h[(1, 1)], self.h[(1, 2)]],
            [self.h[(2, 0)], self.h[(2, 1)], self.h[(2, 2)]],
        ]
    }

    /// Map a point with the projective divide, refusing points on (or near)
    /// the line at infinity.
    #[inline]
    pub fn try_apply(&self, p: Point2<f64>) -> Result<Point2<f64>, GeometryError> {
        let m = &self.h;
        let c = m[(2, 0)] * p.x + m[(2, 1)] * p.y + m[(2, 2)];
        if !c.is_finite() || c.abs() < PROJECTIVE_EPS {
            return Err(GeometryError::DegenerateTransform { denominator: c });
        }
        let x = (m[(0, 0)] * p.x + m[(0, 1)] * p.y + m[(0, 2)]) / c;
        let y = (m[(1, 0)] * p.x + m[(1, 1)] * p.y + m[(1, 2)]) / c;
        Ok(Point2::new(x, y))
    }

    /// Unchecked variant for hot loops where the caller has already bounded
    /// the domain (e.g. warping inside a known quadrilateral).
    #[inline]
    pub fn apply(&self, p: Point2<f64>) -> Point2<f64> {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        Point2::new(v[0] / v[2], v[1] / v[2])
    }

    pub fn inverse(&self) -> Option<Self> {
        let inv = self.h.try_inverse()?;
        normalize_homography(inv).map(Self::new)
    }
}

/// Map one point through `h` (guarded divide).
pub fn transform_point(h: &Homography, p: Point2<f64>) -> Result<Point2<f64>, GeometryError> {
    h.try_apply(p)
}

/// Map an ordered sequence of points; output order matches input order.
/// Fails on the first point that hits the divide guard.
pub fn transform_points(
    h: &Homography,
    pts: &[Point2<f64>],
) -> Result<Vec<Point2<f64>>, GeometryError> {
    pts.iter().map(|&p| h.try_apply(p)).collect()
}

/// Reject four control points that cannot define a projective transform:
/// non-finite coordinates, coincident points, or any collinear triple.
pub fn ensure_general_position(pts: &[Point2<f64>; 4]) -> Result<(), GeometryError> {
    if pts.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(GeometryError::DegeneratePoints {
            reason: "non-finite coordinate".to_string(),
        });
    }

    let mut extent = 0.0_f64;
    for i in 0..4 {
        for j in (i + 1)..4 {
            extent = extent.max((pts[i] - pts[j]).norm());
        }
    }
    if extent <= 0.0 {
        return Err(GeometryError::DegeneratePoints {
            reason: "all points coincide".to_string(),
        });
    }

    for i in 0..4 {
        for j in (i + 1)..4 {
            if (pts[i] - pts[j]).norm() <= DUPLICATE_REL * extent {
                return Err(GeometryError::DegeneratePoints {
                    reason: format!("points {i} and {j} coincide"),
                });
            }
        }
    }

    const TRIPLES: [[usize; 3]; 4] = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];
    for [a, b, c] in TRIPLES {
        let ab = pts[b] - pts[a];
        let ac = pts[c] - pts[a];
        let area2 = (ab.x * ac.y - ab.y * ac.x).abs();
        if area2 <= COLLINEAR_REL * extent * extent {
            return Err(GeometryError::DegeneratePoints {
                reason: format!("points {a}, {b} and {c} are collinear"),
            });
        }
    }
    Ok(())
}

fn hartley_normalization(cx: f64, cy: f64, mean_dist: f64) -> Matrix3<f64> {
    let s = if mean_dist > 1e-12 {
        (2.0_f64).sqrt() / mean_dist
    } else {
        1.0
    };

    Matrix3::<f64>::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn normalize_points(pts: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    // translate to centroid, scale so the mean distance is sqrt(2)
    let n = pts.len() as f64;
    let (sx, sy) = pts
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (sx / n, sy / n);

    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let t = hartley_normalization(cx, cy, mean_dist);
    let out = pts
        .iter()
        .map(|p| {
            let v = t * Vector3::new(p.x, p.y, 1.0);
            Point2::new(v[0], v[1])
        })
        .collect();
    (out, t)
}

fn normalize_homography(h: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let s = h[(2, 2)];
    if s.abs() < 1e-12 {
        return None;
    }
    Some(h / s)
}

fn denormalize_homography(
    hn: Matrix3<f64>,
    t_src: Matrix3<f64>,
    t_dst: Matrix3<f64>,
) -> Option<Matrix3<f64>> {
    let t_dst_inv = t_dst.try_inverse()?;
    Some(t_dst_inv * hn * t_src)
}

/// Estimate `H` such that `dst ~ H * src` from N >= 4 correspondences.
///
/// Four correspondences go through the exact [`homography_from_4pt`] solver;
/// more use the normalized DLT with an SVD null-space solve.
pub fn estimate_homography(
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
) -> Result<Homography, GeometryError> {
    if src.len() != dst.len() {
        return Err(GeometryError::CountMismatch {
            src: src.len(),
            dst: dst.len(),
        });
    }
    if src.len() < 4 {
        return Err(GeometryError::NotEnoughPoints {
            needed: 4,
            got: src.len(),
        });
    }

    if src.len() == 4 {
        let s: [Point2<f64>; 4] = [src[0], src[1], src[2], src[3]];
        let d: [Point2<f64>; 4] = [dst[0], dst[1], dst[2], dst[3]];
        return homography_from_4pt(&s, &d);
    }

    let (r, tr) = normalize_points(src);
    let (i, ti) = normalize_points(dst);

    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);

    for k in 0..n {
        let x = r[k].x;
        let y = r[k].y;
        let u = i[k].x;
        let v = i[k].y;

        // [ -x -y -1   0  0  0   u*x u*y u ]
        a[(2 * k, 0)] = -x;
        a[(2 * k, 1)] = -y;
        a[(2 * k, 2)] = -1.0;
        a[(2 * k, 6)] = u * x;
        a[(2 * k, 7)] = u * y;
        a[(2 * k, 8)] = u;

        // [ 0  0  0  -x -y -1   v*x v*y v ]
        a[(2 * k + 1, 3)] = -x;
        a[(2 * k + 1, 4)] = -y;
        a[(2 * k + 1, 5)] = -1.0;
        a[(2 * k + 1, 6)] = v * x;
        a[(2 * k + 1, 7)] = v * y;
        a[(2 * k + 1, 8)] = v;
    }

    // h is the right singular vector with the smallest singular value
    let svd = a.svd(false, true);
    let vt = svd.v_t.ok_or(GeometryError::SingularSystem)?;
    let last = vt.nrows().checked_sub(1).ok_or(GeometryError::SingularSystem)?;
    let h = vt.row(last);

    let hn =
        Matrix3::<f64>::from_row_slice(&[h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]]);

    let h_den = denormalize_homography(hn, tr, ti).ok_or(GeometryError::SingularSystem)?;
    let h_den = normalize_homography(h_den).ok_or(GeometryError::SingularSystem)?;
    Ok(Homography::new(h_den))
}

/// Compute `H` such that `dst ~ H * src` from exactly four correspondences.
///
/// Corner order must be consistent between `src` and `dst`. Both sets are
/// checked with [`ensure_general_position`] first.
pub fn homography_from_4pt(
    src: &[Point2<f64>; 4],
    dst: &[Point2<f64>; 4],
) -> Result<Homography, GeometryError> {
    ensure_general_position(src)?;
    ensure_general_position(dst)?;

    // Unknowns: [h11 h12 h13 h21 h22 h23 h31 h32], with h33 = 1
    // h11 x + h12 y + h13 - u h31 x - u h32 y = u
    // h21 x + h22 y + h23 - v h31 x - v h32 y = v
    let (src_n, t_src) = normalize_points(src);
    let (dst_n, t_dst) = normalize_points(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();

    for k in 0..4 {
        let x = src_n[k].x;
        let y = src_n[k].y;
        let u = dst_n[k].x;
        let v = dst_n[k].y;

        let r0 = 2 * k;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        b[r0] = u;

        let r1 = 2 * k + 1;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        b[r1] = v;
    }

    let x = a.lu().solve(&b).ok_or(GeometryError::SingularSystem)?;

    let hn = Matrix3::<f64>::new(
        x[0], x[1], x[2], //
        x[3], x[4], x[5], //
        x[6], x[7], 1.0,
    );

    let h_den = denormalize_homography(hn, t_src, t_dst).ok_or(GeometryError::SingularSystem)?;
    let h_den = normalize_homography(h_den).ok_or(GeometryError::SingularSystem)?;

    Ok(Homography::new(h_den))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Point2<f64>, b: Point2<f64>, tol: f64) {
        let dx = (a.x - b.x).abs();
        let dy = (a.y - b.y).abs();
        assert!(
            dx < tol && dy < tol,
            "expected ({:.6},{:.6}) ~ ({:.6},{:.6}) within {}",
            a.x,
            a.y,
            b.x,
            b.y,
            tol
        );
    }

    fn sample_h() -> Homography {
        Homography::new(Matrix3::new(
            1.2, 0.1, 5.0, //
            -0.05, 0.9, 3.0, //
            0.001, 0.0005, 1.0,
        ))
    }

    #[test]
    fn inverse_round_trips_points() {
        let h = sample_h();
        let inv = h.inverse().expect("invertible");

        for p in [
            Point2::new(0.0, 0.0),
            Point2::new(50.0, -20.0),
            Point2::new(320.0, 200.0),
            Point2::new(4399.0, 8799.0),
        ] {
            let q = h.try_apply(p).expect("forward");
            let back = inv.try_apply(q).expect("inverse");
            assert_close(back, p, 1e-3);
        }
    }

    #[test]
    fn four_point_solver_recovers_h() {
        let ground_truth = Homography::new(Matrix3::new(
            0.8, 0.05, 120.0, //
            -0.02, 1.1, 80.0, //
            0.0009, -0.0004, 1.0,
        ));

        let rect = [
            Point2::new(0.0, 0.0),
            Point2::new(180.0, 0.0),
            Point2::new(180.0, 130.0),
            Point2::new(0.0, 130.0),
        ];
        let dst = rect.map(|p| ground_truth.apply(p));

        let recovered = homography_from_4pt(&rect, &dst).expect("recoverable");

        for p in [
            Point2::new(0.0, 0.0),
            Point2::new(60.0, 40.0),
            Point2::new(150.0, 120.0),
        ] {
            assert_close(recovered.apply(p), ground_truth.apply(p), 1e-6);
        }
    }

    #[test]
    fn dlt_handles_overdetermined_case() {
        let ground_truth = Homography::new(Matrix3::new(
            1.0, 0.2, 12.0, //
            -0.1, 0.9, 6.0, //
            0.0006, 0.0004, 1.0,
        ));

        let rect: Vec<Point2<f64>> = (0..3)
            .flat_map(|y| (0..3).map(move |x| Point2::new(x as f64 * 40.0, y as f64 * 50.0)))
            .collect();
        let img: Vec<Point2<f64>> = rect.iter().map(|&p| ground_truth.apply(p)).collect();

        let estimated = estimate_homography(&rect, &img).expect("estimate");
        for p in [
            Point2::new(0.0, 0.0),
            Point2::new(60.0, 40.0),
            Point2::new(80.0, 90.0),
        ] {
            assert_close(estimated.apply(p), ground_truth.apply(p), 1e-6);
        }
    }

    #[test]
    fn mismatched_input_lengths_fail() {
        let rect = [Point2::new(0.0, 0.0); 4];
        let img = [Point2::new(1.0, 1.0); 3];
        assert!(matches!(
            estimate_homography(&rect, &img),
            Err(GeometryError::CountMismatch { src: 4, dst: 3 })
        ));
    }

    #[test]
    fn collinear_and_duplicate_points_are_rejected() {
        let collinear = [
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 10.0),
            Point2::new(20.0, 20.0),
            Point2::new(30.0, 30.0),
        ];
        assert!(matches!(
            ensure_general_position(&collinear),
            Err(GeometryError::DegeneratePoints { .. })
        ));

        let duplicate = [
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(0.0, 10.0),
        ];
        assert!(ensure_general_position(&duplicate).is_err());

        let square = [
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(10.0, 10.0),
            Point2::new(0.0, 10.0),
        ];
        assert!(ensure_general_position(&square).is_ok());
    }

    #[test]
    fn guarded_divide_rejects_line_at_infinity() {
        // w = x - 5 vanishes along x = 5
        let h = Homography::new(Matrix3::new(
            1.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, //
            1.0, 0.0, -5.0,
        ));
        let err = h.try_apply(Point2::new(5.0, 3.0)).unwrap_err();
        assert!(matches!(err, GeometryError::DegenerateTransform { .. }));
        assert!(h.try_apply(Point2::new(6.0, 3.0)).is_ok());
    }

    #[test]
    fn transform_points_preserves_order() {
        let h = sample_h();
        let pts = vec![
            Point2::new(3.0, 4.0),
            Point2::new(-7.0, 1.0),
            Point2::new(100.0, 9.0),
        ];
        let out = transform_points(&h, &pts).expect("mapped");
        assert_eq!(out.len(), pts.len());
        for (p, q) in pts.iter().zip(&out) {
            assert_close(*q, h.apply(*p), 1e-12);
        }
    }
}
