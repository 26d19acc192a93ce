//! Planar-target intrinsic calibration.
//!
//! Linear start: one homography per correspondence set, focal lengths from
//! the orthogonality of the homography columns with the principal point at
//! the image centre, board poses from the homography decomposition. The
//! camera matrix, five distortion coefficients and every board pose are then
//! refined jointly by Levenberg-Marquardt on the pixel reprojection error.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::{debug, warn};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn, Matrix2, Matrix3, Point2, Point3, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tablecam_core::{camera_matrix, estimate_homography, Distortion, LensModel};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::SolveError;

const INTRINSIC_PARAMS: usize = 9;
const POSE_PARAMS: usize = 6;
/// Residual assigned to both coordinates of a point behind the camera, so
/// steps that flip a board are rejected instead of aborting the solve.
const BEHIND_CAMERA_RESIDUAL: f64 = 1e6;

/// Levenberg-Marquardt settings for the bundle solve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    /// Patience: the solver gives up after `max_iters * (n + 1)` residual
    /// evaluations for `n` free parameters.
    pub max_iters: usize,
    /// Relative reduction of the cost (and of the step) below which the
    /// solve counts as converged.
    pub ftol: f64,
    /// Factor for the initial trust-region radius.
    pub stepbound: f64,
    /// Keep `k3` at zero.
    pub fix_k3: bool,
    /// Keep `p1`, `p2` at zero.
    pub zero_tangent: bool,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            max_iters: 30,
            ftol: 1e-12,
            stepbound: 100.0,
            fix_k3: false,
            zero_tangent: false,
        }
    }
}

/// Board points and where one detected instance put them in the image.
#[derive(Clone, Debug, PartialEq)]
pub struct ChessboardObservation {
    pub object_points: Vec<Point3<f64>>,
    pub image_points: Vec<Point2<f64>>,
}

/// Board-to-camera transform as an axis-angle rotation plus translation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardPose {
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl BoardPose {
    pub fn rotation_matrix(&self) -> Rotation3<f64> {
        Rotation3::from_scaled_axis(self.rotation)
    }
}

/// Result of [`solve`].
#[derive(Clone, Debug)]
pub struct SolveOutcome {
    pub lens: LensModel,
    pub poses: Vec<BoardPose>,
    /// Root-mean-square pixel reprojection error.
    pub rms: f64,
    /// Residual evaluations spent by the solver.
    pub evaluations: usize,
}

/// RMS pixel distance between observed and reprojected points.
///
/// `None` when any point falls behind the camera or the inputs are empty.
pub fn reprojection_rms(
    lens: &LensModel,
    observations: &[ChessboardObservation],
    poses: &[BoardPose],
) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (obs, pose) in observations.iter().zip(poses) {
        let rot = pose.rotation_matrix();
        for (obj, img) in obs.object_points.iter().zip(&obs.image_points) {
            let p = lens.project(&rot, &pose.translation, obj)?;
            sum += (p - img).norm_squared();
            count += 1;
        }
    }
    (count > 0).then(|| (sum / count as f64).sqrt())
}

/// Closed-form focal lengths from plane homographies, principal point fixed
/// at the image centre. Works from a single non-frontal view.
pub fn init_intrinsics(homographies: &[Matrix3<f64>], image_size: (u32, u32)) -> Option<Matrix3<f64>> {
    let cx = (image_size.0.max(1) as f64 - 1.0) * 0.5;
    let cy = (image_size.1.max(1) as f64 - 1.0) * 0.5;

    let mut ata = Matrix2::<f64>::zeros();
    let mut atb = Vector2::<f64>::zeros();
    for h in homographies {
        let mut m = *h;
        for c in 0..3 {
            m[(0, c)] -= m[(2, c)] * cx;
            m[(1, c)] -= m[(2, c)] * cy;
        }
        let hc = m.column(0).into_owned();
        let vc = m.column(1).into_owned();
        let d1 = (hc + vc) * 0.5;
        let d2 = (hc - vc) * 0.5;
        let (Some(hc), Some(vc), Some(d1), Some(d2)) = (
            hc.try_normalize(1e-12),
            vc.try_normalize(1e-12),
            d1.try_normalize(1e-12),
            d2.try_normalize(1e-12),
        ) else {
            continue;
        };

        for (row, b) in [
            (Vector2::new(hc[0] * vc[0], hc[1] * vc[1]), -hc[2] * vc[2]),
            (Vector2::new(d1[0] * d2[0], d1[1] * d2[1]), -d1[2] * d2[2]),
        ] {
            ata += row * row.transpose();
            atb += row * b;
        }
    }

    let f = ata.try_inverse()? * atb;
    let fx = (1.0 / f[0].abs()).sqrt();
    let fy = (1.0 / f[1].abs()).sqrt();
    (fx.is_finite() && fy.is_finite() && fx > 0.0 && fy > 0.0)
        .then(|| camera_matrix(fx, fy, cx, cy))
}

/// Board pose from a plane-to-image homography and intrinsics (board on `Z = 0`).
pub fn pose_from_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Option<BoardPose> {
    let k_inv = k.try_inverse()?;
    let a1 = k_inv * h.column(0);
    let a2 = k_inv * h.column(1);
    let a3 = k_inv * h.column(2);

    let scale = 0.5 * (a1.norm() + a2.norm());
    if scale <= 1e-12 {
        return None;
    }
    let mut r1 = a1 / scale;
    let mut r2 = a2 / scale;
    let mut t = a3 / scale;
    // board in front of the camera
    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let r3 = r1.cross(&r2);
    if r3.norm() <= 1e-12 {
        return None;
    }

    let approx = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = approx.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flip = u;
        u_flip.column_mut(2).neg_mut();
        r = u_flip * v_t;
    }

    let rotation = Rotation3::from_matrix_unchecked(r).scaled_axis();
    Some(BoardPose {
        rotation,
        translation: t,
    })
}

fn lens_from(intr: &[f64; INTRINSIC_PARAMS]) -> LensModel {
    LensModel::new(
        camera_matrix(intr[0], intr[1], intr[2], intr[3]),
        Distortion {
            k1: intr[4],
            k2: intr[5],
            p1: intr[6],
            p2: intr[7],
            k3: intr[8],
            rational: None,
        },
    )
}

/// Pixel residuals of one view, `(projected - observed)` per point.
fn view_residuals(
    intr: &[f64; INTRINSIC_PARAMS],
    pose: &[f64],
    obs: &ChessboardObservation,
    out: &mut [f64],
) {
    let lens = lens_from(intr);
    let rot = Rotation3::from_scaled_axis(Vector3::new(pose[0], pose[1], pose[2]));
    let t = Vector3::new(pose[3], pose[4], pose[5]);
    for (i, (obj, img)) in obs.object_points.iter().zip(&obs.image_points).enumerate() {
        let (dx, dy) = match lens.project(&rot, &t, obj) {
            Some(p) => (p.x - img.x, p.y - img.y),
            None => (BEHIND_CAMERA_RESIDUAL, BEHIND_CAMERA_RESIDUAL),
        };
        out[2 * i] = dx;
        out[2 * i + 1] = dy;
    }
}

/// Joint intrinsics + poses problem. The parameter vector holds the free
/// intrinsics (fixed ones stay at their stored value) followed by six pose
/// parameters per view.
struct BundleProblem<'a> {
    observations: &'a [ChessboardObservation],
    /// Intrinsics with fixed entries at their held value.
    base: [f64; INTRINSIC_PARAMS],
    /// Indices into `base` that the solver may move.
    free: Vec<usize>,
    params: DVector<f64>,
}

impl<'a> BundleProblem<'a> {
    fn new(
        observations: &'a [ChessboardObservation],
        base: [f64; INTRINSIC_PARAMS],
        free: Vec<usize>,
        poses: &[BoardPose],
    ) -> Self {
        let mut params = DVector::zeros(free.len() + POSE_PARAMS * observations.len());
        for (slot, &j) in free.iter().enumerate() {
            params[slot] = base[j];
        }
        for (v, pose) in poses.iter().enumerate() {
            let start = free.len() + POSE_PARAMS * v;
            params.rows_mut(start, 3).copy_from(&pose.rotation);
            params.rows_mut(start + 3, 3).copy_from(&pose.translation);
        }
        Self {
            observations,
            base,
            free,
            params,
        }
    }

    fn residual_count(&self) -> usize {
        self.observations.iter().map(|o| 2 * o.image_points.len()).sum()
    }

    fn intrinsics_of(&self, x: &DVector<f64>) -> [f64; INTRINSIC_PARAMS] {
        let mut intr = self.base;
        for (slot, &j) in self.free.iter().enumerate() {
            intr[j] = x[slot];
        }
        intr
    }

    fn pose_start(&self, v: usize) -> usize {
        self.free.len() + POSE_PARAMS * v
    }

    fn pose_of(&self, x: &DVector<f64>, v: usize) -> BoardPose {
        let s = self.pose_start(v);
        BoardPose {
            rotation: Vector3::new(x[s], x[s + 1], x[s + 2]),
            translation: Vector3::new(x[s + 3], x[s + 4], x[s + 5]),
        }
    }

    fn lens(&self) -> LensModel {
        lens_from(&self.intrinsics_of(&self.params))
    }

    fn poses(&self) -> Vec<BoardPose> {
        (0..self.observations.len())
            .map(|v| self.pose_of(&self.params, v))
            .collect()
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for BundleProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let intr = self.intrinsics_of(&self.params);
        let mut r = DVector::zeros(self.residual_count());
        let mut row = 0;
        for (v, obs) in self.observations.iter().enumerate() {
            let rows = 2 * obs.image_points.len();
            let start = self.pose_start(v);
            let pose = &self.params.as_slice()[start..start + POSE_PARAMS];
            view_residuals(&intr, pose, obs, &mut r.as_mut_slice()[row..row + rows]);
            row += rows;
        }
        Some(r)
    }

    /// Central differences, one view block at a time: a view's residuals
    /// depend only on the intrinsics and its own pose.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jac = DMatrix::zeros(self.residual_count(), self.params.len());
        let mut plus = Vec::new();
        let mut minus = Vec::new();
        let mut row = 0;

        for (v, obs) in self.observations.iter().enumerate() {
            let rows = 2 * obs.image_points.len();
            plus.resize(rows, 0.0);
            minus.resize(rows, 0.0);
            let start = self.pose_start(v);
            let mut intr = self.intrinsics_of(&self.params);
            let mut pose = self.params.as_slice()[start..start + POSE_PARAMS].to_vec();

            for (slot, &j) in self.free.iter().enumerate() {
                let x0 = intr[j];
                let h = 1e-6 * x0.abs().max(1.0);
                intr[j] = x0 + h;
                view_residuals(&intr, &pose, obs, &mut plus);
                intr[j] = x0 - h;
                view_residuals(&intr, &pose, obs, &mut minus);
                intr[j] = x0;
                for k in 0..rows {
                    jac[(row + k, slot)] = (plus[k] - minus[k]) / (2.0 * h);
                }
            }
            for j in 0..POSE_PARAMS {
                let x0 = pose[j];
                let h = 1e-6 * x0.abs().max(1.0);
                pose[j] = x0 + h;
                view_residuals(&intr, &pose, obs, &mut plus);
                pose[j] = x0 - h;
                view_residuals(&intr, &pose, obs, &mut minus);
                pose[j] = x0;
                for k in 0..rows {
                    jac[(row + k, start + j)] = (plus[k] - minus[k]) / (2.0 * h);
                }
            }
            row += rows;
        }
        Some(jac)
    }
}

/// Jointly refine intrinsics, distortion and board poses.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(observations, params), fields(views = observations.len()))
)]
pub fn solve(
    observations: &[ChessboardObservation],
    image_size: (u32, u32),
    params: &SolverParams,
) -> Result<SolveOutcome, SolveError> {
    if observations.is_empty() {
        return Err(SolveError::NoObservations);
    }

    let mut homographies = Vec::with_capacity(observations.len());
    for (index, obs) in observations.iter().enumerate() {
        if obs.object_points.len() != obs.image_points.len() || obs.image_points.len() < 4 {
            return Err(SolveError::BadObservation {
                index,
                object: obs.object_points.len(),
                image: obs.image_points.len(),
            });
        }
        let plane: Vec<Point2<f64>> = obs.object_points.iter().map(|p| p.xy()).collect();
        let h = estimate_homography(&plane, &obs.image_points)
            .map_err(|source| SolveError::Homography { index, source })?;
        homographies.push(h.h);
    }

    let k0 = init_intrinsics(&homographies, image_size).unwrap_or_else(|| {
        let f = image_size.0.max(image_size.1).max(1) as f64;
        warn!("closed-form focal length failed, starting from f = {:.1}", f);
        camera_matrix(
            f,
            f,
            (image_size.0 as f64 - 1.0) * 0.5,
            (image_size.1 as f64 - 1.0) * 0.5,
        )
    });
    debug!(
        "initial intrinsics fx={:.2} fy={:.2} cx={:.2} cy={:.2}",
        k0[(0, 0)],
        k0[(1, 1)],
        k0[(0, 2)],
        k0[(1, 2)]
    );

    let poses = homographies
        .iter()
        .enumerate()
        .map(|(v, h)| pose_from_homography(&k0, h).ok_or(SolveError::Pose(v)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut base = [0.0; INTRINSIC_PARAMS];
    base[0] = k0[(0, 0)];
    base[1] = k0[(1, 1)];
    base[2] = k0[(0, 2)];
    base[3] = k0[(1, 2)];
    let free: Vec<usize> = (0..INTRINSIC_PARAMS)
        .filter(|&j| !(params.zero_tangent && (j == 6 || j == 7)))
        .filter(|&j| !(params.fix_k3 && j == 8))
        .collect();

    let problem = BundleProblem::new(observations, base, free, &poses);
    let lm = LevenbergMarquardt::new()
        .with_ftol(params.ftol)
        .with_xtol(params.ftol)
        .with_stepbound(params.stepbound)
        .with_patience(params.max_iters.max(1));
    let (problem, report) = lm.minimize(problem);
    debug!(
        "bundle solve: {:?} after {} evaluations, cost {:.6e}",
        report.termination, report.number_of_evaluations, report.objective_function
    );

    let lens = problem.lens();
    if !report.objective_function.is_finite()
        || !lens.k.iter().all(|v| v.is_finite())
        || lens.fx() <= 0.0
        || lens.fy() <= 0.0
        || !lens.distortion.to_coeffs().iter().all(|c| c.is_finite())
    {
        return Err(SolveError::Diverged);
    }
    if !report.termination.was_successful() {
        warn!("bundle solve stopped early: {:?}", report.termination);
    }

    let poses = problem.poses();
    let rms = reprojection_rms(&lens, observations, &poses).ok_or(SolveError::BehindCamera)?;

    Ok(SolveOutcome {
        lens,
        poses,
        rms,
        evaluations: report.number_of_evaluations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn board(cols: usize, rows: usize) -> Vec<Point3<f64>> {
        let mut out = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                out.push(Point3::new(c as f64, r as f64, 0.0));
            }
        }
        out
    }

    fn truth() -> LensModel {
        LensModel::new(
            camera_matrix(800.0, 790.0, 322.0, 241.0),
            Distortion {
                k1: -0.12,
                k2: 0.03,
                p1: 0.0008,
                p2: -0.0006,
                k3: 0.0,
                rational: None,
            },
        )
    }

    fn poses() -> Vec<BoardPose> {
        [
            ([0.35, 0.0, 0.05], [-4.0, -2.5, 15.0]),
            ([-0.35, 0.1, 0.0], [-4.5, -2.0, 14.0]),
            ([0.0, 0.4, -0.1], [-3.5, -3.0, 16.0]),
            ([0.1, -0.4, 0.2], [-4.0, -2.5, 13.0]),
            ([0.3, 0.3, 0.0], [-5.0, -2.0, 17.0]),
            ([-0.25, -0.3, -0.15], [-3.0, -3.5, 15.0]),
        ]
        .into_iter()
        .map(|(r, t)| BoardPose {
            rotation: Vector3::from(r),
            translation: Vector3::from(t),
        })
        .collect()
    }

    fn observe(lens: &LensModel, poses: &[BoardPose]) -> Vec<ChessboardObservation> {
        let object = board(9, 6);
        poses
            .iter()
            .map(|pose| {
                let rot = pose.rotation_matrix();
                ChessboardObservation {
                    object_points: object.clone(),
                    image_points: object
                        .iter()
                        .map(|p| lens.project(&rot, &pose.translation, p).expect("in front"))
                        .collect(),
                }
            })
            .collect()
    }

    #[test]
    fn rms_is_zero_at_ground_truth() {
        let lens = truth();
        let poses = poses();
        let obs = observe(&lens, &poses);
        let rms = reprojection_rms(&lens, &obs, &poses).expect("rms");
        assert!(rms < 1e-9);
    }

    #[test]
    fn closed_form_focal_length_is_close() {
        let lens = LensModel::new(truth().k, Distortion::none());
        let obs = observe(&lens, &poses());
        let hs: Vec<Matrix3<f64>> = obs
            .iter()
            .map(|o| {
                let plane: Vec<Point2<f64>> = o.object_points.iter().map(|p| p.xy()).collect();
                estimate_homography(&plane, &o.image_points).expect("h").h
            })
            .collect();
        let k = init_intrinsics(&hs, (640, 480)).expect("intrinsics");
        assert_relative_eq!(k[(0, 0)], 800.0, max_relative = 0.03);
        assert_relative_eq!(k[(1, 1)], 790.0, max_relative = 0.03);
    }

    #[test]
    fn pose_recovered_from_exact_homography() {
        let k = truth().k;
        let pose = poses()[2];
        let r = pose.rotation_matrix();
        let h = Matrix3::from_columns(&[
            k * r.matrix().column(0),
            k * r.matrix().column(1),
            k * pose.translation,
        ]);
        let est = pose_from_homography(&k, &(h * -2.0)).expect("pose");
        assert!((est.translation - pose.translation).norm() < 1e-9);
        assert!((est.rotation - pose.rotation).norm() < 1e-9);
    }

    #[test]
    fn bundle_solve_recovers_distorted_camera() {
        let lens = truth();
        let obs = observe(&lens, &poses());
        let out = solve(&obs, (640, 480), &SolverParams::default()).expect("solve");
        assert!(out.rms < 0.05, "rms {}", out.rms);
        assert_relative_eq!(out.lens.fx(), 800.0, max_relative = 0.01);
        assert_relative_eq!(out.lens.fy(), 790.0, max_relative = 0.01);
        assert!((out.lens.distortion.k1 + 0.12).abs() < 0.01);
        assert!(out.evaluations > 0);
        assert_eq!(out.poses.len(), obs.len());
    }

    #[test]
    fn fixed_coefficients_stay_zero() {
        let lens = LensModel::new(
            truth().k,
            Distortion {
                k1: -0.1,
                ..Distortion::none()
            },
        );
        let obs = observe(&lens, &poses());
        let params = SolverParams {
            fix_k3: true,
            zero_tangent: true,
            ..SolverParams::default()
        };
        let out = solve(&obs, (640, 480), &params).expect("solve");
        assert_eq!(out.lens.distortion.p1, 0.0);
        assert_eq!(out.lens.distortion.p2, 0.0);
        assert_eq!(out.lens.distortion.k3, 0.0);
        assert!(out.rms < 0.05);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(
            solve(&[], (640, 480), &SolverParams::default()).unwrap_err(),
            SolveError::NoObservations
        );
    }

    #[test]
    fn mismatched_observation_is_rejected() {
        let obs = ChessboardObservation {
            object_points: board(3, 3),
            image_points: vec![Point2::new(0.0, 0.0); 8],
        };
        assert!(matches!(
            solve(&[obs], (640, 480), &SolverParams::default()),
            Err(SolveError::BadObservation { index: 0, .. })
        ));
    }
}
