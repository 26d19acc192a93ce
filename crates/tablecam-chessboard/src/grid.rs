//! Grow a complete `cols x rows` corner lattice out of unordered ChESS
//! candidates.
//!
//! A seed corner and its two nearest roughly perpendicular neighbors fix the
//! local lattice axes. The grid then grows breadth-first: each missing
//! neighbor is predicted by extrapolating the already-accepted line (or the
//! local axis when no line exists yet) and snapped to the nearest candidate
//! inside a spacing-relative tolerance. Only lattices whose extent is
//! exactly the requested pattern, fully populated, are accepted.

use std::collections::{HashMap, VecDeque};

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Point2, Vector2};

use crate::params::{ChessboardParams, PatternSize};

/// Corner candidate fed to the grid search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub position: Point2<f64>,
    pub strength: f32,
}

const SEED_NEIGHBORS: usize = 9;
const MAX_SEED_ATTEMPTS: usize = 64;
const PERPENDICULAR_COS: f64 = 0.35;

type Cell = (i32, i32);

pub(crate) struct GridSearch<'a> {
    candidates: &'a [Candidate],
    tree: KdTree<f32, 2>,
    pattern: PatternSize,
    tolerance_rel: f64,
    min_spacing: f64,
}

impl<'a> GridSearch<'a> {
    pub(crate) fn new(candidates: &'a [Candidate], params: &ChessboardParams) -> Self {
        let coords = candidates
            .iter()
            .map(|c| [c.position.x as f32, c.position.y as f32])
            .collect::<Vec<_>>();
        let tree: KdTree<f32, 2> = (&coords).into();
        Self {
            candidates,
            tree,
            pattern: params.pattern,
            tolerance_rel: params.grid_tolerance_rel,
            min_spacing: params.min_spacing_pix,
        }
    }

    /// Return the first complete lattice, corners in canonical row-major order.
    pub(crate) fn find(&self) -> Option<Vec<Point2<f64>>> {
        let needed = self.pattern.corner_count();
        if self.candidates.len() < needed {
            return None;
        }

        let mut order: Vec<usize> = (0..self.candidates.len()).collect();
        order.sort_by(|&a, &b| {
            self.candidates[b]
                .strength
                .total_cmp(&self.candidates[a].strength)
                .then(a.cmp(&b))
        });

        let mut explored = vec![false; self.candidates.len()];
        let mut attempts = 0usize;
        for seed in order {
            if explored[seed] {
                continue;
            }
            if attempts == MAX_SEED_ATTEMPTS {
                break;
            }
            attempts += 1;

            let Some((u, v)) = self.seed_axes(seed) else {
                continue;
            };
            let cells = self.grow(seed, u, v);
            for &idx in cells.values() {
                explored[idx] = true;
            }
            if let Some(points) = self.extract(&cells) {
                return Some(points);
            }
            log::trace!(
                "seed {} grew {} cells, pattern needs {}",
                seed,
                cells.len(),
                needed
            );
        }
        None
    }

    fn position(&self, idx: usize) -> Point2<f64> {
        self.candidates[idx].position
    }

    fn nearest(&self, p: Point2<f64>, count: usize) -> Vec<(usize, f64)> {
        self.tree
            .nearest_n::<SquaredEuclidean>(&[p.x as f32, p.y as f32], count)
            .into_iter()
            .map(|nn| (nn.item as usize, nn.distance as f64))
            .collect()
    }

    fn seed_axes(&self, seed: usize) -> Option<(Vector2<f64>, Vector2<f64>)> {
        let p0 = self.position(seed);
        let mut offsets: Vec<Vector2<f64>> = self
            .nearest(p0, SEED_NEIGHBORS)
            .into_iter()
            .filter(|&(idx, _)| idx != seed)
            .map(|(idx, _)| self.position(idx) - p0)
            .filter(|d| d.norm() >= self.min_spacing)
            .collect();
        offsets.sort_by(|a, b| a.norm().total_cmp(&b.norm()));

        let u = *offsets.first()?;
        let du = u.norm();
        let v = offsets.iter().skip(1).find(|w| {
            let dw = w.norm();
            let cos = (u.dot(w) / (du * dw)).abs();
            dw <= 1.5 * du && cos < PERPENDICULAR_COS
        })?;
        Some((u, *v))
    }

    fn grow(&self, seed: usize, u: Vector2<f64>, v: Vector2<f64>) -> HashMap<Cell, usize> {
        let cap = 4 * self.pattern.corner_count();
        let mut cells: HashMap<Cell, usize> = HashMap::new();
        let mut axes: HashMap<Cell, (Vector2<f64>, Vector2<f64>)> = HashMap::new();
        let mut used = vec![false; self.candidates.len()];
        let mut queue = VecDeque::new();

        cells.insert((0, 0), seed);
        axes.insert((0, 0), (u, v));
        used[seed] = true;
        queue.push_back((0, 0));

        while let Some(cell) = queue.pop_front() {
            let (i, j) = cell;
            let p = self.position(cells[&cell]);
            let (au, av) = axes[&cell];

            for (di, dj) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
                let next = (i + di, j + dj);
                if cells.contains_key(&next) {
                    continue;
                }
                let step = if di != 0 {
                    au * di as f64
                } else {
                    av * dj as f64
                };
                // extrapolate the line through the cell behind when it exists
                let predicted = match cells.get(&(i - di, j - dj)) {
                    Some(&behind) => p + (p - self.position(behind)),
                    None => p + step,
                };
                let radius = self.tolerance_rel * step.norm();

                let Some(&(hit, dist_sq)) = self.nearest(predicted, 1).first() else {
                    continue;
                };
                if used[hit] || dist_sq > radius * radius {
                    continue;
                }

                let actual = self.position(hit) - p;
                let next_axes = if di != 0 {
                    (actual * di as f64, av)
                } else {
                    (au, actual * dj as f64)
                };
                cells.insert(next, hit);
                axes.insert(next, next_axes);
                used[hit] = true;
                queue.push_back(next);

                if cells.len() > cap {
                    return cells;
                }
            }
        }
        cells
    }

    fn extract(&self, cells: &HashMap<Cell, usize>) -> Option<Vec<Point2<f64>>> {
        let cols = self.pattern.cols as i32;
        let rows = self.pattern.rows as i32;
        if cells.len() != (cols * rows) as usize {
            return None;
        }

        let imin = cells.keys().map(|c| c.0).min()?;
        let imax = cells.keys().map(|c| c.0).max()?;
        let jmin = cells.keys().map(|c| c.1).min()?;
        let jmax = cells.keys().map(|c| c.1).max()?;
        let (w, h) = (imax - imin + 1, jmax - jmin + 1);

        // cell keys are unique, so matching extent and count means complete
        let transposed = if (w, h) == (cols, rows) {
            false
        } else if (w, h) == (rows, cols) {
            true
        } else {
            return None;
        };

        let mut points = vec![Point2::origin(); cells.len()];
        for (&(i, j), &idx) in cells {
            let (c, r) = if transposed {
                (j - jmin, i - imin)
            } else {
                (i - imin, j - jmin)
            };
            points[(r * cols + c) as usize] = self.position(idx);
        }
        Some(canonical_order(points, cols as usize, rows as usize))
    }
}

/// Reorder a row-major lattice so the column axis turns clockwise into the row
/// axis (image y points down) and the first corner is the one nearest the
/// image origin among the remaining symmetric variants.
pub(crate) fn canonical_order(
    points: Vec<Point2<f64>>,
    cols: usize,
    rows: usize,
) -> Vec<Point2<f64>> {
    let mut points = points;
    let col_axis = points[cols - 1] - points[0];
    let row_axis = points[(rows - 1) * cols] - points[0];
    if col_axis.perp(&row_axis) < 0.0 {
        points = flip_rows(&points, cols, rows);
    }

    let mut variants = vec![points.clone(), points.iter().rev().copied().collect()];
    if cols == rows {
        let quarter = rotate_quarter(&points, cols);
        variants.push(quarter.iter().rev().copied().collect());
        variants.push(quarter);
    }

    variants
        .into_iter()
        .min_by(|a, b| (a[0].x + a[0].y).total_cmp(&(b[0].x + b[0].y)))
        .unwrap_or(points)
}

fn flip_rows(points: &[Point2<f64>], cols: usize, rows: usize) -> Vec<Point2<f64>> {
    (0..rows)
        .rev()
        .flat_map(|r| points[r * cols..(r + 1) * cols].iter().copied())
        .collect()
}

fn rotate_quarter(points: &[Point2<f64>], n: usize) -> Vec<Point2<f64>> {
    let mut out = Vec::with_capacity(points.len());
    for r in 0..n {
        for c in 0..n {
            out.push(points[(n - 1 - c) * n + r]);
        }
    }
    out
}
