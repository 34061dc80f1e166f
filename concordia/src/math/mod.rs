//! Least-squares fitting and robust statistics shared by the estimators.

use glam::DVec3;
use nalgebra::{DMatrix, SVD};

use crate::affine::{Affine, AxisOrder};


/// MAD (Median Absolute Deviation) to standard deviation conversion factor.
///
/// For a normal distribution, σ ≈ 1.4826 × MAD.
pub const MAD_TO_SIGMA: f64 = 1.482_602_2;

/// Relative singular-value cutoff below which a system counts as rank deficient.
const RANK_TOLERANCE: f64 = 1e-9;

/// Spread below which a coordinate is treated as constant.
const MIN_SPREAD: f64 = 1e-9;

/// Median of `data`, reordering it in place. Returns `None` when empty.
pub fn median_mut(data: &mut [f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let mid = data.len() / 2;
    let odd = data.len() % 2 == 1;
    let (left, upper, _) = data.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;
    if odd {
        return Some(upper);
    }
    let lower = left.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some((lower + upper) * 0.5)
}

/// Median and MAD of `values`.
pub fn median_and_mad(values: &[f64]) -> Option<(f64, f64)> {
    let mut scratch = values.to_vec();
    let median = median_mut(&mut scratch)?;
    for v in scratch.iter_mut() {
        *v = (*v - median).abs();
    }
    let mad = median_mut(&mut scratch)?;
    Some((median, mad))
}

/// Weighted mean of points. `None` when the total weight is not positive.
pub fn weighted_mean(points: &[DVec3], weights: Option<&[f64]>) -> Option<DVec3> {
    let mut sum = DVec3::ZERO;
    let mut total = 0.0;
    for (i, p) in points.iter().enumerate() {
        let w = weight_at(weights, i);
        sum += *p * w;
        total += w;
    }
    (total > 0.0).then(|| sum / total)
}

/// Solves `min ‖diag(√w)(X·B − Y)‖` for `B` via SVD.
///
/// Returns `None` when the weighted design matrix is rank deficient.
pub fn weighted_least_squares(
    design: &DMatrix<f64>,
    rhs: &DMatrix<f64>,
    weights: &[f64],
) -> Option<DMatrix<f64>> {
    assert_eq!(design.nrows(), rhs.nrows(), "design/rhs row count mismatch");
    assert_eq!(design.nrows(), weights.len(), "design/weights row count mismatch");

    let mut a = design.clone();
    let mut b = rhs.clone();
    for (i, &w) in weights.iter().enumerate() {
        let s = w.max(0.0).sqrt();
        a.row_mut(i).scale_mut(s);
        b.row_mut(i).scale_mut(s);
    }

    let ncols = a.ncols();
    if a.nrows() < ncols {
        return None;
    }
    let svd = SVD::new(a, true, true);
    let largest = svd.singular_values.max();
    if !(largest > 0.0) {
        return None;
    }
    let eps = largest * RANK_TOLERANCE;
    if svd.rank(eps) < ncols {
        return None;
    }
    svd.solve(&b, eps).ok()
}

/// Weighted least-squares affine map taking `src` onto `dst`.
///
/// Only slots marked in `active` are fitted. A slot whose source coordinate
/// does not vary keeps an identity column, and an inactive output slot keeps
/// an identity row with the weighted mean offset as translation. Returns
/// `None` for empty input, zero total weight, or a degenerate point layout.
pub fn fit_affine<O: AxisOrder>(
    src: &[DVec3],
    dst: &[DVec3],
    weights: Option<&[f64]>,
    active: [bool; 3],
) -> Option<Affine<O>> {
    assert_eq!(src.len(), dst.len(), "point count mismatch");
    if let Some(w) = weights {
        assert_eq!(w.len(), src.len(), "weight count mismatch");
    }

    let mean_src = weighted_mean(src, weights)?;
    let mean_dst = weighted_mean(dst, weights)?;

    let inputs: Vec<usize> = (0..3)
        .filter(|&k| active[k] && varies(src, weights, k))
        .collect();
    let outputs: Vec<usize> = (0..3).filter(|&j| active[j]).collect();

    let mut rows = [[0.0; 4]; 3];
    for (j, row) in rows.iter_mut().enumerate() {
        row[j] = 1.0;
    }

    if !inputs.is_empty() && !outputs.is_empty() {
        let n = src.len();
        let design = DMatrix::from_fn(n, inputs.len(), |i, c| src[i][inputs[c]] - mean_src[inputs[c]]);
        let rhs = DMatrix::from_fn(n, outputs.len(), |i, c| {
            dst[i][outputs[c]] - mean_dst[outputs[c]]
        });
        let w: Vec<f64> = (0..n).map(|i| weight_at(weights, i)).collect();
        let solution = weighted_least_squares(&design, &rhs, &w)?;
        for (oc, &j) in outputs.iter().enumerate() {
            for (ic, &k) in inputs.iter().enumerate() {
                rows[j][k] = solution[(ic, oc)];
            }
        }
    }

    // Weighted least squares with an intercept passes through the weighted means.
    for (j, row) in rows.iter_mut().enumerate() {
        row[3] = mean_dst[j] - (0..3).map(|k| row[k] * mean_src[k]).sum::<f64>();
    }

    let affine = Affine::from_rows(rows);
    affine.is_finite().then_some(affine)
}

fn weight_at(weights: Option<&[f64]>, i: usize) -> f64 {
    weights.map_or(1.0, |w| w[i])
}

fn varies(points: &[DVec3], weights: Option<&[f64]>, slot: usize) -> bool {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for (i, p) in points.iter().enumerate() {
        if weight_at(weights, i) > 0.0 {
            min = min.min(p[slot]);
            max = max.max(p[slot]);
        }
    }
    max - min > MIN_SPREAD
}
