//! Outlier detection and replacement of round transforms across the tile grid.
//!
//! For each registered round, the translation of every tile's transform is
//! modelled as a smooth function of the tile's origin: a constant, plus a
//! linear term along each grid axis that varies when there are enough tiles
//! to support it. The model is a quality-weighted L1 fit (iteratively
//! reweighted least squares), so a single wild tile barely moves it. Tiles
//! are flagged worst-first while their residual exceeds the threshold, with
//! the model refit after each flag. Tied residuals, as two equally good tiles
//! always give, go to the tile whose translation strays furthest from its
//! own other rounds. Flagged tiles get the trend translation
//! and the quality-weighted mean linear part of the tiles that were kept.
//!
//! Entries flagged by an earlier pass stay flagged and out of the fit, which
//! makes a second pass over regularized data a no-op.


use glam::{DMat3, DVec3};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::affine::{Affine, Zyx};
use crate::config::RegularizeConfig;
use crate::error::{Error, Result};
use crate::layout::{Layout, TileGrid};
use crate::math::{median_mut, weighted_least_squares};
use crate::round::{FitStatus, RoundEntry};
use crate::table::TileRoundTable;

/// Lower bound on residuals when reweighting, avoiding division by zero.
const MIN_RESIDUAL: f64 = 1e-6;

/// Residuals within this relative distance of the largest are tied.
const RESIDUAL_TIE: f64 = 1e-9;

/// Why an entry was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutlierReason {
    /// Translation too far from the tile-grid trend.
    Residual,
    /// Round registration produced no usable estimate.
    UnderDetermined,
}

/// A newly replaced (tile, round) transform.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierReport {
    pub tile: usize,
    pub round: usize,
    pub reason: OutlierReason,
    pub residual: f64,
    pub before: Affine<Zyx>,
    pub after: Affine<Zyx>,
}

/// Translation trend over tile origins: `t = c + s_y·(y − ȳ) + s_x·(x − x̄)`.
#[derive(Debug, Clone)]
struct Trend {
    /// Row 0 is the constant; further rows are slopes of the varying axes.
    coefficients: DMatrix<f64>,
    /// Grid axes (0 = y, 1 = x) with a slope term.
    axes: Vec<usize>,
    centre: [f64; 2],
}

impl Trend {
    fn features(&self, origin: [f64; 2]) -> Vec<f64> {
        let mut row = Vec::with_capacity(1 + self.axes.len());
        row.push(1.0);
        for &axis in &self.axes {
            row.push(origin[axis] - self.centre[axis]);
        }
        row
    }

    fn predict(&self, origin: [f64; 2]) -> DVec3 {
        let features = self.features(origin);
        let mut out = DVec3::ZERO;
        for k in 0..3 {
            out[k] = features
                .iter()
                .enumerate()
                .map(|(p, f)| f * self.coefficients[(p, k)])
                .sum();
        }
        out
    }
}

/// Quality-weighted L1 trend fit. `None` when no sample has positive weight.
fn fit_trend(
    origins: &[[f64; 2]],
    translations: &[DVec3],
    weights: &[f64],
    config: &RegularizeConfig,
) -> Option<Trend> {
    let n = origins.len();
    let fitted = weights.iter().filter(|&&w| w > 0.0).count();
    if n == 0 || fitted == 0 {
        return None;
    }

    let centre = [0, 1].map(|axis| origins.iter().map(|o| o[axis]).sum::<f64>() / n as f64);
    let varying: Vec<usize> = [0, 1]
        .into_iter()
        .filter(|&axis| {
            let first = origins[0][axis];
            origins.iter().any(|o| (o[axis] - first).abs() > 1e-9)
        })
        .collect();

    // Slopes need at least two fitted tiles per coefficient.
    if fitted >= 2 * (1 + varying.len()) {
        if let Some(trend) = fit_trend_with(origins, translations, weights, config, varying, centre) {
            return Some(trend);
        }
    }
    fit_trend_with(origins, translations, weights, config, Vec::new(), centre)
}

fn fit_trend_with(
    origins: &[[f64; 2]],
    translations: &[DVec3],
    weights: &[f64],
    config: &RegularizeConfig,
    axes: Vec<usize>,
    centre: [f64; 2],
) -> Option<Trend> {
    let n = origins.len();
    let mut trend = Trend {
        coefficients: DMatrix::zeros(1 + axes.len(), 3),
        axes,
        centre,
    };
    let design = DMatrix::from_fn(n, 1 + trend.axes.len(), |i, p| trend.features(origins[i])[p]);
    let rhs = DMatrix::from_fn(n, 3, |i, k| translations[i][k]);

    let mut irls_weights = weights.to_vec();
    for _ in 0..config.max_iterations {
        let coefficients = weighted_least_squares(&design, &rhs, &irls_weights)?;
        let change = (&coefficients - &trend.coefficients).abs().max();
        trend.coefficients = coefficients;

        for i in 0..n {
            let residual = (translations[i] - trend.predict(origins[i])).length();
            irls_weights[i] = weights[i] / residual.max(MIN_RESIDUAL);
        }
        if change < config.tolerance {
            break;
        }
    }
    Some(trend)
}

/// Detects and replaces outlier round transforms, round by round.
///
/// Every used (tile, registered round) entry must be present. Returns the
/// entries replaced by this call; entries replaced by an earlier call keep
/// their flag and are not reported again.
pub fn regularize(
    table: &mut TileRoundTable<Option<RoundEntry>>,
    layout: &Layout,
    grid: &TileGrid,
    config: &RegularizeConfig,
) -> Result<Vec<OutlierReport>> {
    config.validate();
    grid.validate(layout)?;
    table.check_shape("round transform table", [layout.n_tiles, layout.n_rounds])?;

    let mut reports = Vec::new();
    for round in layout.registered_rounds() {
        reports.extend(regularize_round(table, layout, grid, config, round)?);
    }
    Ok(reports)
}

fn regularize_round(
    table: &mut TileRoundTable<Option<RoundEntry>>,
    layout: &Layout,
    grid: &TileGrid,
    config: &RegularizeConfig,
    round: usize,
) -> Result<Vec<OutlierReport>> {
    let tiles = &layout.use_tiles;
    let mut entries = Vec::with_capacity(tiles.len());
    for &tile in tiles {
        let entry = table.get(tile, round).as_ref().ok_or(Error::MissingEntry {
            what: "round transform",
            tile,
            round,
        })?;
        entries.push(entry.clone());
    }
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let origins: Vec<[f64; 2]> = tiles
        .iter()
        .map(|&t| [grid.origins[t][0], grid.origins[t][1]])
        .collect();
    let translations: Vec<DVec3> = entries.iter().map(|e| e.transform_raw.translation()).collect();
    let mut flagged: Vec<bool> = entries
        .iter()
        .map(|e| e.outlier || e.status == FitStatus::UnderDetermined)
        .collect();
    let strays: Vec<f64> = tiles
        .iter()
        .zip(&translations)
        .map(|(&tile, &translation)| stray_from_other_rounds(table, layout, tile, round, translation))
        .collect();

    let trend = loop {
        let weights: Vec<f64> = entries
            .iter()
            .zip(&flagged)
            .map(|(e, &f)| if f { 0.0 } else { e.quality.max(0.0) })
            .collect();
        let Some(trend) = fit_trend(&origins, &translations, &weights, config) else {
            log::warn!(
                "Round {}: no reliable tile to regularize against; keeping raw transforms",
                round
            );
            return Ok(Vec::new());
        };

        let candidates: Vec<(usize, f64)> = (0..entries.len())
            .filter(|&i| !flagged[i])
            .map(|i| (i, (translations[i] - trend.predict(origins[i])).length()))
            .filter(|&(_, r)| r > config.residual_threshold)
            .collect();
        let largest = candidates.iter().map(|c| c.1).fold(0.0, f64::max);
        let worst = candidates
            .into_iter()
            .filter(|&(_, r)| r >= largest * (1.0 - RESIDUAL_TIE))
            .max_by(|a, b| strays[a.0].total_cmp(&strays[b.0]).then(b.0.cmp(&a.0)));
        match worst {
            Some((i, _)) => flagged[i] = true,
            None => break trend,
        }
    };

    let linear = mean_linear(&entries, &flagged);
    let mut reports = Vec::new();
    for (i, &tile) in tiles.iter().enumerate() {
        let residual = (translations[i] - trend.predict(origins[i])).length();
        let Some(entry) = table.get_mut(tile, round).as_mut() else {
            continue;
        };
        entry.residual = Some(residual);
        if !flagged[i] {
            entry.transform = entry.transform_raw;
            continue;
        }

        let before = entry.transform;
        let after = Affine::from_parts(linear, trend.predict(origins[i]));
        entry.transform = after;
        if !entry.outlier {
            entry.outlier = true;
            let reason = if entry.status == FitStatus::UnderDetermined {
                OutlierReason::UnderDetermined
            } else {
                OutlierReason::Residual
            };
            log::warn!(
                "Tile {}, round {}: outlier transform replaced ({:?}, residual {:.2}); before {}, after {}",
                tile,
                round,
                reason,
                residual,
                before,
                after
            );
            reports.push(OutlierReport {
                tile,
                round,
                reason,
                residual,
                before,
                after,
            });
        }
    }
    Ok(reports)
}

/// Median distance from `translation` to the tile's usable translations in
/// the other registered rounds. Zero when there are none.
fn stray_from_other_rounds(
    table: &TileRoundTable<Option<RoundEntry>>,
    layout: &Layout,
    tile: usize,
    round: usize,
    translation: DVec3,
) -> f64 {
    let mut distances: Vec<f64> = layout
        .registered_rounds()
        .into_iter()
        .filter(|&r| r != round)
        .filter_map(|r| table.get(tile, r).as_ref())
        .filter(|e| !e.outlier && e.status != FitStatus::UnderDetermined)
        .map(|e| (e.transform_raw.translation() - translation).length())
        .collect();
    median_mut(&mut distances).unwrap_or(0.0)
}

/// Quality-weighted mean linear part of the kept entries, identity if none.
fn mean_linear(entries: &[RoundEntry], flagged: &[bool]) -> DMat3 {
    let mut sum = DMat3::ZERO;
    let mut total = 0.0;
    for (entry, &f) in entries.iter().zip(flagged) {
        let w = entry.quality.max(0.0);
        if f || w <= 0.0 {
            continue;
        }
        sum += entry.transform_raw.linear() * w;
        total += w;
    }
    if total > 0.0 {
        sum * (1.0 / total)
    } else {
        DMat3::IDENTITY
    }
}
