//! Round registration: subvolume phase correlation aggregated into one
//! affine transform per (tile, round).
//!
//! The anchor and round volumes are cut into the same grid of overlapping
//! boxes. Each box pair yields a shift and a correlation score; boxes that
//! score too low or shift implausibly far are discarded, and the rest feed a
//! score-weighted least-squares affine fit from box centres to shifted box
//! centres. The resulting transform maps anchor-frame z-y-x positions into
//! the round's frame.

#[cfg(test)]
mod tests;

use glam::DVec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::affine::{Affine, Zyx};
use crate::config::RoundConfig;
use crate::error::{Error, Result};
use crate::layout::Dimensionality;
use crate::math::{fit_affine, weighted_mean};
use crate::phase_correlation::PhaseCorrelator;
use crate::volume::Volume;

/// Correlation outcome of one subvolume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubvolumeShift {
    /// Centre of the box in anchor z-y-x coordinates.
    pub position: DVec3,
    pub shift: DVec3,
    /// Zero for a flat box.
    pub score: f64,
    pub accepted: bool,
}

/// How the round transform was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FitStatus {
    /// Full affine fit over the accepted subvolumes.
    #[default]
    Affine,
    /// Too few subvolumes for an affine fit; weighted mean shift only.
    TranslationOnly,
    /// No usable subvolume; identity placeholder awaiting regularization.
    UnderDetermined,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundFit {
    pub transform: Affine<Zyx>,
    pub subvolumes: Vec<SubvolumeShift>,
    /// Sum of accepted scores divided by the number of subvolumes.
    pub quality: f64,
    pub status: FitStatus,
}

impl RoundFit {
    pub fn accepted_count(&self) -> usize {
        self.subvolumes.iter().filter(|s| s.accepted).count()
    }
}

/// Stored result for one (tile, round).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundEntry {
    /// Transform as estimated from this tile's own data.
    pub transform_raw: Affine<Zyx>,
    /// Transform used downstream; differs from `transform_raw` once the
    /// entry has been flagged as an outlier.
    pub transform: Affine<Zyx>,
    pub subvolumes: Vec<SubvolumeShift>,
    pub quality: f64,
    pub status: FitStatus,
    pub outlier: bool,
    /// Distance of the raw translation from the tile-grid trend, once
    /// regularization has run.
    pub residual: Option<f64>,
}

impl From<RoundFit> for RoundEntry {
    fn from(fit: RoundFit) -> Self {
        Self {
            transform_raw: fit.transform,
            transform: fit.transform,
            subvolumes: fit.subvolumes,
            quality: fit.quality,
            status: fit.status,
            outlier: false,
            residual: None,
        }
    }
}

impl RoundEntry {
    /// Entry of the anchor round, which is its own reference.
    pub fn identity() -> Self {
        Self {
            transform_raw: Affine::identity(),
            transform: Affine::identity(),
            subvolumes: Vec::new(),
            quality: 1.0,
            status: FitStatus::Affine,
            outlier: false,
            residual: None,
        }
    }
}

/// Box size and start corners of the subvolume grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolumeGrid {
    pub box_size: [usize; 3],
    pub starts: Vec<[usize; 3]>,
}

impl SubvolumeGrid {
    /// Evenly spaced boxes covering `shape`. The box is clamped to the volume
    /// and an axis with no room to move gets a single box.
    pub fn new(shape: [usize; 3], counts: [usize; 3], box_size: [usize; 3]) -> Self {
        let box_size: [usize; 3] = std::array::from_fn(|i| box_size[i].min(shape[i]).max(1));
        let axis_starts: [Vec<usize>; 3] = std::array::from_fn(|i| {
            let room = shape[i] - box_size[i];
            let count = if room == 0 { 1 } else { counts[i].min(room + 1) };
            linspace_starts(room, count)
        });

        let mut starts = Vec::new();
        for &z in &axis_starts[0] {
            for &y in &axis_starts[1] {
                for &x in &axis_starts[2] {
                    starts.push([z, y, x]);
                }
            }
        }
        Self { box_size, starts }
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    pub fn centre(&self, start: [usize; 3]) -> DVec3 {
        DVec3::new(
            start[0] as f64 + (self.box_size[0] as f64 - 1.0) / 2.0,
            start[1] as f64 + (self.box_size[1] as f64 - 1.0) / 2.0,
            start[2] as f64 + (self.box_size[2] as f64 - 1.0) / 2.0,
        )
    }
}

fn linspace_starts(room: usize, count: usize) -> Vec<usize> {
    if count <= 1 {
        return vec![room / 2];
    }
    (0..count)
        .map(|i| ((i * room) as f64 / (count - 1) as f64).round() as usize)
        .collect()
}

/// Registers rounds of one tile against its anchor round.
#[derive(Debug)]
pub struct RoundRegistrator {
    config: RoundConfig,
    dimensionality: Dimensionality,
    volume_shape: [usize; 3],
    grid: SubvolumeGrid,
    correlator: PhaseCorrelator,
}

impl RoundRegistrator {
    pub fn new(volume_shape: [usize; 3], config: RoundConfig, dimensionality: Dimensionality) -> Self {
        config.validate();
        let grid = SubvolumeGrid::new(volume_shape, config.subvolume_counts, config.box_size);
        let correlator = PhaseCorrelator::new(grid.box_size);
        Self {
            config,
            dimensionality,
            volume_shape,
            grid,
            correlator,
        }
    }

    pub fn volume_shape(&self) -> [usize; 3] {
        self.volume_shape
    }

    pub fn grid(&self) -> &SubvolumeGrid {
        &self.grid
    }

    /// Estimates the transform taking anchor-frame positions to `round`.
    pub fn register(&self, anchor: &Volume, round: &Volume) -> Result<RoundFit> {
        for (what, volume) in [("anchor volume", anchor), ("round volume", round)] {
            if volume.shape() != self.volume_shape {
                return Err(Error::ShapeMismatch {
                    what,
                    expected: self.volume_shape.to_vec(),
                    actual: volume.shape().to_vec(),
                });
            }
        }

        let subvolumes: Vec<SubvolumeShift> = self
            .grid
            .starts
            .par_iter()
            .map(|&start| self.correlate_box(anchor, round, start))
            .collect();

        for s in &subvolumes {
            log::debug!(
                "subvolume at {:?}: shift {:?}, score {:.3}, accepted {}",
                s.position,
                s.shift,
                s.score,
                s.accepted
            );
        }

        Ok(self.fit(subvolumes))
    }

    fn correlate_box(&self, anchor: &Volume, round: &Volume, start: [usize; 3]) -> SubvolumeShift {
        let position = self.grid.centre(start);
        let a = anchor.subvolume(start, self.grid.box_size);
        let r = round.subvolume(start, self.grid.box_size);

        match self.correlator.correlate(&a, &r) {
            Some(estimate) => SubvolumeShift {
                position,
                shift: estimate.shift,
                score: estimate.score,
                accepted: self.is_plausible(estimate.shift, estimate.score),
            },
            None => SubvolumeShift {
                position,
                shift: DVec3::ZERO,
                score: 0.0,
                accepted: false,
            },
        }
    }

    fn is_plausible(&self, shift: DVec3, score: f64) -> bool {
        score >= self.config.min_score
            && (0..3).all(|axis| shift[axis].abs() <= self.config.max_shift[axis])
    }

    fn fit(&self, subvolumes: Vec<SubvolumeShift>) -> RoundFit {
        let accepted: Vec<&SubvolumeShift> = subvolumes.iter().filter(|s| s.accepted).collect();
        let quality = if subvolumes.is_empty() {
            0.0
        } else {
            accepted.iter().map(|s| s.score).sum::<f64>() / subvolumes.len() as f64
        };

        let src: Vec<DVec3> = accepted.iter().map(|s| s.position).collect();
        let dst: Vec<DVec3> = accepted.iter().map(|s| s.position + s.shift).collect();
        let weights: Vec<f64> = accepted.iter().map(|s| s.score).collect();
        let active = self.dimensionality.active_axes::<Zyx>();

        let affine = if accepted.len() >= self.config.min_subvolumes {
            fit_affine::<Zyx>(&src, &dst, Some(&weights), active)
        } else {
            None
        };

        let (transform, status) = match affine {
            Some(transform) => (transform, FitStatus::Affine),
            None => {
                let shifts: Vec<DVec3> = accepted.iter().map(|s| s.shift).collect();
                match weighted_mean(&shifts, Some(&weights)) {
                    Some(mean) if self.config.translation_fallback => {
                        let mut shift = mean;
                        for (axis, &on) in active.iter().enumerate() {
                            if !on {
                                shift[axis] = 0.0;
                            }
                        }
                        (Affine::from_translation(shift), FitStatus::TranslationOnly)
                    }
                    _ => (Affine::identity(), FitStatus::UnderDetermined),
                }
            }
        };

        RoundFit {
            transform,
            subvolumes,
            quality,
            status,
        }
    }
}
