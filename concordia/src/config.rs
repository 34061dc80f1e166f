//! Configuration types for the registration engine.
//!
//! Each stage has its own config struct; [`RegisterConfig`] groups them.
//! All structs deserialize with defaults for missing fields, so a config file
//! only needs to list the values it changes.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layout::Dimensionality;

// =============================================================================
// Channel registration
// =============================================================================

/// Bead detection and camera-to-camera matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Expected bead radii in pixels. Detected blobs must have an equivalent
    /// radius within `radius_tolerance` of this range.
    pub bead_radii: Vec<f64>,
    /// Fractional slack applied to both ends of the bead-radius range.
    pub radius_tolerance: f64,
    /// Foreground threshold as a fraction of the way from the median to the
    /// maximum of the projected bead image.
    pub threshold_fraction: f64,
    /// Minimum ratio of minor to major second-moment axis for a blob to count
    /// as a circular bead.
    pub min_circularity: f64,
    /// Maximum distance in pixels between matched bead centroids.
    pub match_tolerance: f64,
    /// Fewer matches than this falls back to the identity transform.
    pub min_matches: usize,
    /// Rounds of matching and refitting.
    pub max_iterations: usize,
    /// Radius of the displacement vote that seeds the matching. `None` starts
    /// from the identity.
    pub coarse_search_radius: Option<f64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bead_radii: vec![10.0, 11.0, 12.0],
            radius_tolerance: 0.5,
            threshold_fraction: 0.25,
            min_circularity: 0.6,
            match_tolerance: 5.0,
            min_matches: 6,
            max_iterations: 10,
            coarse_search_radius: Some(30.0),
        }
    }
}

impl ChannelConfig {
    /// Smallest and largest accepted equivalent radius.
    pub fn radius_range(&self) -> (f64, f64) {
        let min = self.bead_radii.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.bead_radii.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (
            min * (1.0 - self.radius_tolerance),
            max * (1.0 + self.radius_tolerance),
        )
    }

    pub fn validate(&self) {
        assert!(
            !self.bead_radii.is_empty() && self.bead_radii.iter().all(|&r| r > 0.0),
            "bead_radii must be non-empty and positive, got {:?}",
            self.bead_radii
        );
        assert!(
            (0.0..1.0).contains(&self.radius_tolerance),
            "radius_tolerance must be in [0, 1), got {}",
            self.radius_tolerance
        );
        assert!(
            self.threshold_fraction > 0.0 && self.threshold_fraction < 1.0,
            "threshold_fraction must be in (0, 1), got {}",
            self.threshold_fraction
        );
        assert!(
            (0.0..=1.0).contains(&self.min_circularity),
            "min_circularity must be in [0, 1], got {}",
            self.min_circularity
        );
        assert!(
            self.match_tolerance > 0.0,
            "match_tolerance must be positive, got {}",
            self.match_tolerance
        );
        assert!(
            self.min_matches >= 3,
            "min_matches must be at least 3 for an affine fit, got {}",
            self.min_matches
        );
        assert!(
            self.max_iterations > 0,
            "channel max_iterations must be positive"
        );
        if let Some(radius) = self.coarse_search_radius {
            assert!(
                radius > 0.0,
                "coarse_search_radius must be positive, got {}",
                radius
            );
        }
    }
}

// =============================================================================
// Round registration
// =============================================================================

/// Subvolume phase correlation and the affine fit over its shifts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Number of subvolumes along z, y and x.
    pub subvolume_counts: [usize; 3],
    /// Subvolume size in voxels along z, y and x. Clamped to the volume.
    pub box_size: [usize; 3],
    /// Patches scoring below this are discarded.
    pub min_score: f64,
    /// Largest plausible |shift| along z, y and x.
    pub max_shift: [f64; 3],
    /// Fewer accepted patches than this leaves the fit under-determined.
    pub min_subvolumes: usize,
    /// With fewer than `min_subvolumes` but at least one accepted patch, fall
    /// back to the weighted mean shift instead of the identity.
    pub translation_fallback: bool,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            subvolume_counts: [5, 8, 8],
            box_size: [12, 300, 300],
            min_score: 0.3,
            max_shift: [10.0, 100.0, 100.0],
            min_subvolumes: 4,
            translation_fallback: true,
        }
    }
}

impl RoundConfig {
    pub fn validate(&self) {
        assert!(
            self.subvolume_counts.iter().all(|&n| n > 0),
            "subvolume_counts must be positive, got {:?}",
            self.subvolume_counts
        );
        assert!(
            self.box_size.iter().all(|&n| n > 0),
            "box_size must be positive, got {:?}",
            self.box_size
        );
        assert!(
            (0.0..=1.0).contains(&self.min_score),
            "min_score must be in [0, 1], got {}",
            self.min_score
        );
        assert!(
            self.max_shift.iter().all(|&s| s >= 0.0),
            "max_shift must be non-negative, got {:?}",
            self.max_shift
        );
        assert!(
            self.min_subvolumes > 0,
            "min_subvolumes must be positive"
        );
    }
}

// =============================================================================
// Regularization
// =============================================================================

/// Outlier detection across the tile grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegularizeConfig {
    /// Residual (voxels) between a tile's translation and the trend above which
    /// the tile is flagged and replaced.
    pub residual_threshold: f64,
    /// Iteration cap of the reweighted L1 trend fit.
    pub max_iterations: usize,
    /// Stops the trend fit when coefficients move less than this.
    pub tolerance: f64,
}

impl Default for RegularizeConfig {
    fn default() -> Self {
        Self {
            residual_threshold: 5.0,
            max_iterations: 50,
            tolerance: 1e-6,
        }
    }
}

impl RegularizeConfig {
    pub fn validate(&self) {
        assert!(
            self.residual_threshold > 0.0,
            "residual_threshold must be positive, got {}",
            self.residual_threshold
        );
        assert!(
            self.max_iterations > 0,
            "regularize max_iterations must be positive"
        );
        assert!(
            self.tolerance > 0.0,
            "regularize tolerance must be positive, got {}",
            self.tolerance
        );
    }
}

// =============================================================================
// ICP
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    pub max_iterations: usize,
    /// Correspondence distance threshold for 3-D experiments.
    pub neighbour_distance_3d: f64,
    /// Correspondence distance threshold for 2-D experiments.
    pub neighbour_distance_2d: f64,
    /// Tiles with fewer spots than this in a round/channel keep the initial
    /// transform.
    pub min_spots: usize,
    /// Fewer matched pairs than this ends the run as degenerate.
    pub min_matches: usize,
    /// Convergence tolerance on the change in mean squared error.
    pub mse_tolerance: f64,
    /// Drop pairs with large residuals and refit each iteration.
    pub robust: bool,
    /// Lower bound of the robust residual cutoff in voxels.
    pub robust_residual_floor: f64,
    /// Radius of the displacement vote run before iterating. `None` disables it.
    pub coarse_search_radius: Option<f64>,
    /// Apply the low-spot-count skip to the pre-sequence round as well. Off by
    /// default: only imaging rounds are skipped.
    pub skip_sparse_pre_seq: bool,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            neighbour_distance_3d: 5.0,
            neighbour_distance_2d: 3.0,
            min_spots: 100,
            min_matches: 10,
            mse_tolerance: 1e-6,
            robust: true,
            robust_residual_floor: 1.0,
            coarse_search_radius: Some(10.0),
            skip_sparse_pre_seq: false,
        }
    }
}

impl IcpConfig {
    pub fn distance_threshold(&self, dimensionality: Dimensionality) -> f64 {
        match dimensionality {
            Dimensionality::Two => self.neighbour_distance_2d,
            Dimensionality::Three => self.neighbour_distance_3d,
        }
    }

    pub fn validate(&self) {
        assert!(self.max_iterations > 0, "ICP max_iterations must be positive");
        assert!(
            self.neighbour_distance_3d > 0.0 && self.neighbour_distance_2d > 0.0,
            "ICP neighbour distances must be positive, got {} / {}",
            self.neighbour_distance_3d,
            self.neighbour_distance_2d
        );
        assert!(
            self.min_matches >= 4,
            "ICP min_matches must be at least 4 for an affine fit, got {}",
            self.min_matches
        );
        assert!(
            self.mse_tolerance >= 0.0,
            "ICP mse_tolerance must be non-negative, got {}",
            self.mse_tolerance
        );
        assert!(
            self.robust_residual_floor > 0.0,
            "robust_residual_floor must be positive, got {}",
            self.robust_residual_floor
        );
        if let Some(radius) = self.coarse_search_radius {
            assert!(
                radius > 0.0,
                "ICP coarse_search_radius must be positive, got {}",
                radius
            );
        }
    }
}

// =============================================================================
// Top-level configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    pub channel: ChannelConfig,
    pub round: RoundConfig,
    pub regularize: RegularizeConfig,
    pub icp: IcpConfig,
    /// Gaussian sigma (pixels) of the per-plane pre-sequence blur.
    pub pre_seq_blur_radius: f64,
    /// Channel used for round registration. Defaults to the anchor channel.
    pub round_registration_channel: Option<usize>,
    /// Number of chunks the rounds of a tile are loaded in.
    pub round_chunks: usize,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            round: RoundConfig::default(),
            regularize: RegularizeConfig::default(),
            icp: IcpConfig::default(),
            pre_seq_blur_radius: 3.0,
            round_registration_channel: None,
            round_chunks: 2,
        }
    }
}

impl RegisterConfig {
    /// Reads a YAML or JSON config, picking the format from the extension.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let name = path.to_string_lossy();
        let format = common::FileFormat::from_file_name(&name)?;
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read config '{}'", path.display()))?;
        let config: Self = common::deserialize(&bytes, format)
            .with_context(|| format!("Failed to parse config '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Section values are asserted; invalid top-level values are returned as
    /// [`Error::InvalidConfig`].
    pub fn validate(&self) -> Result<()> {
        self.channel.validate();
        self.round.validate();
        self.regularize.validate();
        self.icp.validate();
        if !(self.pre_seq_blur_radius >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "pre_seq_blur_radius must be non-negative, got {}",
                self.pre_seq_blur_radius
            )));
        }
        if self.round_chunks == 0 {
            return Err(Error::InvalidConfig("round_chunks must be positive".to_string()));
        }
        Ok(())
    }
}
