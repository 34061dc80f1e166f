//! Concordia - registration of multi-round, multi-channel microscopy tiles.
//!
//! Every tile of an experiment is imaged over several rounds, each with
//! several channels. This crate estimates the affine transforms that bring
//! all of them into the frame of the anchor round:
//! - Channel registration from bead calibration images
//! - Round registration by subvolume phase correlation
//! - Regularization of round transforms across the tile grid
//! - ICP refinement on detected spots
//!
//! Results accumulate in a checkpointed [`RegistrationState`] so an
//! interrupted run resumes where it stopped.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use concordia::{CheckpointStore, Pipeline, RegisterConfig};
//!
//! let config = RegisterConfig::load(Path::new("register.yaml"))?;
//! let store = CheckpointStore::new("output/registration.json")?;
//! let mut state = store.load_or_init(&layout)?;
//!
//! Pipeline::new(&layout, &grid, &config, &mut volumes, &spots, &beads)
//!     .run(&mut state, &store)?;
//!
//! let transform = state.final_transform(&layout, tile, round, channel)?;
//! ```

pub mod affine;
pub mod blur;
pub mod channel;
pub mod compose;
pub mod config;
pub mod error;
pub mod icp;
pub mod layout;
pub(crate) mod math;
pub mod phase_correlation;
pub mod pipeline;
pub mod point_cloud;
pub mod regularize;
pub mod round;
pub(crate) mod spatial;
pub mod state;
pub mod table;
pub mod volume;

#[cfg(test)]
mod testing;

// ============================================================================
// Core types
// ============================================================================

pub use affine::{reorder_point, Affine, AxisOrder, Yxz, Zyx};
pub use error::{Error, Result};
pub use layout::{Dimensionality, Layout, TileGrid};
pub use point_cloud::{PointCloud, SpotTable};
pub use table::{TileRoundChannelTable, TileRoundTable};
pub use volume::Volume;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{ChannelConfig, IcpConfig, RegisterConfig, RegularizeConfig, RoundConfig};

// ============================================================================
// Registration stages
// ============================================================================

pub use blur::gaussian_blur_planes;
pub use channel::{
    detect_beads, register_channels, Bead, CameraRegistration, ChannelRegistration, ChannelStatus,
};
pub use compose::{compose, compose_initial};
pub use icp::{icp, IcpIteration, IcpPhase, IcpResult, IcpRun, IcpStatus};
pub use phase_correlation::{PhaseCorrelator, ShiftEstimate};
pub use regularize::{regularize, OutlierReason, OutlierReport};
pub use round::{FitStatus, RoundEntry, RoundFit, RoundRegistrator, SubvolumeShift};

// ============================================================================
// State and pipeline
// ============================================================================

pub use pipeline::{
    BeadSource, MemoryVolumeStore, Pipeline, SpotProvider, VolumeStore, VolumeVariant,
};
pub use state::{CheckpointStore, RegistrationState, STATE_VERSION};
