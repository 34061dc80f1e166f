//! Registration state and its checkpoint store.
//!
//! [`RegistrationState`] is the single accumulator every stage writes into.
//! It is passed explicitly through the pipeline and persisted with
//! [`CheckpointStore::persist`], which replaces the checkpoint file
//! atomically. Loading a checkpoint that cannot be parsed or does not match
//! the experiment layout is a fatal error.


use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use common::FileFormat;
use serde::{Deserialize, Serialize};

use crate::affine::{Affine, Yxz};
use crate::channel::ChannelRegistration;
use crate::error::{Error, Result};
use crate::icp::IcpResult;
use crate::layout::Layout;
use crate::round::RoundEntry;
use crate::table::{TileRoundChannelTable, TileRoundTable};

/// Bumped whenever the persisted layout changes incompatibly.
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationState {
    pub version: u32,
    /// (tiles, rounds, channels) the state was created for.
    pub shape: [usize; 3],
    pub channel: Option<ChannelRegistration>,
    pub rounds: TileRoundTable<Option<RoundEntry>>,
    /// Tiles whose rounds have all been registered and committed.
    pub tiles_completed: BTreeSet<usize>,
    pub regularized: bool,
    pub initial: TileRoundChannelTable<Option<Affine<Yxz>>>,
    pub icp: TileRoundChannelTable<Option<IcpResult>>,
    /// Tiles whose ICP results have all been committed.
    pub icp_tiles_completed: BTreeSet<usize>,
    /// Whether the pre-sequence blur has been written.
    pub blur: bool,
    /// z-y-x shape of the registered volumes, known once a tile's rounds
    /// have been registered.
    #[serde(default)]
    pub volume_shape: Option<[usize; 3]>,
}

impl RegistrationState {
    pub fn new(layout: &Layout) -> Self {
        let (t, r, c) = (layout.n_tiles, layout.n_rounds, layout.n_channels);
        Self {
            version: STATE_VERSION,
            shape: [t, r, c],
            channel: None,
            rounds: TileRoundTable::filled(t, r, None),
            tiles_completed: BTreeSet::new(),
            regularized: false,
            initial: TileRoundChannelTable::filled(t, r, c, None),
            icp: TileRoundChannelTable::filled(t, r, c, None),
            icp_tiles_completed: BTreeSet::new(),
            blur: false,
            volume_shape: None,
        }
    }

    /// Checks that every table matches `layout`.
    pub fn check_layout(&self, layout: &Layout) -> Result<()> {
        let shape = [layout.n_tiles, layout.n_rounds, layout.n_channels];
        if self.shape != shape {
            return Err(Error::ShapeMismatch {
                what: "registration state",
                expected: shape.to_vec(),
                actual: self.shape.to_vec(),
            });
        }
        self.rounds.check_shape("round transform table", [shape[0], shape[1]])?;
        self.initial.check_shape("initial transform table", shape)?;
        self.icp.check_shape("ICP result table", shape)?;
        if let Some(&tile) = self
            .tiles_completed
            .iter()
            .chain(&self.icp_tiles_completed)
            .find(|&&t| t >= layout.n_tiles)
        {
            return Err(Error::ShapeMismatch {
                what: "completed tile index",
                expected: vec![layout.n_tiles],
                actual: vec![tile],
            });
        }
        Ok(())
    }

    /// Used tiles still lacking round registration, in layout order.
    pub fn remaining_round_tiles(&self, layout: &Layout) -> Vec<usize> {
        layout
            .use_tiles
            .iter()
            .copied()
            .filter(|t| !self.tiles_completed.contains(t))
            .collect()
    }

    /// (tile, round, channel) triples still lacking an ICP result.
    pub fn remaining_icp(&self, layout: &Layout) -> Vec<(usize, usize, usize)> {
        let mut remaining = Vec::new();
        for &t in &layout.use_tiles {
            for r in layout.registered_rounds() {
                for &c in &layout.use_channels {
                    if self.icp.get(t, r, c).is_none() {
                        remaining.push((t, r, c));
                    }
                }
            }
        }
        remaining
    }

    /// Writes all round results of `tile`, plus the identity entry of the
    /// anchor round, and marks the tile completed.
    pub fn commit_tile_rounds(
        &mut self,
        layout: &Layout,
        tile: usize,
        entries: Vec<(usize, RoundEntry)>,
    ) {
        self.rounds.set(tile, layout.anchor_round, Some(RoundEntry::identity()));
        for (round, entry) in entries {
            self.rounds.set(tile, round, Some(entry));
        }
        self.tiles_completed.insert(tile);
    }

    /// Writes all ICP results of `tile` and marks its ICP completed.
    pub fn commit_tile_icp(&mut self, tile: usize, results: Vec<((usize, usize), IcpResult)>) {
        for ((round, channel), result) in results {
            self.icp.set(tile, round, channel, Some(result));
        }
        self.icp_tiles_completed.insert(tile);
    }

    /// Transform taking anchor-frame spot positions of `tile` into
    /// (`round`, `channel`).
    ///
    /// The anchor round's anchor channel is the identity and its other
    /// channels use their channel transform; every other round uses the ICP
    /// result.
    pub fn final_transform(
        &self,
        layout: &Layout,
        tile: usize,
        round: usize,
        channel: usize,
    ) -> Result<Affine<Yxz>> {
        if round == layout.anchor_round {
            if channel == layout.anchor_channel {
                return Ok(Affine::identity());
            }
            return self
                .channel
                .as_ref()
                .and_then(|c| c.transform(channel))
                .map(|t| t.to_yxz())
                .ok_or(Error::MissingEntry {
                    what: "channel transform",
                    tile,
                    round,
                });
        }
        self.icp
            .get(tile, round, channel)
            .as_ref()
            .map(|result| result.transform)
            .ok_or(Error::MissingEntry {
                what: "ICP result",
                tile,
                round,
            })
    }
}

/// File-backed persistence of a [`RegistrationState`].
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    format: FileFormat,
}

impl CheckpointStore {
    /// Store at `path`; the format (JSON or YAML) follows the extension.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let format = FileFormat::from_file_name(&path.to_string_lossy()).map_err(|e| {
            Error::CheckpointIo {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
            }
        })?;
        Ok(Self { path, format })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the checkpoint, or creates a fresh state when none exists.
    pub fn load_or_init(&self, layout: &Layout) -> Result<RegistrationState> {
        if !self.path.exists() {
            log::info!(
                "No checkpoint at '{}'; starting from an empty state",
                self.path.display()
            );
            return Ok(RegistrationState::new(layout));
        }

        let bytes = std::fs::read(&self.path).map_err(|source| Error::CheckpointIo {
            path: self.path.clone(),
            source,
        })?;
        let state: RegistrationState =
            common::deserialize(&bytes, self.format).map_err(|e| self.corrupt(format!("{:#}", e)))?;
        if state.version != STATE_VERSION {
            return Err(self.corrupt(format!(
                "version {} does not match {}",
                state.version, STATE_VERSION
            )));
        }
        state
            .check_layout(layout)
            .map_err(|e| self.corrupt(e.to_string()))?;

        log::info!(
            "Loaded checkpoint '{}': {} tiles round-registered, {} tiles refined",
            self.path.display(),
            state.tiles_completed.len(),
            state.icp_tiles_completed.len()
        );
        Ok(state)
    }

    /// Replaces the checkpoint with `state`.
    pub fn persist(&self, state: &RegistrationState) -> Result<()> {
        let text = common::serialize(state, self.format).map_err(|e| Error::CheckpointIo {
            path: self.path.clone(),
            source: io::Error::other(e.to_string()),
        })?;
        common::file_utils::write_atomic(&self.path, text.as_bytes()).map_err(|source| {
            Error::CheckpointIo {
                path: self.path.clone(),
                source,
            }
        })?;
        log::debug!("Persisted checkpoint '{}'", self.path.display());
        Ok(())
    }

    fn corrupt(&self, reason: String) -> Error {
        Error::CorruptCheckpoint {
            path: self.path.clone(),
            reason,
        }
    }
}
