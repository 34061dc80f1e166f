//! End-to-end registration run over all tiles.
//!
//! Stages, each skipped when the state shows it already ran:
//!
//! 1. Channel registration from bead images.
//! 2. Round registration, tile by tile, committing and persisting each tile.
//! 3. Regularization of the round transforms across the tile grid.
//! 4. Composition of channel and round transforms into initial guesses.
//! 5. ICP refinement, tile by tile, persisting each tile.
//! 6. Pre-sequence background blur.
//!
//! A run interrupted at any point can be restarted with the persisted state;
//! work already recorded there is never redone.

#[cfg(test)]
mod tests;

pub mod sources;

use std::collections::BTreeMap;

use glam::DVec3;

use crate::blur::gaussian_blur_planes;
use crate::channel::register_channels;
use crate::compose::compose_initial;
use crate::config::RegisterConfig;
use crate::error::{Error, Result};
use crate::icp::{icp, IcpResult, IcpStatus};
use crate::layout::{Layout, TileGrid};
use crate::point_cloud::PointCloud;
use crate::regularize::regularize;
use crate::round::{FitStatus, RoundEntry, RoundRegistrator};
use crate::state::{CheckpointStore, RegistrationState};

pub use sources::{BeadSource, MemoryVolumeStore, SpotProvider, VolumeStore, VolumeVariant};

/// Drives every registration stage against external collaborators.
pub struct Pipeline<'a, V, S, B> {
    layout: &'a Layout,
    grid: &'a TileGrid,
    config: &'a RegisterConfig,
    volumes: &'a mut V,
    spots: &'a S,
    beads: &'a B,
}

impl<'a, V, S, B> Pipeline<'a, V, S, B>
where
    V: VolumeStore,
    S: SpotProvider,
    B: BeadSource,
{
    pub fn new(
        layout: &'a Layout,
        grid: &'a TileGrid,
        config: &'a RegisterConfig,
        volumes: &'a mut V,
        spots: &'a S,
        beads: &'a B,
    ) -> Self {
        Self {
            layout,
            grid,
            config,
            volumes,
            spots,
            beads,
        }
    }

    /// Runs all outstanding stages, persisting `state` through `store` after
    /// every tile and every stage.
    pub fn run(&mut self, state: &mut RegistrationState, store: &CheckpointStore) -> Result<()> {
        self.config.validate()?;
        self.layout.validate()?;
        self.grid.validate(self.layout)?;
        state.check_layout(self.layout)?;

        self.register_channels(state, store)?;
        self.register_rounds(state, store)?;
        self.regularize(state, store)?;
        self.compose(state, store)?;
        self.refine(state, store)?;
        self.blur_pre_seq(state, store)?;

        log::info!("Registration complete for {} tiles", self.layout.use_tiles.len());
        Ok(())
    }

    fn register_channels(&self, state: &mut RegistrationState, store: &CheckpointStore) -> Result<()> {
        if state.channel.as_ref().is_some_and(|c| c.is_computed()) {
            log::info!("Channel registration already computed; skipping");
            return Ok(());
        }

        log::info!("Registering {} cameras from bead images", self.layout.cameras().len());
        let mut images = BTreeMap::new();
        for camera in self.layout.cameras() {
            if let Some(image) = self.beads.bead_image(camera)? {
                images.insert(camera, image);
            }
        }
        state.channel = Some(register_channels(&images, self.layout, &self.config.channel));
        store.persist(state)
    }

    fn register_rounds(&mut self, state: &mut RegistrationState, store: &CheckpointStore) -> Result<()> {
        let remaining = state.remaining_round_tiles(self.layout);
        if remaining.is_empty() {
            log::info!("Round registration already complete; skipping");
            return Ok(());
        }

        log::info!("Registering rounds for {} tiles", remaining.len());
        let channel = self
            .config
            .round_registration_channel
            .unwrap_or(self.layout.anchor_channel);
        let mut registrator: Option<RoundRegistrator> = None;

        for tile in remaining {
            let entries = self.register_tile_rounds(tile, channel, &mut registrator)?;
            state.commit_tile_rounds(self.layout, tile, entries);
            state.volume_shape = registrator.as_ref().map(RoundRegistrator::volume_shape);
            store.persist(state)?;
            log::info!("Tile {}: rounds registered", tile);
        }
        Ok(())
    }

    /// Registers every registered round of `tile`, loading rounds in chunks.
    fn register_tile_rounds(
        &self,
        tile: usize,
        channel: usize,
        registrator: &mut Option<RoundRegistrator>,
    ) -> Result<Vec<(usize, RoundEntry)>> {
        let anchor = self.volumes.load(
            tile,
            self.layout.anchor_round,
            channel,
            VolumeVariant::Filtered,
            None,
        )?;
        if registrator
            .as_ref()
            .is_some_and(|r| r.volume_shape() != anchor.shape())
        {
            *registrator = None;
        }
        let registrator = registrator.get_or_insert_with(|| {
            RoundRegistrator::new(anchor.shape(), self.config.round.clone(), self.layout.dimensionality)
        });

        let rounds = self.layout.registered_rounds();
        let chunk_len = rounds.len().div_ceil(self.config.round_chunks).max(1);
        let mut entries = Vec::with_capacity(rounds.len());
        for chunk in rounds.chunks(chunk_len) {
            let mut volumes = Vec::with_capacity(chunk.len());
            for &round in chunk {
                let variant = if self.layout.is_pre_seq(round) {
                    VolumeVariant::Raw
                } else {
                    VolumeVariant::Filtered
                };
                volumes.push(self.volumes.load(tile, round, channel, variant, None)?);
            }

            for (&round, volume) in chunk.iter().zip(&volumes) {
                let fit = registrator.register(&anchor, volume)?;
                log::debug!(
                    "Tile {}, round {}: {:?}, {} of {} subvolumes accepted, quality {:.3}, transform {}",
                    tile,
                    round,
                    fit.status,
                    fit.accepted_count(),
                    fit.subvolumes.len(),
                    fit.quality,
                    fit.transform
                );
                if fit.status != FitStatus::Affine {
                    log::warn!(
                        "Tile {}, round {}, channel {}: round fit {:?} with {} accepted subvolumes",
                        tile,
                        round,
                        channel,
                        fit.status,
                        fit.accepted_count()
                    );
                }
                entries.push((round, RoundEntry::from(fit)));
            }
        }
        Ok(entries)
    }

    fn regularize(&self, state: &mut RegistrationState, store: &CheckpointStore) -> Result<()> {
        if state.regularized {
            log::info!("Round transforms already regularized; skipping");
            return Ok(());
        }

        let reports = regularize(&mut state.rounds, self.layout, self.grid, &self.config.regularize)?;
        log::info!("Regularization replaced {} round transforms", reports.len());
        state.regularized = true;
        store.persist(state)
    }

    fn compose(&self, state: &mut RegistrationState, store: &CheckpointStore) -> Result<()> {
        if state.initial.as_slice().iter().any(Option::is_some) {
            log::info!("Initial transforms already composed; skipping");
            return Ok(());
        }

        let channel = state
            .channel
            .as_ref()
            .ok_or(Error::MissingStage("channel registration"))?;
        state.initial = compose_initial(channel, &state.rounds, self.layout)?;
        store.persist(state)
    }

    fn refine(&self, state: &mut RegistrationState, store: &CheckpointStore) -> Result<()> {
        let mut by_tile: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        for (tile, round, channel) in state.remaining_icp(self.layout) {
            by_tile.entry(tile).or_default().push((round, channel));
        }
        if by_tile.is_empty() {
            log::info!("ICP already complete; skipping");
            return Ok(());
        }

        log::info!("Refining {} tiles with ICP", by_tile.len());
        for (tile, pending) in by_tile {
            let reference = self
                .spots
                .point_cloud(tile, self.layout.anchor_round, self.layout.anchor_channel)?;
            check_spot_bounds(state, &reference)?;
            let reference = reference.positions();

            let mut results = Vec::with_capacity(pending.len());
            for (round, channel) in pending {
                let result = self.refine_one(state, &reference, tile, round, channel)?;
                results.push(((round, channel), result));
            }
            state.commit_tile_icp(tile, results);
            store.persist(state)?;
            log::info!("Tile {}: ICP complete", tile);
        }
        Ok(())
    }

    fn refine_one(
        &self,
        state: &RegistrationState,
        reference: &[DVec3],
        tile: usize,
        round: usize,
        channel: usize,
    ) -> Result<IcpResult> {
        let initial = (*state.initial.get(tile, round, channel)).ok_or(Error::MissingEntry {
            what: "initial transform",
            tile,
            round,
        })?;

        let n_spots = self.spots.spot_count(tile, round, channel);
        let sparse = n_spots < self.config.icp.min_spots;
        if sparse && (!self.layout.is_pre_seq(round) || self.config.icp.skip_sparse_pre_seq) {
            log::warn!(
                "Tile {}, round {}, channel {}: ICP skipped, only {} spots (need {})",
                tile,
                round,
                channel,
                n_spots,
                self.config.icp.min_spots
            );
            return Ok(IcpResult::skipped(initial));
        }

        let target = self.spots.point_cloud(tile, round, channel)?;
        check_spot_bounds(state, &target)?;
        let target = target.positions();
        let dimensionality = self.layout.dimensionality;
        let result = icp(
            reference,
            &target,
            initial,
            self.config.icp.distance_threshold(dimensionality),
            dimensionality,
            &self.config.icp,
        );

        match result.status {
            IcpStatus::Converged => log::debug!(
                "Tile {}, round {}, channel {}: converged after {} iterations, {:?} matches",
                tile,
                round,
                channel,
                result.iterations.len(),
                result.final_matches()
            ),
            IcpStatus::Exhausted => log::warn!(
                "Tile {}, round {}, channel {}: ICP did not converge in {} iterations",
                tile,
                round,
                channel,
                result.iterations.len()
            ),
            IcpStatus::Degenerate => log::warn!(
                "Tile {}, round {}, channel {}: ICP found {:?} matches (need {}); kept previous transform",
                tile,
                round,
                channel,
                result.final_matches(),
                self.config.icp.min_matches
            ),
            IcpStatus::Skipped => {}
        }
        Ok(result)
    }

    fn blur_pre_seq(&mut self, state: &mut RegistrationState, store: &CheckpointStore) -> Result<()> {
        let Some(round) = self.layout.pre_seq_round else {
            return Ok(());
        };
        if state.blur {
            log::info!("Pre-sequence round already blurred; skipping");
            return Ok(());
        }
        if self.config.pre_seq_blur_radius == 0.0 {
            log::info!("Pre-sequence blur radius is zero; skipping blur");
            return Ok(());
        }

        let mut channels = self.layout.use_channels.clone();
        channels.extend(self.layout.dapi_channel);
        channels.sort_unstable();
        channels.dedup();

        log::info!(
            "Blurring pre-sequence round {} with sigma {}",
            round,
            self.config.pre_seq_blur_radius
        );
        for &tile in &self.layout.use_tiles {
            for &channel in &channels {
                let raw = self.volumes.load(tile, round, channel, VolumeVariant::Raw, None)?;
                let blurred = gaussian_blur_planes(&raw, self.config.pre_seq_blur_radius);
                self.volumes
                    .save(tile, round, channel, VolumeVariant::Filtered, &blurred)?;
            }
        }
        state.blur = true;
        store.persist(state)
    }
}

/// Rejects spots outside the registered volumes. Unchecked until a volume
/// shape is known.
fn check_spot_bounds(state: &RegistrationState, cloud: &PointCloud) -> Result<()> {
    match state.volume_shape {
        Some([nz, ny, nx]) => cloud.check_bounds([ny, nx, nz]),
        None => Ok(()),
    }
}
