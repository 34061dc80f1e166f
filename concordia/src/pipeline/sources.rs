//! Collaborators the pipeline reads images and spots from.

use std::ops::Range;

use anyhow::{anyhow, bail};
use hashbrown::HashMap;

use crate::point_cloud::{PointCloud, SpotTable};
use crate::volume::Volume;

/// Which stored image of a (tile, round, channel) to access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeVariant {
    /// As acquired, before any background filtering.
    Raw,
    /// Background-filtered image used for registration and spot reading.
    Filtered,
}

/// Tile image storage.
pub trait VolumeStore {
    /// Loads a volume, restricted to the z planes in `z_range` when given.
    fn load(
        &self,
        tile: usize,
        round: usize,
        channel: usize,
        variant: VolumeVariant,
        z_range: Option<Range<usize>>,
    ) -> anyhow::Result<Volume>;

    fn save(
        &mut self,
        tile: usize,
        round: usize,
        channel: usize,
        variant: VolumeVariant,
        volume: &Volume,
    ) -> anyhow::Result<()>;
}

/// Detected spots per (tile, round, channel).
pub trait SpotProvider {
    fn spot_count(&self, tile: usize, round: usize, channel: usize) -> usize;

    fn point_cloud(&self, tile: usize, round: usize, channel: usize) -> anyhow::Result<PointCloud>;
}

/// Bead calibration images keyed by camera.
pub trait BeadSource {
    /// Bead image of `camera`, or `None` when that camera has none.
    fn bead_image(&self, camera: usize) -> anyhow::Result<Option<Volume>>;
}

impl SpotProvider for SpotTable {
    fn spot_count(&self, tile: usize, round: usize, channel: usize) -> usize {
        SpotTable::spot_count(self, tile, round, channel)
    }

    fn point_cloud(&self, tile: usize, round: usize, channel: usize) -> anyhow::Result<PointCloud> {
        Ok(SpotTable::point_cloud(self, tile, round, channel))
    }
}

type VolumeKey = (usize, usize, usize, VolumeVariant);

/// Volume store kept entirely in memory.
///
/// A filtered volume that was never stored falls back to the raw one.
#[derive(Debug, Default, Clone)]
pub struct MemoryVolumeStore {
    volumes: HashMap<VolumeKey, Volume>,
}

impl MemoryVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tile: usize, round: usize, channel: usize, variant: VolumeVariant, volume: Volume) {
        self.volumes.insert((tile, round, channel, variant), volume);
    }

    pub fn get(&self, tile: usize, round: usize, channel: usize, variant: VolumeVariant) -> Option<&Volume> {
        self.volumes.get(&(tile, round, channel, variant))
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

impl VolumeStore for MemoryVolumeStore {
    fn load(
        &self,
        tile: usize,
        round: usize,
        channel: usize,
        variant: VolumeVariant,
        z_range: Option<Range<usize>>,
    ) -> anyhow::Result<Volume> {
        let volume = self
            .get(tile, round, channel, variant)
            .or_else(|| match variant {
                VolumeVariant::Filtered => self.get(tile, round, channel, VolumeVariant::Raw),
                VolumeVariant::Raw => None,
            })
            .ok_or_else(|| {
                anyhow!(
                    "no {:?} volume for tile {}, round {}, channel {}",
                    variant,
                    tile,
                    round,
                    channel
                )
            })?;

        match z_range {
            None => Ok(volume.clone()),
            Some(range) => {
                if range.start > range.end || range.end > volume.nz() {
                    bail!("z range {:?} outside volume with {} planes", range, volume.nz());
                }
                Ok(volume.z_slice(range))
            }
        }
    }

    fn save(
        &mut self,
        tile: usize,
        round: usize,
        channel: usize,
        variant: VolumeVariant,
        volume: &Volume,
    ) -> anyhow::Result<()> {
        self.insert(tile, round, channel, variant, volume.clone());
        Ok(())
    }
}

/// Bead images held in memory.
impl BeadSource for std::collections::BTreeMap<usize, Volume> {
    fn bead_image(&self, camera: usize) -> anyhow::Result<Option<Volume>> {
        Ok(self.get(&camera).cloned())
    }
}
