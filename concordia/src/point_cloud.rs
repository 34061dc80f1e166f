//! Detected-spot point clouds and the flat per-tile/round/channel spot table.

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::table::TileRoundChannelTable;

/// Integer y-x-z spot coordinates with a parallel intensity per spot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    coords: Vec<[i32; 3]>,
    intensities: Vec<f32>,
}

impl PointCloud {
    pub fn new(coords: Vec<[i32; 3]>, intensities: Vec<f32>) -> Result<Self> {
        if coords.len() != intensities.len() {
            return Err(Error::ShapeMismatch {
                what: "point cloud intensities",
                expected: vec![coords.len()],
                actual: vec![intensities.len()],
            });
        }
        Ok(Self {
            coords,
            intensities,
        })
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn coords(&self) -> &[[i32; 3]] {
        &self.coords
    }

    pub fn intensities(&self) -> &[f32] {
        &self.intensities
    }

    /// Coordinates as floating-point y-x-z points.
    pub fn positions(&self) -> Vec<DVec3> {
        to_positions(&self.coords)
    }

    /// Checks that every spot lies inside a tile of `tile_shape` (y, x, z) voxels.
    pub fn check_bounds(&self, tile_shape: [usize; 3]) -> Result<()> {
        let inside = |c: &[i32; 3]| {
            c.iter()
                .zip(tile_shape)
                .all(|(&v, n)| v >= 0 && (v as usize) < n)
        };
        match self.coords.iter().find(|c| !inside(c)) {
            None => Ok(()),
            Some(c) => Err(Error::ShapeMismatch {
                what: "spot coordinate",
                expected: tile_shape.to_vec(),
                actual: c.iter().map(|&v| v.max(0) as usize).collect(),
            }),
        }
    }
}

pub(crate) fn to_positions(coords: &[[i32; 3]]) -> Vec<DVec3> {
    coords
        .iter()
        .map(|c| DVec3::new(c[0] as f64, c[1] as f64, c[2] as f64))
        .collect()
}

/// Flat spot buffer for every (tile, round, channel), ordered row-major by
/// (tile, round, channel) with `counts` giving the length of each run.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotTable {
    counts: TileRoundChannelTable<usize>,
    starts: Vec<usize>,
    coords: Vec<[i32; 3]>,
    intensities: Vec<f32>,
}

impl SpotTable {
    pub fn new(
        counts: TileRoundChannelTable<usize>,
        coords: Vec<[i32; 3]>,
        intensities: Vec<f32>,
    ) -> Result<Self> {
        let total: usize = counts.as_slice().iter().sum();
        if coords.len() != total || intensities.len() != total {
            return Err(Error::ShapeMismatch {
                what: "spot table",
                expected: vec![total, total],
                actual: vec![coords.len(), intensities.len()],
            });
        }

        let mut starts = Vec::with_capacity(counts.as_slice().len());
        let mut acc = 0;
        for &n in counts.as_slice() {
            starts.push(acc);
            acc += n;
        }

        Ok(Self {
            counts,
            starts,
            coords,
            intensities,
        })
    }

    /// Builds the table from one point cloud per (tile, round, channel), given
    /// in row-major order.
    pub fn from_clouds(shape: [usize; 3], clouds: Vec<PointCloud>) -> Result<Self> {
        let counts = clouds.iter().map(PointCloud::len).collect();
        let counts = TileRoundChannelTable::from_vec(shape, counts)?;
        let mut coords = Vec::new();
        let mut intensities = Vec::new();
        for cloud in clouds {
            coords.extend(cloud.coords);
            intensities.extend(cloud.intensities);
        }
        Self::new(counts, coords, intensities)
    }

    pub fn counts(&self) -> &TileRoundChannelTable<usize> {
        &self.counts
    }

    pub fn spot_count(&self, tile: usize, round: usize, channel: usize) -> usize {
        *self.counts.get(tile, round, channel)
    }

    /// Spots of one (tile, round, channel) as borrowed slices.
    pub fn spots(&self, tile: usize, round: usize, channel: usize) -> (&[[i32; 3]], &[f32]) {
        let offset = self.counts.offset(tile, round, channel);
        let start = self.starts[offset];
        let end = start + *self.counts.get(tile, round, channel);
        (&self.coords[start..end], &self.intensities[start..end])
    }

    pub fn point_cloud(&self, tile: usize, round: usize, channel: usize) -> PointCloud {
        let (coords, intensities) = self.spots(tile, round, channel);
        PointCloud {
            coords: coords.to_vec(),
            intensities: intensities.to_vec(),
        }
    }
}
