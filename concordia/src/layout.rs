//! Index layout of an experiment and the physical tile grid.

use serde::{Deserialize, Serialize};

use crate::affine::{Axis, AxisOrder};
use crate::error::{Error, Result};

/// Number of spatial dimensions the engine works in. A 2-D experiment is a
/// 3-D one with the z axis collapsed to a single plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Dimensionality {
    Two,
    #[default]
    Three,
}

impl Dimensionality {
    pub fn count(self) -> usize {
        match self {
            Dimensionality::Two => 2,
            Dimensionality::Three => 3,
        }
    }

    /// Coordinate slots that are free to vary, in axis order `O`.
    pub fn active_axes<O: AxisOrder>(self) -> [bool; 3] {
        std::array::from_fn(|i| self == Dimensionality::Three || O::AXES[i] != Axis::Z)
    }
}

/// Which tiles, rounds and channels exist and which of them are used.
///
/// Round indices cover the imaging rounds, the anchor round and the optional
/// pre-sequence round in a single index space of size `n_rounds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub n_tiles: usize,
    pub n_rounds: usize,
    pub n_channels: usize,
    pub use_tiles: Vec<usize>,
    /// Imaging rounds, excluding the anchor and pre-sequence rounds.
    pub use_rounds: Vec<usize>,
    pub use_channels: Vec<usize>,
    pub anchor_round: usize,
    pub anchor_channel: usize,
    pub pre_seq_round: Option<usize>,
    /// Extra channel blurred alongside the used channels in the pre-sequence round.
    pub dapi_channel: Option<usize>,
    /// Camera id per channel. Empty means every channel shares one camera.
    pub channel_camera: Vec<usize>,
    pub dimensionality: Dimensionality,
}

impl Layout {
    /// Rounds registered against the anchor round: imaging rounds followed by
    /// the pre-sequence round, if any.
    pub fn registered_rounds(&self) -> Vec<usize> {
        let mut rounds = self.use_rounds.clone();
        rounds.extend(self.pre_seq_round);
        rounds
    }

    pub fn is_pre_seq(&self, round: usize) -> bool {
        self.pre_seq_round == Some(round)
    }

    pub fn camera_of(&self, channel: usize) -> usize {
        self.channel_camera.get(channel).copied().unwrap_or(0)
    }

    /// Distinct cameras in ascending order.
    pub fn cameras(&self) -> Vec<usize> {
        let mut cameras: Vec<usize> = if self.channel_camera.is_empty() {
            vec![0]
        } else {
            self.channel_camera.clone()
        };
        cameras.sort_unstable();
        cameras.dedup();
        cameras
    }

    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, msg: String| if ok { Ok(()) } else { Err(Error::InvalidLayout(msg)) };

        check(self.n_tiles > 0, "n_tiles must be positive".to_string())?;
        check(self.n_channels > 0, "n_channels must be positive".to_string())?;
        for &t in &self.use_tiles {
            check(t < self.n_tiles, format!("tile {} out of range {}", t, self.n_tiles))?;
        }
        for &r in self.use_rounds.iter().chain([&self.anchor_round]) {
            check(r < self.n_rounds, format!("round {} out of range {}", r, self.n_rounds))?;
        }
        if let Some(pre_seq) = self.pre_seq_round {
            check(
                pre_seq < self.n_rounds && pre_seq != self.anchor_round,
                format!("invalid pre-sequence round {}", pre_seq),
            )?;
            check(
                !self.use_rounds.contains(&pre_seq),
                format!("pre-sequence round {} listed as imaging round", pre_seq),
            )?;
        }
        check(
            !self.use_rounds.contains(&self.anchor_round),
            format!("anchor round {} listed as imaging round", self.anchor_round),
        )?;
        for &c in self
            .use_channels
            .iter()
            .chain([&self.anchor_channel])
            .chain(self.dapi_channel.as_ref())
        {
            check(c < self.n_channels, format!("channel {} out of range {}", c, self.n_channels))?;
        }
        check(
            self.channel_camera.is_empty() || self.channel_camera.len() == self.n_channels,
            format!(
                "channel_camera has {} entries for {} channels",
                self.channel_camera.len(),
                self.n_channels
            ),
        )?;
        Ok(())
    }
}

/// Physical arrangement of tiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileGrid {
    /// (row, col) of each tile.
    pub positions: Vec<[usize; 2]>,
    /// Global y-x-z offset of each tile's first voxel.
    pub origins: Vec<[f64; 3]>,
}

impl TileGrid {
    /// Regular grid with `n_rows × n_cols` tiles of `tile_size` (y, x) voxels and
    /// the given fractional overlap. Tiles are numbered row-major.
    pub fn regular(n_rows: usize, n_cols: usize, tile_size: [usize; 2], overlap: f64) -> Self {
        let step_y = tile_size[0] as f64 * (1.0 - overlap);
        let step_x = tile_size[1] as f64 * (1.0 - overlap);
        let mut positions = Vec::with_capacity(n_rows * n_cols);
        let mut origins = Vec::with_capacity(n_rows * n_cols);
        for row in 0..n_rows {
            for col in 0..n_cols {
                positions.push([row, col]);
                origins.push([row as f64 * step_y, col as f64 * step_x, 0.0]);
            }
        }
        Self { positions, origins }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn validate(&self, layout: &Layout) -> Result<()> {
        if self.positions.len() != layout.n_tiles || self.origins.len() != layout.n_tiles {
            return Err(Error::ShapeMismatch {
                what: "tile grid",
                expected: vec![layout.n_tiles, layout.n_tiles],
                actual: vec![self.positions.len(), self.origins.len()],
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::{Yxz, Zyx};

    fn layout() -> Layout {
        Layout {
            n_tiles: 2,
            n_rounds: 5,
            n_channels: 3,
            use_tiles: vec![0, 1],
            use_rounds: vec![0, 1, 2],
            use_channels: vec![0, 1, 2],
            anchor_round: 3,
            anchor_channel: 0,
            pre_seq_round: Some(4),
            dapi_channel: None,
            channel_camera: vec![1, 1, 2],
            dimensionality: Dimensionality::Three,
        }
    }

    #[test]
    fn test_registered_rounds_include_pre_seq() {
        assert_eq!(layout().registered_rounds(), vec![0, 1, 2, 4]);
    }

    #[test]
    fn test_cameras_sorted_unique() {
        let layout = layout();
        assert_eq!(layout.cameras(), vec![1, 2]);
        assert_eq!(layout.camera_of(2), 2);
    }

    #[test]
    fn test_validate_rejects_anchor_in_imaging_rounds() {
        let mut layout = layout();
        layout.use_rounds.push(3);
        assert!(matches!(layout.validate(), Err(Error::InvalidLayout(_))));
    }

    #[test]
    fn test_validate_rejects_bad_camera_table() {
        let mut layout = layout();
        layout.channel_camera = vec![0];
        assert!(layout.validate().is_err());
        layout.channel_camera.clear();
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_active_axes_2d() {
        assert_eq!(Dimensionality::Two.active_axes::<Zyx>(), [false, true, true]);
        assert_eq!(Dimensionality::Two.active_axes::<Yxz>(), [true, true, false]);
        assert_eq!(Dimensionality::Three.active_axes::<Yxz>(), [true, true, true]);
    }

    #[test]
    fn test_regular_grid_origins() {
        let grid = TileGrid::regular(2, 3, [100, 200], 0.1);
        assert_eq!(grid.len(), 6);
        assert_eq!(grid.positions[4], [1, 1]);
        assert!((grid.origins[4][0] - 90.0).abs() < 1e-12);
        assert!((grid.origins[4][1] - 180.0).abs() < 1e-12);
    }
}
