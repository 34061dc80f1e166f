//! Dense per-index tables.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Values indexed by (tile, round).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRoundTable<T> {
    shape: [usize; 2],
    data: Vec<T>,
}

impl<T: Clone> TileRoundTable<T> {
    pub fn filled(n_tiles: usize, n_rounds: usize, value: T) -> Self {
        Self {
            shape: [n_tiles, n_rounds],
            data: vec![value; n_tiles * n_rounds],
        }
    }
}

impl<T> TileRoundTable<T> {
    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    fn offset(&self, tile: usize, round: usize) -> usize {
        assert!(
            tile < self.shape[0] && round < self.shape[1],
            "index ({}, {}) out of bounds for table of shape {:?}",
            tile,
            round,
            self.shape
        );
        tile * self.shape[1] + round
    }

    pub fn get(&self, tile: usize, round: usize) -> &T {
        &self.data[self.offset(tile, round)]
    }

    pub fn get_mut(&mut self, tile: usize, round: usize) -> &mut T {
        let offset = self.offset(tile, round);
        &mut self.data[offset]
    }

    pub fn set(&mut self, tile: usize, round: usize, value: T) {
        *self.get_mut(tile, round) = value;
    }

    /// Checks the table shape and that the storage matches it.
    pub fn check_shape(&self, what: &'static str, expected: [usize; 2]) -> Result<()> {
        if self.shape != expected || self.data.len() != expected[0] * expected[1] {
            return Err(Error::ShapeMismatch {
                what,
                expected: expected.to_vec(),
                actual: vec![self.shape[0], self.shape[1], self.data.len()],
            });
        }
        Ok(())
    }
}

/// Values indexed by (tile, round, channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRoundChannelTable<T> {
    shape: [usize; 3],
    data: Vec<T>,
}

impl<T: Clone> TileRoundChannelTable<T> {
    pub fn filled(n_tiles: usize, n_rounds: usize, n_channels: usize, value: T) -> Self {
        Self {
            shape: [n_tiles, n_rounds, n_channels],
            data: vec![value; n_tiles * n_rounds * n_channels],
        }
    }
}

impl<T> TileRoundChannelTable<T> {
    /// Wraps row-major (tile, round, channel) data.
    pub fn from_vec(shape: [usize; 3], data: Vec<T>) -> Result<Self> {
        if data.len() != shape.iter().product::<usize>() {
            return Err(Error::ShapeMismatch {
                what: "tile/round/channel table",
                expected: shape.to_vec(),
                actual: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Row-major position of (tile, round, channel).
    pub fn offset(&self, tile: usize, round: usize, channel: usize) -> usize {
        assert!(
            tile < self.shape[0] && round < self.shape[1] && channel < self.shape[2],
            "index ({}, {}, {}) out of bounds for table of shape {:?}",
            tile,
            round,
            channel,
            self.shape
        );
        (tile * self.shape[1] + round) * self.shape[2] + channel
    }

    pub fn get(&self, tile: usize, round: usize, channel: usize) -> &T {
        &self.data[self.offset(tile, round, channel)]
    }

    pub fn get_mut(&mut self, tile: usize, round: usize, channel: usize) -> &mut T {
        let offset = self.offset(tile, round, channel);
        &mut self.data[offset]
    }

    pub fn set(&mut self, tile: usize, round: usize, channel: usize, value: T) {
        *self.get_mut(tile, round, channel) = value;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn check_shape(&self, what: &'static str, expected: [usize; 3]) -> Result<()> {
        if self.shape != expected || self.data.len() != expected.iter().product::<usize>() {
            return Err(Error::ShapeMismatch {
                what,
                expected: expected.to_vec(),
                actual: vec![self.shape[0], self.shape[1], self.shape[2], self.data.len()],
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_round_indexing() {
        let mut table = TileRoundTable::filled(2, 3, 0usize);
        table.set(1, 2, 7);
        assert_eq!(*table.get(1, 2), 7);
        assert_eq!(*table.get(0, 2), 0);
        assert!(table.check_shape("t", [2, 3]).is_ok());
        assert!(table.check_shape("t", [3, 2]).is_err());
    }

    #[test]
    fn test_tile_round_channel_offsets_are_row_major() {
        let table = TileRoundChannelTable::from_vec([2, 2, 3], (0..12).collect()).unwrap();
        assert_eq!(*table.get(0, 0, 2), 2);
        assert_eq!(*table.get(0, 1, 0), 3);
        assert_eq!(*table.get(1, 0, 0), 6);
        assert_eq!(*table.get(1, 1, 2), 11);
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        let result = TileRoundChannelTable::from_vec([2, 2, 2], vec![0u8; 7]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_panics() {
        let table = TileRoundTable::filled(1, 1, 0u8);
        table.get(0, 1);
    }
}
