//! Dense 3-D intensity volume in z-y-x order.

use std::ops::Range;

use crate::error::{Error, Result};

/// 3-D image stored z-major (`index = (z * ny + y) * nx + x`).
///
/// A 2-D image is a volume with a single z plane.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    shape: [usize; 3],
    data: Vec<f32>,
}

impl Volume {
    pub fn new(shape: [usize; 3], data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.iter().product::<usize>() {
            return Err(Error::ShapeMismatch {
                what: "volume",
                expected: shape.to_vec(),
                actual: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: [usize; 3]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }

    /// Converts stored pixel values, which carry an additive `offset` so that
    /// zero signal maps to `offset`, back to signed intensities.
    pub fn from_raw(raw: &[u16], shape: [usize; 3], offset: u16) -> Result<Self> {
        let data = raw.iter().map(|&v| v as f32 - offset as f32).collect();
        Self::new(shape, data)
    }

    /// Inverse of [`Volume::from_raw`], rounding and clamping to the `u16` range.
    pub fn to_raw(&self, offset: u16) -> Vec<u16> {
        self.data
            .iter()
            .map(|&v| (v + offset as f32).round().clamp(0.0, u16::MAX as f32) as u16)
            .collect()
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn nz(&self) -> usize {
        self.shape[0]
    }

    pub fn ny(&self) -> usize {
        self.shape[1]
    }

    pub fn nx(&self) -> usize {
        self.shape[2]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn index(&self, z: usize, y: usize, x: usize) -> usize {
        (z * self.shape[1] + y) * self.shape[2] + x
    }

    #[inline]
    pub fn get(&self, z: usize, y: usize, x: usize) -> f32 {
        self.data[self.index(z, y, x)]
    }

    #[inline]
    pub fn set(&mut self, z: usize, y: usize, x: usize, value: f32) {
        let idx = self.index(z, y, x);
        self.data[idx] = value;
    }

    /// Copies the box starting at `start` with extent `size`.
    ///
    /// Panics if the box leaves the volume.
    pub fn subvolume(&self, start: [usize; 3], size: [usize; 3]) -> Volume {
        for axis in 0..3 {
            assert!(
                start[axis] + size[axis] <= self.shape[axis],
                "subvolume {:?}+{:?} exceeds volume {:?}",
                start,
                size,
                self.shape
            );
        }

        let mut data = Vec::with_capacity(size.iter().product());
        for z in start[0]..start[0] + size[0] {
            for y in start[1]..start[1] + size[1] {
                let row = self.index(z, y, start[2]);
                data.extend_from_slice(&self.data[row..row + size[2]]);
            }
        }
        Volume { shape: size, data }
    }

    /// Planes `range` of the volume.
    pub fn z_slice(&self, range: Range<usize>) -> Volume {
        let size = [range.len(), self.shape[1], self.shape[2]];
        self.subvolume([range.start, 0, 0], size)
    }

    pub fn plane(&self, z: usize) -> &[f32] {
        let plane = self.shape[1] * self.shape[2];
        &self.data[z * plane..(z + 1) * plane]
    }

    pub fn plane_mut(&mut self, z: usize) -> &mut [f32] {
        let plane = self.shape[1] * self.shape[2];
        &mut self.data[z * plane..(z + 1) * plane]
    }

    /// Maximum intensity projection along z.
    pub fn max_projection(&self) -> Volume {
        let plane = self.shape[1] * self.shape[2];
        let mut data = vec![f32::NEG_INFINITY; plane];
        for z in 0..self.shape[0] {
            for (out, &v) in data.iter_mut().zip(self.plane(z)) {
                *out = out.max(v);
            }
        }
        if self.shape[0] == 0 {
            data.fill(0.0);
        }
        Volume {
            shape: [1, self.shape[1], self.shape[2]],
            data,
        }
    }
}
