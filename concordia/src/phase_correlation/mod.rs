//! Phase correlation for translation estimation between volumes.
//!
//! Shifts are estimated by:
//! 1. Windowing both volumes (Hann, per axis) after removing the mean
//! 2. Computing the N-D FFT of both
//! 3. Normalizing the cross-power spectrum to unit magnitude
//! 4. Locating the peak of its inverse FFT
//! 5. Refining each axis with a Gaussian fit through the overlap correlation
//!    at the integer shift and its two neighbours
//!
//! Axes of length one are left untouched, so a single-plane volume gives a
//! 2-D correlation with no special casing.


use std::sync::Arc;

use glam::DVec3;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::volume::Volume;

/// Variance below which a patch is treated as flat.
const MIN_VARIANCE: f64 = 1e-12;

/// Result of correlating two equally sized volumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShiftEstimate {
    /// z-y-x shift `d` such that `target(p) ≈ reference(p − d)`.
    pub shift: DVec3,
    /// Pearson correlation of the two volumes over their overlap at the
    /// integer part of `shift`, in [-1, 1].
    pub score: f64,
    /// Height of the phase-correlation peak.
    pub peak: f64,
}

/// Phase correlator for volumes of one fixed shape. FFT plans and windows are
/// built once and shared by every call.
pub struct PhaseCorrelator {
    shape: [usize; 3],
    forward: [Arc<dyn Fft<f32>>; 3],
    inverse: [Arc<dyn Fft<f32>>; 3],
    windows: [Vec<f32>; 3],
}

impl std::fmt::Debug for PhaseCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseCorrelator")
            .field("shape", &self.shape)
            .finish()
    }
}

impl PhaseCorrelator {
    /// Creates a correlator for z-y-x volumes of `shape`.
    pub fn new(shape: [usize; 3]) -> Self {
        assert!(
            shape.iter().all(|&n| n > 0),
            "correlator shape must be non-empty, got {:?}",
            shape
        );
        let mut planner = FftPlanner::new();
        let forward = shape.map(|n| planner.plan_fft_forward(n));
        let inverse = shape.map(|n| planner.plan_fft_inverse(n));
        let windows = shape.map(hann_window);

        Self {
            shape,
            forward,
            inverse,
            windows,
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Estimates the shift taking `reference` onto `target`.
    ///
    /// Returns `None` when either volume is flat.
    pub fn correlate(&self, reference: &Volume, target: &Volume) -> Option<ShiftEstimate> {
        assert_eq!(reference.shape(), self.shape, "reference shape mismatch");
        assert_eq!(target.shape(), self.shape, "target shape mismatch");

        let mut ref_spec = self.prepare(reference)?;
        let mut tar_spec = self.prepare(target)?;
        self.transform(&mut ref_spec, &self.forward);
        self.transform(&mut tar_spec, &self.forward);

        let mut cross = cross_power_spectrum(&ref_spec, &tar_spec);
        self.transform(&mut cross, &self.inverse);

        let total = cross.len() as f32;
        let surface: Vec<f32> = cross.iter().map(|c| c.re / total).collect();

        let (peak_idx, peak) = find_peak(&surface);
        let peak_pos = unravel(peak_idx, self.shape);

        let mut integer = [0i64; 3];
        for axis in 0..3 {
            let n = self.shape[axis];
            let p = peak_pos[axis];
            integer[axis] = if p > n / 2 {
                p as i64 - n as i64
            } else {
                p as i64
            };
        }

        let score = overlap_correlation(reference, target, integer);
        let mut shift = DVec3::ZERO;
        for axis in 0..3 {
            shift[axis] = integer[axis] as f64
                + self.subpixel_offset(reference, target, integer, score, axis);
        }

        Some(ShiftEstimate {
            shift,
            score,
            peak: peak as f64,
        })
    }

    /// Mean-removed, windowed copy as complex samples. `None` for a flat volume.
    fn prepare(&self, volume: &Volume) -> Option<Vec<Complex<f32>>> {
        let data = volume.data();
        let n = data.len() as f64;
        let mean = data.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = data
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        if !(variance > MIN_VARIANCE) {
            return None;
        }

        let [nz, ny, nx] = self.shape;
        let mut out = Vec::with_capacity(data.len());
        for z in 0..nz {
            let wz = self.windows[0][z];
            for y in 0..ny {
                let wzy = wz * self.windows[1][y];
                let row = &data[(z * ny + y) * nx..(z * ny + y + 1) * nx];
                for (x, &v) in row.iter().enumerate() {
                    let value = (v as f64 - mean) as f32 * wzy * self.windows[2][x];
                    out.push(Complex::new(value, 0.0));
                }
            }
        }
        Some(out)
    }

    /// In-place FFT along every axis longer than one sample.
    fn transform(&self, data: &mut [Complex<f32>], plans: &[Arc<dyn Fft<f32>>; 3]) {
        for (axis, plan) in plans.iter().enumerate() {
            transform_axis(data, self.shape, axis, plan.as_ref());
        }
    }

    /// Gaussian fit of the overlap correlation around `integer` along one
    /// axis. Falls back to a parabola when a neighbour is not positive.
    fn subpixel_offset(
        &self,
        reference: &Volume,
        target: &Volume,
        integer: [i64; 3],
        center: f64,
        axis: usize,
    ) -> f64 {
        if self.shape[axis] < 3 {
            return 0.0;
        }
        let at = |step: i64| {
            let mut shift = integer;
            shift[axis] += step;
            overlap_correlation(reference, target, shift)
        };
        let left = at(-1);
        let right = at(1);
        if center < left.max(right) {
            return 0.0;
        }

        let (l, c, r) = if left > 0.0 && right > 0.0 && center > 0.0 {
            (left.ln(), center.ln(), right.ln())
        } else {
            (left, center, right)
        };
        let denom = l + r - 2.0 * c;
        if denom.abs() < 1e-12 {
            return 0.0;
        }
        (0.5 * (l - r) / denom).clamp(-0.5, 0.5)
    }
}

/// Periodic Hann window. A length-one axis gets weight one.
pub fn hann_window(size: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    if size <= 1 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|i| {
            let x = i as f32 / size as f32;
            0.5 * (1.0 - (2.0 * PI * x).cos())
        })
        .collect()
}

/// `F_tar · conj(F_ref)`, normalized to unit magnitude, so that the inverse
/// transform peaks at the shift from reference to target.
fn cross_power_spectrum(reference: &[Complex<f32>], target: &[Complex<f32>]) -> Vec<Complex<f32>> {
    reference
        .iter()
        .zip(target.iter())
        .map(|(&r, &t)| {
            let product = t * r.conj();
            let magnitude = product.norm();
            if magnitude > 1e-10 {
                product / magnitude
            } else {
                Complex::new(0.0, 0.0)
            }
        })
        .collect()
}

fn transform_axis(data: &mut [Complex<f32>], shape: [usize; 3], axis: usize, fft: &dyn Fft<f32>) {
    let n = shape[axis];
    if n <= 1 {
        return;
    }
    if axis == 2 {
        // rows are contiguous
        fft.process(data);
        return;
    }

    let stride = if axis == 0 { shape[1] * shape[2] } else { shape[2] };
    let mut line = vec![Complex::new(0.0, 0.0); n];
    for base in 0..data.len() {
        if (base / stride) % n != 0 {
            continue;
        }
        for (i, sample) in line.iter_mut().enumerate() {
            *sample = data[base + i * stride];
        }
        fft.process(&mut line);
        for (i, sample) in line.iter().enumerate() {
            data[base + i * stride] = *sample;
        }
    }
}

/// Index and value of the maximum. The first maximum wins.
fn find_peak(surface: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, &v) in surface.iter().enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best
}

fn unravel(idx: usize, shape: [usize; 3]) -> [usize; 3] {
    let plane = shape[1] * shape[2];
    [idx / plane, (idx % plane) / shape[2], idx % shape[2]]
}

fn ravel(pos: [usize; 3], shape: [usize; 3]) -> usize {
    (pos[0] * shape[1] + pos[1]) * shape[2] + pos[2]
}

/// Pearson correlation of `target(p)` against `reference(p − shift)` over the
/// voxels where both are defined. Zero when the overlap is too small or flat.
pub fn overlap_correlation(reference: &Volume, target: &Volume, shift: [i64; 3]) -> f64 {
    let shape = reference.shape();
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    for axis in 0..3 {
        let n = shape[axis] as i64;
        let start = shift[axis].max(0);
        let end = (n + shift[axis]).min(n);
        if end <= start {
            return 0.0;
        }
        lo[axis] = start as usize;
        hi[axis] = end as usize;
    }

    let mut count = 0.0;
    let (mut sr, mut st, mut srr, mut stt, mut srt) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for z in lo[0]..hi[0] {
        let rz = (z as i64 - shift[0]) as usize;
        for y in lo[1]..hi[1] {
            let ry = (y as i64 - shift[1]) as usize;
            for x in lo[2]..hi[2] {
                let rx = (x as i64 - shift[2]) as usize;
                let r = reference.get(rz, ry, rx) as f64;
                let t = target.get(z, y, x) as f64;
                count += 1.0;
                sr += r;
                st += t;
                srr += r * r;
                stt += t * t;
                srt += r * t;
            }
        }
    }
    if count < 2.0 {
        return 0.0;
    }

    let cov = srt - sr * st / count;
    let var_r = srr - sr * sr / count;
    let var_t = stt - st * st / count;
    if var_r <= MIN_VARIANCE * count || var_t <= MIN_VARIANCE * count {
        return 0.0;
    }
    (cov / (var_r * var_t).sqrt()).clamp(-1.0, 1.0)
}
