//! Per-plane Gaussian blur used to suppress background structure in the
//! pre-sequence round.

use rayon::prelude::*;

use crate::volume::Volume;

/// Normalized 1-D Gaussian kernel truncated at 3 sigma.
///
/// Length is `2 * radius + 1` with `radius = round(3 * sigma)`.
pub fn gaussian_kernel_1d(sigma: f64) -> Vec<f32> {
    assert!(sigma > 0.0, "Sigma must be positive");

    let radius = (3.0 * sigma + 0.5) as usize;
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel: Vec<f64> = (0..2 * radius + 1)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (-x * x / two_sigma_sq).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|v| *v /= sum);
    kernel.into_iter().map(|v| v as f32).collect()
}

/// Blurs every z-plane of `volume` independently with a separable Gaussian
/// of the given sigma (in pixels). Edges replicate the nearest pixel, so the
/// output stays within the input's value range.
///
/// A non-positive sigma returns the volume unchanged.
pub fn gaussian_blur_planes(volume: &Volume, sigma: f64) -> Volume {
    if sigma <= 0.0 {
        return volume.clone();
    }
    let kernel = gaussian_kernel_1d(sigma);
    let (ny, nx) = (volume.ny(), volume.nx());
    let plane_len = ny * nx;

    let mut output = Volume::zeros(volume.shape());
    if plane_len == 0 {
        return output;
    }
    output
        .data_mut()
        .par_chunks_mut(plane_len)
        .zip(volume.data().par_chunks(plane_len))
        .for_each(|(out_plane, in_plane)| {
            let mut temp = vec![0.0f32; plane_len];
            for y in 0..ny {
                let row = y * nx;
                convolve_line(&in_plane[row..row + nx], 1, &mut temp[row..row + nx], 1, nx, &kernel);
            }
            for x in 0..nx {
                convolve_line(&temp[x..], nx, &mut out_plane[x..], nx, ny, &kernel);
            }
        });
    output
}

/// Convolves `len` samples read from `input` with the given stride into
/// `output`, clamping indices at the edges.
fn convolve_line(
    input: &[f32],
    in_stride: usize,
    output: &mut [f32],
    out_stride: usize,
    len: usize,
    kernel: &[f32],
) {
    let radius = (kernel.len() / 2) as isize;
    let last = len as isize - 1;
    for i in 0..len {
        let mut sum = 0.0f32;
        for (k, &kval) in kernel.iter().enumerate() {
            let j = (i as isize + k as isize - radius).clamp(0, last) as usize;
            sum += input[j * in_stride] * kval;
        }
        output[i * out_stride] = sum;
    }
}
