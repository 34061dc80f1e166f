//! Synthetic data generators for tests.

use glam::DVec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::layout::{Dimensionality, Layout};
use crate::volume::Volume;

/// Random blob centres (z-y-x) inside a volume, away from the borders.
pub fn blob_centres(shape: [usize; 3], count: usize, seed: u64) -> Vec<DVec3> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let mut coord = |n: usize| {
                if n <= 1 {
                    return 0.0;
                }
                let margin = (n as f64 * 0.1).min(3.0);
                rng.random_range(margin..n as f64 - margin)
            };
            let z = coord(shape[0]);
            let y = coord(shape[1]);
            let x = coord(shape[2]);
            DVec3::new(z, y, x)
        })
        .collect()
}

/// Volume holding isotropic Gaussian blobs of amplitude 1000 on a flat
/// background of 100.
pub fn blob_volume(shape: [usize; 3], centres: &[DVec3], sigma: f64) -> Volume {
    let mut volume = Volume::zeros(shape);
    let reach = (3.0 * sigma).ceil() as i64;
    volume.data_mut().fill(100.0);
    for c in centres {
        let lo = |v: f64| (v.round() as i64 - reach).max(0) as usize;
        let hi = |v: f64, n: usize| ((v.round() as i64 + reach + 1).max(0) as usize).min(n);
        for z in lo(c[0])..hi(c[0], shape[0]) {
            for y in lo(c[1])..hi(c[1], shape[1]) {
                for x in lo(c[2])..hi(c[2], shape[2]) {
                    let d2 = (z as f64 - c[0]).powi(2)
                        + (y as f64 - c[1]).powi(2)
                        + (x as f64 - c[2]).powi(2);
                    let value = 1000.0 * (-d2 / (2.0 * sigma * sigma)).exp();
                    volume.set(z, y, x, volume.get(z, y, x) + value as f32);
                }
            }
        }
    }
    volume
}

/// Random integer y-x-z points in `[lo, hi)` per axis.
pub fn random_cloud(rng: &mut StdRng, n: usize, lo: [i32; 3], hi: [i32; 3]) -> Vec<[i32; 3]> {
    (0..n)
        .map(|_| std::array::from_fn(|i| rng.random_range(lo[i]..hi[i])))
        .collect()
}

/// Single-camera 3-D layout: imaging rounds `0..n_imaging`, then the anchor
/// round, then an optional pre-sequence round. Channel 0 is the anchor.
pub fn experiment_layout(
    n_tiles: usize,
    n_imaging: usize,
    n_channels: usize,
    pre_seq: bool,
) -> Layout {
    let anchor_round = n_imaging;
    Layout {
        n_tiles,
        n_rounds: n_imaging + 1 + pre_seq as usize,
        n_channels,
        use_tiles: (0..n_tiles).collect(),
        use_rounds: (0..n_imaging).collect(),
        use_channels: (0..n_channels).collect(),
        anchor_round,
        anchor_channel: 0,
        pre_seq_round: pre_seq.then_some(anchor_round + 1),
        dapi_channel: None,
        channel_camera: Vec::new(),
        dimensionality: Dimensionality::Three,
    }
}
