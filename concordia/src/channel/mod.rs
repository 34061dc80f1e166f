//! Channel registration: one affine transform per camera from bead images.
//!
//! Beads are detected in the z maximum projection of each camera's bead
//! image as bright, round connected blobs of the expected radius. Anchor
//! beads are matched to candidate beads by mutual nearest neighbour after a
//! displacement vote, and an affine map in the y-x plane is refit until the
//! match set settles. Transforms map anchor-camera positions into the
//! candidate camera's frame.


use std::collections::BTreeMap;

use glam::DVec3;
use nalgebra::Matrix2;
use serde::{Deserialize, Serialize};

use crate::affine::{Affine, Zyx};
use crate::config::ChannelConfig;
use crate::layout::{Dimensionality, Layout};
use crate::math::{fit_affine, median_mut};
use crate::spatial::{dominant_displacement, KdTree};
use crate::volume::Volume;

/// A detected bead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bead {
    /// Intensity-weighted centroid, z-y-x with z = 0.
    pub position: DVec3,
    /// Radius of the disk with the blob's area.
    pub radius: f64,
    /// Ratio of minor to major axis of the blob's second moments.
    pub circularity: f64,
    /// Summed intensity above the background.
    pub flux: f64,
}

/// Outcome for one camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// The anchor camera; identity by definition.
    Anchor,
    Registered,
    /// Too few bead matches; identity fallback.
    InsufficientMatches,
    /// No bead image for this camera or the anchor; identity fallback.
    MissingBeads,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRegistration {
    pub camera: usize,
    pub transform: Affine<Zyx>,
    pub status: ChannelStatus,
    pub n_beads: usize,
    pub n_matches: usize,
}

/// Per-camera transforms plus the channel → camera mapping they were built for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRegistration {
    pub anchor_camera: usize,
    pub cameras: Vec<CameraRegistration>,
    channel_camera: Vec<usize>,
}

impl ChannelRegistration {
    /// Transform of `channel`: that of its camera. `None` for a channel or
    /// camera this registration was not built for.
    pub fn transform(&self, channel: usize) -> Option<Affine<Zyx>> {
        let camera = *self.channel_camera.get(channel)?;
        self.camera(camera).map(|c| c.transform)
    }

    pub fn camera(&self, camera: usize) -> Option<&CameraRegistration> {
        self.cameras.iter().find(|c| c.camera == camera)
    }

    /// True when any camera carries a non-identity transform.
    pub fn is_computed(&self) -> bool {
        self.cameras.iter().any(|c| !c.transform.is_identity(0.0))
    }
}

/// Detects beads in `image`, projecting along z first.
pub fn detect_beads(image: &Volume, config: &ChannelConfig) -> Vec<Bead> {
    let projection = image.max_projection();
    let (ny, nx) = (projection.ny(), projection.nx());
    let data = projection.data();
    if data.is_empty() {
        return Vec::new();
    }

    let mut scratch: Vec<f64> = data.iter().map(|&v| v as f64).collect();
    let Some(background) = median_mut(&mut scratch) else {
        return Vec::new();
    };
    let peak = data.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    if !(peak > background) {
        return Vec::new();
    }
    let threshold = background + config.threshold_fraction * (peak - background);

    let mask: Vec<bool> = data.iter().map(|&v| v as f64 > threshold).collect();
    let (labels, n_labels) = connected_components(&mask, nx, ny);

    let mut moments = vec![BlobMoments::default(); n_labels];
    for (idx, &label) in labels.iter().enumerate() {
        if label == 0 {
            continue;
        }
        let (y, x) = ((idx / nx) as f64, (idx % nx) as f64);
        moments[label as usize - 1].add(y, x, data[idx] as f64 - background);
    }

    let (min_radius, max_radius) = config.radius_range();
    moments
        .iter()
        .filter_map(BlobMoments::to_bead)
        .filter(|b| {
            b.radius >= min_radius && b.radius <= max_radius && b.circularity >= config.min_circularity
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
struct BlobMoments {
    area: f64,
    flux: f64,
    sum_wy: f64,
    sum_wx: f64,
    sum_y: f64,
    sum_x: f64,
    sum_yy: f64,
    sum_xx: f64,
    sum_xy: f64,
}

impl BlobMoments {
    fn add(&mut self, y: f64, x: f64, weight: f64) {
        self.area += 1.0;
        self.flux += weight;
        self.sum_wy += weight * y;
        self.sum_wx += weight * x;
        self.sum_y += y;
        self.sum_x += x;
        self.sum_yy += y * y;
        self.sum_xx += x * x;
        self.sum_xy += x * y;
    }

    fn to_bead(&self) -> Option<Bead> {
        if self.area < 3.0 || !(self.flux > 0.0) {
            return None;
        }
        let (my, mx) = (self.sum_y / self.area, self.sum_x / self.area);
        let cyy = self.sum_yy / self.area - my * my;
        let cxx = self.sum_xx / self.area - mx * mx;
        let cxy = self.sum_xy / self.area - mx * my;

        let eigen = Matrix2::new(cyy, cxy, cxy, cxx).symmetric_eigen();
        let (minor, major) = (eigen.eigenvalues.min(), eigen.eigenvalues.max());
        if !(major > 0.0) {
            return None;
        }

        Some(Bead {
            position: DVec3::new(0.0, self.sum_wy / self.flux, self.sum_wx / self.flux),
            radius: (self.area / std::f64::consts::PI).sqrt(),
            circularity: (minor.max(0.0) / major).sqrt(),
            flux: self.flux,
        })
    }
}

/// 4-connected component labels (1-based, 0 = background) and label count.
fn connected_components(mask: &[bool], width: usize, height: usize) -> (Vec<u32>, usize) {
    let mut labels = vec![0u32; width * height];
    let mut parent: Vec<u32> = Vec::new();
    let mut next_label = 1u32;

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            if !mask[idx] {
                continue;
            }

            let left = (x > 0 && mask[idx - 1]).then(|| labels[idx - 1]);
            let up = (y > 0 && mask[idx - width]).then(|| labels[idx - width]);

            match (left, up) {
                (None, None) => {
                    labels[idx] = next_label;
                    parent.push(next_label);
                    next_label += 1;
                }
                (Some(a), None) | (None, Some(a)) => labels[idx] = a,
                (Some(a), Some(b)) => {
                    labels[idx] = a.min(b);
                    union(&mut parent, a, b);
                }
            }
        }
    }

    let mut label_map = vec![0u32; parent.len() + 1];
    let mut num_labels = 0u32;
    for label in labels.iter_mut() {
        if *label == 0 {
            continue;
        }
        let root = find(&parent, *label);
        if label_map[root as usize] == 0 {
            num_labels += 1;
            label_map[root as usize] = num_labels;
        }
        *label = label_map[root as usize];
    }

    (labels, num_labels as usize)
}

fn find(parent: &[u32], mut label: u32) -> u32 {
    while parent[(label - 1) as usize] != label {
        label = parent[(label - 1) as usize];
    }
    label
}

fn union(parent: &mut [u32], a: u32, b: u32) {
    let root_a = find(parent, a);
    let root_b = find(parent, b);
    if root_a != root_b {
        let (keep, drop) = (root_a.min(root_b), root_a.max(root_b));
        parent[(drop - 1) as usize] = keep;
    }
}

/// Mutually nearest (anchor, candidate) index pairs within `tolerance`.
fn mutual_matches(mapped_anchor: &[DVec3], candidates: &KdTree, tolerance: f64) -> Vec<(usize, usize)> {
    let Some(anchor_tree) = KdTree::build(mapped_anchor) else {
        return Vec::new();
    };
    let tol_sq = tolerance * tolerance;
    mapped_anchor
        .iter()
        .enumerate()
        .filter_map(|(i, &p)| {
            let (j, d) = candidates.nearest(p)?;
            if d > tol_sq {
                return None;
            }
            let (back, _) = anchor_tree.nearest(candidates.get_point(j))?;
            (back == i).then_some((i, j))
        })
        .collect()
}

/// Estimates the transform from anchor beads to candidate beads.
///
/// Returns the transform and the final match count, or `None` for the
/// transform when matching never reached `min_matches`.
pub fn match_beads(anchor: &[Bead], candidate: &[Bead], config: &ChannelConfig) -> (Option<Affine<Zyx>>, usize) {
    let active = Dimensionality::Two.active_axes::<Zyx>();
    let anchor_pos: Vec<DVec3> = anchor.iter().map(|b| b.position).collect();
    let candidate_pos: Vec<DVec3> = candidate.iter().map(|b| b.position).collect();
    let Some(tree) = KdTree::build(&candidate_pos) else {
        return (None, 0);
    };

    let mut transform = Affine::<Zyx>::identity();
    if let Some(radius) = config.coarse_search_radius {
        if let Some(shift) = dominant_displacement(&tree, &anchor_pos, radius, active) {
            transform = Affine::from_translation(shift);
        }
    }

    let mut fitted = None;
    let mut previous: Vec<(usize, usize)> = Vec::new();
    let mut n_matches = 0;
    for _ in 0..config.max_iterations {
        let mapped: Vec<DVec3> = anchor_pos.iter().map(|&p| transform.apply(p)).collect();
        let matches = mutual_matches(&mapped, &tree, config.match_tolerance);
        n_matches = matches.len();
        if n_matches < config.min_matches || matches == previous {
            break;
        }

        let src: Vec<DVec3> = matches.iter().map(|&(i, _)| anchor_pos[i]).collect();
        let dst: Vec<DVec3> = matches.iter().map(|&(_, j)| candidate_pos[j]).collect();
        match fit_affine::<Zyx>(&src, &dst, None, active) {
            Some(next) => {
                transform = next;
                fitted = Some(next);
            }
            None => break,
        }
        previous = matches;
    }

    if n_matches < config.min_matches {
        return (None, n_matches);
    }
    (fitted, n_matches)
}

/// Registers every camera of `layout` against the anchor channel's camera.
///
/// `bead_images` maps camera id to its bead image. Cameras without an image,
/// or with too few matches, fall back to the identity with a warning.
pub fn register_channels(
    bead_images: &BTreeMap<usize, Volume>,
    layout: &Layout,
    config: &ChannelConfig,
) -> ChannelRegistration {
    config.validate();
    let anchor_camera = layout.camera_of(layout.anchor_channel);
    let anchor_beads = bead_images.get(&anchor_camera).map(|img| detect_beads(img, config));
    if anchor_beads.is_none() && layout.cameras().len() > 1 {
        log::warn!(
            "No bead image for anchor camera {}; all channel transforms fall back to identity",
            anchor_camera
        );
    }

    let cameras = layout
        .cameras()
        .into_iter()
        .map(|camera| {
            let mut entry = CameraRegistration {
                camera,
                transform: Affine::identity(),
                status: ChannelStatus::Anchor,
                n_beads: 0,
                n_matches: 0,
            };
            if camera == anchor_camera {
                entry.n_beads = anchor_beads.as_ref().map_or(0, Vec::len);
                return entry;
            }

            let (Some(anchor_beads), Some(image)) = (anchor_beads.as_ref(), bead_images.get(&camera)) else {
                log::warn!("Camera {}: missing bead image, using identity transform", camera);
                entry.status = ChannelStatus::MissingBeads;
                return entry;
            };

            let beads = detect_beads(image, config);
            entry.n_beads = beads.len();
            let (transform, n_matches) = match_beads(anchor_beads, &beads, config);
            entry.n_matches = n_matches;
            match transform {
                Some(transform) => {
                    log::info!(
                        "Camera {}: {} beads, {} matches, transform {}",
                        camera,
                        beads.len(),
                        n_matches,
                        transform
                    );
                    entry.transform = transform;
                    entry.status = ChannelStatus::Registered;
                }
                None => {
                    log::warn!(
                        "Camera {}: only {} bead matches (need {}), using identity transform",
                        camera,
                        n_matches,
                        config.min_matches
                    );
                    entry.status = ChannelStatus::InsufficientMatches;
                }
            }
            entry
        })
        .collect();

    ChannelRegistration {
        anchor_camera,
        cameras,
        channel_camera: (0..layout.n_channels).map(|c| layout.camera_of(c)).collect(),
    }
}
