use std::cell::RefCell;
use std::ops::Range;

use glam::DVec3;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::*;
use crate::affine::{reorder_point, Yxz, Zyx};
use crate::config::RoundConfig;
use crate::point_cloud::{PointCloud, SpotTable};
use crate::testing::{blob_centres, blob_volume, experiment_layout, random_cloud};
use crate::volume::Volume;

const SHAPE: [usize; 3] = [4, 32, 32];
const N_TILES: usize = 3;
const PRE_SEQ: usize = 3;
const SPARSE_TILE: usize = 2;
const SPARSE_ROUND: usize = 1;

/// Shift (y, x, z) of round `round` relative to the anchor round.
fn round_shift(round: usize) -> DVec3 {
    match round {
        0 => DVec3::new(1.0, -2.0, 0.0),
        1 => DVec3::new(-1.0, 1.0, 0.0),
        PRE_SEQ => DVec3::new(2.0, 1.0, 0.0),
        _ => DVec3::ZERO,
    }
}

struct Experiment {
    layout: Layout,
    grid: TileGrid,
    config: RegisterConfig,
    volumes: MemoryVolumeStore,
    spots: SpotTable,
    beads: BTreeMap<usize, Volume>,
}

fn experiment() -> Experiment {
    let layout = experiment_layout(N_TILES, 2, 1, true);
    let grid = TileGrid::regular(1, N_TILES, [SHAPE[1], SHAPE[2]], 0.1);

    let mut config = RegisterConfig::default();
    config.round = RoundConfig {
        subvolume_counts: [1, 2, 2],
        box_size: [4, 24, 24],
        max_shift: [2.0, 8.0, 8.0],
        ..Default::default()
    };

    let mut volumes = MemoryVolumeStore::new();
    let mut clouds = Vec::new();
    for tile in 0..N_TILES {
        let centres = blob_centres(SHAPE, 60, 100 + tile as u64);
        let mut rng = StdRng::seed_from_u64(200 + tile as u64);
        let anchor_spots = random_cloud(&mut rng, 150, [2, 2, 0], [30, 30, 4]);

        for round in 0..layout.n_rounds {
            let shift = round_shift(round);
            let zyx = reorder_point::<Yxz, Zyx>(shift);
            let moved: Vec<DVec3> = centres.iter().map(|&c| c + zyx).collect();
            let variant = if round == PRE_SEQ {
                VolumeVariant::Raw
            } else {
                VolumeVariant::Filtered
            };
            volumes.insert(tile, round, 0, variant, blob_volume(SHAPE, &moved, 1.5));

            let sparse = tile == SPARSE_TILE && (round == SPARSE_ROUND || round == PRE_SEQ);
            let n = if sparse {
                50
            } else {
                anchor_spots.len()
            };
            let coords: Vec<[i32; 3]> = anchor_spots[..n]
                .iter()
                .map(|p| {
                    [
                        p[0] + shift.x as i32,
                        p[1] + shift.y as i32,
                        p[2] + shift.z as i32,
                    ]
                })
                .collect();
            let intensities = vec![1.0; coords.len()];
            clouds.push(PointCloud::new(coords, intensities).unwrap());
        }
    }
    let spots = SpotTable::from_clouds([N_TILES, layout.n_rounds, 1], clouds).unwrap();

    Experiment {
        layout,
        grid,
        config,
        volumes,
        spots,
        beads: BTreeMap::new(),
    }
}

/// Volume store that records filtered loads and can fail on one tile.
struct FlakyVolumes {
    inner: MemoryVolumeStore,
    fail_tile: Option<usize>,
    loads: RefCell<Vec<(usize, usize, VolumeVariant)>>,
}

impl FlakyVolumes {
    fn new(inner: MemoryVolumeStore, fail_tile: Option<usize>) -> Self {
        Self {
            inner,
            fail_tile,
            loads: RefCell::new(Vec::new()),
        }
    }
}

impl VolumeStore for FlakyVolumes {
    fn load(
        &self,
        tile: usize,
        round: usize,
        channel: usize,
        variant: VolumeVariant,
        z_range: Option<Range<usize>>,
    ) -> anyhow::Result<Volume> {
        if self.fail_tile == Some(tile) {
            anyhow::bail!("disk error reading tile {}", tile);
        }
        self.loads.borrow_mut().push((tile, round, variant));
        self.inner.load(tile, round, channel, variant, z_range)
    }

    fn save(
        &mut self,
        tile: usize,
        round: usize,
        channel: usize,
        variant: VolumeVariant,
        volume: &Volume,
    ) -> anyhow::Result<()> {
        self.inner.save(tile, round, channel, variant, volume)
    }
}

fn run_to_completion(exp: &Experiment, volumes: &mut FlakyVolumes, store: &CheckpointStore) -> Result<RegistrationState> {
    let mut state = store.load_or_init(&exp.layout)?;
    Pipeline::new(&exp.layout, &exp.grid, &exp.config, volumes, &exp.spots, &exp.beads)
        .run(&mut state, store)?;
    Ok(state)
}

fn checkpoint(name: &str) -> CheckpointStore {
    let dir = common::test_utils::fresh_test_dir(&format!("concordia/pipeline/{}", name));
    CheckpointStore::new(dir.join("registration.json")).unwrap()
}

#[test]
fn test_full_run_fills_every_table() {
    let exp = experiment();
    let store = checkpoint("full");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);

    let state = run_to_completion(&exp, &mut volumes, &store).unwrap();

    assert!(state.channel.is_some());
    assert_eq!(state.tiles_completed.len(), N_TILES);
    assert_eq!(state.icp_tiles_completed.len(), N_TILES);
    assert!(state.regularized);
    assert!(state.blur);
    assert!(state.remaining_round_tiles(&exp.layout).is_empty());
    assert!(state.remaining_icp(&exp.layout).is_empty());
    for tile in 0..N_TILES {
        for round in exp.layout.registered_rounds() {
            assert!(state.rounds.get(tile, round).is_some());
            assert!(state.initial.get(tile, round, 0).is_some());
        }
        let anchor = state.rounds.get(tile, exp.layout.anchor_round).as_ref().unwrap();
        assert!(anchor.transform.is_identity(0.0));
        assert!(!anchor.outlier);
    }

    let persisted = store.load_or_init(&exp.layout).unwrap();
    assert_eq!(persisted.tiles_completed, state.tiles_completed);
    assert!(persisted.blur);
}

#[test]
fn test_icp_recovers_round_shifts() {
    let exp = experiment();
    let store = checkpoint("shifts");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);

    let state = run_to_completion(&exp, &mut volumes, &store).unwrap();

    for tile in 0..N_TILES {
        for round in exp.layout.registered_rounds() {
            if tile == SPARSE_TILE && (round == SPARSE_ROUND || round == PRE_SEQ) {
                continue;
            }
            let result = state.icp.get(tile, round, 0).as_ref().unwrap();
            assert!(result.converged(), "tile {} round {}: {:?}", tile, round, result.status);
            let transform = state.final_transform(&exp.layout, tile, round, 0).unwrap();
            let error = (transform.translation() - round_shift(round)).abs().max_element();
            assert!(error < 0.1, "tile {} round {}: transform {}", tile, round, transform);
        }
    }
    assert!(state
        .final_transform(&exp.layout, 0, exp.layout.anchor_round, 0)
        .unwrap()
        .is_identity(0.0));
}

#[test]
fn test_sparse_imaging_round_skips_icp_but_pre_seq_does_not() {
    let exp = experiment();
    let store = checkpoint("sparse");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);

    let state = run_to_completion(&exp, &mut volumes, &store).unwrap();

    let sparse = state.icp.get(SPARSE_TILE, SPARSE_ROUND, 0).as_ref().unwrap();
    assert_eq!(sparse.status, IcpStatus::Skipped);
    assert_eq!(Some(sparse.transform), *state.initial.get(SPARSE_TILE, SPARSE_ROUND, 0));

    let pre_seq = state.icp.get(SPARSE_TILE, PRE_SEQ, 0).as_ref().unwrap();
    assert_ne!(pre_seq.status, IcpStatus::Skipped);
    assert!(!pre_seq.iterations.is_empty());
}

#[test]
fn test_sparse_pre_seq_skipped_when_configured() {
    let mut exp = experiment();
    exp.config.icp.skip_sparse_pre_seq = true;
    let store = checkpoint("sparse_pre_seq");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);

    let state = run_to_completion(&exp, &mut volumes, &store).unwrap();

    let pre_seq = state.icp.get(SPARSE_TILE, PRE_SEQ, 0).as_ref().unwrap();
    assert_eq!(pre_seq.status, IcpStatus::Skipped);
    let dense = state.icp.get(0, PRE_SEQ, 0).as_ref().unwrap();
    assert_ne!(dense.status, IcpStatus::Skipped);
}

#[test]
fn test_pre_seq_round_is_blurred_into_filtered_variant() {
    let exp = experiment();
    let store = checkpoint("blur");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);

    run_to_completion(&exp, &mut volumes, &store).unwrap();

    for tile in 0..N_TILES {
        let raw = volumes.inner.get(tile, PRE_SEQ, 0, VolumeVariant::Raw).unwrap();
        let filtered = volumes
            .inner
            .get(tile, PRE_SEQ, 0, VolumeVariant::Filtered)
            .unwrap();
        assert_eq!(filtered, &gaussian_blur_planes(raw, exp.config.pre_seq_blur_radius));
    }
    // registration reads the raw pre-sequence image
    let loads = volumes.loads.borrow();
    assert!(!loads.contains(&(0, PRE_SEQ, VolumeVariant::Filtered)));
}

#[test]
fn test_zero_blur_radius_leaves_pre_seq_unfiltered() {
    let mut exp = experiment();
    exp.config.pre_seq_blur_radius = 0.0;
    let store = checkpoint("no_blur");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);

    let state = run_to_completion(&exp, &mut volumes, &store).unwrap();

    assert!(!state.blur);
    assert!(state.remaining_icp(&exp.layout).is_empty());
    for tile in 0..N_TILES {
        assert!(volumes.inner.get(tile, PRE_SEQ, 0, VolumeVariant::Filtered).is_none());
    }
}

#[test]
fn test_negative_blur_radius_is_a_config_error() {
    let mut exp = experiment();
    exp.config.pre_seq_blur_radius = -1.0;
    let store = checkpoint("negative_blur");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);

    let err = run_to_completion(&exp, &mut volumes, &store).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)), "{:?}", err);
    assert!(volumes.loads.borrow().is_empty());
}

#[test]
fn test_completed_run_does_no_work() {
    let exp = experiment();
    let store = checkpoint("idle");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);
    let first = run_to_completion(&exp, &mut volumes, &store).unwrap();

    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);
    let second = run_to_completion(&exp, &mut volumes, &store).unwrap();

    assert!(volumes.loads.borrow().is_empty());
    assert_eq!(second.tiles_completed, first.tiles_completed);
    assert_eq!(second.rounds.shape(), first.rounds.shape());
}

#[test]
fn test_resume_after_crash_matches_uninterrupted_run() {
    let exp = experiment();

    let uninterrupted_store = checkpoint("uninterrupted");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);
    let uninterrupted = run_to_completion(&exp, &mut volumes, &uninterrupted_store).unwrap();

    let store = checkpoint("resumed");
    let mut crashing = FlakyVolumes::new(exp.volumes.clone(), Some(2));
    let err = run_to_completion(&exp, &mut crashing, &store).unwrap_err();
    assert!(matches!(err, Error::Collaborator(_)), "{:?}", err);

    let partial = store.load_or_init(&exp.layout).unwrap();
    assert_eq!(partial.remaining_round_tiles(&exp.layout), vec![2]);
    assert!(!partial.regularized);

    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);
    let resumed = run_to_completion(&exp, &mut volumes, &store).unwrap();

    let anchor_round = exp.layout.anchor_round;
    let reloaded_anchors: Vec<usize> = volumes
        .loads
        .borrow()
        .iter()
        .filter(|&&(_, round, variant)| round == anchor_round && variant == VolumeVariant::Filtered)
        .map(|&(tile, _, _)| tile)
        .collect();
    assert_eq!(reloaded_anchors, vec![2]);

    for tile in 0..N_TILES {
        for round in 0..exp.layout.n_rounds {
            let a = uninterrupted.final_transform(&exp.layout, tile, round, 0).unwrap();
            let b = resumed.final_transform(&exp.layout, tile, round, 0).unwrap();
            assert!(a.abs_diff_eq(&b, 1e-9), "tile {} round {}: {} vs {}", tile, round, a, b);
        }
        for round in exp.layout.registered_rounds() {
            let a = uninterrupted.rounds.get(tile, round).as_ref().unwrap();
            let b = resumed.rounds.get(tile, round).as_ref().unwrap();
            assert!(a.transform.abs_diff_eq(&b.transform, 1e-9));
            assert_eq!(a.outlier, b.outlier);
            assert_eq!(
                uninterrupted.icp.get(tile, round, 0).as_ref().map(|r| r.status),
                resumed.icp.get(tile, round, 0).as_ref().map(|r| r.status)
            );
        }
    }
    assert_eq!(resumed.tiles_completed, uninterrupted.tiles_completed);
    assert_eq!(resumed.blur, uninterrupted.blur);
}

#[test]
fn test_spot_outside_volume_is_rejected() {
    let mut exp = experiment();
    let mut clouds = Vec::new();
    for tile in 0..N_TILES {
        for round in 0..exp.layout.n_rounds {
            let cloud = exp.spots.point_cloud(tile, round, 0);
            if (tile, round) != (1, 0) {
                clouds.push(cloud);
                continue;
            }
            let mut coords = cloud.coords().to_vec();
            coords[0] = [5, SHAPE[2] as i32 + 8, 1];
            clouds.push(PointCloud::new(coords, cloud.intensities().to_vec()).unwrap());
        }
    }
    exp.spots = SpotTable::from_clouds([N_TILES, exp.layout.n_rounds, 1], clouds).unwrap();
    let store = checkpoint("spot_bounds");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);

    let err = run_to_completion(&exp, &mut volumes, &store).unwrap_err();
    assert!(
        matches!(err, Error::ShapeMismatch { what: "spot coordinate", .. }),
        "{:?}",
        err
    );

    let partial = store.load_or_init(&exp.layout).unwrap();
    assert_eq!(partial.volume_shape, Some(SHAPE));
    assert!(partial.icp_tiles_completed.contains(&0));
    assert!(!partial.icp_tiles_completed.contains(&1));
}

#[test]
fn test_compose_requires_channel_registration() {
    let exp = experiment();
    let store = checkpoint("compose_without_channels");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);
    let mut state = RegistrationState::new(&exp.layout);

    let pipeline = Pipeline::new(&exp.layout, &exp.grid, &exp.config, &mut volumes, &exp.spots, &exp.beads);
    let err = pipeline.compose(&mut state, &store).unwrap_err();
    assert!(matches!(err, Error::MissingStage("channel registration")), "{:?}", err);
    assert!(state.initial.as_slice().iter().all(Option::is_none));
}

#[test]
fn test_checkpoint_for_other_layout_is_rejected() {
    let exp = experiment();
    let other = experiment_layout(N_TILES + 1, 2, 1, true);
    let mut state = RegistrationState::new(&other);
    let store = checkpoint("wrong_layout");
    let mut volumes = FlakyVolumes::new(exp.volumes.clone(), None);

    let err = Pipeline::new(&exp.layout, &exp.grid, &exp.config, &mut volumes, &exp.spots, &exp.beads)
        .run(&mut state, &store)
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}
