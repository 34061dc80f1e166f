use glam::DVec3;

use super::*;
use crate::testing::{blob_centres, blob_volume};

fn config() -> RoundConfig {
    RoundConfig {
        subvolume_counts: [2, 3, 3],
        box_size: [8, 32, 32],
        ..Default::default()
    }
}

#[test]
fn test_grid_spacing() {
    let grid = SubvolumeGrid::new([16, 64, 64], [2, 3, 3], [8, 32, 32]);
    assert_eq!(grid.box_size, [8, 32, 32]);
    assert_eq!(grid.len(), 18);
    assert_eq!(grid.starts[0], [0, 0, 0]);
    assert_eq!(grid.starts[1], [0, 0, 16]);
    assert_eq!(grid.starts[17], [8, 32, 32]);
    assert_eq!(grid.centre([0, 0, 0]), DVec3::new(3.5, 15.5, 15.5));
}

#[test]
fn test_grid_clamps_box_to_volume() {
    let grid = SubvolumeGrid::new([4, 20, 20], [5, 8, 8], [12, 300, 300]);
    assert_eq!(grid.box_size, [4, 20, 20]);
    assert_eq!(grid.starts, vec![[0, 0, 0]]);
}

#[test]
fn test_register_recovers_translation() {
    let shape = [16, 64, 64];
    let truth = DVec3::new(1.0, -3.0, 2.0);
    let centres = blob_centres(shape, 200, 21);
    let moved: Vec<DVec3> = centres.iter().map(|&c| c + truth).collect();
    let anchor = blob_volume(shape, &centres, 1.5);
    let round = blob_volume(shape, &moved, 1.5);

    let registrator = RoundRegistrator::new(shape, config(), Dimensionality::Three);
    let fit = registrator.register(&anchor, &round).unwrap();

    assert_eq!(fit.status, FitStatus::Affine);
    assert!(fit.accepted_count() >= 12, "accepted {}", fit.accepted_count());
    assert!(fit.quality > 0.5, "quality {}", fit.quality);

    let centre = DVec3::new(8.0, 32.0, 32.0);
    let mapped = fit.transform.apply(centre);
    assert!(
        (mapped - (centre + truth)).abs().max_element() < 0.5,
        "transform {} maps centre to {:?}",
        fit.transform,
        mapped
    );
}

#[test]
fn test_flat_round_is_under_determined() {
    let shape = [16, 64, 64];
    let anchor = blob_volume(shape, &blob_centres(shape, 100, 5), 1.5);
    let round = blob_volume(shape, &[], 1.5);

    let registrator = RoundRegistrator::new(shape, config(), Dimensionality::Three);
    let fit = registrator.register(&anchor, &round).unwrap();

    assert_eq!(fit.status, FitStatus::UnderDetermined);
    assert!(fit.transform.is_identity(0.0));
    assert_eq!(fit.quality, 0.0);
    assert_eq!(fit.subvolumes.len(), 18);
}

#[test]
fn test_few_subvolumes_fall_back_to_translation() {
    let shape = [8, 32, 32];
    let truth = DVec3::new(0.0, 2.0, -1.0);
    let centres = blob_centres(shape, 40, 8);
    let moved: Vec<DVec3> = centres.iter().map(|&c| c + truth).collect();
    let anchor = blob_volume(shape, &centres, 1.5);
    let round = blob_volume(shape, &moved, 1.5);

    // a single box cannot support an affine fit
    let config = RoundConfig {
        subvolume_counts: [1, 1, 1],
        box_size: [8, 32, 32],
        ..Default::default()
    };
    let registrator = RoundRegistrator::new(shape, config, Dimensionality::Three);
    let fit = registrator.register(&anchor, &round).unwrap();

    assert_eq!(fit.status, FitStatus::TranslationOnly);
    assert!((fit.transform.translation() - truth).abs().max_element() < 0.3);
}

#[test]
fn test_shape_mismatch_is_fatal() {
    let registrator = RoundRegistrator::new([16, 64, 64], config(), Dimensionality::Three);
    let small = Volume::zeros([8, 64, 64]);
    let result = registrator.register(&small, &small);
    assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
}
