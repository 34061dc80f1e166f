//! Composition of channel and round transforms into initial ICP guesses.

use crate::affine::{Affine, Yxz, Zyx};
use crate::channel::ChannelRegistration;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::round::RoundEntry;
use crate::table::{TileRoundChannelTable, TileRoundTable};

/// Applies `channel` then `round` and expresses the result in y-x-z order.
pub fn compose(channel: &Affine<Zyx>, round: &Affine<Zyx>) -> Affine<Yxz> {
    channel.then(round).to_yxz()
}

/// Initial transform for every used tile, registered round and used channel.
///
/// Entries outside that set stay `None`. A missing round transform is fatal.
pub fn compose_initial(
    channels: &ChannelRegistration,
    rounds: &TileRoundTable<Option<RoundEntry>>,
    layout: &Layout,
) -> Result<TileRoundChannelTable<Option<Affine<Yxz>>>> {
    rounds.check_shape("round transform table", [layout.n_tiles, layout.n_rounds])?;
    let mut initial =
        TileRoundChannelTable::filled(layout.n_tiles, layout.n_rounds, layout.n_channels, None);

    for &tile in &layout.use_tiles {
        for round in layout.registered_rounds() {
            let entry = rounds.get(tile, round).as_ref().ok_or(Error::MissingEntry {
                what: "round transform",
                tile,
                round,
            })?;
            for &channel in &layout.use_channels {
                let channel_transform = channels.transform(channel).ok_or(Error::MissingEntry {
                    what: "channel transform",
                    tile,
                    round,
                })?;
                let composed = compose(&channel_transform, &entry.transform);
                initial.set(tile, round, channel, Some(composed));
            }
        }
    }
    Ok(initial)
}

#[cfg(test)]
mod tests {
    use glam::{DMat3, DVec3};

    use super::*;
    use crate::affine::reorder_point;

    fn sample() -> Affine<Zyx> {
        Affine::from_rows([
            [1.002, 0.001, 0.0, 0.75],
            [0.0, 0.998, -0.004, -3.5],
            [0.003, 0.002, 1.001, 12.0],
        ])
    }

    #[test]
    fn test_identity_laws() {
        let x = sample();
        let id = Affine::<Zyx>::identity();
        assert!(compose(&id, &x).abs_diff_eq(&x.to_yxz(), 1e-15));
        assert!(compose(&x, &id).abs_diff_eq(&x.to_yxz(), 1e-15));
    }

    #[test]
    fn test_self_alignment_is_identity() {
        let id = Affine::<Zyx>::identity();
        assert!(compose(&id, &id).is_identity(0.0));
    }

    #[test]
    fn test_channel_applies_first() {
        let channel = Affine::<Zyx>::from_parts(DMat3::from_diagonal(DVec3::splat(2.0)), DVec3::ZERO);
        let round = Affine::<Zyx>::from_translation(DVec3::new(1.0, 2.0, 3.0));
        let composed = compose(&channel, &round);

        let p_zyx = DVec3::new(1.0, 1.0, 1.0);
        let expected_zyx = round.apply(channel.apply(p_zyx));
        let got_yxz = composed.apply(reorder_point::<Zyx, Yxz>(p_zyx));
        assert!(got_yxz.abs_diff_eq(reorder_point::<Zyx, Yxz>(expected_zyx), 1e-12));
        assert_eq!(expected_zyx, DVec3::new(3.0, 4.0, 5.0));
    }

    #[test]
    fn test_compose_initial_requires_channel_transform() {
        let layout = crate::testing::experiment_layout(1, 1, 2, false);
        let mut rounds = TileRoundTable::filled(layout.n_tiles, layout.n_rounds, None);
        rounds.set(0, 0, Some(RoundEntry::identity()));
        let mut other = layout.clone();
        other.n_channels = 1;
        let channels = crate::channel::register_channels(
            &std::collections::BTreeMap::new(),
            &other,
            &crate::config::ChannelConfig::default(),
        );

        let err = compose_initial(&channels, &rounds, &layout).unwrap_err();
        assert!(
            matches!(err, Error::MissingEntry { what: "channel transform", tile: 0, round: 0 }),
            "{:?}",
            err
        );

        let channels = crate::channel::register_channels(
            &std::collections::BTreeMap::new(),
            &layout,
            &crate::config::ChannelConfig::default(),
        );
        let initial = compose_initial(&channels, &rounds, &layout).unwrap();
        assert!(initial.get(0, 0, 1).unwrap().is_identity(0.0));
        assert!(initial.get(0, layout.anchor_round, 0).is_none());
    }
}
