//! Iterative closest point refinement of initial transforms.
//!
//! A run is an explicit state machine. Each [`IcpRun::step`] maps the
//! reference cloud through the current transform, pairs every mapped point
//! with its nearest target point within the distance threshold, refits the
//! affine transform to the pairs and records the match count and mean
//! squared residual. The run leaves [`IcpPhase::Iterating`] for one of three
//! terminal phases:
//!
//! - `Converged`: the pair set is unchanged from the previous iteration and
//!   the MSE moved by at most the tolerance.
//! - `Exhausted`: the iteration cap was reached.
//! - `Degenerate`: too few pairs (or a singular fit); the transform from
//!   before that iteration is kept.
//!
//! Nearest-neighbour ties go to the lowest target index, so identical input
//! always gives identical output.


use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::affine::{Affine, Yxz};
use crate::config::IcpConfig;
use crate::layout::Dimensionality;
use crate::math::{fit_affine, median_and_mad, MAD_TO_SIGMA};
use crate::spatial::{dominant_displacement, KdTree};

/// Phase of a running refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcpPhase {
    Iterating,
    Converged,
    Exhausted,
    Degenerate,
}

/// Final outcome of a (tile, round, channel) refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcpStatus {
    Converged,
    Exhausted,
    /// Too few matched pairs; the last good transform was kept.
    Degenerate,
    /// Too few detected spots to attempt refinement; the initial transform
    /// was kept.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IcpIteration {
    /// Pairs within the distance threshold.
    pub n_matches: usize,
    /// Mean squared residual of the fitted pairs; `None` when the iteration
    /// did not fit.
    pub mse: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcpResult {
    pub initial: Affine<Yxz>,
    pub transform: Affine<Yxz>,
    /// Translation correction found by the displacement vote, if it ran.
    pub coarse_shift: Option<DVec3>,
    pub iterations: Vec<IcpIteration>,
    pub status: IcpStatus,
}

impl IcpResult {
    /// Result for a refinement that was not attempted.
    pub fn skipped(initial: Affine<Yxz>) -> Self {
        Self {
            initial,
            transform: initial,
            coarse_shift: None,
            iterations: Vec::new(),
            status: IcpStatus::Skipped,
        }
    }

    pub fn converged(&self) -> bool {
        self.status == IcpStatus::Converged
    }

    pub fn final_matches(&self) -> Option<usize> {
        self.iterations.last().map(|it| it.n_matches)
    }

    pub fn final_mse(&self) -> Option<f64> {
        self.iterations.iter().rev().find_map(|it| it.mse)
    }
}

/// One refinement of a reference cloud onto a target cloud.
pub struct IcpRun<'a> {
    reference: &'a [DVec3],
    target: &'a [DVec3],
    tree: Option<KdTree>,
    config: &'a IcpConfig,
    distance_threshold: f64,
    active: [bool; 3],
    initial: Affine<Yxz>,
    transform: Affine<Yxz>,
    coarse_shift: Option<DVec3>,
    phase: IcpPhase,
    iterations: Vec<IcpIteration>,
    previous_pairs: Vec<(usize, usize)>,
}

impl<'a> IcpRun<'a> {
    /// Prepares a run, applying the coarse translation search when enabled.
    pub fn new(
        reference: &'a [DVec3],
        target: &'a [DVec3],
        start: Affine<Yxz>,
        distance_threshold: f64,
        dimensionality: Dimensionality,
        config: &'a IcpConfig,
    ) -> Self {
        let tree = KdTree::build(target);
        let active = dimensionality.active_axes::<Yxz>();

        let mut transform = start;
        let mut coarse_shift = None;
        if let (Some(radius), Some(tree)) = (config.coarse_search_radius, tree.as_ref()) {
            let mapped: Vec<DVec3> = reference.iter().map(|&p| start.apply(p)).collect();
            if let Some(shift) = dominant_displacement(tree, &mapped, radius, active) {
                transform = start.then(&Affine::from_translation(shift));
                coarse_shift = Some(shift);
            }
        }

        Self {
            reference,
            target,
            tree,
            config,
            distance_threshold,
            active,
            initial: start,
            transform,
            coarse_shift,
            phase: IcpPhase::Iterating,
            iterations: Vec::new(),
            previous_pairs: Vec::new(),
        }
    }

    pub fn phase(&self) -> IcpPhase {
        self.phase
    }

    pub fn transform(&self) -> Affine<Yxz> {
        self.transform
    }

    pub fn iterations(&self) -> &[IcpIteration] {
        &self.iterations
    }

    /// Runs one iteration. Does nothing once the run has terminated.
    pub fn step(&mut self) -> IcpPhase {
        if self.phase != IcpPhase::Iterating {
            return self.phase;
        }
        if self.iterations.len() >= self.config.max_iterations {
            self.phase = IcpPhase::Exhausted;
            return self.phase;
        }

        let pairs = self.match_pairs();
        if pairs.len() < self.config.min_matches {
            return self.degenerate(pairs.len());
        }

        let src: Vec<DVec3> = pairs.iter().map(|&(i, _)| self.reference[i]).collect();
        let dst: Vec<DVec3> = pairs.iter().map(|&(_, j)| self.target[j]).collect();
        let Some(mut fitted) = fit_affine::<Yxz>(&src, &dst, None, self.active) else {
            return self.degenerate(pairs.len());
        };

        let mut kept: Vec<usize> = (0..pairs.len()).collect();
        if self.config.robust {
            if let Some((refit, inliers)) = self.robust_refit(&fitted, &src, &dst) {
                fitted = refit;
                kept = inliers;
            }
        }

        let mse = kept
            .iter()
            .map(|&k| fitted.apply(src[k]).distance_squared(dst[k]))
            .sum::<f64>()
            / kept.len() as f64;

        let previous_mse = self.iterations.last().and_then(|it| it.mse);
        self.transform = fitted;
        self.iterations.push(IcpIteration {
            n_matches: pairs.len(),
            mse: Some(mse),
        });
        log::debug!(
            "ICP iteration {}: {} matches, mse {:.5}",
            self.iterations.len(),
            pairs.len(),
            mse
        );

        let stable = pairs == self.previous_pairs
            && previous_mse.is_some_and(|prev| (prev - mse).abs() <= self.config.mse_tolerance);
        self.previous_pairs = pairs;
        if stable {
            self.phase = IcpPhase::Converged;
        } else if self.iterations.len() >= self.config.max_iterations {
            self.phase = IcpPhase::Exhausted;
        }
        self.phase
    }

    /// Steps until a terminal phase and returns the result.
    pub fn run(mut self) -> IcpResult {
        while self.step() == IcpPhase::Iterating {}
        self.into_result()
    }

    pub fn into_result(self) -> IcpResult {
        let status = match self.phase {
            IcpPhase::Converged => IcpStatus::Converged,
            IcpPhase::Degenerate => IcpStatus::Degenerate,
            IcpPhase::Iterating | IcpPhase::Exhausted => IcpStatus::Exhausted,
        };
        IcpResult {
            initial: self.initial,
            transform: self.transform,
            coarse_shift: self.coarse_shift,
            iterations: self.iterations,
            status,
        }
    }

    fn degenerate(&mut self, n_matches: usize) -> IcpPhase {
        // Without a single successful fit the coarse correction is unverified.
        if self.iterations.iter().all(|it| it.mse.is_none()) {
            self.transform = self.initial;
        }
        self.iterations.push(IcpIteration {
            n_matches,
            mse: None,
        });
        self.phase = IcpPhase::Degenerate;
        self.phase
    }

    /// (reference, target) index pairs within the distance threshold, in
    /// reference order.
    fn match_pairs(&self) -> Vec<(usize, usize)> {
        let Some(tree) = self.tree.as_ref() else {
            return Vec::new();
        };
        let max_sq = self.distance_threshold * self.distance_threshold;
        self.reference
            .iter()
            .enumerate()
            .filter_map(|(i, &p)| {
                let (j, d) = tree.nearest(self.transform.apply(p))?;
                (d <= max_sq).then_some((i, j))
            })
            .collect()
    }

    /// Drops pairs whose residual exceeds `median + 3σ` (at least the floor)
    /// and refits. `None` when trimming would leave too few pairs.
    fn robust_refit(
        &self,
        fitted: &Affine<Yxz>,
        src: &[DVec3],
        dst: &[DVec3],
    ) -> Option<(Affine<Yxz>, Vec<usize>)> {
        let residuals: Vec<f64> = src
            .iter()
            .zip(dst)
            .map(|(&s, &d)| fitted.apply(s).distance(d))
            .collect();
        let (median, mad) = median_and_mad(&residuals)?;
        let cutoff = (median + 3.0 * MAD_TO_SIGMA * mad).max(self.config.robust_residual_floor);

        let inliers: Vec<usize> = (0..residuals.len())
            .filter(|&k| residuals[k] <= cutoff)
            .collect();
        if inliers.len() == residuals.len() || inliers.len() < self.config.min_matches {
            return None;
        }

        let src: Vec<DVec3> = inliers.iter().map(|&k| src[k]).collect();
        let dst: Vec<DVec3> = inliers.iter().map(|&k| dst[k]).collect();
        let refit = fit_affine::<Yxz>(&src, &dst, None, self.active)?;
        Some((refit, inliers))
    }
}

/// Refines `start` so that it maps `reference` onto `target`.
pub fn icp(
    reference: &[DVec3],
    target: &[DVec3],
    start: Affine<Yxz>,
    distance_threshold: f64,
    dimensionality: Dimensionality,
    config: &IcpConfig,
) -> IcpResult {
    IcpRun::new(reference, target, start, distance_threshold, dimensionality, config).run()
}
