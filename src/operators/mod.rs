//! Proposal mechanisms.
//!
//! An [`Operator`] edits the state held in a [`ModelGraph`] in place and
//! reports how to correct the acceptance test for the asymmetry of the move.
//! The chain opens the pending phase before calling [`Operator::propose`] and
//! resolves it afterwards, so an operator never stores, accepts or restores
//! anything itself.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{error::Result, graph::ModelGraph};

mod gibbs;
mod indicator;
mod random_walk;
mod scale;
mod team;
mod tree;

pub use gibbs::{EllipticalSliceOperator, NormalMeanGibbsOperator, NormalPrecisionGibbsOperator};
pub use indicator::{BitFlipOperator, BitMoveOperator, SampleNonActiveOperator};
pub use random_walk::{RandomWalkKind, RandomWalkOperator};
pub use scale::{Scalable, ScaleOperator, UpDownOperator};
pub use team::TeamOperator;
pub use tree::{ExchangeKind, ExchangeOperator, SubtreeSlideOperator, WilsonBaldingOperator};

/// Acceptance rate most operators are tuned towards.
pub const DEFAULT_TARGET_ACCEPTANCE: f64 = 0.234;

/// What a call to [`Operator::propose`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proposal {
    /// A Metropolis-Hastings move with the log of the ratio of reverse to
    /// forward proposal densities.
    Move { log_hastings_ratio: f64 },
    /// A draw from a full conditional; always accepted.
    Gibbs,
    /// No valid move exists from the current state. Whatever the operator
    /// touched is restored and the iteration counts as rejected.
    Failed,
}

impl Proposal {
    pub fn symmetric() -> Proposal {
        Proposal::Move {
            log_hastings_ratio: 0.,
        }
    }
}

/// Whether the schedule adapts an operator's tuning value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoercionMode {
    /// Adapt when the run has adaptation switched on.
    #[default]
    Default,
    On,
    Off,
}

pub trait Operator: Send {
    fn name(&self) -> &str;

    /// Change the state and describe the move.
    ///
    /// Errors are reserved for misconfiguration; a state from which the move
    /// cannot be made is [`Proposal::Failed`].
    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal>;

    /// Whether moves are drawn from a full conditional and answered with
    /// [`Proposal::Gibbs`] rather than a Hastings ratio.
    fn is_gibbs(&self) -> bool {
        false
    }

    /// The tuning value on an unbounded scale, if the operator has one.
    fn coercable_parameter(&self) -> Option<f64> {
        None
    }

    fn set_coercable_parameter(&mut self, _value: f64) {}

    /// The tuning value in its natural units, for reports and checkpoints.
    fn raw_parameter(&self) -> Option<f64> {
        None
    }

    fn set_raw_parameter(&mut self, _value: f64) {}

    fn target_acceptance(&self) -> f64 {
        DEFAULT_TARGET_ACCEPTANCE
    }

    fn coercion_mode(&self) -> CoercionMode {
        CoercionMode::Default
    }
}

/// Draw a scale factor from `Uniform(c, 1/c)`.
fn draw_scale(rng: &mut dyn RngCore, scale_factor: f64) -> f64 {
    scale_factor + rng.random::<f64>() * (1. / scale_factor - scale_factor)
}

fn scale_factor_to_tuning(scale_factor: f64) -> f64 {
    (1. / scale_factor - 1.).ln()
}

fn tuning_to_scale_factor(value: f64) -> f64 {
    1. / (value.exp() + 1.)
}
