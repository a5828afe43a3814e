use thiserror::Error;

use crate::chain::ChainPhase;

/// Errors raised by the inference core.
///
/// Recoverable per-iteration conditions (out-of-bounds values, non-finite
/// densities, inapplicable moves) never show up here. They are handled by
/// the accept/reject test. Everything in this enum either aborts the run or
/// is reported to the driver.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum McmcError {
    #[error("Unknown {kind} with index {index}")]
    UnknownNode { kind: &'static str, index: usize },

    #[error("Invalid model configuration: {0}")]
    Misconfigured(String),

    #[error("Dimension mismatch for {name}: expected {expected}, found {found}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Model state stored twice without accept or restore")]
    NestedStore,

    #[error("Accept or restore called without a pending store")]
    NotStored,

    #[error("Illegal chain transition from {from:?} to {to:?}")]
    IllegalTransition { from: ChainPhase, to: ChainPhase },

    #[error("The initial model is invalid: {0}")]
    InvalidInitialState(String),

    #[error(
        "State was not correctly calculated after operator {operator}: \
         incremental {incremental}, full evaluation {full}"
    )]
    EvaluationMismatch {
        operator: String,
        incremental: f64,
        full: f64,
    },

    #[error(
        "State was not correctly restored after operator {operator}: \
         before {before}, after {after}"
    )]
    RestoreMismatch {
        operator: String,
        before: f64,
        after: f64,
    },

    #[error("Checkpoint log posterior {expected} does not match recomputed value {found}")]
    CheckpointMismatch { expected: f64, found: f64 },

    #[error("Checkpoint does not fit the model: {0}")]
    CheckpointLayout(String),

    #[error("Could not parse Newick tree: {0}")]
    Newick(String),

    #[error("Invalid tree: {0}")]
    InvalidTree(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Could not (de)serialize checkpoint")]
    Json(#[from] serde_json::Error),

    #[error("Could not build trace arrays")]
    Trace(#[from] arrow::error::ArrowError),
}

pub type Result<T> = std::result::Result<T, McmcError>;
