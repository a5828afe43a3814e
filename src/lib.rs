//! Metropolis-Hastings and Gibbs inference over a graph of cached
//! likelihoods, parameters and phylogenetic trees.
//!
//! Models are wired into a [`ModelGraph`], operators are collected in an
//! [`OperatorSchedule`], and a [`MarkovChain`] drives the
//! propose/evaluate/accept loop with a one-level undo of every touched
//! cache. [`sample_parallel`] runs independent chains on a thread pool.

pub(crate) mod acceptor;
pub(crate) mod chain;
pub(crate) mod checkpoint;
pub(crate) mod distribution;
pub(crate) mod error;
pub(crate) mod graph;
pub(crate) mod likelihood;
pub(crate) mod listener;
pub(crate) mod model;
pub mod operators;
pub(crate) mod parameter;
pub(crate) mod sampler;
pub(crate) mod schedule;
pub(crate) mod state;
pub(crate) mod tree;

pub use acceptor::{Acceptance, Acceptor, MetropolisHastings};
pub use chain::{ChainPhase, ChainRng, MarkovChain, RunOutcome, StepOutcome, StopHandle};
pub use checkpoint::{Checkpoint, CheckpointListener, StateLoader, StateSaver};
pub use distribution::Distribution;
pub use error::McmcError;
pub use graph::{GraphFingerprint, ModelGraph};
pub use likelihood::{
    ActiveSet, CompoundLikelihood, ConstantCoalescentLikelihood, DistributionLikelihood,
    MonophylyLikelihood, MultivariateNormalLikelihood, NormalLikelihood, SparseNormalLikelihood,
};
pub use listener::{
    BackgroundListener, ChainListener, ChainSnapshot, ChainState, LogListener, OperatorSnapshot,
    ParameterSnapshot, SnapshotSink, TraceCollector,
};
pub use model::{Dependency, Inputs, Model, ModelId, ParameterId, TreeId, Variable};
pub use operators::{CoercionMode, Operator, Proposal};
pub use parameter::{Bounds, Parameter, VariableChange};
pub use sampler::{
    chain_rng, sample_parallel, sample_parallel_until, ChainOutput, ChainSetup, McmcSettings,
};
pub use schedule::{OperatorSchedule, OperatorStats, OptimizationTransform, ScheduleKind};
pub use state::Stored;
pub use tree::{TipSet, Tree, TreeNode, TreeSnapshot};
