use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use arrow::array::StructArray;
use itertools::Itertools;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{
    iter::{IntoParallelIterator, ParallelIterator},
    ThreadPoolBuilder,
};
use serde::{Deserialize, Serialize};

use crate::{
    chain::{MarkovChain, RunOutcome, StopHandle},
    checkpoint::{CheckpointListener, StateSaver},
    error::McmcError,
    graph::ModelGraph,
    listener::TraceCollector,
    model::ModelId,
    schedule::{OperatorSchedule, OperatorStats, OptimizationTransform},
};

/// Settings for running MCMC chains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McmcSettings {
    /// The number of iterations of each chain.
    pub chain_length: u64,
    pub seed: u64,
    pub num_chains: usize,
    /// Threads used to run chains in parallel. Zero starts one per chain.
    pub num_threads: usize,
    /// Adapt the tuning values of operators that leave the choice to the
    /// run.
    pub adapt: bool,
    /// How the step size of the adaptation shrinks with the number of times
    /// an operator was used.
    pub optimization_transform: OptimizationTransform,
    /// For this many iterations at the start, every incremental score is
    /// compared against a full evaluation of the model. Zero disables the
    /// check.
    pub full_evaluation_count: u64,
    /// The full evaluation check also keeps running until each operator has
    /// been used this many times.
    pub min_operator_count: u64,
    /// Largest difference between an incremental and a full evaluation that
    /// is not treated as an error.
    pub evaluation_tolerance: f64,
    /// Record every `log_every`-th state in the trace.
    pub log_every: u64,
    /// Save a checkpoint every `checkpoint_every` iterations. Zero only saves
    /// at the end of the run.
    pub checkpoint_every: u64,
    /// Where checkpoints go, one file per chain. Nothing is saved without it.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for McmcSettings {
    fn default() -> Self {
        Self {
            chain_length: 10_000,
            seed: 0,
            num_chains: 4,
            num_threads: 0,
            adapt: true,
            optimization_transform: OptimizationTransform::Default,
            full_evaluation_count: 2000,
            min_operator_count: 1,
            evaluation_tolerance: 1e-6,
            log_every: 100,
            checkpoint_every: 0,
            checkpoint_dir: None,
        }
    }
}

impl McmcSettings {
    /// Read settings from JSON. Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<McmcSettings, McmcError> {
        let settings: McmcSettings = serde_json::from_str(json)?;
        if !(settings.evaluation_tolerance >= 0.) {
            return Err(McmcError::Misconfigured(format!(
                "evaluation tolerance must not be negative, got {}",
                settings.evaluation_tolerance
            )));
        }
        Ok(settings)
    }
}

/// Everything a chain needs apart from its settings and random numbers.
pub struct ChainSetup {
    pub graph: ModelGraph,
    pub posterior: ModelId,
    pub schedule: OperatorSchedule,
}

/// The result of one chain.
#[derive(Debug)]
pub struct ChainOutput {
    pub chain: u64,
    pub outcome: RunOutcome,
    pub iterations: u64,
    pub final_score: f64,
    pub best_score: f64,
    pub operators: Vec<(String, OperatorStats)>,
    pub trace: StructArray,
}

/// The random number generator of chain `chain`: one stream of the seed.
pub fn chain_rng(seed: u64, chain: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(chain);
    rng
}

fn run_chain<F>(settings: &McmcSettings, chain_id: u64, build: &F, stop: &StopHandle) -> Result<ChainOutput>
where
    F: Fn(u64) -> Result<ChainSetup> + Sync,
{
    let ChainSetup {
        graph,
        posterior,
        schedule,
    } = build(chain_id).with_context(|| format!("Could not build chain {chain_id}"))?;
    let trace = Arc::new(Mutex::new(TraceCollector::new(&graph, settings.log_every)));
    let mut chain = MarkovChain::new(
        graph,
        posterior,
        schedule,
        settings.clone(),
        chain_rng(settings.seed, chain_id),
    )
    .with_context(|| format!("Could not start chain {chain_id}"))?
    .with_stop_handle(stop.clone());

    chain.add_listener(trace.clone());
    if let Some(dir) = &settings.checkpoint_dir {
        let saver = StateSaver::new(dir.join(format!("chain-{chain_id}.json")));
        let every = match settings.checkpoint_every {
            0 => u64::MAX,
            every => every,
        };
        chain.add_listener(CheckpointListener::new(saver, every));
    }

    let outcome = chain.run(settings.chain_length)?;
    chain.finish()?;

    let schedule = chain.schedule();
    let operators = (0..schedule.len())
        .map(|k| (schedule.operator(k).name().to_string(), schedule.stats(k)))
        .collect();
    let trace = trace
        .lock()
        .map_err(|_| anyhow!("Trace lock was poisoned"))?
        .finish()?;
    Ok(ChainOutput {
        chain: chain_id,
        outcome,
        iterations: chain.iteration(),
        final_score: chain.current_score(),
        best_score: chain.best_score(),
        operators,
        trace,
    })
}

/// Run `settings.num_chains` independent chains on a thread pool.
///
/// `build` is called once per chain, on that chain's thread, to set up its
/// model and operators.
pub fn sample_parallel<F>(settings: &McmcSettings, build: F) -> Result<Vec<ChainOutput>>
where
    F: Fn(u64) -> Result<ChainSetup> + Sync,
{
    sample_parallel_until(settings, build, &StopHandle::default())
}

/// Like [`sample_parallel`], but every chain stops early once `stop` is
/// triggered.
pub fn sample_parallel_until<F>(
    settings: &McmcSettings,
    build: F,
    stop: &StopHandle,
) -> Result<Vec<ChainOutput>>
where
    F: Fn(u64) -> Result<ChainSetup> + Sync,
{
    let num_threads = match settings.num_threads {
        0 => settings.num_chains.max(1),
        n => n,
    };
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("phylo-mcmc-worker-{}", i))
        .build()
        .context("Could not start thread pool")?;

    log::info!(
        "Running {} chains of {} iterations on {num_threads} threads",
        settings.num_chains,
        settings.chain_length
    );
    let results: Vec<Result<ChainOutput>> = pool.install(|| {
        (0..settings.num_chains as u64)
            .into_par_iter()
            .map(|chain_id| run_chain(settings, chain_id, &build, stop))
            .collect()
    });

    let (outputs, errors): (Vec<_>, Vec<_>) = results.into_iter().partition_result();
    if let Some(error) = errors.into_iter().next() {
        return Err(error).context("A chain failed");
    }
    Ok(outputs)
}
