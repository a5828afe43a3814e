//! Saving and resuming chains.
//!
//! A checkpoint holds every parameter value, every tree, the operator
//! tuning values and counters, the position of the random number generator,
//! the iteration and the log posterior at the time it was taken. Loading it back re-scores the state and refuses to
//! continue if the score has moved.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    chain::{ChainRng, MarkovChain},
    error::McmcError,
    listener::{ChainListener, ChainSnapshot, ChainState},
};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    #[serde(flatten)]
    pub state: ChainSnapshot,
}

impl Checkpoint {
    pub fn from_state(state: &ChainState<'_>) -> Checkpoint {
        Checkpoint {
            version: FORMAT_VERSION,
            state: state.snapshot(),
        }
    }

    pub fn from_chain<R: ChainRng>(chain: &MarkovChain<R>) -> Checkpoint {
        Checkpoint::from_state(&chain.state())
    }
}

/// Writes checkpoints to one path, replacing the previous one atomically.
#[derive(Debug, Clone)]
pub struct StateSaver {
    path: PathBuf,
}

impl StateSaver {
    pub fn new(path: impl Into<PathBuf>) -> StateSaver {
        StateSaver { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), McmcError> {
        let mut temporary = self.path.clone().into_os_string();
        temporary.push(".tmp");
        let temporary = PathBuf::from(temporary);
        {
            let file = File::create(&temporary)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, checkpoint)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temporary, &self.path)?;
        log::debug!(
            "Saved checkpoint at iteration {} to {}",
            checkpoint.state.iteration,
            self.path.display()
        );
        Ok(())
    }
}

/// Reads checkpoints and puts their state back into a chain.
#[derive(Debug, Clone)]
pub struct StateLoader {
    tolerance: f64,
}

impl Default for StateLoader {
    fn default() -> Self {
        StateLoader { tolerance: 1e-6 }
    }
}

impl StateLoader {
    pub fn with_tolerance(tolerance: f64) -> StateLoader {
        StateLoader { tolerance }
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Result<Checkpoint, McmcError> {
        let file = File::open(path.as_ref())?;
        let checkpoint: Checkpoint = serde_json::from_reader(BufReader::new(file))?;
        if checkpoint.version != FORMAT_VERSION {
            return Err(McmcError::CheckpointLayout(format!(
                "unsupported format version {}",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }

    /// Put the saved state into `chain` and check that it scores what it
    /// scored when it was saved.
    ///
    /// Parameters and trees are matched by name and operators by position
    /// and name. The chain must have been built from the same model.
    pub fn restore<R: ChainRng>(
        &self,
        checkpoint: &Checkpoint,
        chain: &mut MarkovChain<R>,
    ) -> Result<(), McmcError> {
        let state = &checkpoint.state;
        let graph = chain.graph_mut();
        for saved in state.parameters.iter() {
            let id = graph.parameter_by_name(&saved.name).ok_or_else(|| {
                McmcError::CheckpointLayout(format!("no parameter named {}", saved.name))
            })?;
            graph.load_parameter(id, saved.values.clone())?;
        }
        for saved in state.trees.iter() {
            let id = graph.tree_by_name(&saved.name).ok_or_else(|| {
                McmcError::CheckpointLayout(format!("no tree named {}", saved.name))
            })?;
            graph.load_tree(id, saved)?;
        }

        let schedule = chain.schedule_mut();
        if schedule.len() != state.operators.len() {
            return Err(McmcError::CheckpointLayout(format!(
                "checkpoint has {} operators, the chain has {}",
                state.operators.len(),
                schedule.len()
            )));
        }
        for (index, saved) in state.operators.iter().enumerate() {
            if schedule.operator(index).name() != saved.name {
                return Err(McmcError::CheckpointLayout(format!(
                    "operator {index} is {}, checkpoint has {}",
                    schedule.operator(index).name(),
                    saved.name
                )));
            }
            if let Some(tuning) = saved.tuning {
                schedule.operator_mut(index).set_raw_parameter(tuning);
            }
            schedule.set_weight(index, saved.weight)?;
            schedule.set_stats(index, saved.stats);
        }

        match &state.rng {
            Some(saved) => chain.rng_mut().load_state(saved)?,
            None => log::warn!(
                "Checkpoint has no random number generator state; \
                 the resumed run will not repeat the original one"
            ),
        }

        chain.set_iteration(state.iteration);
        let found = chain.rescore()?;
        log::warn!(
            "Resumed from checkpoint at iteration {} with log posterior {found}",
            state.iteration
        );
        if !((found - state.log_posterior).abs() <= self.tolerance) {
            log::error!(
                "Checkpoint log posterior {} does not match the restored state {found}",
                state.log_posterior
            );
            return Err(McmcError::CheckpointMismatch {
                expected: state.log_posterior,
                found,
            });
        }
        Ok(())
    }
}

/// Saves a checkpoint every `every` iterations and at the end of the run.
#[derive(Debug, Clone)]
pub struct CheckpointListener {
    saver: StateSaver,
    every: u64,
}

impl CheckpointListener {
    pub fn new(saver: StateSaver, every: u64) -> CheckpointListener {
        CheckpointListener {
            saver,
            every: every.max(1),
        }
    }
}

impl ChainListener for CheckpointListener {
    fn current_state(&mut self, state: &ChainState<'_>) -> Result<()> {
        if state.iteration > 0 && state.iteration % self.every == 0 {
            self.saver.save(&Checkpoint::from_state(state))?;
        }
        Ok(())
    }

    fn finished(&mut self, state: &ChainState<'_>) -> Result<()> {
        self.saver.save(&Checkpoint::from_state(state))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::{Checkpoint, StateLoader, StateSaver};
    use crate::{
        chain::MarkovChain,
        distribution::Distribution,
        error::McmcError,
        graph::ModelGraph,
        likelihood::{CompoundLikelihood, ConstantCoalescentLikelihood, DistributionLikelihood},
        operators::{ScaleOperator, SubtreeSlideOperator},
        parameter::{Bounds, Parameter},
        sampler::McmcSettings,
        schedule::OperatorSchedule,
        tree::Tree,
    };

    fn chain(seed: u64) -> MarkovChain<ChaCha8Rng> {
        let mut graph = ModelGraph::new();
        let n = graph
            .add_parameter(Parameter::scalar("N", 1.).with_bounds(Bounds::POSITIVE))
            .unwrap();
        let tree = graph
            .add_tree(Tree::from_newick("t", "((a:1,b:1):1,(c:0.5,d:0.5):1.5);").unwrap())
            .unwrap();
        let prior = graph
            .add_model(DistributionLikelihood::new(
                "prior",
                n,
                Distribution::LogNormal { mu: 0., sigma: 1. },
            ))
            .unwrap();
        let coalescent = graph
            .add_model(ConstantCoalescentLikelihood::new("coalescent", tree, n))
            .unwrap();
        let posterior = graph
            .add_model(CompoundLikelihood::new("posterior", vec![prior, coalescent]))
            .unwrap();
        let mut schedule = OperatorSchedule::new();
        schedule.add(ScaleOperator::new(n, 0.75).unwrap(), 1.).unwrap();
        schedule.add(SubtreeSlideOperator::new(tree, 0.5).unwrap(), 2.).unwrap();
        MarkovChain::new(
            graph,
            posterior,
            schedule,
            McmcSettings::default(),
            ChaCha8Rng::seed_from_u64(seed),
        )
        .unwrap()
    }

    #[test]
    fn save_and_resume() {
        let dir = std::env::temp_dir().join(format!("phylo-mcmc-checkpoint-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("chain.json");

        let mut first = chain(70);
        first.run(500).unwrap();
        let saver = StateSaver::new(&path);
        saver.save(&Checkpoint::from_chain(&first)).unwrap();

        let loader = StateLoader::default();
        let checkpoint = loader.read(&path).unwrap();
        let mut second = chain(71);
        loader.restore(&checkpoint, &mut second).unwrap();
        assert_eq!(second.iteration(), 500);
        approx::assert_abs_diff_eq!(
            second.current_score(),
            first.current_score(),
            epsilon = 1e-9
        );
        assert_eq!(second.schedule().stats(1), first.schedule().stats(1));
        let n = second.graph().parameter_by_name("N").unwrap();
        approx::assert_abs_diff_eq!(
            second.graph().parameter(n).value(0),
            first.graph().parameter(n).value(0),
            epsilon = 1e-12
        );
        // Same generator position, so both chains take the same next steps.
        first.run(200).unwrap();
        second.run(200).unwrap();
        assert_eq!(second.current_score().to_bits(), first.current_score().to_bits());
        assert_eq!(second.graph().fingerprint(), first.graph().fingerprint());

        let mut tampered = checkpoint.clone();
        tampered.state.log_posterior += 1.;
        let mut third = chain(72);
        assert!(matches!(
            loader.restore(&tampered, &mut third),
            Err(McmcError::CheckpointMismatch { .. })
        ));

        let mut renamed = checkpoint;
        renamed.state.parameters[0].name = "theta".into();
        let mut fourth = chain(73);
        assert!(matches!(
            loader.restore(&renamed, &mut fourth),
            Err(McmcError::CheckpointLayout(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
