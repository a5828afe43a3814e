use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use rand::{rngs::SmallRng, RngCore};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use crate::{
    acceptor::{Acceptance, Acceptor, MetropolisHastings},
    error::McmcError,
    graph::ModelGraph,
    listener::{ChainListener, ChainState},
    model::ModelId,
    operators::Proposal,
    sampler::McmcSettings,
    schedule::OperatorSchedule,
};

/// Where a chain is within an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    Ready,
    Proposed,
    Accepted,
    Rejected,
}

/// What happened in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Accepted,
    Rejected,
    /// The operator found no move to make; nothing changed.
    OperatorFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// A stop was requested through a [`StopHandle`].
    Stopped,
}

/// Cooperative stop request, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Withdraw a stop request so the chain can be run again.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// A random number generator a chain can run on.
///
/// Generators that can report their position let a checkpoint resume a run
/// exactly where it stopped. The others keep whatever stream they were
/// built with when a chain is resumed.
pub trait ChainRng: RngCore + fmt::Debug {
    fn save_state(&self) -> Option<serde_json::Value> {
        None
    }

    fn load_state(&mut self, _state: &serde_json::Value) -> Result<(), McmcError> {
        Err(McmcError::CheckpointLayout(
            "the random number generator of this chain cannot load a saved state".into(),
        ))
    }
}

impl ChainRng for ChaCha8Rng {
    fn save_state(&self) -> Option<serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(state) => Some(state),
            Err(err) => {
                log::warn!("Could not save the random number generator: {err}");
                None
            }
        }
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<(), McmcError> {
        *self = ChaCha8Rng::deserialize(state)?;
        Ok(())
    }
}

impl ChainRng for SmallRng {}

/// A Metropolis-Hastings chain over the state held in a [`ModelGraph`].
///
/// Each iteration stores the graph, lets one operator from the schedule
/// change it, scores the posterior incrementally and then either accepts
/// the new state or restores the old one exactly.
pub struct MarkovChain<R: ChainRng> {
    graph: ModelGraph,
    posterior: ModelId,
    schedule: OperatorSchedule,
    acceptor: Box<dyn Acceptor>,
    settings: McmcSettings,
    rng: R,
    phase: ChainPhase,
    iteration: u64,
    current_score: f64,
    initial_score: f64,
    best_score: f64,
    full_evaluation: bool,
    listeners: Vec<Box<dyn ChainListener>>,
    stop: StopHandle,
}

impl<R: ChainRng> MarkovChain<R> {
    /// Set up a chain at the current state of `graph`.
    ///
    /// This fails if the schedule is empty or if the initial state has zero
    /// density or a numerically invalid one.
    pub fn new(
        mut graph: ModelGraph,
        posterior: ModelId,
        schedule: OperatorSchedule,
        settings: McmcSettings,
        rng: R,
    ) -> Result<Self, McmcError> {
        if schedule.is_empty() {
            return Err(McmcError::Misconfigured("the operator schedule is empty".into()));
        }
        if graph.is_pending() {
            return Err(McmcError::Misconfigured(
                "the model graph has an unresolved proposal".into(),
            ));
        }
        let score = initial_score(&mut graph, posterior)?;
        let schedule = schedule.with_transform(settings.optimization_transform);
        Ok(MarkovChain {
            graph,
            posterior,
            schedule,
            acceptor: Box::new(MetropolisHastings),
            full_evaluation: settings.full_evaluation_count > 0,
            settings,
            rng,
            phase: ChainPhase::Ready,
            iteration: 0,
            current_score: score,
            initial_score: score,
            best_score: score,
            listeners: Vec::new(),
            stop: StopHandle::default(),
        })
    }

    pub fn with_acceptor(mut self, acceptor: impl Acceptor + 'static) -> Self {
        self.acceptor = Box::new(acceptor);
        self
    }

    /// Share a stop flag with other chains or with the caller.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn add_listener(&mut self, listener: impl ChainListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    pub(crate) fn graph_mut(&mut self) -> &mut ModelGraph {
        &mut self.graph
    }

    pub fn posterior(&self) -> ModelId {
        self.posterior
    }

    pub fn schedule(&self) -> &OperatorSchedule {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut OperatorSchedule {
        &mut self.schedule
    }

    pub fn settings(&self) -> &McmcSettings {
        &self.settings
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub(crate) fn rng_mut(&mut self) -> &mut R {
        &mut self.rng
    }

    pub(crate) fn set_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    pub fn current_score(&self) -> f64 {
        self.current_score
    }

    pub fn initial_score(&self) -> f64 {
        self.initial_score
    }

    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    /// Whether the full-evaluation self check is still running.
    pub fn is_checking_evaluations(&self) -> bool {
        self.full_evaluation
    }

    /// A borrowed view of the current state, as listeners see it.
    pub fn state(&self) -> ChainState<'_> {
        ChainState {
            iteration: self.iteration,
            score: self.current_score,
            graph: &self.graph,
            schedule: &self.schedule,
            rng: Some(&self.rng as &dyn ChainRng),
        }
    }

    /// Forget all cached values and score the current state from scratch.
    pub(crate) fn rescore(&mut self) -> Result<f64, McmcError> {
        self.graph.make_dirty();
        self.current_score = self.graph.evaluate(self.posterior)?;
        Ok(self.current_score)
    }

    fn transition(&mut self, to: ChainPhase) -> Result<(), McmcError> {
        use ChainPhase::*;
        match (self.phase, to) {
            (Ready, Proposed)
            | (Proposed, Accepted)
            | (Proposed, Rejected)
            | (Accepted, Ready)
            | (Rejected, Ready) => {
                self.phase = to;
                Ok(())
            }
            (from, to) => Err(McmcError::IllegalTransition { from, to }),
        }
    }

    /// Clear the operator counters and the iteration count.
    pub fn reset(&mut self) -> Result<(), McmcError> {
        if self.phase != ChainPhase::Ready {
            return Err(McmcError::IllegalTransition {
                from: self.phase,
                to: ChainPhase::Ready,
            });
        }
        self.iteration = 0;
        self.schedule.reset();
        self.full_evaluation = self.settings.full_evaluation_count > 0;
        Ok(())
    }

    /// Run one iteration.
    ///
    /// An error leaves the chain outside the `Ready` phase and every later
    /// call to `step` fails.
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.transition(ChainPhase::Proposed)?;
        self.notify(Event::Current, self.current_score)?;

        let index = self.schedule.next_index(&mut self.rng);
        let old_score = self.current_score;
        self.graph.store()?;
        let proposal = self
            .schedule
            .operator_mut(index)
            .propose(&mut self.graph, &mut self.rng)
            .with_context(|| {
                format!("Operator {} could not propose", self.schedule.operator(index).name())
            })?;

        let (outcome, log_alpha) = match proposal {
            Proposal::Failed => {
                self.graph.restore()?;
                self.transition(ChainPhase::Rejected)?;
                log::trace!(
                    "iteration {}: {} failed",
                    self.iteration,
                    self.schedule.operator(index).name()
                );
                (StepOutcome::OperatorFailed, f64::NEG_INFINITY)
            }
            Proposal::Gibbs | Proposal::Move { .. } => {
                let score = self.graph.evaluate(self.posterior)?;
                if self.full_evaluation {
                    self.check_evaluation(index, score)?;
                }
                let acceptance = match proposal {
                    Proposal::Move { log_hastings_ratio } => self.acceptor.accept(
                        old_score,
                        score,
                        log_hastings_ratio,
                        &mut self.rng,
                    ),
                    _ => Acceptance {
                        accept: true,
                        log_alpha: 0.,
                    },
                };
                log::trace!(
                    "iteration {}: {} proposed {score} against {old_score}, accept = {}",
                    self.iteration,
                    self.schedule.operator(index).name(),
                    acceptance.accept
                );
                if acceptance.accept {
                    self.graph.accept()?;
                    self.current_score = score;
                    self.transition(ChainPhase::Accepted)?;
                    if score > self.best_score {
                        self.best_score = score;
                        self.notify(Event::Best, score)?;
                    }
                    (StepOutcome::Accepted, acceptance.log_alpha)
                } else {
                    self.graph.restore()?;
                    self.transition(ChainPhase::Rejected)?;
                    (StepOutcome::Rejected, acceptance.log_alpha)
                }
            }
        };

        if self.full_evaluation {
            self.check_restore(index)?;
        }
        self.schedule.record(index, outcome);
        self.schedule.coerce(index, log_alpha, self.settings.adapt);

        if self.full_evaluation
            && self.iteration >= self.settings.full_evaluation_count
            && self.schedule.minimum_count() >= self.settings.min_operator_count
        {
            log::debug!(
                "Full evaluation check passed after {} iterations",
                self.iteration + 1
            );
            self.full_evaluation = false;
        }

        self.iteration += 1;
        self.transition(ChainPhase::Ready)?;
        Ok(outcome)
    }

    /// The incremental score of a proposal must match a full evaluation.
    fn check_evaluation(&mut self, index: usize, incremental: f64) -> Result<(), McmcError> {
        self.graph.make_dirty();
        let full = self.graph.evaluate(self.posterior)?;
        if (full - incremental).abs() > self.settings.evaluation_tolerance {
            let operator = self.schedule.operator(index).name().to_string();
            log::error!(
                "State was not correctly calculated after an operator move.\n\
                 Likelihood evaluation: {incremental}\n\
                 Full likelihood evaluation: {full}\n\
                 Operator: {operator}\n{}",
                self.graph.diagnosis(self.posterior)
            );
            return Err(McmcError::EvaluationMismatch {
                operator,
                incremental,
                full,
            });
        }
        Ok(())
    }

    /// After accept or restore the graph must score what the chain believes.
    fn check_restore(&mut self, index: usize) -> Result<(), McmcError> {
        self.graph.make_dirty();
        let after = self.graph.evaluate(self.posterior)?;
        let before = self.current_score;
        // Both infinite and equal is fine; the difference would be NaN.
        if after != before && !((after - before).abs() <= self.settings.evaluation_tolerance) {
            let operator = self.schedule.operator(index).name().to_string();
            log::error!(
                "State was not correctly restored after {operator}: \
                 likelihood before {before}, after {after}\n{}",
                self.graph.diagnosis(self.posterior)
            );
            return Err(McmcError::RestoreMismatch {
                operator,
                before,
                after,
            });
        }
        Ok(())
    }

    /// Run `length` more iterations, or until a stop is requested.
    pub fn run(&mut self, length: u64) -> Result<RunOutcome> {
        if self.phase != ChainPhase::Ready {
            return Err(McmcError::IllegalTransition {
                from: self.phase,
                to: ChainPhase::Proposed,
            }
            .into());
        }
        self.rescore()?;
        if self.iteration == 0 {
            self.initial_score = self.current_score;
            self.best_score = self.current_score;
            self.notify(Event::Best, self.current_score)?;
        }
        log::info!(
            "Running {length} iterations from iteration {}, log posterior {}",
            self.iteration,
            self.current_score
        );
        let end = self.iteration + length;
        let mut outcome = RunOutcome::Completed;
        while self.iteration < end {
            if self.stop.is_stopped() {
                log::info!("Stopped at iteration {}", self.iteration);
                outcome = RunOutcome::Stopped;
                break;
            }
            self.step()
                .with_context(|| format!("Chain failed at iteration {}", self.iteration))?;
        }
        log::info!(
            "Finished at iteration {} with log posterior {} (best {})\n{}",
            self.iteration,
            self.current_score,
            self.best_score,
            self.schedule.acceptance_table()
        );
        Ok(outcome)
    }

    /// Tell every listener that sampling is over.
    pub fn finish(&mut self) -> Result<()> {
        self.notify(Event::Finished, self.current_score)
    }

    fn notify(&mut self, event: Event, score: f64) -> Result<()> {
        let state = ChainState {
            iteration: self.iteration,
            score,
            graph: &self.graph,
            schedule: &self.schedule,
            rng: Some(&self.rng as &dyn ChainRng),
        };
        for listener in self.listeners.iter_mut() {
            match event {
                Event::Current => listener.current_state(&state)?,
                Event::Best => listener.best_state(&state)?,
                Event::Finished => listener.finished(&state)?,
            }
        }
        Ok(())
    }
}

/// Score the starting state, refusing states the chain could never leave
/// in a meaningful way.
fn initial_score(graph: &mut ModelGraph, posterior: ModelId) -> Result<f64, McmcError> {
    graph.make_dirty();
    if let Some(id) = graph
        .parameter_ids()
        .find(|&id| !graph.parameter(id).is_within_bounds())
    {
        return Err(McmcError::InvalidInitialState(format!(
            "{} lies outside its bounds",
            graph.parameter(id).name()
        )));
    }
    if let Some(id) = graph.tree_ids().find(|&id| !graph.tree(id).is_valid()) {
        return Err(McmcError::InvalidInitialState(format!(
            "{} has a node below one of its children",
            graph.tree(id).name()
        )));
    }
    let score = graph.log_likelihood(posterior)?;
    if score == f64::NEG_INFINITY {
        return Err(McmcError::InvalidInitialState(format!(
            "the initial posterior has zero density:\n{}",
            graph.diagnosis(posterior)
        )));
    }
    if score.is_nan() || score == f64::INFINITY {
        return Err(McmcError::InvalidInitialState(format!(
            "a likelihood returned with a numerical error:\n{}",
            graph.diagnosis(posterior)
        )));
    }
    Ok(score)
}

#[derive(Clone, Copy)]
enum Event {
    Current,
    Best,
    Finished,
}

#[cfg(test)]
mod test {
    use std::any::Any;

    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::{ChainPhase, ChainRng, MarkovChain, StepOutcome};
    use crate::{
        distribution::Distribution,
        error::McmcError,
        graph::ModelGraph,
        likelihood::{ConstantCoalescentLikelihood, DistributionLikelihood},
        model::{Dependency, Inputs, Model, ParameterId},
        operators::{ExchangeOperator, RandomWalkOperator},
        parameter::{Bounds, Parameter},
        sampler::McmcSettings,
        schedule::OperatorSchedule,
        tree::Tree,
    };

    /// Keeps its value across changes of its input and only forgets it when
    /// made dirty.
    struct Stale {
        x: ParameterId,
        cached: Option<f64>,
    }

    impl Model for Stale {
        fn name(&self) -> &str {
            "stale"
        }

        fn dependencies(&self) -> Vec<Dependency> {
            vec![self.x.into()]
        }

        fn make_dirty(&mut self) {
            self.cached = None;
        }

        fn calculate_log_likelihood(&mut self, inputs: &Inputs<'_>) -> f64 {
            let x = inputs.parameter(self.x).value(0);
            *self.cached.get_or_insert(-0.5 * x * x)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn rejects_invalid_start() {
        let mut graph = ModelGraph::new();
        let x = graph
            .add_parameter(Parameter::scalar("x", -1.).with_bounds(Bounds::POSITIVE))
            .unwrap();
        let prior = graph
            .add_model(DistributionLikelihood::new(
                "prior",
                x,
                Distribution::Exponential { rate: 1. },
            ))
            .unwrap();
        let mut schedule = OperatorSchedule::new();
        schedule.add(RandomWalkOperator::new(x, 1.).unwrap(), 1.).unwrap();
        let result = MarkovChain::new(
            graph,
            prior,
            schedule,
            McmcSettings::default(),
            ChaCha8Rng::seed_from_u64(60),
        );
        assert!(matches!(result, Err(McmcError::InvalidInitialState(_))));

        let mut graph = ModelGraph::new();
        let x = graph.add_parameter(Parameter::scalar("x", 1.)).unwrap();
        let prior = graph
            .add_model(DistributionLikelihood::new(
                "prior",
                x,
                Distribution::Normal { mean: 0., sd: 1. },
            ))
            .unwrap();
        let result = MarkovChain::new(
            graph,
            prior,
            OperatorSchedule::new(),
            McmcSettings::default(),
            ChaCha8Rng::seed_from_u64(61),
        );
        assert!(matches!(result, Err(McmcError::Misconfigured(_))));
    }

    #[test]
    fn phases() {
        let mut graph = ModelGraph::new();
        let x = graph.add_parameter(Parameter::scalar("x", 0.)).unwrap();
        let prior = graph
            .add_model(DistributionLikelihood::new(
                "prior",
                x,
                Distribution::Normal { mean: 0., sd: 1. },
            ))
            .unwrap();
        let mut schedule = OperatorSchedule::new();
        schedule.add(RandomWalkOperator::new(x, 1.).unwrap(), 1.).unwrap();
        let mut chain = MarkovChain::new(
            graph,
            prior,
            schedule,
            McmcSettings::default(),
            ChaCha8Rng::seed_from_u64(62),
        )
        .unwrap();
        assert!(matches!(
            chain.transition(ChainPhase::Accepted),
            Err(McmcError::IllegalTransition {
                from: ChainPhase::Ready,
                to: ChainPhase::Accepted
            })
        ));
        for _ in 0..10 {
            chain.step().unwrap();
            assert_eq!(chain.phase(), ChainPhase::Ready);
            assert!(!chain.graph().is_pending());
        }
        assert_eq!(chain.iteration(), 10);
        assert_eq!(chain.schedule().stats(0).count(), 10);
        chain.reset().unwrap();
        assert_eq!(chain.iteration(), 0);
        assert_eq!(chain.schedule().stats(0).count(), 0);
    }

    #[test]
    fn generator_state() {
        let mut rng = ChaCha8Rng::seed_from_u64(65);
        rng.set_stream(4);
        let _: f64 = rng.random();
        let saved = rng.save_state().unwrap();
        let mut other = ChaCha8Rng::seed_from_u64(66);
        other.load_state(&saved).unwrap();
        assert_eq!(other.random::<u64>(), rng.random::<u64>());
        assert!(matches!(
            other.load_state(&serde_json::json!({ "seed": 1 })),
            Err(McmcError::Json(_))
        ));

        // A chain without a saveable generator still runs.
        let mut graph = ModelGraph::new();
        let x = graph.add_parameter(Parameter::scalar("x", 0.)).unwrap();
        let prior = graph
            .add_model(DistributionLikelihood::new(
                "prior",
                x,
                Distribution::Normal { mean: 0., sd: 1. },
            ))
            .unwrap();
        let mut schedule = OperatorSchedule::new();
        schedule.add(RandomWalkOperator::new(x, 1.).unwrap(), 1.).unwrap();
        let mut chain = MarkovChain::new(
            graph,
            prior,
            schedule,
            McmcSettings::default(),
            SmallRng::seed_from_u64(67),
        )
        .unwrap();
        chain.run(50).unwrap();
        assert_eq!(chain.iteration(), 50);
        assert!(chain.state().rng.unwrap().save_state().is_none());
        assert!(matches!(
            chain.rng_mut().load_state(&saved),
            Err(McmcError::CheckpointLayout(_))
        ));
    }

    #[test]
    fn failed_operator_changes_nothing() {
        let mut graph = ModelGraph::new();
        let n = graph
            .add_parameter(Parameter::scalar("N", 1.).with_bounds(Bounds::POSITIVE))
            .unwrap();
        let tree = graph
            .add_tree(Tree::from_newick("t", "(a:1,b:1);").unwrap())
            .unwrap();
        let coalescent = graph
            .add_model(ConstantCoalescentLikelihood::new("coalescent", tree, n))
            .unwrap();
        let mut schedule = OperatorSchedule::new();
        schedule.add(ExchangeOperator::narrow(tree), 1.).unwrap();
        let mut chain = MarkovChain::new(
            graph,
            coalescent,
            schedule,
            McmcSettings::default(),
            ChaCha8Rng::seed_from_u64(63),
        )
        .unwrap();
        let before = chain.graph().fingerprint();
        let score = chain.current_score();
        assert_eq!(chain.step().unwrap(), StepOutcome::OperatorFailed);
        assert_eq!(chain.iteration(), 1);
        assert_eq!(chain.graph().fingerprint(), before);
        assert_eq!(chain.current_score().to_bits(), score.to_bits());
        assert_eq!(chain.schedule().stats(0).failed, 1);
    }

    #[test]
    fn missed_invalidation_is_caught() {
        let mut graph = ModelGraph::new();
        let x = graph.add_parameter(Parameter::scalar("x", 0.5)).unwrap();
        let stale = graph
            .add_model(Stale {
                x,
                cached: None,
            })
            .unwrap();
        let mut schedule = OperatorSchedule::new();
        schedule.add(RandomWalkOperator::new(x, 1.).unwrap(), 1.).unwrap();
        let mut chain = MarkovChain::new(
            graph,
            stale,
            schedule,
            McmcSettings::default(),
            ChaCha8Rng::seed_from_u64(64),
        )
        .unwrap();
        let error = chain.step().unwrap_err();
        assert!(matches!(
            error.downcast_ref::<McmcError>(),
            Some(McmcError::EvaluationMismatch { .. })
        ));
        let error = chain.step().unwrap_err();
        assert!(matches!(
            error.downcast_ref::<McmcError>(),
            Some(McmcError::IllegalTransition { .. })
        ));
    }
}
