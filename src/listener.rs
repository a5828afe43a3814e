//! Observers of a running chain.
//!
//! Listeners are called synchronously with a borrowed [`ChainState`]. Anything
//! that wants to do its work on another thread must take an owned
//! [`ChainSnapshot`] first, because the chain keeps mutating the graph as soon
//! as the listener returns.

use std::{
    sync::{
        mpsc::{sync_channel, SyncSender},
        Arc, Mutex,
    },
    thread::{spawn, JoinHandle},
};

use anyhow::{anyhow, bail, Context, Result};
use arrow::{
    array::{
        ArrayBuilder, ArrayRef, Float64Builder, LargeListBuilder, StringBuilder, StructArray,
        UInt64Builder,
    },
    datatypes::{DataType, Field, Fields},
};
use serde::{Deserialize, Serialize};

use crate::{
    chain::ChainRng,
    error::McmcError,
    graph::ModelGraph,
    model::{ParameterId, TreeId},
    schedule::{OperatorSchedule, OperatorStats},
    tree::TreeSnapshot,
};

/// The state of a chain between two iterations.
#[derive(Debug, Clone, Copy)]
pub struct ChainState<'a> {
    pub iteration: u64,
    /// Log posterior of the state in `graph`.
    pub score: f64,
    pub graph: &'a ModelGraph,
    pub schedule: &'a OperatorSchedule,
    pub rng: Option<&'a dyn ChainRng>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub name: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSnapshot {
    pub name: String,
    pub weight: f64,
    /// Tuning value in the operator's own units.
    pub tuning: Option<f64>,
    pub stats: OperatorStats,
}

/// An owned copy of everything needed to describe or resume a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub iteration: u64,
    pub log_posterior: f64,
    pub parameters: Vec<ParameterSnapshot>,
    pub trees: Vec<TreeSnapshot>,
    pub operators: Vec<OperatorSnapshot>,
    /// Position of the chain's random number generator, when it can be saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rng: Option<serde_json::Value>,
}

impl ChainState<'_> {
    pub fn snapshot(&self) -> ChainSnapshot {
        let graph = self.graph;
        let schedule = self.schedule;
        ChainSnapshot {
            iteration: self.iteration,
            log_posterior: self.score,
            parameters: graph
                .parameter_ids()
                .map(|id| {
                    let parameter = graph.parameter(id);
                    ParameterSnapshot {
                        name: parameter.name().to_string(),
                        values: parameter.values().to_vec(),
                    }
                })
                .collect(),
            trees: graph.tree_ids().map(|id| graph.tree(id).snapshot()).collect(),
            operators: (0..schedule.len())
                .map(|k| OperatorSnapshot {
                    name: schedule.operator(k).name().to_string(),
                    weight: schedule.weight(k),
                    tuning: schedule.operator(k).raw_parameter(),
                    stats: schedule.stats(k),
                })
                .collect(),
            rng: self.rng.and_then(|rng| rng.save_state()),
        }
    }
}

/// Receives the state of a chain as it runs.
pub trait ChainListener: Send {
    /// Called before every iteration with the current state.
    fn current_state(&mut self, state: &ChainState<'_>) -> Result<()>;

    /// Called whenever a proposal scores higher than every state before.
    fn best_state(&mut self, _state: &ChainState<'_>) -> Result<()> {
        Ok(())
    }

    /// Called once with the final state.
    fn finished(&mut self, _state: &ChainState<'_>) -> Result<()> {
        Ok(())
    }
}

impl<L: ChainListener> ChainListener for Arc<Mutex<L>> {
    fn current_state(&mut self, state: &ChainState<'_>) -> Result<()> {
        self.lock()
            .map_err(|_| anyhow!("Listener lock was poisoned"))?
            .current_state(state)
    }

    fn best_state(&mut self, state: &ChainState<'_>) -> Result<()> {
        self.lock()
            .map_err(|_| anyhow!("Listener lock was poisoned"))?
            .best_state(state)
    }

    fn finished(&mut self, state: &ChainState<'_>) -> Result<()> {
        self.lock()
            .map_err(|_| anyhow!("Listener lock was poisoned"))?
            .finished(state)
    }
}

/// Writes a progress line to the log every `every` iterations.
#[derive(Debug, Clone)]
pub struct LogListener {
    every: u64,
}

impl LogListener {
    pub fn new(every: u64) -> LogListener {
        LogListener {
            every: every.max(1),
        }
    }
}

impl ChainListener for LogListener {
    fn current_state(&mut self, state: &ChainState<'_>) -> Result<()> {
        if state.iteration % self.every == 0 {
            log::info!("iteration {}: log posterior {}", state.iteration, state.score);
        }
        Ok(())
    }

    fn finished(&mut self, state: &ChainState<'_>) -> Result<()> {
        log::info!(
            "finished after {} iterations: log posterior {}\n{}",
            state.iteration,
            state.score,
            state.schedule.acceptance_table()
        );
        Ok(())
    }
}

/// Consumes snapshots on a worker thread.
pub trait SnapshotSink: Send + 'static {
    fn current(&mut self, snapshot: ChainSnapshot) -> Result<()>;

    fn finished(&mut self, _snapshot: ChainSnapshot) -> Result<()> {
        Ok(())
    }
}

enum Message {
    Current(ChainSnapshot),
    Finished(ChainSnapshot),
}

/// Hands a snapshot of every `every`-th state to a [`SnapshotSink`] running
/// on its own thread.
///
/// The channel is bounded, so a slow sink eventually slows the chain down
/// instead of piling up snapshots.
pub struct BackgroundListener {
    every: u64,
    sender: Option<SyncSender<Message>>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl BackgroundListener {
    pub fn new(sink: impl SnapshotSink, every: u64, capacity: usize) -> BackgroundListener {
        let (sender, receiver) = sync_channel(capacity);
        let mut sink = sink;
        let worker = spawn(move || -> Result<()> {
            for message in receiver {
                match message {
                    Message::Current(snapshot) => sink.current(snapshot)?,
                    Message::Finished(snapshot) => {
                        sink.finished(snapshot)?;
                        break;
                    }
                }
            }
            Ok(())
        });
        BackgroundListener {
            every: every.max(1),
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    fn send(&mut self, message: Message) -> Result<()> {
        let Some(sender) = &self.sender else {
            bail!("Background listener has already finished");
        };
        if sender.send(message).is_err() {
            // The worker only hangs up when it failed.
            self.sender = None;
            return self.join();
        }
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker
            .join()
            .map_err(|_| anyhow!("Background listener thread panicked"))?
            .context("Background listener failed")
    }
}

impl ChainListener for BackgroundListener {
    fn current_state(&mut self, state: &ChainState<'_>) -> Result<()> {
        if state.iteration % self.every != 0 {
            return Ok(());
        }
        self.send(Message::Current(state.snapshot()))
    }

    fn finished(&mut self, state: &ChainState<'_>) -> Result<()> {
        self.send(Message::Finished(state.snapshot()))?;
        self.sender = None;
        self.join()
    }
}

impl Drop for BackgroundListener {
    fn drop(&mut self) {
        self.sender = None;
        if let Err(error) = self.join() {
            log::error!("{error:#}");
        }
    }
}

/// Collects a trace of sampled states into arrow arrays.
///
/// Every `every`-th iteration the iteration number, the log posterior, each
/// parameter (as a list, so dimension changes are kept) and each tree (as
/// Newick) are appended.
pub struct TraceCollector {
    every: u64,
    last: Option<u64>,
    iterations: UInt64Builder,
    scores: Float64Builder,
    parameters: Vec<(ParameterId, String, LargeListBuilder<Float64Builder>)>,
    trees: Vec<(TreeId, String, StringBuilder)>,
}

impl TraceCollector {
    pub fn new(graph: &ModelGraph, every: u64) -> TraceCollector {
        TraceCollector {
            every: every.max(1),
            last: None,
            iterations: UInt64Builder::new(),
            scores: Float64Builder::new(),
            parameters: graph
                .parameter_ids()
                .map(|id| {
                    let builder = LargeListBuilder::new(Float64Builder::new())
                        .with_field(Field::new("item", DataType::Float64, false));
                    (id, graph.parameter(id).name().to_string(), builder)
                })
                .collect(),
            trees: graph
                .tree_ids()
                .map(|id| (id, graph.tree(id).name().to_string(), StringBuilder::new()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a state regardless of the thinning interval. A state is only
    /// recorded once per iteration.
    pub fn record(&mut self, state: &ChainState<'_>) {
        if self.last == Some(state.iteration) {
            return;
        }
        self.last = Some(state.iteration);
        self.iterations.append_value(state.iteration);
        self.scores.append_value(state.score);
        for (id, _, builder) in self.parameters.iter_mut() {
            builder
                .values()
                .append_slice(state.graph.parameter(*id).values());
            builder.append(true);
        }
        for (id, _, builder) in self.trees.iter_mut() {
            builder.append_value(state.graph.tree(*id).to_newick());
        }
    }

    /// Take everything collected so far, leaving the collector empty.
    pub fn finish(&mut self) -> Result<StructArray, McmcError> {
        let mut columns: Vec<(String, ArrayRef)> = vec![
            ("iteration".into(), Arc::new(self.iterations.finish()) as ArrayRef),
            ("log_posterior".into(), Arc::new(self.scores.finish()) as ArrayRef),
        ];
        for (_, name, builder) in self.parameters.iter_mut() {
            columns.push((name.clone(), Arc::new(builder.finish()) as ArrayRef));
        }
        for (_, name, builder) in self.trees.iter_mut() {
            columns.push((name.clone(), Arc::new(builder.finish()) as ArrayRef));
        }
        self.last = None;
        let fields: Fields = columns
            .iter()
            .map(|(name, array)| Field::new(name.as_str(), array.data_type().clone(), false))
            .collect();
        let arrays = columns.into_iter().map(|(_, array)| array).collect();
        Ok(StructArray::try_new(fields, arrays, None)?)
    }
}

impl ChainListener for TraceCollector {
    fn current_state(&mut self, state: &ChainState<'_>) -> Result<()> {
        if state.iteration % self.every == 0 {
            self.record(state);
        }
        Ok(())
    }

    fn finished(&mut self, state: &ChainState<'_>) -> Result<()> {
        if state.iteration % self.every == 0 {
            self.record(state);
        }
        Ok(())
    }
}
