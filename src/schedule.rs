//! Operator selection, acceptance counters and tuning.

use std::fmt::Write;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{
    chain::StepOutcome,
    error::{McmcError, Result},
    operators::{CoercionMode, Operator},
};

/// How the schedule picks the next operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScheduleKind {
    /// Draw an operator with probability proportional to its weight.
    #[default]
    Random,
    /// Cycle through the operators in the order they were added.
    Sequential,
}

/// Transform of the usage count used in the coercion step size
/// `1 / (t(n) + 1)`. Slower growing transforms keep adapting for longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizationTransform {
    #[default]
    Default,
    Log,
    Sqrt,
}

impl OptimizationTransform {
    pub fn apply(self, count: u64) -> f64 {
        let n = count as f64;
        match self {
            OptimizationTransform::Default => n,
            OptimizationTransform::Log => n.ln().max(0.),
            OptimizationTransform::Sqrt => n.sqrt(),
        }
    }
}

/// How often an operator has been used and with what result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStats {
    pub accepted: u64,
    pub rejected: u64,
    /// Proposals the operator could not make. They count as rejections in
    /// the acceptance rate.
    pub failed: u64,
}

impl OperatorStats {
    pub fn count(&self) -> u64 {
        self.accepted + self.rejected + self.failed
    }

    pub fn acceptance_rate(&self) -> f64 {
        match self.count() {
            0 => 0.,
            count => self.accepted as f64 / count as f64,
        }
    }
}

struct Entry {
    operator: Box<dyn Operator>,
    weight: f64,
    stats: OperatorStats,
}

/// Owns the operators of a chain together with their weights.
pub struct OperatorSchedule {
    entries: Vec<Entry>,
    total_weight: f64,
    kind: ScheduleKind,
    transform: OptimizationTransform,
    next: usize,
}

impl Default for OperatorSchedule {
    fn default() -> Self {
        OperatorSchedule::new()
    }
}

impl std::fmt::Debug for OperatorSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorSchedule")
            .field("operators", &self.names().collect::<Vec<_>>())
            .field("kind", &self.kind)
            .field("transform", &self.transform)
            .finish()
    }
}

fn check_weight(weight: f64) -> Result<()> {
    if !(weight > 0. && weight.is_finite()) {
        return Err(McmcError::Misconfigured(format!(
            "operator weights must be positive, got {weight}"
        )));
    }
    Ok(())
}

impl OperatorSchedule {
    pub fn new() -> OperatorSchedule {
        OperatorSchedule {
            entries: Vec::new(),
            total_weight: 0.,
            kind: ScheduleKind::Random,
            transform: OptimizationTransform::Default,
            next: 0,
        }
    }

    pub fn with_kind(mut self, kind: ScheduleKind) -> OperatorSchedule {
        self.kind = kind;
        self
    }

    pub fn with_transform(mut self, transform: OptimizationTransform) -> OperatorSchedule {
        self.transform = transform;
        self
    }

    /// Add an operator and return its index in the schedule.
    pub fn add(&mut self, operator: impl Operator + 'static, weight: f64) -> Result<usize> {
        self.add_boxed(Box::new(operator), weight)
    }

    pub fn add_boxed(&mut self, operator: Box<dyn Operator>, weight: f64) -> Result<usize> {
        check_weight(weight)?;
        self.entries.push(Entry {
            operator,
            weight,
            stats: OperatorStats::default(),
        });
        self.total_weight += weight;
        Ok(self.entries.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    pub fn transform(&self) -> OptimizationTransform {
        self.transform
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.operator.name())
    }

    pub fn operator(&self, index: usize) -> &dyn Operator {
        self.entries[index].operator.as_ref()
    }

    pub fn operator_mut(&mut self, index: usize) -> &mut dyn Operator {
        self.entries[index].operator.as_mut()
    }

    pub fn weight(&self, index: usize) -> f64 {
        self.entries[index].weight
    }

    pub fn set_weight(&mut self, index: usize, weight: f64) -> Result<()> {
        check_weight(weight)?;
        self.entries[index].weight = weight;
        self.total_weight = self.entries.iter().map(|e| e.weight).sum();
        Ok(())
    }

    pub fn stats(&self, index: usize) -> OperatorStats {
        self.entries[index].stats
    }

    pub(crate) fn set_stats(&mut self, index: usize, stats: OperatorStats) {
        self.entries[index].stats = stats;
    }

    /// The smallest usage count over all operators.
    pub fn minimum_count(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.stats.count())
            .min()
            .unwrap_or(0)
    }

    /// Choose the operator for the next iteration. The schedule must not be
    /// empty.
    pub fn next_index(&mut self, rng: &mut dyn RngCore) -> usize {
        match self.kind {
            ScheduleKind::Sequential => {
                let index = self.next;
                self.next = (self.next + 1) % self.entries.len();
                index
            }
            ScheduleKind::Random => {
                let mut target = rng.random::<f64>() * self.total_weight;
                for (index, entry) in self.entries.iter().enumerate() {
                    if target < entry.weight {
                        return index;
                    }
                    target -= entry.weight;
                }
                // Rounding can leave the target just past the last weight.
                self.entries.len() - 1
            }
        }
    }

    pub(crate) fn record(&mut self, index: usize, outcome: StepOutcome) {
        let stats = &mut self.entries[index].stats;
        match outcome {
            StepOutcome::Accepted => stats.accepted += 1,
            StepOutcome::Rejected => stats.rejected += 1,
            StepOutcome::OperatorFailed => stats.failed += 1,
        }
    }

    /// Move the tuning value of an operator towards its target acceptance
    /// probability, given the acceptance probability of the last move.
    ///
    /// Call after the move has been recorded. Operators without a tuning
    /// value, or whose mode excludes them, are left alone.
    pub(crate) fn coerce(&mut self, index: usize, log_alpha: f64, adapting: bool) {
        let transform = self.transform;
        let entry = &mut self.entries[index];
        let operator = entry.operator.as_mut();
        let active = match operator.coercion_mode() {
            CoercionMode::On => true,
            CoercionMode::Off => false,
            CoercionMode::Default => adapting,
        };
        if !active {
            return;
        }
        let Some(current) = operator.coercable_parameter() else {
            return;
        };
        let step = 1. / (transform.apply(entry.stats.count()) + 1.);
        let updated = current + step * (log_alpha.exp() - operator.target_acceptance());
        if updated.is_finite() {
            operator.set_coercable_parameter(updated);
        } else {
            log::warn!(
                "{}: coercion produced a non-finite tuning value, keeping {current}",
                operator.name()
            );
        }
    }

    /// Clear all counters.
    pub fn reset(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.stats = OperatorStats::default();
        }
        self.next = 0;
    }

    /// Per-operator usage and acceptance, one line per operator.
    pub fn acceptance_table(&self) -> String {
        let width = self
            .names()
            .map(|name| name.len())
            .max()
            .unwrap_or(0)
            .max("operator".len());
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<width$}  {:>10}  {:>10}  {:>8}  {:>8}  {:>12}",
            "operator", "accepted", "count", "failed", "rate", "tuning"
        );
        for entry in self.entries.iter() {
            let tuning = entry
                .operator
                .raw_parameter()
                .map(|p| format!("{p:.5}"))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:<width$}  {:>10}  {:>10}  {:>8}  {:>8.4}  {:>12}",
                entry.operator.name(),
                entry.stats.accepted,
                entry.stats.count(),
                entry.stats.failed,
                entry.stats.acceptance_rate(),
                tuning
            );
        }
        out
    }
}
