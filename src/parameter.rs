use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    error::{McmcError, Result},
    state::Stored,
};

/// Closed interval every value of a parameter must lie in once a move has
/// been accepted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: f64,
    pub upper: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds::UNBOUNDED
    }
}

impl Bounds {
    pub const UNBOUNDED: Bounds = Bounds {
        lower: f64::NEG_INFINITY,
        upper: f64::INFINITY,
    };

    pub const POSITIVE: Bounds = Bounds {
        lower: 0.,
        upper: f64::INFINITY,
    };

    pub const UNIT: Bounds = Bounds {
        lower: 0.,
        upper: 1.,
    };

    pub fn new(lower: f64, upper: f64) -> Result<Bounds> {
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(McmcError::Misconfigured(format!(
                "invalid bounds [{lower}, {upper}]"
            )));
        }
        Ok(Bounds { lower, upper })
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    pub fn is_finite(&self) -> bool {
        self.lower.is_finite() && self.upper.is_finite()
    }
}

/// What changed in a parameter or tree, sent along with change notifications.
///
/// For trees `Value(node)` means a node height changed and `All` means the
/// topology was edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableChange {
    Value(usize),
    All,
    Added(usize),
    Removed(usize),
}

/// A named vector of real values with bounds.
///
/// Mutation goes through [`crate::ModelGraph`] so that every write is
/// announced to the models that read this parameter. Writing a value outside
/// the bounds is allowed; the chain scores such states as `-inf`.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    values: Vec<f64>,
    bounds: Bounds,
    stored: Stored<Vec<f64>>,
    changed: Vec<usize>,
    resized: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Parameter {
        Parameter {
            name: name.into(),
            values,
            bounds: Bounds::UNBOUNDED,
            stored: Stored::Committed,
            changed: Vec::new(),
            resized: false,
        }
    }

    pub fn scalar(name: impl Into<String>, value: f64) -> Parameter {
        Parameter::new(name, vec![value])
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Parameter {
        self.bounds = bounds;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn is_within_bounds(&self) -> bool {
        self.values.iter().all(|&v| self.bounds.contains(v))
    }

    pub fn is_stored(&self) -> bool {
        self.stored.is_pending()
    }

    /// Whether entry `index` of an indicator parameter is switched on. Any
    /// non-zero value counts as on.
    pub fn is_on(&self, index: usize) -> bool {
        self.values[index] != 0.
    }

    /// Indices of indicator entries that are switched on (`on`) or off.
    pub fn indices_where_on(&self, on: bool) -> impl Iterator<Item = usize> + '_ {
        (0..self.values.len()).filter(move |&k| self.is_on(k) == on)
    }

    /// Number of indicator entries that are switched on.
    pub fn count_ones(&self) -> usize {
        self.indices_where_on(true).count()
    }

    pub(crate) fn set_value(&mut self, index: usize, value: f64) -> VariableChange {
        self.values[index] = value;
        if self.stored.is_pending() {
            self.changed.push(index);
        }
        VariableChange::Value(index)
    }

    pub(crate) fn set_values(&mut self, values: &[f64]) -> Result<VariableChange> {
        if values.len() != self.values.len() {
            return Err(McmcError::DimensionMismatch {
                name: self.name.clone(),
                expected: self.values.len(),
                found: values.len(),
            });
        }
        self.values.copy_from_slice(values);
        if self.stored.is_pending() {
            self.changed.extend(0..values.len());
        }
        Ok(VariableChange::All)
    }

    pub(crate) fn add_dimension(&mut self, index: usize, value: f64) -> VariableChange {
        self.values.insert(index, value);
        self.resized = true;
        VariableChange::Added(index)
    }

    pub(crate) fn remove_dimension(&mut self, index: usize) -> (f64, VariableChange) {
        let value = self.values.remove(index);
        self.resized = true;
        (value, VariableChange::Removed(index))
    }

    pub(crate) fn load(&mut self, values: Vec<f64>) {
        self.values = values;
        self.stored.accept();
        self.changed.clear();
        self.resized = false;
    }

    pub(crate) fn store(&mut self) {
        self.stored.store(self.values.clone());
        self.changed.clear();
        self.resized = false;
    }

    /// Put the stored values back and report which entries differ from what
    /// listeners last saw.
    pub(crate) fn restore(&mut self) -> Vec<VariableChange> {
        let Some(shadow) = self.stored.take() else {
            return Vec::new();
        };
        self.values = shadow;
        let changes = if self.resized {
            vec![VariableChange::All]
        } else {
            self.changed
                .iter()
                .copied()
                .sorted_unstable()
                .dedup()
                .map(VariableChange::Value)
                .collect()
        };
        self.changed.clear();
        self.resized = false;
        changes
    }

    pub(crate) fn accept(&mut self) {
        self.stored.accept();
        self.changed.clear();
        self.resized = false;
    }
}
