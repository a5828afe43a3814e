//! Core abstractions for the model graph.
//!
//! A [`Model`] is a node of the [`crate::ModelGraph`] that reads parameters,
//! trees and other models, keeps whatever derived quantities it likes, and
//! produces one scalar log density. Models never recompute inside a change
//! handler: handlers only mark caches dirty and the graph calls
//! [`Model::calculate_log_likelihood`] the next time the value is needed.

use std::any::Any;

use crate::{
    error::Result,
    parameter::{Parameter, VariableChange},
    tree::Tree,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub(crate) usize);

impl ParameterId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl TreeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl ModelId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Mutable state a model can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    Parameter(ParameterId),
    Tree(TreeId),
}

/// Something a model reads when it computes its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    Parameter(ParameterId),
    Tree(TreeId),
    Model(ModelId),
}

impl From<ParameterId> for Dependency {
    fn from(id: ParameterId) -> Self {
        Dependency::Parameter(id)
    }
}

impl From<TreeId> for Dependency {
    fn from(id: TreeId) -> Self {
        Dependency::Tree(id)
    }
}

impl From<ModelId> for Dependency {
    fn from(id: ModelId) -> Self {
        Dependency::Model(id)
    }
}

/// Read-only view of the graph handed to models while they compute.
///
/// Every model listed in the caller's dependencies has already been
/// evaluated when this view is created.
pub struct Inputs<'a> {
    pub(crate) parameters: &'a [Parameter],
    pub(crate) trees: &'a [Tree],
    pub(crate) values: &'a [f64],
}

impl<'a> Inputs<'a> {
    pub fn parameter(&self, id: ParameterId) -> &'a Parameter {
        &self.parameters[id.0]
    }

    pub fn tree(&self, id: TreeId) -> &'a Tree {
        &self.trees[id.0]
    }

    /// Cached log density of an upstream model.
    pub fn log_likelihood(&self, id: ModelId) -> f64 {
        self.values[id.0]
    }
}

/// A node of the model graph.
///
/// Implementations that keep derived buffers must save them in
/// `store_state` and put them back exactly in `restore_state`; the graph
/// takes care of the cached scalar and its known flag. The graph calls
/// `store_state` at most once between two `accept_state`/`restore_state`
/// calls.
pub trait Model: Send {
    fn name(&self) -> &str;

    /// Parameters, trees and models this model reads.
    fn dependencies(&self) -> Vec<Dependency>;

    /// Check dimensions and wiring when the model is added to the graph.
    fn validate(&self, _inputs: &Inputs<'_>) -> Result<()> {
        Ok(())
    }

    fn handle_variable_changed(&mut self, _variable: Variable, _change: VariableChange) {}

    fn handle_model_changed(&mut self, _model: ModelId) {}

    fn store_state(&mut self) {}

    fn restore_state(&mut self) {}

    fn accept_state(&mut self) {}

    /// Drop all internal caches so the next evaluation starts from scratch.
    fn make_dirty(&mut self) {}

    fn calculate_log_likelihood(&mut self, inputs: &Inputs<'_>) -> f64;

    fn as_any(&self) -> &dyn Any;
}
