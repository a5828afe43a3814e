//! The model graph: an arena of parameters, trees and models.
//!
//! Models are addressed by [`ModelId`] and hold lists of downstream
//! listeners. A change to a parameter or tree starts a propagation wave that
//! marks every dependent model dirty; a per-model generation stamp makes sure
//! each model is visited once per wave, which also keeps cyclic listener
//! edges from looping.
//!
//! The graph implements the store/accept/restore protocol for everything it
//! owns. `store` only opens a pending phase: a parameter, tree or model is
//! snapshotted the first time it is touched afterwards, so a proposal that
//! touches nothing costs nothing to undo.

use std::fmt::Write;

use crate::{
    error::{McmcError, Result},
    model::{Dependency, Inputs, Model, ModelId, ParameterId, TreeId, Variable},
    parameter::{Parameter, VariableChange},
    state::Stored,
    tree::{Tree, TreeSnapshot},
};

#[derive(Debug, Default)]
struct Touched {
    parameters: Vec<ParameterId>,
    trees: Vec<TreeId>,
    models: Vec<ModelId>,
}

/// Bit-level summary of the observable graph state, for comparing the state
/// before a proposal with the state after a restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphFingerprint {
    pub parameters: Vec<Vec<u64>>,
    pub trees: Vec<(usize, Vec<(Option<usize>, [Option<usize>; 2], u64)>)>,
    pub models: Vec<Option<u64>>,
}

#[derive(Default)]
pub struct ModelGraph {
    parameters: Vec<Parameter>,
    trees: Vec<Tree>,
    models: Vec<Box<dyn Model>>,
    values: Vec<f64>,
    known: Vec<bool>,
    stored_values: Vec<Stored<(f64, bool)>>,
    model_inputs: Vec<Vec<ModelId>>,
    parameter_listeners: Vec<Vec<ModelId>>,
    tree_listeners: Vec<Vec<ModelId>>,
    model_listeners: Vec<Vec<ModelId>>,
    wave: u64,
    visited: Vec<u64>,
    scratch: Vec<ModelId>,
    pending: Option<Touched>,
}

impl std::fmt::Debug for ModelGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelGraph")
            .field("parameters", &self.parameters.len())
            .field("trees", &self.trees.len())
            .field("models", &self.models.len())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl ModelGraph {
    pub fn new() -> ModelGraph {
        ModelGraph::default()
    }

    pub fn add_parameter(&mut self, parameter: Parameter) -> Result<ParameterId> {
        self.check_building()?;
        if self.parameter_by_name(parameter.name()).is_some() {
            return Err(McmcError::Misconfigured(format!(
                "duplicate parameter name {}",
                parameter.name()
            )));
        }
        self.parameters.push(parameter);
        self.parameter_listeners.push(Vec::new());
        Ok(ParameterId(self.parameters.len() - 1))
    }

    pub fn add_tree(&mut self, tree: Tree) -> Result<TreeId> {
        self.check_building()?;
        if self.tree_by_name(tree.name()).is_some() {
            return Err(McmcError::Misconfigured(format!(
                "duplicate tree name {}",
                tree.name()
            )));
        }
        self.trees.push(tree);
        self.tree_listeners.push(Vec::new());
        Ok(TreeId(self.trees.len() - 1))
    }

    /// Add a model and subscribe it to everything it reads.
    ///
    /// Dependencies must already be part of the graph, so the evaluation
    /// order is acyclic by construction.
    pub fn add_model(&mut self, model: impl Model + 'static) -> Result<ModelId> {
        self.check_building()?;
        let dependencies = model.dependencies();
        for &dependency in dependencies.iter() {
            self.check_dependency(dependency)?;
        }
        let inputs = Inputs {
            parameters: &self.parameters,
            trees: &self.trees,
            values: &self.values,
        };
        model.validate(&inputs)?;

        let id = ModelId(self.models.len());
        self.models.push(Box::new(model));
        self.values.push(f64::NAN);
        self.known.push(false);
        self.stored_values.push(Stored::Committed);
        self.visited.push(0);
        self.model_listeners.push(Vec::new());
        self.model_inputs.push(Vec::new());

        for dependency in dependencies {
            if let Dependency::Model(input) = dependency {
                if !self.model_inputs[id.0].contains(&input) {
                    self.model_inputs[id.0].push(input);
                }
            }
            self.subscribe(id, dependency);
        }
        Ok(id)
    }

    /// Add a notification-only edge: `listener` is told when `source`
    /// changes but does not read it during evaluation. Such edges may close
    /// cycles in the listener graph.
    pub fn listen(&mut self, listener: ModelId, source: Dependency) -> Result<()> {
        self.check_building()?;
        self.check_dependency(Dependency::Model(listener))?;
        self.check_dependency(source)?;
        self.subscribe(listener, source);
        Ok(())
    }

    fn subscribe(&mut self, listener: ModelId, source: Dependency) {
        let list = match source {
            Dependency::Parameter(id) => &mut self.parameter_listeners[id.0],
            Dependency::Tree(id) => &mut self.tree_listeners[id.0],
            Dependency::Model(id) => &mut self.model_listeners[id.0],
        };
        if !list.contains(&listener) {
            list.push(listener);
        }
    }

    fn check_building(&self) -> Result<()> {
        if self.pending.is_some() {
            return Err(McmcError::Misconfigured(
                "the graph cannot grow while a proposal is pending".into(),
            ));
        }
        Ok(())
    }

    fn check_dependency(&self, dependency: Dependency) -> Result<()> {
        let (kind, index, len) = match dependency {
            Dependency::Parameter(id) => ("parameter", id.0, self.parameters.len()),
            Dependency::Tree(id) => ("tree", id.0, self.trees.len()),
            Dependency::Model(id) => ("model", id.0, self.models.len()),
        };
        if index >= len {
            return Err(McmcError::UnknownNode { kind, index });
        }
        Ok(())
    }

    pub fn parameter(&self, id: ParameterId) -> &Parameter {
        &self.parameters[id.0]
    }

    pub fn tree(&self, id: TreeId) -> &Tree {
        &self.trees[id.0]
    }

    pub fn model(&self, id: ModelId) -> &dyn Model {
        self.models[id.0].as_ref()
    }

    /// Downcast a model to its concrete type.
    pub fn model_as<T: 'static>(&self, id: ModelId) -> Option<&T> {
        self.models.get(id.0)?.as_any().downcast_ref::<T>()
    }

    pub fn parameter_by_name(&self, name: &str) -> Option<ParameterId> {
        self.parameters
            .iter()
            .position(|p| p.name() == name)
            .map(ParameterId)
    }

    pub fn tree_by_name(&self, name: &str) -> Option<TreeId> {
        self.trees.iter().position(|t| t.name() == name).map(TreeId)
    }

    pub fn model_by_name(&self, name: &str) -> Option<ModelId> {
        self.models.iter().position(|m| m.name() == name).map(ModelId)
    }

    pub fn parameter_ids(&self) -> impl Iterator<Item = ParameterId> {
        (0..self.parameters.len()).map(ParameterId)
    }

    pub fn tree_ids(&self) -> impl Iterator<Item = TreeId> {
        (0..self.trees.len()).map(TreeId)
    }

    pub fn model_ids(&self) -> impl Iterator<Item = ModelId> {
        (0..self.models.len()).map(ModelId)
    }

    /// Models notified when `source` changes.
    pub fn listeners(&self, source: Dependency) -> &[ModelId] {
        match source {
            Dependency::Parameter(id) => &self.parameter_listeners[id.0],
            Dependency::Tree(id) => &self.tree_listeners[id.0],
            Dependency::Model(id) => &self.model_listeners[id.0],
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_value(&mut self, id: ParameterId, index: usize, value: f64) {
        self.touch_parameter(id);
        let change = self.parameters[id.0].set_value(index, value);
        self.fire_variable_changed(Variable::Parameter(id), change);
    }

    /// Replace all values at once with a single notification.
    pub fn set_values(&mut self, id: ParameterId, values: &[f64]) -> Result<()> {
        self.touch_parameter(id);
        let change = self.parameters[id.0].set_values(values)?;
        self.fire_variable_changed(Variable::Parameter(id), change);
        Ok(())
    }

    pub fn add_dimension(&mut self, id: ParameterId, index: usize, value: f64) {
        self.touch_parameter(id);
        let change = self.parameters[id.0].add_dimension(index, value);
        self.fire_variable_changed(Variable::Parameter(id), change);
    }

    pub fn remove_dimension(&mut self, id: ParameterId, index: usize) -> f64 {
        self.touch_parameter(id);
        let (value, change) = self.parameters[id.0].remove_dimension(index);
        self.fire_variable_changed(Variable::Parameter(id), change);
        value
    }

    pub fn set_node_height(&mut self, id: TreeId, node: usize, height: f64) {
        self.touch_tree(id);
        self.trees[id.0].set_height(node, height);
        self.fire_variable_changed(Variable::Tree(id), VariableChange::Value(node));
    }

    /// Edit a tree's topology and heights as one change.
    ///
    /// Listeners are notified once, after `edit` returns, with
    /// [`VariableChange::All`].
    pub fn edit_tree<T>(&mut self, id: TreeId, edit: impl FnOnce(&mut Tree) -> T) -> T {
        self.touch_tree(id);
        let tree = &mut self.trees[id.0];
        let result = edit(tree);
        tree.rebuild_clades();
        self.fire_variable_changed(Variable::Tree(id), VariableChange::All);
        result
    }

    /// Open a pending phase. Everything touched from now on can be undone.
    pub fn store(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Err(McmcError::NestedStore);
        }
        self.pending = Some(Touched::default());
        Ok(())
    }

    /// Keep the proposed state.
    pub fn accept(&mut self) -> Result<()> {
        let touched = self.pending.take().ok_or(McmcError::NotStored)?;
        for id in touched.parameters {
            self.parameters[id.0].accept();
        }
        for id in touched.trees {
            self.trees[id.0].accept();
        }
        for id in touched.models {
            self.models[id.0].accept_state();
            self.stored_values[id.0].accept();
        }
        Ok(())
    }

    /// Return to the state at the last `store`, including every cached
    /// log likelihood and its known flag.
    pub fn restore(&mut self) -> Result<()> {
        let touched = self.pending.take().ok_or(McmcError::NotStored)?;
        for &id in touched.parameters.iter() {
            for change in self.parameters[id.0].restore() {
                self.fire_variable_changed(Variable::Parameter(id), change);
            }
        }
        for &id in touched.trees.iter() {
            if self.trees[id.0].restore() {
                self.fire_variable_changed(Variable::Tree(id), VariableChange::All);
            }
        }
        // Listeners of every restored variable were touched when the
        // variable first changed, so this overwrites whatever the
        // notifications above marked dirty.
        for &id in touched.models.iter() {
            self.models[id.0].restore_state();
            if let Some((value, known)) = self.stored_values[id.0].take() {
                self.values[id.0] = value;
                self.known[id.0] = known;
            }
        }
        Ok(())
    }

    /// Log density of a model, recomputing it and its inputs if needed.
    pub fn log_likelihood(&mut self, id: ModelId) -> Result<f64> {
        self.check_dependency(Dependency::Model(id))?;
        self.compute(id);
        Ok(self.values[id.0])
    }

    /// Score a model the way the chain does: states with out-of-bounds
    /// parameters or inconsistent trees, and numerical errors, are `-inf`.
    pub fn evaluate(&mut self, id: ModelId) -> Result<f64> {
        if !self.within_bounds() {
            return Ok(f64::NEG_INFINITY);
        }
        let value = self.log_likelihood(id)?;
        if value.is_nan() || value == f64::INFINITY {
            log::error!(
                "A likelihood returned with a numerical error ({value}):\n{}",
                self.diagnosis(id)
            );
            return Ok(f64::NEG_INFINITY);
        }
        Ok(value)
    }

    /// The cached value of a model, if it is currently known.
    pub fn cached_log_likelihood(&self, id: ModelId) -> Option<f64> {
        self.known[id.0].then_some(self.values[id.0])
    }

    pub fn is_known(&self, id: ModelId) -> bool {
        self.known[id.0]
    }

    /// Forget every cached value, forcing a full evaluation next time.
    pub fn make_dirty(&mut self) {
        for k in 0..self.models.len() {
            let id = ModelId(k);
            self.touch_model(id);
            self.models[k].make_dirty();
            self.known[k] = false;
        }
    }

    /// Whether parameters and trees satisfy their constraints. While a
    /// proposal is pending only touched variables are checked.
    pub fn within_bounds(&self) -> bool {
        match &self.pending {
            Some(touched) => {
                touched
                    .parameters
                    .iter()
                    .all(|id| self.parameters[id.0].is_within_bounds())
                    && touched.trees.iter().all(|id| self.trees[id.0].is_valid())
            }
            None => {
                self.parameters.iter().all(|p| p.is_within_bounds())
                    && self.trees.iter().all(|t| t.is_valid())
            }
        }
    }

    /// Human readable breakdown of a model's value into its inputs.
    pub fn diagnosis(&self, id: ModelId) -> String {
        let mut out = String::new();
        self.write_diagnosis(id, 0, &mut out);
        out
    }

    fn write_diagnosis(&self, id: ModelId, depth: usize, out: &mut String) {
        let value = if self.known[id.0] {
            format!("{}", self.values[id.0])
        } else {
            "unknown".to_string()
        };
        let _ = writeln!(
            out,
            "{:indent$}{}={}",
            "",
            self.models[id.0].name(),
            value,
            indent = 2 * depth
        );
        for &input in self.model_inputs[id.0].iter() {
            self.write_diagnosis(input, depth + 1, out);
        }
    }

    pub fn fingerprint(&self) -> GraphFingerprint {
        GraphFingerprint {
            parameters: self
                .parameters
                .iter()
                .map(|p| p.values().iter().map(|v| v.to_bits()).collect())
                .collect(),
            trees: self
                .trees
                .iter()
                .map(|t| {
                    let nodes = t
                        .nodes()
                        .iter()
                        .map(|n| (n.parent, n.children, n.height.to_bits()))
                        .collect();
                    (t.root(), nodes)
                })
                .collect(),
            models: (0..self.models.len())
                .map(|k| self.known[k].then(|| self.values[k].to_bits()))
                .collect(),
        }
    }

    /// Overwrite a parameter outside of a proposal, e.g. from a checkpoint.
    pub fn load_parameter(&mut self, id: ParameterId, values: Vec<f64>) -> Result<()> {
        self.check_building()?;
        self.parameters[id.0].load(values);
        self.fire_variable_changed(Variable::Parameter(id), VariableChange::All);
        Ok(())
    }

    /// Overwrite a tree outside of a proposal, e.g. from a checkpoint.
    pub fn load_tree(&mut self, id: TreeId, snapshot: &TreeSnapshot) -> Result<()> {
        self.check_building()?;
        self.trees[id.0].load(snapshot)?;
        self.fire_variable_changed(Variable::Tree(id), VariableChange::All);
        Ok(())
    }

    fn compute(&mut self, id: ModelId) {
        if self.known[id.0] {
            return;
        }
        // Inputs always have smaller ids than the model reading them.
        for k in 0..self.model_inputs[id.0].len() {
            let input = self.model_inputs[id.0][k];
            self.compute(input);
        }
        self.touch_model(id);
        let inputs = Inputs {
            parameters: &self.parameters,
            trees: &self.trees,
            values: &self.values,
        };
        let value = self.models[id.0].calculate_log_likelihood(&inputs);
        self.values[id.0] = value;
        self.known[id.0] = true;
    }

    fn touch_parameter(&mut self, id: ParameterId) {
        if let Some(touched) = self.pending.as_mut() {
            let parameter = &mut self.parameters[id.0];
            if !parameter.is_stored() {
                parameter.store();
                touched.parameters.push(id);
            }
        }
    }

    fn touch_tree(&mut self, id: TreeId) {
        if let Some(touched) = self.pending.as_mut() {
            let tree = &mut self.trees[id.0];
            if !tree.is_stored() {
                tree.store();
                touched.trees.push(id);
            }
        }
    }

    fn touch_model(&mut self, id: ModelId) {
        if let Some(touched) = self.pending.as_mut() {
            let slot = &mut self.stored_values[id.0];
            if !slot.is_pending() {
                self.models[id.0].store_state();
                slot.store((self.values[id.0], self.known[id.0]));
                touched.models.push(id);
            }
        }
    }

    fn fire_variable_changed(&mut self, variable: Variable, change: VariableChange) {
        self.wave += 1;
        let count = self.variable_listeners(variable).len();
        for k in 0..count {
            let listener = self.variable_listeners(variable)[k];
            self.touch_model(listener);
            self.models[listener.0].handle_variable_changed(variable, change);
            self.invalidate(listener);
        }
    }

    fn variable_listeners(&self, variable: Variable) -> &[ModelId] {
        match variable {
            Variable::Parameter(id) => &self.parameter_listeners[id.0],
            Variable::Tree(id) => &self.tree_listeners[id.0],
        }
    }

    fn invalidate(&mut self, start: ModelId) {
        let mut stack = std::mem::take(&mut self.scratch);
        stack.push(start);
        while let Some(model) = stack.pop() {
            if self.visited[model.0] == self.wave {
                continue;
            }
            self.visited[model.0] = self.wave;
            self.touch_model(model);
            self.known[model.0] = false;
            for k in 0..self.model_listeners[model.0].len() {
                let listener = self.model_listeners[model.0][k];
                self.touch_model(listener);
                self.models[listener.0].handle_model_changed(model);
                stack.push(listener);
            }
        }
        self.scratch = stack;
    }
}
