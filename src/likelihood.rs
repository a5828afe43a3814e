//! Likelihoods and priors that ship with the crate.
//!
//! Each of these is a [`Model`] producing one log density. Data likelihoods
//! for real analyses (sequence likelihoods and the like) are expected to
//! implement [`Model`] themselves; the types here cover composition, simple
//! priors, the conjugate pairs the Gibbs operators understand and a few tree
//! priors.

use std::any::Any;
use std::collections::BTreeSet;

use faer::Mat;
use rand::RngCore;
use rand_distr::{Distribution as _, StandardNormal};

use crate::{
    distribution::Distribution,
    error::{McmcError, Result},
    model::{Dependency, Inputs, Model, ModelId, ParameterId, TreeId, Variable},
    parameter::{Parameter, VariableChange},
    state::Stored,
    tree::{TipSet, Tree},
};

const LN_2PI: f64 = 1.8378770664093453;

fn expect_dimension(parameter: &Parameter, expected: usize) -> Result<()> {
    if parameter.dimension() != expected {
        return Err(McmcError::DimensionMismatch {
            name: parameter.name().to_string(),
            expected,
            found: parameter.dimension(),
        });
    }
    Ok(())
}

/// Weighted sum of other models, optionally raised to a temperature.
///
/// Any component at `-inf` makes the whole sum `-inf` without looking at
/// the rest.
#[derive(Debug, Clone)]
pub struct CompoundLikelihood {
    name: String,
    components: Vec<ModelId>,
    weights: Vec<f64>,
    temperature: Option<ParameterId>,
}

impl CompoundLikelihood {
    pub fn new(name: impl Into<String>, components: Vec<ModelId>) -> CompoundLikelihood {
        let weights = vec![1.; components.len()];
        CompoundLikelihood {
            name: name.into(),
            components,
            weights,
            temperature: None,
        }
    }

    pub fn weighted(name: impl Into<String>, components: Vec<(ModelId, f64)>) -> CompoundLikelihood {
        let (components, weights) = components.into_iter().unzip();
        CompoundLikelihood {
            name: name.into(),
            components,
            weights,
            temperature: None,
        }
    }

    /// Multiply the summed log density by the value of a scalar parameter.
    pub fn with_temperature(mut self, temperature: ParameterId) -> CompoundLikelihood {
        self.temperature = Some(temperature);
        self
    }

    pub fn components(&self) -> &[ModelId] {
        &self.components
    }
}

impl Model for CompoundLikelihood {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<Dependency> {
        self.components
            .iter()
            .map(|&id| Dependency::Model(id))
            .chain(self.temperature.map(Dependency::Parameter))
            .collect()
    }

    fn validate(&self, inputs: &Inputs<'_>) -> Result<()> {
        if self.components.is_empty() {
            return Err(McmcError::Misconfigured(format!(
                "{} has no components",
                self.name
            )));
        }
        if self.weights.iter().any(|w| !w.is_finite()) {
            return Err(McmcError::Misconfigured(format!(
                "{} has a non-finite weight",
                self.name
            )));
        }
        if let Some(temperature) = self.temperature {
            expect_dimension(inputs.parameter(temperature), 1)?;
        }
        Ok(())
    }

    fn calculate_log_likelihood(&mut self, inputs: &Inputs<'_>) -> f64 {
        let mut total = 0.;
        for (&id, &weight) in self.components.iter().zip(self.weights.iter()) {
            let value = inputs.log_likelihood(id);
            if value == f64::NEG_INFINITY {
                return f64::NEG_INFINITY;
            }
            total += weight * value;
        }
        match self.temperature {
            Some(temperature) => inputs.parameter(temperature).value(0) * total,
            None => total,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Independent identically distributed prior over every entry of a
/// parameter.
///
/// Keeps one term per entry and only recomputes the entries that changed.
#[derive(Debug, Clone)]
pub struct DistributionLikelihood {
    name: String,
    parameter: ParameterId,
    distribution: Distribution,
    terms: Vec<f64>,
    dirty: Vec<bool>,
    stored: Stored<(Vec<f64>, Vec<bool>)>,
}

impl DistributionLikelihood {
    pub fn new(
        name: impl Into<String>,
        parameter: ParameterId,
        distribution: Distribution,
    ) -> DistributionLikelihood {
        DistributionLikelihood {
            name: name.into(),
            parameter,
            distribution,
            terms: Vec::new(),
            dirty: Vec::new(),
            stored: Stored::Committed,
        }
    }

    pub fn parameter(&self) -> ParameterId {
        self.parameter
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }
}

impl Model for DistributionLikelihood {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![self.parameter.into()]
    }

    fn validate(&self, _inputs: &Inputs<'_>) -> Result<()> {
        self.distribution.validate()
    }

    fn handle_variable_changed(&mut self, _variable: Variable, change: VariableChange) {
        match change {
            VariableChange::Value(index) if index < self.dirty.len() => self.dirty[index] = true,
            _ => self.make_dirty(),
        }
    }

    fn store_state(&mut self) {
        self.stored.store((self.terms.clone(), self.dirty.clone()));
    }

    fn restore_state(&mut self) {
        if let Some((terms, dirty)) = self.stored.take() {
            self.terms = terms;
            self.dirty = dirty;
        }
    }

    fn accept_state(&mut self) {
        self.stored.accept();
    }

    fn make_dirty(&mut self) {
        self.terms.clear();
        self.dirty.clear();
    }

    fn calculate_log_likelihood(&mut self, inputs: &Inputs<'_>) -> f64 {
        let values = inputs.parameter(self.parameter).values();
        if self.terms.len() != values.len() {
            self.terms = vec![0.; values.len()];
            self.dirty = vec![true; values.len()];
        }
        for (k, &value) in values.iter().enumerate() {
            if self.dirty[k] {
                self.terms[k] = self.distribution.ln_pdf(value);
                self.dirty[k] = false;
            }
        }
        self.terms.iter().sum()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Observations `x_i ~ Normal(mean, 1 / precision)` with scalar mean and
/// precision parameters.
#[derive(Debug, Clone)]
pub struct NormalLikelihood {
    name: String,
    data: Vec<f64>,
    mean: ParameterId,
    precision: ParameterId,
}

impl NormalLikelihood {
    pub fn new(
        name: impl Into<String>,
        data: Vec<f64>,
        mean: ParameterId,
        precision: ParameterId,
    ) -> NormalLikelihood {
        NormalLikelihood {
            name: name.into(),
            data,
            mean,
            precision,
        }
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn mean(&self) -> ParameterId {
        self.mean
    }

    pub fn precision(&self) -> ParameterId {
        self.precision
    }

    /// Sum of squared deviations of the data around `mean`.
    pub fn sum_of_squares(&self, mean: f64) -> f64 {
        self.data.iter().map(|x| (x - mean) * (x - mean)).sum()
    }
}

impl Model for NormalLikelihood {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![self.mean.into(), self.precision.into()]
    }

    fn validate(&self, inputs: &Inputs<'_>) -> Result<()> {
        expect_dimension(inputs.parameter(self.mean), 1)?;
        expect_dimension(inputs.parameter(self.precision), 1)?;
        if self.data.is_empty() {
            return Err(McmcError::Misconfigured(format!("{} has no data", self.name)));
        }
        Ok(())
    }

    fn calculate_log_likelihood(&mut self, inputs: &Inputs<'_>) -> f64 {
        let mean = inputs.parameter(self.mean).value(0);
        let precision = inputs.parameter(self.precision).value(0);
        if precision <= 0. {
            return f64::NEG_INFINITY;
        }
        let n = self.data.len() as f64;
        0.5 * n * (precision.ln() - LN_2PI) - 0.5 * precision * self.sum_of_squares(mean)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Multivariate normal prior over a whole parameter vector, e.g. a Gaussian
/// process evaluated at fixed points.
///
/// The covariance is decomposed once at construction.
#[derive(Debug, Clone)]
pub struct MultivariateNormalLikelihood {
    name: String,
    parameter: ParameterId,
    mean: Vec<f64>,
    eigenvectors: Vec<Vec<f64>>,
    eigenvalues: Vec<f64>,
    log_determinant: f64,
}

impl MultivariateNormalLikelihood {
    pub fn new(
        name: impl Into<String>,
        parameter: ParameterId,
        mean: Vec<f64>,
        covariance: &[Vec<f64>],
    ) -> Result<MultivariateNormalLikelihood> {
        let name = name.into();
        let dim = mean.len();
        if covariance.len() != dim || covariance.iter().any(|row| row.len() != dim) {
            return Err(McmcError::DimensionMismatch {
                name,
                expected: dim,
                found: covariance.len(),
            });
        }
        let matrix = Mat::from_fn(dim, dim, |i, j| covariance[i][j]);
        let eigen = matrix
            .self_adjoint_eigen(faer::Side::Lower)
            .map_err(|err| McmcError::Misconfigured(format!("{name}: {err:?}")))?;
        let eigenvalues: Vec<f64> = eigen.S().column_vector().iter().copied().collect();
        if eigenvalues.iter().any(|&s| s <= 0. || !s.is_finite()) {
            return Err(McmcError::Misconfigured(format!(
                "{name}: covariance is not positive definite"
            )));
        }
        let eigenvectors = (0..dim)
            .map(|k| eigen.U().col(k).iter().copied().collect())
            .collect();
        let log_determinant = eigenvalues.iter().map(|s| s.ln()).sum();
        Ok(MultivariateNormalLikelihood {
            name,
            parameter,
            mean,
            eigenvectors,
            eigenvalues,
            log_determinant,
        })
    }

    pub fn parameter(&self) -> ParameterId {
        self.parameter
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Log density of `x` under this prior.
    pub fn ln_density(&self, x: &[f64]) -> f64 {
        let quadratic: f64 = self
            .eigenvectors
            .iter()
            .zip(self.eigenvalues.iter())
            .map(|(u, s)| {
                let projection: f64 = u
                    .iter()
                    .zip(x.iter().zip(self.mean.iter()))
                    .map(|(u, (x, m))| u * (x - m))
                    .sum();
                projection * projection / s
            })
            .sum();
        -0.5 * (self.dimension() as f64 * LN_2PI + self.log_determinant + quadratic)
    }

    /// A draw from the zero-mean version of this distribution.
    pub fn sample_centered(&self, rng: &mut dyn RngCore) -> Vec<f64> {
        let mut draw = vec![0.; self.dimension()];
        for (u, s) in self.eigenvectors.iter().zip(self.eigenvalues.iter()) {
            let z: f64 = StandardNormal.sample(rng);
            let scale = z * s.sqrt();
            draw.iter_mut().zip(u.iter()).for_each(|(d, u)| *d += scale * u);
        }
        draw
    }
}

impl Model for MultivariateNormalLikelihood {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![self.parameter.into()]
    }

    fn validate(&self, inputs: &Inputs<'_>) -> Result<()> {
        expect_dimension(inputs.parameter(self.parameter), self.dimension())
    }

    fn calculate_log_likelihood(&mut self, inputs: &Inputs<'_>) -> f64 {
        let x = inputs.parameter(self.parameter).values();
        if x.len() != self.dimension() {
            return f64::NEG_INFINITY;
        }
        self.ln_density(x)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Indices whose indicator is switched on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSet(BTreeSet<usize>);

impl ActiveSet {
    pub fn from_indicators(indicators: &Parameter) -> ActiveSet {
        ActiveSet(indicators.indices_where_on(true).collect())
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }
}

/// Regression with switchable effects: `y_i ~ Normal(b_i, sd)` when
/// indicator `i` is on and `y_i ~ Normal(0, sd)` otherwise.
///
/// Coefficients of inactive entries do not enter the likelihood, so moves
/// on them are free to wander under their prior.
#[derive(Debug, Clone)]
pub struct SparseNormalLikelihood {
    name: String,
    data: Vec<f64>,
    coefficients: ParameterId,
    indicators: ParameterId,
    sd: f64,
    active: Option<ActiveSet>,
    stored: Stored<Option<ActiveSet>>,
}

impl SparseNormalLikelihood {
    pub fn new(
        name: impl Into<String>,
        data: Vec<f64>,
        coefficients: ParameterId,
        indicators: ParameterId,
        sd: f64,
    ) -> SparseNormalLikelihood {
        SparseNormalLikelihood {
            name: name.into(),
            data,
            coefficients,
            indicators,
            sd,
            active: None,
            stored: Stored::Committed,
        }
    }

    pub fn coefficients(&self) -> ParameterId {
        self.coefficients
    }

    pub fn indicators(&self) -> ParameterId {
        self.indicators
    }

    pub fn active_set(&self) -> Option<&ActiveSet> {
        self.active.as_ref()
    }
}

impl Model for SparseNormalLikelihood {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![self.coefficients.into(), self.indicators.into()]
    }

    fn validate(&self, inputs: &Inputs<'_>) -> Result<()> {
        expect_dimension(inputs.parameter(self.coefficients), self.data.len())?;
        expect_dimension(inputs.parameter(self.indicators), self.data.len())?;
        if self.sd.is_nan() || self.sd <= 0. {
            return Err(McmcError::Misconfigured(format!(
                "{}: standard deviation must be positive",
                self.name
            )));
        }
        Ok(())
    }

    fn handle_variable_changed(&mut self, variable: Variable, _change: VariableChange) {
        if variable == Variable::Parameter(self.indicators) {
            self.active = None;
        }
    }

    fn store_state(&mut self) {
        self.stored.store(self.active.clone());
    }

    fn restore_state(&mut self) {
        if let Some(active) = self.stored.take() {
            self.active = active;
        }
    }

    fn accept_state(&mut self) {
        self.stored.accept();
    }

    fn make_dirty(&mut self) {
        self.active = None;
    }

    fn calculate_log_likelihood(&mut self, inputs: &Inputs<'_>) -> f64 {
        let coefficients = inputs.parameter(self.coefficients);
        let active = self
            .active
            .get_or_insert_with(|| ActiveSet::from_indicators(inputs.parameter(self.indicators)));
        let precision = 1. / (self.sd * self.sd);
        let n = self.data.len() as f64;
        let squares: f64 = self
            .data
            .iter()
            .enumerate()
            .map(|(k, y)| {
                let mean = if active.contains(k) {
                    coefficients.value(k)
                } else {
                    0.
                };
                (y - mean) * (y - mean)
            })
            .sum();
        0.5 * n * (precision.ln() - LN_2PI) - 0.5 * precision * squares
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Kingman coalescent prior on a time tree with constant population size.
///
/// The sorted list of sampling and coalescent events is cached and only
/// rebuilt when the tree changes.
#[derive(Debug, Clone)]
pub struct ConstantCoalescentLikelihood {
    name: String,
    tree: TreeId,
    population_size: ParameterId,
    events: Option<Vec<(f64, bool)>>,
    stored: Stored<Option<Vec<(f64, bool)>>>,
}

impl ConstantCoalescentLikelihood {
    pub fn new(
        name: impl Into<String>,
        tree: TreeId,
        population_size: ParameterId,
    ) -> ConstantCoalescentLikelihood {
        ConstantCoalescentLikelihood {
            name: name.into(),
            tree,
            population_size,
            events: None,
            stored: Stored::Committed,
        }
    }

    fn collect_events(tree: &Tree) -> Vec<(f64, bool)> {
        let mut events: Vec<(f64, bool)> = (0..tree.node_count())
            .map(|node| (tree.height(node), !tree.is_tip(node)))
            .collect();
        // Samples before coalescences at equal heights.
        events.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        events
    }
}

impl Model for ConstantCoalescentLikelihood {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![self.tree.into(), self.population_size.into()]
    }

    fn validate(&self, inputs: &Inputs<'_>) -> Result<()> {
        expect_dimension(inputs.parameter(self.population_size), 1)
    }

    fn handle_variable_changed(&mut self, variable: Variable, _change: VariableChange) {
        if variable == Variable::Tree(self.tree) {
            self.events = None;
        }
    }

    fn store_state(&mut self) {
        self.stored.store(self.events.clone());
    }

    fn restore_state(&mut self) {
        if let Some(events) = self.stored.take() {
            self.events = events;
        }
    }

    fn accept_state(&mut self) {
        self.stored.accept();
    }

    fn make_dirty(&mut self) {
        self.events = None;
    }

    fn calculate_log_likelihood(&mut self, inputs: &Inputs<'_>) -> f64 {
        let population_size = inputs.parameter(self.population_size).value(0);
        if population_size <= 0. {
            return f64::NEG_INFINITY;
        }
        let tree = inputs.tree(self.tree);
        let events = self
            .events
            .get_or_insert_with(|| ConstantCoalescentLikelihood::collect_events(tree));

        let mut log_likelihood = 0.;
        let mut lineages = 0usize;
        let mut last = f64::NEG_INFINITY;
        for &(height, is_coalescence) in events.iter() {
            if lineages >= 2 {
                let pairs = (lineages * (lineages - 1)) as f64 / 2.;
                log_likelihood -= pairs * (height - last) / population_size;
            }
            if is_coalescence {
                if lineages < 2 {
                    return f64::NEG_INFINITY;
                }
                log_likelihood -= population_size.ln();
                lineages -= 1;
            } else {
                lineages += 1;
            }
            last = height;
        }
        log_likelihood
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hard constraint: `0` when the given taxa form a clade, `-inf` otherwise.
#[derive(Debug, Clone)]
pub struct MonophylyLikelihood {
    name: String,
    tree: TreeId,
    taxa: Vec<String>,
    tips: Option<TipSet>,
}

impl MonophylyLikelihood {
    pub fn new(name: impl Into<String>, tree: TreeId, taxa: Vec<String>) -> MonophylyLikelihood {
        MonophylyLikelihood {
            name: name.into(),
            tree,
            taxa,
            tips: None,
        }
    }
}

impl Model for MonophylyLikelihood {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![self.tree.into()]
    }

    fn validate(&self, inputs: &Inputs<'_>) -> Result<()> {
        let tree = inputs.tree(self.tree);
        for taxon in self.taxa.iter() {
            if tree.taxon_index(taxon).is_none() {
                return Err(McmcError::Misconfigured(format!(
                    "{}: taxon {taxon} is not in tree {}",
                    self.name,
                    tree.name()
                )));
            }
        }
        Ok(())
    }

    fn calculate_log_likelihood(&mut self, inputs: &Inputs<'_>) -> f64 {
        let tree = inputs.tree(self.tree);
        let taxa = &self.taxa;
        let tips = self.tips.get_or_insert_with(|| {
            TipSet::from_tips(
                tree.tip_count(),
                taxa.iter().filter_map(|taxon| tree.taxon_index(taxon)),
            )
        });
        if tree.is_monophyletic(tips) {
            0.
        } else {
            f64::NEG_INFINITY
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
