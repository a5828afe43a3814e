use rand::{Rng, RngCore};
use rand_distr::{Distribution as _, StandardNormal};
use serde::{Deserialize, Serialize};

use super::{CoercionMode, Operator, Proposal};
use crate::{
    error::{McmcError, Result},
    graph::ModelGraph,
    model::ParameterId,
    parameter::Bounds,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RandomWalkKind {
    /// Step drawn from `U(-w, w)`.
    #[default]
    Uniform,
    /// Step drawn from `Normal(0, w)`.
    Gaussian,
}

/// Reflect `value` back into `bounds`. Reflection keeps the move symmetric.
pub(crate) fn reflect(value: f64, bounds: Bounds) -> f64 {
    let Bounds { lower, upper } = bounds;
    match (lower.is_finite(), upper.is_finite()) {
        (true, true) => {
            let width = upper - lower;
            if width <= 0. {
                return lower;
            }
            let offset = (value - lower).rem_euclid(2. * width);
            if offset > width {
                upper - (offset - width)
            } else {
                lower + offset
            }
        }
        (true, false) if value < lower => 2. * lower - value,
        (false, true) if value > upper => 2. * upper - value,
        _ => value,
    }
}

/// Adds a symmetric random step to one entry of a parameter.
#[derive(Debug, Clone)]
pub struct RandomWalkOperator {
    name: String,
    parameter: ParameterId,
    window_size: f64,
    kind: RandomWalkKind,
    mode: CoercionMode,
}

impl RandomWalkOperator {
    pub fn new(parameter: ParameterId, window_size: f64) -> Result<RandomWalkOperator> {
        if !(window_size > 0. && window_size.is_finite()) {
            return Err(McmcError::Misconfigured(format!(
                "random walk window must be positive, got {window_size}"
            )));
        }
        Ok(RandomWalkOperator {
            name: format!("randomWalk({})", parameter.index()),
            parameter,
            window_size,
            kind: RandomWalkKind::Uniform,
            mode: CoercionMode::Default,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> RandomWalkOperator {
        self.name = name.into();
        self
    }

    pub fn with_kind(mut self, kind: RandomWalkKind) -> RandomWalkOperator {
        self.kind = kind;
        self
    }

    pub fn with_coercion(mut self, mode: CoercionMode) -> RandomWalkOperator {
        self.mode = mode;
        self
    }

    pub fn window_size(&self) -> f64 {
        self.window_size
    }
}

impl Operator for RandomWalkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let parameter = graph.parameter(self.parameter);
        let dim = parameter.dimension();
        if dim == 0 {
            return Ok(Proposal::Failed);
        }
        let index = rng.random_range(0..dim);
        let step = match self.kind {
            RandomWalkKind::Uniform => self.window_size * (2. * rng.random::<f64>() - 1.),
            RandomWalkKind::Gaussian => {
                let z: f64 = StandardNormal.sample(rng);
                self.window_size * z
            }
        };
        let value = reflect(parameter.value(index) + step, parameter.bounds());
        graph.set_value(self.parameter, index, value);
        Ok(Proposal::symmetric())
    }

    fn coercable_parameter(&self) -> Option<f64> {
        Some(self.window_size.ln())
    }

    fn set_coercable_parameter(&mut self, value: f64) {
        self.window_size = value.exp();
    }

    fn raw_parameter(&self) -> Option<f64> {
        Some(self.window_size)
    }

    fn set_raw_parameter(&mut self, value: f64) {
        self.window_size = value;
    }

    fn coercion_mode(&self) -> CoercionMode {
        self.mode
    }
}
