use rand::{Rng, RngCore};

use super::{
    draw_scale, scale_factor_to_tuning, tuning_to_scale_factor, CoercionMode, Operator, Proposal,
};
use crate::{
    error::{McmcError, Result},
    graph::ModelGraph,
    model::{ParameterId, TreeId},
};

fn check_scale_factor(scale_factor: f64) -> Result<()> {
    if !(scale_factor > 0. && scale_factor < 1.) {
        return Err(McmcError::Misconfigured(format!(
            "scale factor must lie in (0, 1), got {scale_factor}"
        )));
    }
    Ok(())
}

/// Multiplies one entry, or every entry, of a parameter by `s ~ U(c, 1/c)`.
#[derive(Debug, Clone)]
pub struct ScaleOperator {
    name: String,
    parameter: ParameterId,
    scale_factor: f64,
    scale_all: bool,
    mode: CoercionMode,
}

impl ScaleOperator {
    pub fn new(parameter: ParameterId, scale_factor: f64) -> Result<ScaleOperator> {
        check_scale_factor(scale_factor)?;
        Ok(ScaleOperator {
            name: format!("scale({})", parameter.index()),
            parameter,
            scale_factor,
            scale_all: false,
            mode: CoercionMode::Default,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> ScaleOperator {
        self.name = name.into();
        self
    }

    /// Scale all entries together instead of one at random.
    pub fn scale_all(mut self) -> ScaleOperator {
        self.scale_all = true;
        self
    }

    pub fn with_coercion(mut self, mode: CoercionMode) -> ScaleOperator {
        self.mode = mode;
        self
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }
}

impl Operator for ScaleOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let dim = graph.parameter(self.parameter).dimension();
        if dim == 0 {
            return Ok(Proposal::Failed);
        }
        let scale = draw_scale(rng, self.scale_factor);
        let log_hastings_ratio = if self.scale_all {
            let values: Vec<f64> = graph
                .parameter(self.parameter)
                .values()
                .iter()
                .map(|v| v * scale)
                .collect();
            graph.set_values(self.parameter, &values)?;
            (dim as f64 - 2.) * scale.ln()
        } else {
            let index = rng.random_range(0..dim);
            let value = graph.parameter(self.parameter).value(index);
            graph.set_value(self.parameter, index, value * scale);
            -scale.ln()
        };
        Ok(Proposal::Move { log_hastings_ratio })
    }

    fn coercable_parameter(&self) -> Option<f64> {
        Some(scale_factor_to_tuning(self.scale_factor))
    }

    fn set_coercable_parameter(&mut self, value: f64) {
        self.scale_factor = tuning_to_scale_factor(value);
    }

    fn raw_parameter(&self) -> Option<f64> {
        Some(self.scale_factor)
    }

    fn set_raw_parameter(&mut self, value: f64) {
        self.scale_factor = value;
    }

    fn coercion_mode(&self) -> CoercionMode {
        self.mode
    }
}

/// Something the up-down operator can stretch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalable {
    /// Every entry of a parameter.
    Parameter(ParameterId),
    /// Every internal node height of a tree; tips keep their heights.
    TreeHeights(TreeId),
}

impl Scalable {
    /// Multiply by `factor`, returning how many values changed.
    fn scale(self, graph: &mut ModelGraph, factor: f64) -> Result<usize> {
        match self {
            Scalable::Parameter(id) => {
                let values: Vec<f64> = graph
                    .parameter(id)
                    .values()
                    .iter()
                    .map(|v| v * factor)
                    .collect();
                graph.set_values(id, &values)?;
                Ok(values.len())
            }
            Scalable::TreeHeights(id) => Ok(graph.edit_tree(id, |tree| {
                let internal = tree.internal_nodes();
                let count = internal.len();
                for node in internal {
                    tree.set_height(node, tree.height(node) * factor);
                }
                count
            })),
        }
    }
}

/// Scales one group of values up by `s` and another down by `1/s`, e.g. a
/// clock rate against the node heights it trades off with.
#[derive(Debug, Clone)]
pub struct UpDownOperator {
    name: String,
    up: Vec<Scalable>,
    down: Vec<Scalable>,
    scale_factor: f64,
    mode: CoercionMode,
}

impl UpDownOperator {
    pub fn new(up: Vec<Scalable>, down: Vec<Scalable>, scale_factor: f64) -> Result<UpDownOperator> {
        check_scale_factor(scale_factor)?;
        if up.is_empty() && down.is_empty() {
            return Err(McmcError::Misconfigured(
                "up-down operator needs something to scale".into(),
            ));
        }
        Ok(UpDownOperator {
            name: "upDown".into(),
            up,
            down,
            scale_factor,
            mode: CoercionMode::Default,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> UpDownOperator {
        self.name = name.into();
        self
    }

    pub fn with_coercion(mut self, mode: CoercionMode) -> UpDownOperator {
        self.mode = mode;
        self
    }
}

impl Operator for UpDownOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let scale = draw_scale(rng, self.scale_factor);
        let mut went_up = 0;
        for &target in self.up.iter() {
            went_up += target.scale(graph, scale)?;
        }
        let mut went_down = 0;
        for &target in self.down.iter() {
            went_down += target.scale(graph, 1. / scale)?;
        }
        let log_hastings_ratio = (went_up as f64 - went_down as f64 - 2.) * scale.ln();
        Ok(Proposal::Move { log_hastings_ratio })
    }

    fn coercable_parameter(&self) -> Option<f64> {
        Some(scale_factor_to_tuning(self.scale_factor))
    }

    fn set_coercable_parameter(&mut self, value: f64) {
        self.scale_factor = tuning_to_scale_factor(value);
    }

    fn raw_parameter(&self) -> Option<f64> {
        Some(self.scale_factor)
    }

    fn set_raw_parameter(&mut self, value: f64) {
        self.scale_factor = value;
    }

    fn coercion_mode(&self) -> CoercionMode {
        self.mode
    }
}
