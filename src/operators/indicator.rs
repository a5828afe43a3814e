//! Moves on 0/1 indicator parameters.

use rand::{seq::IndexedRandom, Rng, RngCore};

use super::{Operator, Proposal};
use crate::{
    distribution::Distribution,
    error::{McmcError, Result},
    graph::ModelGraph,
    likelihood::{DistributionLikelihood, SparseNormalLikelihood},
    model::{Dependency, ModelId, ParameterId},
};

/// Flips one indicator.
///
/// With `prior_on_sum` the move is corrected for the number of ways of
/// choosing which bits are on, so that a prior stated on the sum of the
/// indicators is not distorted by the binomial count of configurations.
#[derive(Debug, Clone)]
pub struct BitFlipOperator {
    name: String,
    indicators: ParameterId,
    prior_on_sum: bool,
}

impl BitFlipOperator {
    pub fn new(indicators: ParameterId) -> BitFlipOperator {
        BitFlipOperator {
            name: format!("bitFlip({})", indicators.index()),
            indicators,
            prior_on_sum: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> BitFlipOperator {
        self.name = name.into();
        self
    }

    pub fn prior_on_sum(mut self) -> BitFlipOperator {
        self.prior_on_sum = true;
        self
    }
}

impl Operator for BitFlipOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let indicators = graph.parameter(self.indicators);
        let dim = indicators.dimension();
        if dim == 0 {
            return Ok(Proposal::Failed);
        }
        let index = rng.random_range(0..dim);
        let was_on = indicators.is_on(index);
        let mut log_hastings_ratio = 0.;
        if self.prior_on_sum {
            let n = dim as f64;
            let sum = indicators.count_ones() as f64;
            log_hastings_ratio = if was_on {
                -(sum / (n - sum + 1.)).ln()
            } else {
                -((n - sum) / (sum + 1.)).ln()
            };
        }
        graph.set_value(self.indicators, index, if was_on { 0. } else { 1. });
        Ok(Proposal::Move { log_hastings_ratio })
    }
}

/// Switches one indicator off and another on, keeping the sum fixed.
///
/// If a parameter of values is attached, its entries at the two positions
/// are swapped along with the bits.
#[derive(Debug, Clone)]
pub struct BitMoveOperator {
    name: String,
    indicators: ParameterId,
    values: Option<ParameterId>,
}

impl BitMoveOperator {
    pub fn new(indicators: ParameterId) -> BitMoveOperator {
        BitMoveOperator {
            name: format!("bitMove({})", indicators.index()),
            indicators,
            values: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> BitMoveOperator {
        self.name = name.into();
        self
    }

    pub fn with_values(mut self, values: ParameterId) -> BitMoveOperator {
        self.values = Some(values);
        self
    }
}

impl Operator for BitMoveOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let bits = graph.parameter(self.indicators);
        let ones: Vec<usize> = bits.indices_where_on(true).collect();
        let zeros: Vec<usize> = bits.indices_where_on(false).collect();
        let (Some(&from), Some(&to)) = (ones.choose(rng), zeros.choose(rng)) else {
            return Ok(Proposal::Failed);
        };
        graph.set_value(self.indicators, from, 0.);
        graph.set_value(self.indicators, to, 1.);
        if let Some(values) = self.values {
            let parameter = graph.parameter(values);
            if parameter.dimension() <= from.max(to) {
                return Err(McmcError::DimensionMismatch {
                    name: parameter.name().to_string(),
                    expected: graph.parameter(self.indicators).dimension(),
                    found: parameter.dimension(),
                });
            }
            let (a, b) = (parameter.value(from), parameter.value(to));
            graph.set_value(values, from, b);
            graph.set_value(values, to, a);
        }
        Ok(Proposal::symmetric())
    }
}

/// Redraws the coefficient of one inactive indicator from its prior.
///
/// Inactive coefficients do not enter the likelihood, so their full
/// conditional is the prior itself.
#[derive(Debug, Clone)]
pub struct SampleNonActiveOperator {
    name: String,
    indicators: ParameterId,
    coefficients: ParameterId,
    prior: Distribution,
}

impl SampleNonActiveOperator {
    pub fn new(
        graph: &ModelGraph,
        likelihood: ModelId,
        prior: ModelId,
    ) -> Result<SampleNonActiveOperator> {
        let sparse = graph.model_as::<SparseNormalLikelihood>(likelihood).ok_or_else(|| {
            McmcError::Misconfigured(format!(
                "{} does not switch coefficients with indicators",
                graph.model(likelihood).name()
            ))
        })?;
        let coefficients = sparse.coefficients();
        let distribution = graph
            .model_as::<DistributionLikelihood>(prior)
            .filter(|p| p.parameter() == coefficients)
            .ok_or_else(|| {
                McmcError::Misconfigured(format!(
                    "{} is not a prior on {}",
                    graph.model(prior).name(),
                    graph.parameter(coefficients).name()
                ))
            })?
            .distribution();
        let listeners = graph.listeners(Dependency::Parameter(coefficients));
        if listeners.iter().any(|&m| m != likelihood && m != prior) {
            return Err(McmcError::Misconfigured(format!(
                "{} is read by models outside its sparse likelihood and prior",
                graph.parameter(coefficients).name()
            )));
        }
        Ok(SampleNonActiveOperator {
            name: format!("sampleNonActive({})", graph.parameter(coefficients).name()),
            indicators: sparse.indicators(),
            coefficients,
            prior: distribution,
        })
    }
}

impl Operator for SampleNonActiveOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_gibbs(&self) -> bool {
        true
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let inactive: Vec<usize> = graph
            .parameter(self.indicators)
            .indices_where_on(false)
            .collect();
        let Some(&index) = inactive.choose(rng) else {
            return Ok(Proposal::Failed);
        };
        let draw = self.prior.sample(rng)?;
        graph.set_value(self.coefficients, index, draw);
        Ok(Proposal::Gibbs)
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::{BitFlipOperator, BitMoveOperator, SampleNonActiveOperator};
    use crate::{
        distribution::Distribution,
        error::McmcError,
        graph::ModelGraph,
        likelihood::{CompoundLikelihood, DistributionLikelihood, SparseNormalLikelihood},
        model::{ModelId, ParameterId},
        operators::{test_support::assert_restores, Operator, Proposal},
        parameter::{Bounds, Parameter},
    };

    fn sparse(bits: Vec<f64>) -> (ModelGraph, ParameterId, ParameterId, [ModelId; 3]) {
        let mut graph = ModelGraph::new();
        let n = bits.len();
        let coefficients = graph
            .add_parameter(Parameter::new("beta", (0..n).map(|k| k as f64 * 0.5).collect()))
            .unwrap();
        let indicators = graph
            .add_parameter(Parameter::new("delta", bits).with_bounds(Bounds::UNIT))
            .unwrap();
        let likelihood = graph
            .add_model(SparseNormalLikelihood::new(
                "regression",
                vec![0.3; n],
                coefficients,
                indicators,
                1.,
            ))
            .unwrap();
        let prior = graph
            .add_model(DistributionLikelihood::new(
                "betaPrior",
                coefficients,
                Distribution::Normal { mean: 0., sd: 2. },
            ))
            .unwrap();
        let posterior = graph
            .add_model(CompoundLikelihood::new("posterior", vec![likelihood, prior]))
            .unwrap();
        (graph, coefficients, indicators, [likelihood, prior, posterior])
    }

    #[test]
    fn prior_on_sum_ratio() {
        let (mut graph, _, indicators, _) = sparse(vec![1., 0., 0., 0.]);
        let mut op = BitFlipOperator::new(indicators).prior_on_sum();
        let mut rng = ChaCha8Rng::seed_from_u64(20);
        for _ in 0..50 {
            let before = graph.parameter(indicators).count_ones() as f64;
            let Proposal::Move { log_hastings_ratio } = op.propose(&mut graph, &mut rng).unwrap()
            else {
                panic!("bit flip must make a move");
            };
            let after = graph.parameter(indicators).count_ones() as f64;
            let expected = if after > before {
                -((4. - before) / (before + 1.)).ln()
            } else {
                -(before / (4. - before + 1.)).ln()
            };
            assert_abs_diff_eq!(log_hastings_ratio, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn fractional_indicator_counts_as_on() {
        let (mut graph, _, indicators, [likelihood, _, posterior]) =
            sparse(vec![0.5, 0., 1., 0.]);
        assert_eq!(graph.parameter(indicators).count_ones(), 2);
        graph.evaluate(posterior).unwrap();
        let sparse = graph.model_as::<SparseNormalLikelihood>(likelihood).unwrap();
        assert!(sparse.active_set().unwrap().contains(0));

        let mut op = BitFlipOperator::new(indicators).prior_on_sum();
        let mut rng = ChaCha8Rng::seed_from_u64(24);
        loop {
            let before = graph.parameter(indicators).count_ones();
            let was_fractional = graph.parameter(indicators).value(0) == 0.5;
            let Proposal::Move { log_hastings_ratio } = op.propose(&mut graph, &mut rng).unwrap()
            else {
                panic!("bit flip must make a move");
            };
            let after = graph.parameter(indicators).count_ones();
            assert_eq!(before.abs_diff(after), 1);
            if was_fractional && graph.parameter(indicators).value(0) == 0. {
                let b = before as f64;
                assert_abs_diff_eq!(log_hastings_ratio, -(b / (4. - b + 1.)).ln(), epsilon = 1e-12);
                break;
            }
        }
    }

    #[test]
    fn bit_move_keeps_sum_and_swaps_values() {
        let (mut graph, coefficients, indicators, _) = sparse(vec![1., 0., 1., 0., 0.]);
        let mut op = BitMoveOperator::new(indicators).with_values(coefficients);
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        for _ in 0..100 {
            let mut before = graph.parameter(coefficients).values().to_vec();
            assert_eq!(op.propose(&mut graph, &mut rng).unwrap(), Proposal::symmetric());
            assert_eq!(graph.parameter(indicators).count_ones(), 2);
            let mut after = graph.parameter(coefficients).values().to_vec();
            before.sort_by(f64::total_cmp);
            after.sort_by(f64::total_cmp);
            assert_eq!(before, after);
        }

        let (mut full, _, indicators, _) = sparse(vec![1., 1., 1.]);
        let mut op = BitMoveOperator::new(indicators);
        assert_eq!(op.propose(&mut full, &mut rng).unwrap(), Proposal::Failed);
    }

    #[test]
    fn non_active_redraws_only_inactive() {
        let (mut graph, coefficients, indicators, [likelihood, prior, _]) =
            sparse(vec![1., 0., 1., 0.]);
        let mut op = SampleNonActiveOperator::new(&graph, likelihood, prior).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(22);
        let active = [graph.parameter(coefficients).value(0), graph.parameter(coefficients).value(2)];
        for _ in 0..20 {
            assert_eq!(op.propose(&mut graph, &mut rng).unwrap(), Proposal::Gibbs);
        }
        assert_eq!(graph.parameter(coefficients).value(0), active[0]);
        assert_eq!(graph.parameter(coefficients).value(2), active[1]);
        assert_ne!(graph.parameter(coefficients).value(1), 0.5);

        graph.set_values(indicators, &[1., 1., 1., 1.]).unwrap();
        assert_eq!(op.propose(&mut graph, &mut rng).unwrap(), Proposal::Failed);

        assert!(matches!(
            SampleNonActiveOperator::new(&graph, prior, prior),
            Err(McmcError::Misconfigured(_))
        ));
    }

    #[test]
    fn indicator_moves_restore_exactly() {
        let (mut graph, coefficients, indicators, [likelihood, prior, posterior]) =
            sparse(vec![1., 0., 0., 1., 0.]);
        let mut rng = ChaCha8Rng::seed_from_u64(23);
        let mut flip = BitFlipOperator::new(indicators).prior_on_sum();
        assert_restores(&mut graph, posterior, &mut flip, &mut rng, 5_000);
        let mut bit_move = BitMoveOperator::new(indicators).with_values(coefficients);
        assert_restores(&mut graph, posterior, &mut bit_move, &mut rng, 5_000);
        let mut redraw = SampleNonActiveOperator::new(&graph, likelihood, prior).unwrap();
        assert_restores(&mut graph, posterior, &mut redraw, &mut rng, 5_000);
    }
}
