//! Operators that draw from full conditional distributions.
//!
//! The conjugate operators only make sense when nothing but their
//! likelihood/prior pair reads the parameter they update, so they check the
//! wiring of the graph when they are built.

use std::f64::consts::PI;

use rand::{Rng, RngCore};

use super::{Operator, Proposal};
use crate::{
    distribution::Distribution,
    error::{McmcError, Result},
    graph::ModelGraph,
    likelihood::{DistributionLikelihood, MultivariateNormalLikelihood, NormalLikelihood},
    model::{Dependency, ModelId, ParameterId},
};

fn normal_likelihood(graph: &ModelGraph, id: ModelId) -> Result<&NormalLikelihood> {
    graph.model_as::<NormalLikelihood>(id).ok_or_else(|| {
        McmcError::Misconfigured(format!(
            "{} is not a normal likelihood",
            graph.model(id).name()
        ))
    })
}

fn prior_on(
    graph: &ModelGraph,
    id: ModelId,
    parameter: ParameterId,
) -> Result<Distribution> {
    let prior = graph
        .model_as::<DistributionLikelihood>(id)
        .filter(|prior| prior.parameter() == parameter)
        .ok_or_else(|| {
            McmcError::Misconfigured(format!(
                "{} is not a prior on {}",
                graph.model(id).name(),
                graph.parameter(parameter).name()
            ))
        })?;
    Ok(prior.distribution())
}

/// The parameter must be read by exactly `readers`.
fn check_only_readers(graph: &ModelGraph, parameter: ParameterId, readers: &[ModelId]) -> Result<()> {
    let listeners = graph.listeners(Dependency::Parameter(parameter));
    let matches = listeners.len() == readers.len() && readers.iter().all(|r| listeners.contains(r));
    if !matches {
        return Err(McmcError::Misconfigured(format!(
            "{} is read by models outside its conjugate pair",
            graph.parameter(parameter).name()
        )));
    }
    Ok(())
}

/// Samples the mean of a normal likelihood under a normal prior.
#[derive(Debug, Clone)]
pub struct NormalMeanGibbsOperator {
    name: String,
    mean: ParameterId,
    precision: ParameterId,
    data_count: f64,
    data_sum: f64,
    prior_mean: f64,
    prior_precision: f64,
}

impl NormalMeanGibbsOperator {
    pub fn new(graph: &ModelGraph, likelihood: ModelId, prior: ModelId) -> Result<NormalMeanGibbsOperator> {
        let normal = normal_likelihood(graph, likelihood)?;
        let mean = normal.mean();
        let Distribution::Normal {
            mean: prior_mean,
            sd,
        } = prior_on(graph, prior, mean)?
        else {
            return Err(McmcError::Misconfigured(format!(
                "the prior of {} must be normal",
                graph.parameter(mean).name()
            )));
        };
        check_only_readers(graph, mean, &[likelihood, prior])?;
        Ok(NormalMeanGibbsOperator {
            name: format!("normalMeanGibbs({})", graph.parameter(mean).name()),
            mean,
            precision: normal.precision(),
            data_count: normal.data().len() as f64,
            data_sum: normal.data().iter().sum(),
            prior_mean,
            prior_precision: 1. / (sd * sd),
        })
    }
}

impl Operator for NormalMeanGibbsOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_gibbs(&self) -> bool {
        true
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let precision = graph.parameter(self.precision).value(0);
        if !(precision > 0.) {
            return Ok(Proposal::Failed);
        }
        let posterior_precision = self.prior_precision + self.data_count * precision;
        let posterior_mean = (self.prior_precision * self.prior_mean + precision * self.data_sum)
            / posterior_precision;
        let draw = Distribution::Normal {
            mean: posterior_mean,
            sd: posterior_precision.sqrt().recip(),
        }
        .sample(rng)?;
        graph.set_value(self.mean, 0, draw);
        Ok(Proposal::Gibbs)
    }
}

/// Samples the precision of a normal likelihood under a gamma prior.
#[derive(Debug, Clone)]
pub struct NormalPrecisionGibbsOperator {
    name: String,
    precision: ParameterId,
    likelihood: ModelId,
    prior_shape: f64,
    prior_rate: f64,
}

impl NormalPrecisionGibbsOperator {
    pub fn new(
        graph: &ModelGraph,
        likelihood: ModelId,
        prior: ModelId,
    ) -> Result<NormalPrecisionGibbsOperator> {
        let precision = normal_likelihood(graph, likelihood)?.precision();
        let Distribution::Gamma { shape, rate } = prior_on(graph, prior, precision)? else {
            return Err(McmcError::Misconfigured(format!(
                "the prior of {} must be a gamma distribution",
                graph.parameter(precision).name()
            )));
        };
        check_only_readers(graph, precision, &[likelihood, prior])?;
        Ok(NormalPrecisionGibbsOperator {
            name: format!("normalPrecisionGibbs({})", graph.parameter(precision).name()),
            precision,
            likelihood,
            prior_shape: shape,
            prior_rate: rate,
        })
    }
}

impl Operator for NormalPrecisionGibbsOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_gibbs(&self) -> bool {
        true
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let normal = normal_likelihood(graph, self.likelihood)?;
        let mean = graph.parameter(normal.mean()).value(0);
        let shape = self.prior_shape + 0.5 * normal.data().len() as f64;
        let rate = self.prior_rate + 0.5 * normal.sum_of_squares(mean);
        let draw = Distribution::Gamma { shape, rate }.sample(rng)?;
        graph.set_value(self.precision, 0, draw);
        Ok(Proposal::Gibbs)
    }
}

/// Elliptical slice sampling for a parameter with a multivariate normal
/// prior. Only the rest of the posterior is evaluated against the slice.
#[derive(Debug, Clone)]
pub struct EllipticalSliceOperator {
    name: String,
    parameter: ParameterId,
    gp: ModelId,
    posterior: ModelId,
    prior: MultivariateNormalLikelihood,
    bracket_angle: f64,
    max_shrinks: usize,
}

impl EllipticalSliceOperator {
    pub fn new(graph: &ModelGraph, gp: ModelId, posterior: ModelId) -> Result<EllipticalSliceOperator> {
        let prior = graph
            .model_as::<MultivariateNormalLikelihood>(gp)
            .ok_or_else(|| {
                McmcError::Misconfigured(format!(
                    "{} is not a multivariate normal prior",
                    graph.model(gp).name()
                ))
            })?
            .clone();
        let parameter = prior.parameter();
        Ok(EllipticalSliceOperator {
            name: format!("ellipticalSlice({})", graph.parameter(parameter).name()),
            parameter,
            gp,
            posterior,
            prior,
            bracket_angle: 0.,
            max_shrinks: 10_000,
        })
    }

    /// Restrict the initial angle bracket to a width of `angle`; zero means
    /// the whole ellipse.
    pub fn with_bracket_angle(mut self, angle: f64) -> Result<EllipticalSliceOperator> {
        if !(0. ..=2. * PI).contains(&angle) {
            return Err(McmcError::Misconfigured(format!(
                "bracket angle must lie in [0, 2pi], got {angle}"
            )));
        }
        self.bracket_angle = angle;
        Ok(self)
    }

    fn non_gaussian_part(&self, graph: &mut ModelGraph) -> Result<f64> {
        Ok(graph.evaluate(self.posterior)? - graph.log_likelihood(self.gp)?)
    }
}

impl Operator for EllipticalSliceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_gibbs(&self) -> bool {
        true
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let current = graph.parameter(self.parameter).values().to_vec();
        let mean = self.prior.mean();
        let cutoff = self.non_gaussian_part(graph)? + rng.random::<f64>().ln();
        let nu = self.prior.sample_centered(rng);

        let (mut phi, mut phi_min, mut phi_max) = if self.bracket_angle == 0. {
            let phi = rng.random::<f64>() * 2. * PI;
            (phi, phi - 2. * PI, phi)
        } else {
            let phi_min = -self.bracket_angle * rng.random::<f64>();
            let phi_max = phi_min + self.bracket_angle;
            (rng.random_range(phi_min..phi_max), phi_min, phi_max)
        };

        let mut proposal = vec![0.; current.len()];
        for _ in 0..self.max_shrinks {
            let (sin, cos) = phi.sin_cos();
            for (k, value) in proposal.iter_mut().enumerate() {
                *value = (current[k] - mean[k]) * cos + nu[k] * sin + mean[k];
            }
            graph.set_values(self.parameter, &proposal)?;
            if self.non_gaussian_part(graph)? > cutoff {
                return Ok(Proposal::Gibbs);
            }
            if phi > 0. {
                phi_max = phi;
            } else {
                phi_min = phi;
            }
            phi = phi_min + rng.random::<f64>() * (phi_max - phi_min);
        }
        log::warn!("{}: slice did not shrink onto an acceptable point", self.name);
        Ok(Proposal::Failed)
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::{EllipticalSliceOperator, NormalMeanGibbsOperator, NormalPrecisionGibbsOperator};
    use crate::{
        distribution::Distribution,
        error::McmcError,
        graph::ModelGraph,
        likelihood::{
            CompoundLikelihood, DistributionLikelihood, MultivariateNormalLikelihood,
            NormalLikelihood,
        },
        model::{Dependency, ModelId},
        operators::{Operator, Proposal},
        parameter::{Bounds, Parameter},
    };

    const DATA: [f64; 5] = [0.8, 1.6, 1.1, 0.4, 1.9];

    fn conjugate() -> (ModelGraph, [ModelId; 4]) {
        let mut graph = ModelGraph::new();
        let mean = graph.add_parameter(Parameter::scalar("mean", 0.)).unwrap();
        let precision = graph
            .add_parameter(Parameter::scalar("precision", 2.).with_bounds(Bounds::POSITIVE))
            .unwrap();
        let data = graph
            .add_model(NormalLikelihood::new("data", DATA.to_vec(), mean, precision))
            .unwrap();
        let mean_prior = graph
            .add_model(DistributionLikelihood::new(
                "meanPrior",
                mean,
                Distribution::Normal { mean: 0., sd: 1. },
            ))
            .unwrap();
        let precision_prior = graph
            .add_model(DistributionLikelihood::new(
                "precisionPrior",
                precision,
                Distribution::Gamma { shape: 2., rate: 1. },
            ))
            .unwrap();
        let posterior = graph
            .add_model(CompoundLikelihood::new(
                "posterior",
                vec![data, mean_prior, precision_prior],
            ))
            .unwrap();
        (graph, [data, mean_prior, precision_prior, posterior])
    }

    #[test]
    fn mean_draws_match_conditional() {
        let (mut graph, [data, mean_prior, _, _]) = conjugate();
        let mut op = NormalMeanGibbsOperator::new(&graph, data, mean_prior).unwrap();
        let mean = graph.parameter_by_name("mean").unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(10);
        let n = 20_000;
        let mut draws = Vec::with_capacity(n);
        for _ in 0..n {
            assert_eq!(op.propose(&mut graph, &mut rng).unwrap(), Proposal::Gibbs);
            draws.push(graph.parameter(mean).value(0));
        }
        let precision = 1. + 5. * 2.;
        let expected = 2. * DATA.iter().sum::<f64>() / precision;
        let sample_mean = draws.iter().sum::<f64>() / n as f64;
        let sample_var = draws.iter().map(|d| (d - sample_mean).powi(2)).sum::<f64>() / n as f64;
        assert_abs_diff_eq!(sample_mean, expected, epsilon = 0.01);
        assert_abs_diff_eq!(sample_var, 1. / precision, epsilon = 0.005);
    }

    #[test]
    fn precision_draws_match_conditional() {
        let (mut graph, [data, _, precision_prior, _]) = conjugate();
        let mut op = NormalPrecisionGibbsOperator::new(&graph, data, precision_prior).unwrap();
        let precision = graph.parameter_by_name("precision").unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let n = 20_000;
        let total: f64 = (0..n)
            .map(|_| {
                op.propose(&mut graph, &mut rng).unwrap();
                graph.parameter(precision).value(0)
            })
            .sum();
        let shape = 2. + 2.5;
        let rate = 1. + 0.5 * DATA.iter().map(|x| x * x).sum::<f64>();
        assert_abs_diff_eq!(total / n as f64, shape / rate, epsilon = 0.02);
    }

    #[test]
    fn rejects_foreign_readers() {
        let (mut graph, [data, mean_prior, precision_prior, _]) = conjugate();
        assert!(matches!(
            NormalMeanGibbsOperator::new(&graph, data, precision_prior),
            Err(McmcError::Misconfigured(_))
        ));
        let mean = graph.parameter_by_name("mean").unwrap();
        let other = graph
            .add_model(DistributionLikelihood::new(
                "other",
                mean,
                Distribution::Normal { mean: 0., sd: 2. },
            ))
            .unwrap();
        assert!(graph.listeners(Dependency::Parameter(mean)).contains(&other));
        assert!(matches!(
            NormalMeanGibbsOperator::new(&graph, data, mean_prior),
            Err(McmcError::Misconfigured(_))
        ));
    }

    #[test]
    fn elliptical_slice_conjugate_normal() {
        // x ~ N(1, 1) a priori, one observation y = 3 with unit precision:
        // the posterior is N(2, 1/2).
        let mut graph = ModelGraph::new();
        let x = graph.add_parameter(Parameter::scalar("x", 0.)).unwrap();
        let precision = graph.add_parameter(Parameter::scalar("precision", 1.)).unwrap();
        let gp = graph
            .add_model(MultivariateNormalLikelihood::new("gp", x, vec![1.], &[vec![1.]]).unwrap())
            .unwrap();
        let data = graph
            .add_model(NormalLikelihood::new("y", vec![3.], x, precision))
            .unwrap();
        let posterior = graph
            .add_model(CompoundLikelihood::new("posterior", vec![gp, data]))
            .unwrap();
        let mut op = EllipticalSliceOperator::new(&graph, gp, posterior).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(12);
        let n = 40_000;
        let mut sum = 0.;
        let mut sum_sq = 0.;
        for _ in 0..n {
            graph.store().unwrap();
            assert_eq!(op.propose(&mut graph, &mut rng).unwrap(), Proposal::Gibbs);
            graph.accept().unwrap();
            let value = graph.parameter(x).value(0);
            sum += value;
            sum_sq += value * value;
        }
        let mean = sum / n as f64;
        let var = sum_sq / n as f64 - mean * mean;
        assert_abs_diff_eq!(mean, 2., epsilon = 0.03);
        assert_abs_diff_eq!(var, 0.5, epsilon = 0.03);

        assert!(EllipticalSliceOperator::new(&graph, data, posterior).is_err());
        assert!(op.clone().with_bracket_angle(7.).is_err());
    }
}
