use rand::{Rng, RngCore};
use rand_distr::Distribution as _;
use serde::{Deserialize, Serialize};
use statrs::distribution::Continuous;

use crate::{
    error::{McmcError, Result},
    parameter::Bounds,
};

/// Univariate densities used as priors.
///
/// Densities come from `statrs`, draws from `rand_distr`. Gamma is
/// parametrized by shape and rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Distribution {
    Normal { mean: f64, sd: f64 },
    Gamma { shape: f64, rate: f64 },
    Exponential { rate: f64 },
    Uniform { lower: f64, upper: f64 },
    LogNormal { mu: f64, sigma: f64 },
}

impl Distribution {
    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            Distribution::Normal { mean, sd } => mean.is_finite() && sd > 0. && sd.is_finite(),
            Distribution::Gamma { shape, rate } => {
                shape > 0. && rate > 0. && shape.is_finite() && rate.is_finite()
            }
            Distribution::Exponential { rate } => rate > 0. && rate.is_finite(),
            Distribution::Uniform { lower, upper } => {
                lower.is_finite() && upper.is_finite() && lower < upper
            }
            Distribution::LogNormal { mu, sigma } => {
                mu.is_finite() && sigma > 0. && sigma.is_finite()
            }
        };
        if !ok {
            return Err(McmcError::Misconfigured(format!(
                "invalid distribution {self:?}"
            )));
        }
        Ok(())
    }

    pub fn support(&self) -> Bounds {
        match *self {
            Distribution::Normal { .. } => Bounds::UNBOUNDED,
            Distribution::Gamma { .. }
            | Distribution::Exponential { .. }
            | Distribution::LogNormal { .. } => Bounds::POSITIVE,
            Distribution::Uniform { lower, upper } => Bounds { lower, upper },
        }
    }

    pub fn mean(&self) -> f64 {
        match *self {
            Distribution::Normal { mean, .. } => mean,
            Distribution::Gamma { shape, rate } => shape / rate,
            Distribution::Exponential { rate } => 1. / rate,
            Distribution::Uniform { lower, upper } => 0.5 * (lower + upper),
            Distribution::LogNormal { mu, sigma } => (mu + 0.5 * sigma * sigma).exp(),
        }
    }

    /// Log density at `x`, `-inf` outside the support.
    pub fn ln_pdf(&self, x: f64) -> f64 {
        if x.is_nan() {
            return f64::NAN;
        }
        if !self.support().contains(x) {
            return f64::NEG_INFINITY;
        }
        let density = match *self {
            Distribution::Normal { mean, sd } => {
                statrs::distribution::Normal::new(mean, sd).map(|d| d.ln_pdf(x))
            }
            Distribution::Gamma { shape, rate } => {
                statrs::distribution::Gamma::new(shape, rate).map(|d| d.ln_pdf(x))
            }
            Distribution::Exponential { rate } => {
                statrs::distribution::Exp::new(rate).map(|d| d.ln_pdf(x))
            }
            Distribution::Uniform { lower, upper } => {
                statrs::distribution::Uniform::new(lower, upper).map(|d| d.ln_pdf(x))
            }
            Distribution::LogNormal { mu, sigma } => {
                statrs::distribution::LogNormal::new(mu, sigma).map(|d| d.ln_pdf(x))
            }
        };
        density.unwrap_or(f64::NAN)
    }

    pub fn sample(&self, rng: &mut dyn RngCore) -> Result<f64> {
        let draw = match *self {
            Distribution::Normal { mean, sd } => rand_distr::Normal::new(mean, sd)
                .map_err(|_| self.unsampleable())?
                .sample(rng),
            Distribution::Gamma { shape, rate } => rand_distr::Gamma::new(shape, 1. / rate)
                .map_err(|_| self.unsampleable())?
                .sample(rng),
            Distribution::Exponential { rate } => rand_distr::Exp::new(rate)
                .map_err(|_| self.unsampleable())?
                .sample(rng),
            Distribution::Uniform { lower, upper } => {
                self.validate()?;
                rng.random_range(lower..upper)
            }
            Distribution::LogNormal { mu, sigma } => rand_distr::LogNormal::new(mu, sigma)
                .map_err(|_| self.unsampleable())?
                .sample(rng),
        };
        Ok(draw)
    }

    fn unsampleable(&self) -> McmcError {
        McmcError::Misconfigured(format!("cannot sample from {self:?}"))
    }
}
