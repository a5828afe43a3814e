use rand::{Rng, RngCore};

/// Result of an acceptance test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acceptance {
    pub accept: bool,
    /// Log of the acceptance probability, used for coercion. Never NaN.
    pub log_alpha: f64,
}

/// Decides whether a proposed state replaces the current one.
pub trait Acceptor: Send {
    fn accept(
        &mut self,
        old_score: f64,
        new_score: f64,
        log_hastings_ratio: f64,
        rng: &mut dyn RngCore,
    ) -> Acceptance;
}

/// The Metropolis-Hastings rule `ln u < new - old + ln h`.
///
/// A state of zero density is never entered, and always left for a state
/// of positive density.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetropolisHastings;

impl Acceptor for MetropolisHastings {
    fn accept(
        &mut self,
        old_score: f64,
        new_score: f64,
        log_hastings_ratio: f64,
        rng: &mut dyn RngCore,
    ) -> Acceptance {
        if new_score == f64::NEG_INFINITY {
            return Acceptance {
                accept: false,
                log_alpha: f64::NEG_INFINITY,
            };
        }
        if old_score == f64::NEG_INFINITY {
            return Acceptance {
                accept: true,
                log_alpha: 0.,
            };
        }
        let log_ratio = new_score - old_score + log_hastings_ratio;
        let accept = rng.random::<f64>().ln() < log_ratio;
        let log_alpha = if log_ratio.is_nan() {
            f64::NEG_INFINITY
        } else {
            log_ratio.min(0.)
        };
        Acceptance { accept, log_alpha }
    }
}
