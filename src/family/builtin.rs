//! Built-in response families: Bernoulli, binomial, Poisson, negative binomial.

use statrs::function::gamma::{digamma, ln_gamma};

use crate::family::link::{softplus, Link};
use crate::family::spec::Family;
use crate::rng::Rng;

/// Bernoulli response with logit link.
#[derive(Debug, Clone, Copy)]
pub struct Bernoulli;

impl Family for Bernoulli {
    fn name(&self) -> &str {
        "bernoulli"
    }

    fn link(&self) -> Link {
        Link::Logit
    }

    fn log_dens(&self, y: f64, eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> f64 {
        y * eta - softplus(eta)
    }

    fn score_eta(&self, y: f64, eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> Option<f64> {
        Some(y - Link::Logit.linkinv(eta))
    }

    fn sample(&self, rng: &mut Rng, eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> Option<f64> {
        Some(rng.next_bernoulli(Link::Logit.linkinv(eta)))
    }
}

/// Binomial response (number of successes out of a fixed trial count) with
/// logit link.
#[derive(Debug, Clone, Copy)]
pub struct Binomial {
    pub trials: u64,
}

impl Family for Binomial {
    fn name(&self) -> &str {
        "binomial"
    }

    fn link(&self) -> Link {
        Link::Logit
    }

    fn log_dens(&self, y: f64, eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> f64 {
        let n = self.trials as f64;
        let log_choose = ln_gamma(n + 1.0) - ln_gamma(y + 1.0) - ln_gamma(n - y + 1.0);
        log_choose + y * eta - n * softplus(eta)
    }

    fn score_eta(&self, y: f64, eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> Option<f64> {
        Some(y - self.trials as f64 * Link::Logit.linkinv(eta))
    }

    fn conditional_mean(&self, eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> f64 {
        self.trials as f64 * Link::Logit.linkinv(eta)
    }

    fn sample(&self, rng: &mut Rng, eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> Option<f64> {
        Some(rng.next_binomial(self.trials, Link::Logit.linkinv(eta)) as f64)
    }
}

/// Poisson response with log link.
#[derive(Debug, Clone, Copy)]
pub struct Poisson;

impl Family for Poisson {
    fn name(&self) -> &str {
        "poisson"
    }

    fn link(&self) -> Link {
        Link::Log
    }

    fn log_dens(&self, y: f64, eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> f64 {
        let mu = eta.min(700.0).exp();
        y * eta - mu - ln_gamma(y + 1.0)
    }

    fn score_eta(&self, y: f64, eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> Option<f64> {
        Some(y - Link::Log.linkinv(eta))
    }

    fn sample(&self, rng: &mut Rng, eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> Option<f64> {
        Some(rng.next_poisson(Link::Log.linkinv(eta)) as f64)
    }
}

/// Negative binomial response with log link and one dispersion parameter
/// `theta` (size), so `Var(Y) = mu + mu^2 / theta`. The dispersion is carried
/// on the log scale in the parameter vector; `phis` arrives here already
/// exponentiated.
#[derive(Debug, Clone, Copy)]
pub struct NegBinomial;

impl NegBinomial {
    fn log_pmf(y: f64, mu: f64, theta: f64) -> f64 {
        ln_gamma(y + theta) - ln_gamma(theta) - ln_gamma(y + 1.0)
            + theta * (theta / (theta + mu)).ln()
            + y * (mu / (theta + mu)).max(1e-300).ln()
    }
}

impl Family for NegBinomial {
    fn name(&self) -> &str {
        "negative binomial"
    }

    fn link(&self) -> Link {
        Link::Log
    }

    fn n_dispersion(&self) -> usize {
        1
    }

    fn log_dens(&self, y: f64, eta: f64, phis: &[f64], _eta_zi: Option<f64>) -> f64 {
        let mu = eta.min(700.0).exp();
        Self::log_pmf(y, mu, phis[0])
    }

    fn score_eta(&self, y: f64, eta: f64, phis: &[f64], _eta_zi: Option<f64>) -> Option<f64> {
        let mu = eta.min(700.0).exp();
        let theta = phis[0];
        Some(y - (y + theta) * mu / (theta + mu))
    }

    fn score_phis(&self, y: f64, eta: f64, phis: &[f64], _eta_zi: Option<f64>) -> Option<Vec<f64>> {
        let mu = eta.min(700.0).exp();
        let theta = phis[0];
        let s = digamma(y + theta) - digamma(theta) + (theta / (theta + mu)).ln() + 1.0
            - (y + theta) / (theta + mu);
        Some(vec![s])
    }

    fn sample(&self, rng: &mut Rng, eta: f64, phis: &[f64], _eta_zi: Option<f64>) -> Option<f64> {
        Some(rng.next_negbin(Link::Log.linkinv(eta), phis[0]) as f64)
    }
}
