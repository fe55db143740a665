//! Zero-inflated and hurdle composites over a base count family.
//!
//! Both composites combine the base family with a gating Bernoulli process
//! driven by a second linear predictor `eta_zi` (logit scale, modelling the
//! zero probability). They are compositions, not subclasses: each wraps a
//! base [`Family`] value and exposes the identical interface, so the
//! integrator cannot tell a composite from an ordinary family.
//!
//! - **Zero-inflated**: a mixture. `P(0) = pi + (1-pi) f(0)`,
//!   `P(y>0) = (1-pi) f(y)`.
//! - **Hurdle**: a two-part split. `P(0) = pi`,
//!   `P(y>0) = (1-pi) f(y) / (1 - f(0))` (zero-truncated base).

use std::sync::Arc;

use crate::family::link::{softplus, Link};
use crate::family::spec::Family;
use crate::rng::Rng;

/// Numerically stable log(1 - exp(x)) for x < 0.
fn log1mexp(x: f64) -> f64 {
    if x >= 0.0 {
        f64::NEG_INFINITY
    } else if x > -std::f64::consts::LN_2 {
        (-x.exp_m1()).ln()
    } else {
        (-x.exp()).ln_1p()
    }
}

/// log(pi) and log(1 - pi) for pi = logit^{-1}(eta_zi).
fn gate_logs(eta_zi: f64) -> (f64, f64) {
    (-softplus(-eta_zi), -softplus(eta_zi))
}

fn logsumexp2(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    if m == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Zero-inflated composite of a base count family.
#[derive(Clone)]
pub struct ZeroInflated {
    base: Arc<dyn Family>,
    name: String,
}

impl ZeroInflated {
    pub fn new(base: Arc<dyn Family>) -> Self {
        let name = format!("zero-inflated {}", base.name());
        Self { base, name }
    }
}

impl Family for ZeroInflated {
    fn name(&self) -> &str {
        &self.name
    }

    fn link(&self) -> Link {
        self.base.link()
    }

    fn n_dispersion(&self) -> usize {
        self.base.n_dispersion()
    }

    fn has_zero_part(&self) -> bool {
        true
    }

    fn log_dens(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> f64 {
        // A missing zero-part predictor gates nothing: pi = 0.
        let zi = eta_zi.unwrap_or(f64::NEG_INFINITY);
        let (log_pi, log_1mpi) = gate_logs(zi);
        if y == 0.0 {
            let base0 = self.base.log_dens(0.0, eta, phis, None);
            logsumexp2(log_pi, log_1mpi + base0)
        } else {
            log_1mpi + self.base.log_dens(y, eta, phis, None)
        }
    }

    fn score_eta(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> Option<f64> {
        let zi = eta_zi.unwrap_or(f64::NEG_INFINITY);
        if y > 0.0 {
            return self.base.score_eta(y, eta, phis, None);
        }
        let s0 = self.base.score_eta(0.0, eta, phis, None)?;
        let (log_pi, log_1mpi) = gate_logs(zi);
        let base0 = self.base.log_dens(0.0, eta, phis, None);
        let log_mix = logsumexp2(log_pi, log_1mpi + base0);
        // Weight of the count component within the zero mixture.
        let w = (log_1mpi + base0 - log_mix).exp();
        Some(w * s0)
    }

    fn score_phis(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> Option<Vec<f64>> {
        let zi = eta_zi.unwrap_or(f64::NEG_INFINITY);
        if y > 0.0 {
            return self.base.score_phis(y, eta, phis, None);
        }
        let s0 = self.base.score_phis(0.0, eta, phis, None)?;
        let (log_pi, log_1mpi) = gate_logs(zi);
        let base0 = self.base.log_dens(0.0, eta, phis, None);
        let log_mix = logsumexp2(log_pi, log_1mpi + base0);
        let w = (log_1mpi + base0 - log_mix).exp();
        Some(s0.into_iter().map(|s| w * s).collect())
    }

    fn score_eta_zi(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> Option<f64> {
        let zi = eta_zi?;
        let pi = Link::Logit.linkinv(zi);
        if y > 0.0 {
            return Some(-pi);
        }
        let (log_pi, log_1mpi) = gate_logs(zi);
        let base0 = self.base.log_dens(0.0, eta, phis, None);
        let log_mix = logsumexp2(log_pi, log_1mpi + base0);
        // d/d eta_zi of log(pi + (1-pi) f0) = pi (1-pi) (1 - f0) / mixture.
        // All factors are positive, so the ratio is formed in log space;
        // forming it on the natural scale underflows to 0/0 for extreme
        // gates.
        let log_1mf0 = log1mexp(base0);
        if log_1mf0 == f64::NEG_INFINITY {
            return Some(0.0);
        }
        Some((log_pi + log_1mpi + log_1mf0 - log_mix).exp())
    }

    fn conditional_mean(&self, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> f64 {
        let pi = eta_zi.map(|z| Link::Logit.linkinv(z)).unwrap_or(0.0);
        (1.0 - pi) * self.base.conditional_mean(eta, phis, None)
    }

    fn sample(&self, rng: &mut Rng, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> Option<f64> {
        let pi = eta_zi.map(|z| Link::Logit.linkinv(z)).unwrap_or(0.0);
        if rng.next_f64() < pi {
            Some(0.0)
        } else {
            self.base.sample(rng, eta, phis, None)
        }
    }
}

/// Hurdle composite of a base count family.
#[derive(Clone)]
pub struct Hurdle {
    base: Arc<dyn Family>,
    name: String,
}

impl Hurdle {
    pub fn new(base: Arc<dyn Family>) -> Self {
        let name = format!("hurdle {}", base.name());
        Self { base, name }
    }

    fn log_trunc_norm(&self, eta: f64, phis: &[f64]) -> f64 {
        // log(1 - f(0)), the base probability of a positive outcome.
        log1mexp(self.base.log_dens(0.0, eta, phis, None))
    }
}

impl Family for Hurdle {
    fn name(&self) -> &str {
        &self.name
    }

    fn link(&self) -> Link {
        self.base.link()
    }

    fn n_dispersion(&self) -> usize {
        self.base.n_dispersion()
    }

    fn has_zero_part(&self) -> bool {
        true
    }

    fn log_dens(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> f64 {
        let zi = eta_zi.unwrap_or(f64::NEG_INFINITY);
        let (log_pi, log_1mpi) = gate_logs(zi);
        if y == 0.0 {
            log_pi
        } else {
            log_1mpi + self.base.log_dens(y, eta, phis, None) - self.log_trunc_norm(eta, phis)
        }
    }

    fn score_eta(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> Option<f64> {
        if y == 0.0 {
            return Some(0.0);
        }
        let _ = eta_zi;
        let s = self.base.score_eta(y, eta, phis, None)?;
        let s0 = self.base.score_eta(0.0, eta, phis, None)?;
        let f0 = self.base.log_dens(0.0, eta, phis, None).exp();
        Some(s + f0 * s0 / (1.0 - f0))
    }

    fn score_phis(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> Option<Vec<f64>> {
        if y == 0.0 {
            return Some(vec![0.0; self.base.n_dispersion()]);
        }
        let _ = eta_zi;
        let s = self.base.score_phis(y, eta, phis, None)?;
        let s0 = self.base.score_phis(0.0, eta, phis, None)?;
        let f0 = self.base.log_dens(0.0, eta, phis, None).exp();
        Some(
            s.into_iter()
                .zip(s0)
                .map(|(a, b)| a + f0 * b / (1.0 - f0))
                .collect(),
        )
    }

    fn score_eta_zi(&self, y: f64, _eta: f64, _phis: &[f64], eta_zi: Option<f64>) -> Option<f64> {
        let pi = Link::Logit.linkinv(eta_zi?);
        if y == 0.0 {
            Some(1.0 - pi)
        } else {
            Some(-pi)
        }
    }

    fn conditional_mean(&self, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> f64 {
        let pi = eta_zi.map(|z| Link::Logit.linkinv(z)).unwrap_or(0.0);
        let trunc = self.log_trunc_norm(eta, phis).exp().max(1e-300);
        (1.0 - pi) * self.base.conditional_mean(eta, phis, None) / trunc
    }

    fn sample(&self, rng: &mut Rng, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> Option<f64> {
        let pi = eta_zi.map(|z| Link::Logit.linkinv(z)).unwrap_or(0.0);
        if rng.next_f64() < pi {
            return Some(0.0);
        }
        // Rejection from the zero-truncated base.
        for _ in 0..1000 {
            let draw = self.base.sample(rng, eta, phis, None)?;
            if draw > 0.0 {
                return Some(draw);
            }
        }
        Some(1.0)
    }
}
