//! Link functions mapping the linear predictor to the response mean.

use serde::{Deserialize, Serialize};

/// Link function identity for a family.
///
/// The link is part of the immutable family configuration: it is fixed when
/// the family is built and shared by the integrator, the simulator, and the
/// fitted-value computations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Link {
    /// log(mu) = eta, for count means.
    Log,
    /// logit(mu) = eta, for probabilities.
    Logit,
    /// mu = eta.
    Identity,
}

impl Link {
    /// Map a mean to the linear-predictor scale.
    pub fn linkfun(&self, mu: f64) -> f64 {
        match self {
            Link::Log => mu.max(1e-300).ln(),
            Link::Logit => {
                let m = mu.clamp(1e-10, 1.0 - 1e-10);
                (m / (1.0 - m)).ln()
            }
            Link::Identity => mu,
        }
    }

    /// Map a linear predictor to the mean scale.
    pub fn linkinv(&self, eta: f64) -> f64 {
        match self {
            Link::Log => eta.min(700.0).exp(),
            Link::Logit => {
                if eta >= 0.0 {
                    1.0 / (1.0 + (-eta).exp())
                } else {
                    let e = eta.exp();
                    e / (1.0 + e)
                }
            }
            Link::Identity => eta,
        }
    }

    /// Derivative d(mu)/d(eta) of the inverse link.
    pub fn mu_eta(&self, eta: f64) -> f64 {
        match self {
            Link::Log => eta.min(700.0).exp(),
            Link::Logit => {
                let p = self.linkinv(eta);
                p * (1.0 - p)
            }
            Link::Identity => 1.0,
        }
    }
}

/// Numerically stable log(1 + exp(x)).
pub(crate) fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}
