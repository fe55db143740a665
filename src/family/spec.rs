//! The family contract and its validated, capability-resolved wrapper.
//!
//! A [`Family`] implementation describes a response distribution: its link,
//! per-observation log-density, and (optionally) analytic score functions.
//! [`FamilySpec`] wraps an implementation once, at construction time, and
//! resolves each optional capability into a tagged choice — analytic score
//! or centered finite difference — so the integrator never has to care which
//! one it is running against.

use std::sync::Arc;

use crate::error::{GlmmError, Result};
use crate::family::link::Link;
use crate::rng::Rng;

/// Default centered-difference step for approximated scores.
pub const DEFAULT_FD_STEP: f64 = 1e-6;

/// A response distribution pluggable into the marginal-likelihood engine.
///
/// Implementations must supply the link and `log_dens`; the score functions
/// are optional and default to "absent" (`None`), in which case the engine
/// substitutes centered finite differences of `log_dens`.
pub trait Family: Send + Sync {
    /// Family name, used in fit summaries and error messages.
    fn name(&self) -> &str;

    /// Link between the linear predictor and the conditional mean.
    fn link(&self) -> Link;

    /// Number of dispersion parameters (`phis`, natural scale, positive).
    fn n_dispersion(&self) -> usize {
        0
    }

    /// Whether this family consumes a secondary zero-part linear predictor.
    fn has_zero_part(&self) -> bool {
        false
    }

    /// Per-observation log-density at linear predictor `eta`. The conditional
    /// mean is obtained through the family's link. `eta_zi` carries the
    /// zero-part predictor for zero-inflated and hurdle composites and is
    /// `None` for ordinary families.
    fn log_dens(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> f64;

    /// Analytic d log_dens / d eta, if available.
    fn score_eta(&self, _y: f64, _eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> Option<f64> {
        None
    }

    /// Analytic d log_dens / d phis (natural scale), if available.
    fn score_phis(
        &self,
        _y: f64,
        _eta: f64,
        _phis: &[f64],
        _eta_zi: Option<f64>,
    ) -> Option<Vec<f64>> {
        None
    }

    /// Analytic d log_dens / d eta_zi, if available.
    fn score_eta_zi(&self, _y: f64, _eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> Option<f64> {
        None
    }

    /// Conditional mean of the response given the linear predictor(s).
    /// Composites override this to account for the zero process.
    fn conditional_mean(&self, eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> f64 {
        self.link().linkinv(eta)
    }

    /// Draw one response under the family's own simulation law. `None` marks
    /// a family that cannot simulate (a usage error when the posterior
    /// simulator is asked to use it).
    fn sample(&self, _rng: &mut Rng, _eta: f64, _phis: &[f64], _eta_zi: Option<f64>) -> Option<f64> {
        None
    }
}

/// Tagged capability resolution for an optional score function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreMode {
    /// The family supplied an analytic score.
    Analytic,
    /// Centered finite differences of `log_dens` with the configured step.
    CenteredDifference,
}

/// An immutable, validated family configuration.
///
/// Built once from a [`Family`] implementation; construction probes the
/// log-density for finiteness and resolves every optional score capability.
/// Cloning is cheap (the implementation is shared behind an `Arc`).
#[derive(Clone)]
pub struct FamilySpec {
    family: Arc<dyn Family>,
    score_eta: ScoreMode,
    score_phis: ScoreMode,
    score_eta_zi: ScoreMode,
    fd_step: f64,
}

impl FamilySpec {
    /// Validate and wrap a family, resolving score capabilities.
    pub fn new(family: Arc<dyn Family>) -> Result<Self> {
        Self::with_fd_step(family, DEFAULT_FD_STEP)
    }

    /// Like [`FamilySpec::new`] with an explicit finite-difference step.
    pub fn with_fd_step(family: Arc<dyn Family>, fd_step: f64) -> Result<Self> {
        if !(fd_step > 0.0) || !fd_step.is_finite() {
            return Err(GlmmError::InvalidParameter(format!(
                "finite-difference step must be positive and finite, got {}",
                fd_step
            )));
        }

        // Probe at a neutral point on the family's support. A non-finite
        // log-density here means the contract is not satisfied.
        let phis = vec![1.0; family.n_dispersion()];
        let eta_zi = if family.has_zero_part() { Some(0.0) } else { None };
        let probe = family.log_dens(0.0, 0.0, &phis, eta_zi);
        if !probe.is_finite() {
            return Err(GlmmError::MissingCapability(format!(
                "family '{}' produced a non-finite log-density at its probe point",
                family.name()
            )));
        }

        let score_eta = match family.score_eta(0.0, 0.0, &phis, eta_zi) {
            Some(_) => ScoreMode::Analytic,
            None => ScoreMode::CenteredDifference,
        };
        let score_phis = if family.n_dispersion() == 0 {
            ScoreMode::Analytic
        } else {
            match family.score_phis(0.0, 0.0, &phis, eta_zi) {
                Some(_) => ScoreMode::Analytic,
                None => ScoreMode::CenteredDifference,
            }
        };
        let score_eta_zi = if !family.has_zero_part() {
            ScoreMode::Analytic
        } else {
            match family.score_eta_zi(0.0, 0.0, &phis, eta_zi) {
                Some(_) => ScoreMode::Analytic,
                None => ScoreMode::CenteredDifference,
            }
        };

        Ok(Self {
            family,
            score_eta,
            score_phis,
            score_eta_zi,
            fd_step,
        })
    }

    pub fn name(&self) -> &str {
        self.family.name()
    }

    pub fn link(&self) -> Link {
        self.family.link()
    }

    pub fn n_dispersion(&self) -> usize {
        self.family.n_dispersion()
    }

    pub fn has_zero_part(&self) -> bool {
        self.family.has_zero_part()
    }

    /// Resolved score mode for d/d eta (for diagnostics and tests).
    pub fn score_eta_mode(&self) -> ScoreMode {
        self.score_eta
    }

    /// Per-observation log-density.
    pub fn log_dens(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> f64 {
        self.family.log_dens(y, eta, phis, eta_zi)
    }

    /// Conditional mean of the response.
    pub fn conditional_mean(&self, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> f64 {
        self.family.conditional_mean(eta, phis, eta_zi)
    }

    /// d log_dens / d eta, analytic or centered difference.
    pub fn score_eta(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> f64 {
        match self.score_eta {
            ScoreMode::Analytic => self
                .family
                .score_eta(y, eta, phis, eta_zi)
                .unwrap_or(f64::NAN),
            ScoreMode::CenteredDifference => {
                let h = self.fd_step;
                (self.family.log_dens(y, eta + h, phis, eta_zi)
                    - self.family.log_dens(y, eta - h, phis, eta_zi))
                    / (2.0 * h)
            }
        }
    }

    /// d log_dens / d phis on the natural scale. The difference step for the
    /// approximated variant scales with the parameter magnitude so the probe
    /// stays inside the positive domain.
    pub fn score_phis(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> Vec<f64> {
        if phis.is_empty() {
            return Vec::new();
        }
        match self.score_phis {
            ScoreMode::Analytic => self
                .family
                .score_phis(y, eta, phis, eta_zi)
                .unwrap_or_else(|| vec![f64::NAN; phis.len()]),
            ScoreMode::CenteredDifference => {
                let mut out = Vec::with_capacity(phis.len());
                let mut work = phis.to_vec();
                for k in 0..phis.len() {
                    let h = self.fd_step * phis[k].abs().max(1.0);
                    work[k] = phis[k] + h;
                    let up = self.family.log_dens(y, eta, &work, eta_zi);
                    work[k] = phis[k] - h;
                    let down = self.family.log_dens(y, eta, &work, eta_zi);
                    work[k] = phis[k];
                    out.push((up - down) / (2.0 * h));
                }
                out
            }
        }
    }

    /// d log_dens / d eta_zi, analytic or centered difference.
    pub fn score_eta_zi(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> f64 {
        let Some(zi) = eta_zi else {
            return 0.0;
        };
        match self.score_eta_zi {
            ScoreMode::Analytic => self
                .family
                .score_eta_zi(y, eta, phis, eta_zi)
                .unwrap_or(f64::NAN),
            ScoreMode::CenteredDifference => {
                let h = self.fd_step;
                (self.family.log_dens(y, eta, phis, Some(zi + h))
                    - self.family.log_dens(y, eta, phis, Some(zi - h)))
                    / (2.0 * h)
            }
        }
    }

    /// Draw one response. `MissingCapability` if the family cannot simulate.
    pub fn sample(
        &self,
        rng: &mut Rng,
        eta: f64,
        phis: &[f64],
        eta_zi: Option<f64>,
    ) -> Result<f64> {
        self.family.sample(rng, eta, phis, eta_zi).ok_or_else(|| {
            GlmmError::MissingCapability(format!(
                "family '{}' does not define a simulation law",
                self.family.name()
            ))
        })
    }
}

impl std::fmt::Debug for FamilySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FamilySpec")
            .field("name", &self.family.name())
            .field("link", &self.family.link())
            .field("n_dispersion", &self.family.n_dispersion())
            .field("score_eta", &self.score_eta)
            .field("score_phis", &self.score_phis)
            .field("score_eta_zi", &self.score_eta_zi)
            .field("fd_step", &self.fd_step)
            .finish()
    }
}
