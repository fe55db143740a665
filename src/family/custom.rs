//! User-supplied families built from closures.
//!
//! The builder collects the pieces of the family contract and refuses to
//! build when a required capability (the log-density) is missing, so the
//! usage error surfaces at construction time rather than mid-fit.

use crate::error::{GlmmError, Result};
use crate::family::link::Link;
use crate::family::spec::Family;
use crate::rng::Rng;

type LogDensFn = Box<dyn Fn(f64, f64, &[f64], Option<f64>) -> f64 + Send + Sync>;
type ScoreEtaFn = Box<dyn Fn(f64, f64, &[f64], Option<f64>) -> f64 + Send + Sync>;
type ScorePhisFn = Box<dyn Fn(f64, f64, &[f64], Option<f64>) -> Vec<f64> + Send + Sync>;
type SampleFn = Box<dyn Fn(&mut Rng, f64, &[f64], Option<f64>) -> f64 + Send + Sync>;

/// A family assembled from user-supplied functions.
pub struct CustomFamily {
    name: String,
    link: Link,
    n_dispersion: usize,
    log_dens: LogDensFn,
    score_eta: Option<ScoreEtaFn>,
    score_phis: Option<ScorePhisFn>,
    sample: Option<SampleFn>,
}

impl Family for CustomFamily {
    fn name(&self) -> &str {
        &self.name
    }

    fn link(&self) -> Link {
        self.link
    }

    fn n_dispersion(&self) -> usize {
        self.n_dispersion
    }

    fn log_dens(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> f64 {
        (self.log_dens)(y, eta, phis, eta_zi)
    }

    fn score_eta(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> Option<f64> {
        self.score_eta.as_ref().map(|f| f(y, eta, phis, eta_zi))
    }

    fn score_phis(&self, y: f64, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> Option<Vec<f64>> {
        self.score_phis.as_ref().map(|f| f(y, eta, phis, eta_zi))
    }

    fn sample(&self, rng: &mut Rng, eta: f64, phis: &[f64], eta_zi: Option<f64>) -> Option<f64> {
        self.sample.as_ref().map(|f| f(rng, eta, phis, eta_zi))
    }
}

/// Builder for [`CustomFamily`].
pub struct CustomFamilyBuilder {
    name: String,
    link: Link,
    n_dispersion: usize,
    log_dens: Option<LogDensFn>,
    score_eta: Option<ScoreEtaFn>,
    score_phis: Option<ScorePhisFn>,
    sample: Option<SampleFn>,
}

impl CustomFamilyBuilder {
    pub fn new(name: impl Into<String>, link: Link) -> Self {
        Self {
            name: name.into(),
            link,
            n_dispersion: 0,
            log_dens: None,
            score_eta: None,
            score_phis: None,
            sample: None,
        }
    }

    /// Number of dispersion parameters the log-density expects.
    pub fn n_dispersion(mut self, n: usize) -> Self {
        self.n_dispersion = n;
        self
    }

    /// Required: per-observation log-density `(y, eta, phis, eta_zi)`.
    pub fn log_dens<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, f64, &[f64], Option<f64>) -> f64 + Send + Sync + 'static,
    {
        self.log_dens = Some(Box::new(f));
        self
    }

    /// Optional analytic d log_dens / d eta.
    pub fn score_eta<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, f64, &[f64], Option<f64>) -> f64 + Send + Sync + 'static,
    {
        self.score_eta = Some(Box::new(f));
        self
    }

    /// Optional analytic d log_dens / d phis.
    pub fn score_phis<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, f64, &[f64], Option<f64>) -> Vec<f64> + Send + Sync + 'static,
    {
        self.score_phis = Some(Box::new(f));
        self
    }

    /// Optional simulation law for the posterior simulator.
    pub fn sample<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Rng, f64, &[f64], Option<f64>) -> f64 + Send + Sync + 'static,
    {
        self.sample = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<CustomFamily> {
        let log_dens = self.log_dens.ok_or_else(|| {
            GlmmError::MissingCapability(format!(
                "custom family '{}' requires a log-density function",
                self.name
            ))
        })?;
        Ok(CustomFamily {
            name: self.name,
            link: self.link,
            n_dispersion: self.n_dispersion,
            log_dens,
            score_eta: self.score_eta,
            score_phis: self.score_phis,
            sample: self.sample,
        })
    }
}
