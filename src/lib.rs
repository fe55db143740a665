//! Adaptive Gauss-Hermite Maximum Likelihood for GLMMs
//!
//! This library fits generalized linear mixed models by maximizing the
//! marginal likelihood with adaptive Gauss-Hermite quadrature: each
//! cluster's random-effects integral is centered at its conditional mode and
//! scaled by the local curvature before the tensor-product rule is applied.
//!
//! # Overview
//!
//! The library is organized into composable modules:
//!
//! - **data**: Core data structures (MixedModelData, Cluster, ParameterVector)
//! - **family**: Response distributions (Poisson, Bernoulli, Binomial,
//!   NegBinomial, zero-inflated and hurdle composites, custom families)
//! - **engine**: Numerical core (quadrature, mode search, per-cluster
//!   integration, marginal likelihood, BFGS)
//! - **fit**: The end-to-end maximum-likelihood fit
//! - **inference**: Standard errors and likelihood-ratio tests
//! - **simulate**: Seeded posterior response simulation
//!
//! # Example
//!
//! ```no_run
//! use adaptive_glmm::prelude::*;
//! use nalgebra::{DMatrix, DVector};
//! use std::sync::Arc;
//!
//! let y = DVector::from_vec(vec![3.0, 1.0, 0.0, 2.0]);
//! let x = DMatrix::from_element(4, 1, 1.0);
//! let z = DMatrix::from_element(4, 1, 1.0);
//! let group = vec!["a".into(), "a".into(), "b".into(), "b".into()];
//!
//! let data = MixedModelData::new(y, x, group, z).unwrap();
//! let family = FamilySpec::new(Arc::new(Poisson)).unwrap();
//! let fit = fit_glmm(&data, &family, &GlmmControl::default()).unwrap();
//! println!("log-likelihood: {}", fit.log_likelihood);
//! ```

pub mod data;
pub mod engine;
pub mod error;
pub mod family;
pub mod fit;
pub mod inference;
pub mod rng;
pub mod simulate;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::data::{Cluster, MixedModelData, ParamLayout, ParameterVector};
    pub use crate::engine::{
        effective_order, gauss_hermite, FitWarnings, GaussHermite, ModeStatus, RandomEffectsMode,
    };
    pub use crate::error::{GlmmError, Result};
    pub use crate::family::{
        Bernoulli, Binomial, CustomFamily, CustomFamilyBuilder, Family, FamilySpec, Hurdle, Link,
        NegBinomial, Poisson, ScoreMode, ZeroInflated, DEFAULT_FD_STEP,
    };
    pub use crate::fit::{fit_glmm, FittedKind, GlmmControl, MixedModelFit};
    pub use crate::inference::{lrt, LrtResult};
    pub use crate::rng::Rng;
    pub use crate::simulate::{simulate, SimulateKind};
}
