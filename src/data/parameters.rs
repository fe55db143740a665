//! The model parameter vector and its unconstrained reparameterization.
//!
//! The optimizer works on a flat unconstrained vector. Covariance matrices
//! are carried as the lower triangle of their Cholesky factor with the
//! diagonal on the log scale, so any real-valued vector maps to a valid
//! positive-definite matrix; dispersions are carried on the log scale, so
//! they are positive by construction.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{GlmmError, Result};

/// Block sizes of the parameter vector; fixed for the lifetime of one fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamLayout {
    /// Fixed-effects coefficients.
    pub p: usize,
    /// Random-effects dimension.
    pub q: usize,
    /// Dispersion parameters.
    pub n_phis: usize,
    /// Zero-part fixed-effects coefficients (0 when absent).
    pub p_zi: usize,
    /// Zero-part random-effects dimension (0 when absent).
    pub q_zi: usize,
}

impl ParamLayout {
    pub fn n_theta(&self) -> usize {
        self.q * (self.q + 1) / 2
    }

    pub fn n_theta_zi(&self) -> usize {
        self.q_zi * (self.q_zi + 1) / 2
    }

    pub fn offset_theta(&self) -> usize {
        self.p
    }

    pub fn offset_phis(&self) -> usize {
        self.p + self.n_theta()
    }

    pub fn offset_gamma(&self) -> usize {
        self.offset_phis() + self.n_phis
    }

    pub fn offset_theta_zi(&self) -> usize {
        self.offset_gamma() + self.p_zi
    }

    pub fn total(&self) -> usize {
        self.offset_theta_zi() + self.n_theta_zi()
    }
}

/// Model parameters in structured form.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterVector {
    pub beta: DVector<f64>,
    /// Lower triangle of the random-effects Cholesky factor, row-major,
    /// diagonal entries on the log scale.
    pub theta: Vec<f64>,
    /// Dispersions on the log scale.
    pub log_phis: Vec<f64>,
    pub gamma: Option<DVector<f64>>,
    pub theta_zi: Option<Vec<f64>>,
    layout: ParamLayout,
}

/// Build the Cholesky factor from an unconstrained lower-triangle vector.
fn factor_from_theta(theta: &[f64], q: usize) -> DMatrix<f64> {
    let mut l = DMatrix::zeros(q, q);
    let mut k = 0;
    for i in 0..q {
        for j in 0..=i {
            l[(i, j)] = if i == j { theta[k].exp() } else { theta[k] };
            k += 1;
        }
    }
    l
}

/// Invert [`factor_from_theta`]: recover theta from a covariance matrix.
fn theta_from_covariance(d: &DMatrix<f64>) -> Result<Vec<f64>> {
    let chol = nalgebra::Cholesky::new(d.clone()).ok_or_else(|| {
        GlmmError::InvalidParameter("covariance matrix is not positive-definite".to_string())
    })?;
    let l = chol.l();
    let q = d.nrows();
    let mut theta = Vec::with_capacity(q * (q + 1) / 2);
    for i in 0..q {
        for j in 0..=i {
            theta.push(if i == j { l[(i, j)].ln() } else { l[(i, j)] });
        }
    }
    Ok(theta)
}

impl ParameterVector {
    /// Neutral starting values: zero coefficients, unit dispersions, and a
    /// random-effects standard deviation of 0.5 per dimension.
    pub fn init(layout: ParamLayout) -> Self {
        let diag_init = 0.5f64.ln();
        let mut theta = vec![0.0; layout.n_theta()];
        let mut k = 0;
        for i in 0..layout.q {
            for j in 0..=i {
                if i == j {
                    theta[k] = diag_init;
                }
                k += 1;
            }
        }
        let theta_zi = (layout.q_zi > 0).then(|| {
            let mut t = vec![0.0; layout.n_theta_zi()];
            let mut k = 0;
            for i in 0..layout.q_zi {
                for j in 0..=i {
                    if i == j {
                        t[k] = diag_init;
                    }
                    k += 1;
                }
            }
            t
        });
        Self {
            beta: DVector::zeros(layout.p),
            theta,
            log_phis: vec![0.0; layout.n_phis],
            gamma: (layout.p_zi > 0).then(|| DVector::zeros(layout.p_zi)),
            theta_zi,
            layout,
        }
    }

    pub fn layout(&self) -> ParamLayout {
        self.layout
    }

    /// Dispersions on the natural (positive) scale.
    pub fn phis(&self) -> Vec<f64> {
        self.log_phis.iter().map(|p| p.exp()).collect()
    }

    /// Cholesky factor of the random-effects covariance.
    pub fn cholesky_factor(&self) -> DMatrix<f64> {
        factor_from_theta(&self.theta, self.layout.q)
    }

    /// Random-effects covariance `D = L L^T`, positive-definite by
    /// construction.
    pub fn covariance(&self) -> DMatrix<f64> {
        let l = self.cholesky_factor();
        &l * l.transpose()
    }

    pub fn cholesky_factor_zi(&self) -> Option<DMatrix<f64>> {
        self.theta_zi
            .as_ref()
            .map(|t| factor_from_theta(t, self.layout.q_zi))
    }

    pub fn covariance_zi(&self) -> Option<DMatrix<f64>> {
        self.cholesky_factor_zi().map(|l| &l * l.transpose())
    }

    /// Replace the covariance block, transforming to the unconstrained scale.
    pub fn set_covariance(&mut self, d: &DMatrix<f64>) -> Result<()> {
        if d.nrows() != self.layout.q || d.ncols() != self.layout.q {
            return Err(GlmmError::DimensionMismatch {
                expected: self.layout.q,
                actual: d.nrows(),
            });
        }
        self.theta = theta_from_covariance(d)?;
        Ok(())
    }

    pub fn set_covariance_zi(&mut self, d: &DMatrix<f64>) -> Result<()> {
        if d.nrows() != self.layout.q_zi {
            return Err(GlmmError::DimensionMismatch {
                expected: self.layout.q_zi,
                actual: d.nrows(),
            });
        }
        self.theta_zi = Some(theta_from_covariance(d)?);
        Ok(())
    }

    /// Flatten into the optimizer's unconstrained vector.
    pub fn pack(&self) -> DVector<f64> {
        let mut flat = Vec::with_capacity(self.layout.total());
        flat.extend(self.beta.iter());
        flat.extend(&self.theta);
        flat.extend(&self.log_phis);
        if let Some(ref g) = self.gamma {
            flat.extend(g.iter());
        }
        if let Some(ref t) = self.theta_zi {
            flat.extend(t);
        }
        DVector::from_vec(flat)
    }

    /// Rebuild from a flat unconstrained vector. The vector length must
    /// match the layout exactly.
    pub fn unpack(layout: ParamLayout, flat: &DVector<f64>) -> Result<Self> {
        if flat.len() != layout.total() {
            return Err(GlmmError::DimensionMismatch {
                expected: layout.total(),
                actual: flat.len(),
            });
        }
        let s = flat.as_slice();
        let beta = DVector::from_column_slice(&s[..layout.p]);
        let theta = s[layout.offset_theta()..layout.offset_phis()].to_vec();
        let log_phis = s[layout.offset_phis()..layout.offset_gamma()].to_vec();
        let gamma = (layout.p_zi > 0)
            .then(|| DVector::from_column_slice(&s[layout.offset_gamma()..layout.offset_theta_zi()]));
        let theta_zi = (layout.q_zi > 0).then(|| s[layout.offset_theta_zi()..layout.total()].to_vec());
        Ok(Self {
            beta,
            theta,
            log_phis,
            gamma,
            theta_zi,
            layout,
        })
    }
}
