//! Gauss-Hermite quadrature rules.
//!
//! Nodes and weights for the physicist's rule (weight `exp(-x^2)`) are
//! computed with the Golub-Welsch algorithm: the nodes are the eigenvalues of
//! the symmetric tridiagonal Jacobi matrix of the Hermite recurrence
//! (zero diagonal, off-diagonal `sqrt(i/2)`), and each weight is
//! `sqrt(pi)` times the squared first component of the matching eigenvector.
//!
//! Multi-dimensional rules are tensor products; the per-dimension order is
//! reduced automatically as the random-effects dimension grows so the node
//! count stays within a configured budget.

use nalgebra::DMatrix;

/// A one-dimensional Gauss-Hermite rule.
#[derive(Debug, Clone)]
pub struct GaussHermite {
    /// Nodes, ascending.
    pub nodes: Vec<f64>,
    /// Weights (sum to sqrt(pi)).
    pub weights: Vec<f64>,
}

/// Compute the order-`order` physicist's Gauss-Hermite rule.
pub fn gauss_hermite(order: usize) -> GaussHermite {
    assert!(order >= 1, "quadrature order must be at least 1");
    if order == 1 {
        return GaussHermite {
            nodes: vec![0.0],
            weights: vec![std::f64::consts::PI.sqrt()],
        };
    }

    let mut jacobi = DMatrix::zeros(order, order);
    for i in 1..order {
        let off = (i as f64 / 2.0).sqrt();
        jacobi[(i - 1, i)] = off;
        jacobi[(i, i - 1)] = off;
    }

    let eigen = nalgebra::SymmetricEigen::new(jacobi);
    let mu0 = std::f64::consts::PI.sqrt();

    let mut pairs: Vec<(f64, f64)> = (0..order)
        .map(|i| {
            let v0 = eigen.eigenvectors[(0, i)];
            (eigen.eigenvalues[i], mu0 * v0 * v0)
        })
        .collect();
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

    GaussHermite {
        nodes: pairs.iter().map(|p| p.0).collect(),
        weights: pairs.iter().map(|p| p.1).collect(),
    }
}

/// Reduce the per-dimension order so the tensor-product node count
/// `order^q` stays within `budget`. Never drops below 3 (or the requested
/// order when that is already smaller).
pub fn effective_order(requested: usize, q: usize, budget: usize) -> usize {
    let floor = requested.min(3).max(1);
    let mut order = requested.max(1);
    while order > floor && (order as f64).powi(q as i32) > budget as f64 {
        order -= 1;
    }
    order
}

/// Iterator over the multi-indices of a `q`-dimensional tensor product of an
/// order-`m` rule.
pub struct MultiIndex {
    order: usize,
    idx: Vec<usize>,
    done: bool,
}

impl MultiIndex {
    pub fn new(order: usize, q: usize) -> Self {
        Self {
            order,
            idx: vec![0; q],
            done: order == 0 || q == 0,
        }
    }
}

impl Iterator for MultiIndex {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }
        let current = self.idx.clone();
        // Odometer increment.
        let mut d = 0;
        loop {
            if d == self.idx.len() {
                self.done = true;
                break;
            }
            self.idx[d] += 1;
            if self.idx[d] < self.order {
                break;
            }
            self.idx[d] = 0;
            d += 1;
        }
        Some(current)
    }
}
