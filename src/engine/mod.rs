//! Numerical core: quadrature rules, conditional-mode search, per-cluster
//! integration, the marginal likelihood objective, and the outer optimizer.

pub mod integrator;
pub mod likelihood;
pub mod mode;
pub mod optimizer;
pub mod quadrature;

pub use likelihood::FitWarnings;
pub use mode::{ModeStatus, RandomEffectsMode};
pub use quadrature::{effective_order, gauss_hermite, GaussHermite};
