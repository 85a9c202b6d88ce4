//! Goal functionals built on the patch reconstruction: refinement error
//! estimators and differentiable aggregate constraints.
mod adjoint;
mod curvature;
mod stats;
mod strain_energy;
mod stress;

pub use adjoint::{adjoint_error_est_2d, adjoint_error_est_3d};
pub use curvature::{CurvatureConstraint, CurvatureOptions};
pub use stats::{ErrorStats, error_stats};
pub use strain_energy::{strain_energy_error_est_2d, strain_energy_error_est_3d};
pub use stress::StressConstraint;

#[cfg(test)]
pub(crate) mod test_support;
