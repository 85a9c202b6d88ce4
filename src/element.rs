//! Element and constitutive collaborator interfaces.
//!
//! The elemental physics (strain measures, stress laws, residuals) lives
//! outside this crate; the estimators and functionals only reach it through
//! the callbacks below.
use crate::{Param, Vert3d};

/// Element collaborator: energy and localized-error callbacks
pub trait Element {
    fn num_nodes(&self) -> usize;

    /// Kinetic and potential energy of the element for the given state
    fn compute_energies(&self, time: f64, xpts: &[Vert3d], vars: &[f64], dvars: &[f64])
    -> (f64, f64);

    /// Accumulate the nodal localized error estimate, the adjoint-weighted
    /// element residual distributed over the element nodes
    fn add_localized_error(
        &self,
        time: f64,
        err: &mut [f64],
        adjoint: &[f64],
        xpts: &[Vert3d],
        vars: &[f64],
    );

    /// Constitutive model bound to this element, if any
    fn constitutive(&self) -> Option<&dyn Constitutive> {
        None
    }
}

/// Constitutive collaborator: pointwise failure criterion and sensitivities
pub trait Constitutive {
    /// Scalar failure value at a parametric point for the given strain
    fn failure(&self, pt: &Param<3>, strain: &[f64; 6]) -> f64;

    /// Gradient of the failure value with respect to the strain
    fn failure_strain_sens(&self, pt: &Param<3>, strain: &[f64; 6], dfde: &mut [f64; 6]);

    /// Scale-accumulate the design-variable sensitivity of the failure value
    fn add_failure_dv_sens(&self, pt: &Param<3>, strain: &[f64; 6], alpha: f64, dfdx: &mut [f64]);
}
