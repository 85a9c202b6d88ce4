//! Element and constitutive collaborators used by the functional tests.
use crate::{
    Param, Vert3d, basis,
    element::{Constitutive, Element},
    jacobian::jacobian_3d,
};

/// Scalar element whose potential energy is the Dirichlet energy
/// `1/2 int |grad u|^2` and whose localized error is the adjoint-weighted
/// Laplace residual with zero forcing
pub struct DirichletElement {
    order: usize,
    knots: Vec<f64>,
}

impl DirichletElement {
    pub fn new(order: usize) -> Self {
        Self {
            order,
            knots: basis::uniform_knots(order),
        }
    }
}

impl Element for DirichletElement {
    fn num_nodes(&self) -> usize {
        self.order * self.order * self.order
    }

    fn compute_energies(
        &self,
        _time: f64,
        xpts: &[Vert3d],
        vars: &[f64],
        _dvars: &[f64],
    ) -> (f64, f64) {
        let size = self.num_nodes();
        let (pts, wts) = basis::gauss_rule(self.order);
        let mut n = vec![0.0; size];
        let mut dn = vec![Param::<3>::zeros(); size];

        let mut pe = 0.0;
        for (kk, &gk) in pts.iter().enumerate() {
            for (jj, &gj) in pts.iter().enumerate() {
                for (ii, &gi) in pts.iter().enumerate() {
                    let pt = Param::<3>::new(gi, gj, gk);
                    basis::eval_tensor_deriv(&self.knots, &pt, &mut n, &mut dn);
                    let (_, j, detj) = jacobian_3d(xpts, &dn);
                    if detj <= 0.0 {
                        continue;
                    }

                    let mut ud = Param::<3>::zeros();
                    for (i, d) in dn.iter().enumerate() {
                        ud += vars[i] * d;
                    }
                    let grad = j * ud;
                    pe += 0.5 * grad.norm_squared() * detj * wts[ii] * wts[jj] * wts[kk];
                }
            }
        }
        (0.0, pe)
    }

    fn add_localized_error(
        &self,
        _time: f64,
        err: &mut [f64],
        adjoint: &[f64],
        xpts: &[Vert3d],
        vars: &[f64],
    ) {
        let size = self.num_nodes();
        let (pts, wts) = basis::gauss_rule(self.order);
        let mut n = vec![0.0; size];
        let mut dn = vec![Param::<3>::zeros(); size];

        for (kk, &gk) in pts.iter().enumerate() {
            for (jj, &gj) in pts.iter().enumerate() {
                for (ii, &gi) in pts.iter().enumerate() {
                    let pt = Param::<3>::new(gi, gj, gk);
                    basis::eval_tensor_deriv(&self.knots, &pt, &mut n, &mut dn);
                    let (_, j, detj) = jacobian_3d(xpts, &dn);
                    if detj <= 0.0 {
                        continue;
                    }

                    let mut ud = Param::<3>::zeros();
                    for (i, d) in dn.iter().enumerate() {
                        ud += vars[i] * d;
                    }
                    let grad = j * ud;
                    let scale = detj * wts[ii] * wts[jj] * wts[kk];

                    // err_i = -psi_i (K u)_i with zero forcing
                    for (i, d) in dn.iter().enumerate() {
                        let gradn = j * d;
                        err[i] -= adjoint[i] * gradn.dot(&grad) * scale;
                    }
                }
            }
        }
    }
}

/// Element wrapper exposing only a constitutive model, as used by the KS
/// stress constraint
pub struct SolidElement {
    con: DesignFailure,
}

impl SolidElement {
    pub fn new(con: DesignFailure) -> Self {
        Self { con }
    }
}

impl Element for SolidElement {
    fn num_nodes(&self) -> usize {
        0
    }

    fn compute_energies(
        &self,
        _time: f64,
        _xpts: &[Vert3d],
        _vars: &[f64],
        _dvars: &[f64],
    ) -> (f64, f64) {
        (0.0, 0.0)
    }

    fn add_localized_error(
        &self,
        _time: f64,
        _err: &mut [f64],
        _adjoint: &[f64],
        _xpts: &[Vert3d],
        _vars: &[f64],
    ) {
    }

    fn constitutive(&self) -> Option<&dyn Constitutive> {
        Some(&self.con)
    }
}

/// Failure model with an explicit design dependence: the failure value is a
/// design-weighted polynomial of the parametric point times a fixed linear
/// combination of the strain components
#[derive(Clone)]
pub struct DesignFailure {
    pub x: Vec<f64>,
}

impl DesignFailure {
    pub fn new(x: Vec<f64>) -> Self {
        assert_eq!(x.len(), 10);
        Self { x }
    }

    fn poly(pt: &Param<3>) -> [f64; 10] {
        [
            1.0,
            pt[0],
            pt[1],
            pt[2],
            pt[0] * pt[0],
            pt[1] * pt[1],
            pt[2] * pt[2],
            pt[0] * pt[1],
            pt[1] * pt[2],
            pt[0] * pt[2],
        ]
    }

    fn weight(&self, pt: &Param<3>) -> f64 {
        Self::poly(pt)
            .iter()
            .zip(self.x.iter())
            .map(|(b, x)| b * x)
            .sum()
    }

    fn strain_comb(strain: &[f64; 6]) -> f64 {
        strain[0]
            + 0.5 * strain[1]
            + 0.25 * strain[2]
            + 0.1 * (strain[3] + strain[4] + strain[5])
    }
}

impl Constitutive for DesignFailure {
    fn failure(&self, pt: &Param<3>, strain: &[f64; 6]) -> f64 {
        self.weight(pt) * Self::strain_comb(strain)
    }

    fn failure_strain_sens(&self, pt: &Param<3>, strain: &[f64; 6], dfde: &mut [f64; 6]) {
        let _ = strain;
        let w = self.weight(pt);
        *dfde = [w, 0.5 * w, 0.25 * w, 0.1 * w, 0.1 * w, 0.1 * w];
    }

    fn add_failure_dv_sens(&self, pt: &Param<3>, strain: &[f64; 6], alpha: f64, dfdx: &mut [f64]) {
        let s = Self::strain_comb(strain);
        for (d, b) in dfdx.iter_mut().zip(Self::poly(pt).iter()) {
            *d += alpha * b * s;
        }
    }
}
