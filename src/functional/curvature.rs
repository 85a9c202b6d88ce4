//! Curvature constraint on a nodal design field.
//!
//! The design field lives on an octree forest. Its nodal gradient is
//! projected the same way as the solution derivatives; per element a
//! 20-term tri-quadratic-plus-cross polynomial is fitted to the corner
//! values and corner gradients (32 equations), and the gradient and Hessian
//! of the fit at the element centroid feed the principal-curvature
//! descriptor
//! ```math
//! r = b(x) \left ( \kappa_{max} + \frac{1}{k} \ln ( 1 + e^{k (\kappa_{min}
//!     - \kappa_{max})} ) \right )
//! ```
//! where `b` localizes the cost to the material transition band. The
//! functional is the induced-exponential aggregate of `r` over the elements.
use log::{debug, info};
use nalgebra::{DMatrix, DVector};

use crate::{
    Error, Result, Vert3d,
    comm::Comm,
    forest::Forest,
    recon::{add_node_deriv_transpose_3d, compute_local_weights, compute_node_deriv_3d},
    vector::{NodalVec, SetMode},
};

const NPOLY: usize = 20;

/// Options of the curvature constraint
#[derive(Clone, Debug)]
pub struct CurvatureOptions {
    /// Sharpness of the induced-exponential aggregation
    pub aggregate_weight: f64,
    /// Guard added to the fitted gradient components away from zero
    pub grad_eps: f64,
}

impl Default for CurvatureOptions {
    fn default() -> Self {
        Self {
            aggregate_weight: 50.0,
            grad_eps: 1e-6,
        }
    }
}

/// The 20-term polynomial basis about the element centroid: constant, linear
/// and quadratic terms (the diagonal ones scaled so their coefficients are
/// second derivatives), plus the cross-cubic terms `xyz`, `x^2 y`, ...
#[allow(clippy::similar_names)]
fn eval_poly(x: &Vert3d) -> ([f64; NPOLY], [f64; NPOLY], [f64; NPOLY], [f64; NPOLY]) {
    let mut n = [0.0; NPOLY];
    let mut nx = [0.0; NPOLY];
    let mut ny = [0.0; NPOLY];
    let mut nz = [0.0; NPOLY];

    n[0] = 1.0;
    n[1] = x[0];
    n[2] = x[1];
    n[3] = x[2];
    n[4] = x[2] * x[1];
    n[5] = x[0] * x[2];
    n[6] = x[0] * x[1];
    n[7] = 0.5 * x[0] * x[0];
    n[8] = 0.5 * x[1] * x[1];
    n[9] = 0.5 * x[2] * x[2];
    n[10] = x[0] * x[1] * x[2];
    n[11] = x[0] * x[0] * x[1];
    n[12] = x[0] * x[0] * x[2];
    n[13] = x[0] * x[0] * x[1] * x[2];
    n[14] = x[1] * x[1] * x[0];
    n[15] = x[1] * x[1] * x[2];
    n[16] = x[1] * x[1] * x[0] * x[2];
    n[17] = x[2] * x[2] * x[0];
    n[18] = x[2] * x[2] * x[1];
    n[19] = x[2] * x[2] * x[0] * x[1];

    nx[1] = 1.0;
    nx[5] = x[2];
    nx[6] = x[1];
    nx[7] = x[0];
    nx[10] = x[1] * x[2];
    nx[11] = 2.0 * x[0] * x[1];
    nx[12] = 2.0 * x[0] * x[2];
    nx[13] = 2.0 * x[0] * x[1] * x[2];
    nx[14] = x[1] * x[1];
    nx[16] = x[1] * x[1] * x[2];
    nx[17] = x[2] * x[2];
    nx[19] = x[2] * x[2] * x[1];

    ny[2] = 1.0;
    ny[4] = x[2];
    ny[6] = x[0];
    ny[8] = x[1];
    ny[10] = x[0] * x[2];
    ny[11] = x[0] * x[0];
    ny[13] = x[0] * x[0] * x[2];
    ny[14] = 2.0 * x[1] * x[0];
    ny[15] = 2.0 * x[1] * x[2];
    ny[16] = 2.0 * x[1] * x[0] * x[2];
    ny[18] = x[2] * x[2];
    ny[19] = x[2] * x[2] * x[0];

    nz[3] = 1.0;
    nz[4] = x[1];
    nz[5] = x[0];
    nz[9] = x[2];
    nz[10] = x[0] * x[1];
    nz[12] = x[0] * x[0];
    nz[13] = x[0] * x[0] * x[1];
    nz[15] = x[1] * x[1];
    nz[16] = x[1] * x[1] * x[0];
    nz[17] = 2.0 * x[2] * x[0];
    nz[18] = 2.0 * x[2] * x[1];
    nz[19] = 2.0 * x[2] * x[0] * x[1];

    (n, nx, ny, nz)
}

/// Assemble the 32 x 20 least-squares system of the centroid fit
fn fit_matrix(xpts: &[Vert3d; 8], centroid: &Vert3d) -> DMatrix<f64> {
    let mut a = DMatrix::<f64>::zeros(32, NPOLY);
    for (i, x) in xpts.iter().enumerate() {
        let dx = x - centroid;
        let (n, nx, ny, nz) = eval_poly(&dx);
        for j in 0..NPOLY {
            a[(4 * i, j)] = n[j];
            a[(4 * i + 1, j)] = nx[j];
            a[(4 * i + 2, j)] = ny[j];
            a[(4 * i + 3, j)] = nz[j];
        }
    }
    a
}

/// Gradient and Hessian of the centroid fit; the Hessian layout is
/// `[xx, xy, xz, yy, yz, zz]`
fn fit_centroid(
    xpts: &[Vert3d; 8],
    vals: &[f64; 8],
    derivs: &[f64; 24],
    grad_eps: f64,
) -> Result<(Vert3d, [f64; 6])> {
    let mut centroid = Vert3d::zeros();
    for x in xpts {
        centroid += 0.125 * x;
    }

    let a = fit_matrix(xpts, &centroid);
    let mut rhs = DVector::<f64>::zeros(32);
    for i in 0..8 {
        rhs[4 * i] = vals[i];
        rhs[4 * i + 1] = derivs[3 * i];
        rhs[4 * i + 2] = derivs[3 * i + 1];
        rhs[4 * i + 3] = derivs[3 * i + 2];
    }

    let svd = a.svd(true, true);
    let eps = svd.singular_values.max() * f64::EPSILON * 32.0;
    let coeffs = match svd.solve(&rhs, eps) {
        Ok(coeffs) => coeffs,
        Err(e) => return Err(Error::from(e)),
    };

    let mut g = Vert3d::new(coeffs[1], coeffs[2], coeffs[3]);
    for gi in g.iter_mut() {
        *gi += if *gi < 0.0 { -grad_eps } else { grad_eps };
    }

    let h = [coeffs[7], coeffs[6], coeffs[5], coeffs[8], coeffs[4], coeffs[9]];
    Ok((g, h))
}

/// Principal curvatures of the implicit surface described by the gradient
/// and Hessian
fn principal_curvatures(g: &Vert3d, h: &[f64; 6]) -> (f64, f64) {
    let gn = g.norm_squared();
    let sqrtgn = gn.sqrt();

    // cofactor matrix of the Hessian
    let hf = [
        h[3] * h[5] - h[4] * h[4],
        h[4] * h[2] - h[1] * h[5],
        h[1] * h[4] - h[3] * h[2],
        h[0] * h[5] - h[2] * h[2],
        h[1] * h[2] - h[0] * h[4],
        h[0] * h[3] - h[1] * h[1],
    ];

    let hfact = g[0] * (hf[0] * g[0] + hf[1] * g[1] + hf[2] * g[2])
        + g[1] * (hf[1] * g[0] + hf[3] * g[1] + hf[4] * g[2])
        + g[2] * (hf[2] * g[0] + hf[4] * g[1] + hf[5] * g[2]);

    let hprod = g[0] * (h[0] * g[0] + h[1] * g[1] + h[2] * g[2])
        + g[1] * (h[1] * g[0] + h[3] * g[1] + h[4] * g[2])
        + g[2] * (h[2] * g[0] + h[4] * g[1] + h[5] * g[2]);

    let kg = if gn != 0.0 { hfact / (gn * gn) } else { 0.0 };
    let km = if gn != 0.0 {
        0.5 * (hprod - gn * (h[0] + h[3] + h[5])) / (gn * sqrtgn)
    } else {
        0.0
    };

    let sqrtk = f64::sqrt(f64::max(km * km - kg, 0.0));
    let k1 = f64::abs(km + sqrtk);
    let k2 = f64::abs(km - sqrtk);
    if k1 > k2 { (k1, k2) } else { (k2, k1) }
}

/// Curvature constraint on an octree design field
pub struct CurvatureConstraint<'a, F: Forest<3>> {
    forest: &'a F,
    opts: CurvatureOptions,
    weights: NodalVec,
    xvec: NodalVec,
    xderiv: NodalVec,
    dfderiv: NodalVec,
    max_curvature: f64,
    aggregate_numer: f64,
    aggregate_denom: f64,
}

impl<'a, F: Forest<3>> CurvatureConstraint<'a, F> {
    pub fn new(forest: &'a F, opts: CurvatureOptions) -> Self {
        let mut weights = forest.create_vec(1);
        compute_local_weights(forest, &mut weights, None);

        let xvec = forest.create_vec(1);
        let xderiv = forest.create_vec(3);
        let dfderiv = forest.create_vec(3);

        Self {
            forest,
            opts,
            weights,
            xvec,
            xderiv,
            dfderiv,
            max_curvature: 0.0,
            aggregate_numer: 0.0,
            aggregate_denom: 0.0,
        }
    }

    /// Maximum per-element curvature cost found by the last evaluation
    #[must_use]
    pub fn max_curvature(&self) -> f64 {
        self.max_curvature
    }

    /// Corner node ids of an element, first axis fastest
    fn corner_nodes(&self, elem: usize) -> [crate::NodeId; 8] {
        let order = self.forest.order();
        let nodes = self.forest.elem_nodes(elem);
        let mut corners = [0; 8];
        let mut c = 0;
        for kk in [0, order - 1] {
            for jj in [0, order - 1] {
                for ii in [0, order - 1] {
                    corners[c] = nodes[ii + order * jj + order * order * kk];
                    c += 1;
                }
            }
        }
        corners
    }

    fn corner_data(&self, elem: usize) -> ([Vert3d; 8], [f64; 8], [f64; 24]) {
        let corners = self.corner_nodes(elem);
        let mut xpts = [Vert3d::zeros(); 8];
        let pts = self.forest.points();
        for (x, &node) in xpts.iter_mut().zip(corners.iter()) {
            if node >= 0 {
                *x = pts[node as usize];
            } else {
                let dep = self.forest.dep_nodes().unwrap();
                let (conn, w) = dep.contributors((-node - 1) as usize);
                for (&ci, &wi) in conn.iter().zip(w.iter()) {
                    *x += wi * pts[ci as usize];
                }
            }
        }

        let mut vals = [0.0; 8];
        self.xvec.get_values(&corners, &mut vals);
        let mut derivs = [0.0; 24];
        self.xderiv.get_values(&corners, &mut derivs);
        (xpts, vals, derivs)
    }

    /// The per-element curvature cost `r`
    fn eval_curvature(&self, val: f64, g: &Vert3d, h: &[f64; 6]) -> f64 {
        let k = self.opts.aggregate_weight;
        let (kmax, kmin) = principal_curvatures(g, h);
        let kdiff = kmin - kmax;

        let dv = val - 0.5;
        let factor = 1.0 - 16.0 * dv * dv * dv * dv;
        factor * (kmax + f64::ln(1.0 + f64::exp(k * kdiff)) / k)
    }

    /// The per-element cost and its derivatives with respect to the corner
    /// mean, the fitted gradient and the fitted Hessian
    #[allow(clippy::similar_names)]
    fn eval_curv_deriv(
        &self,
        val: f64,
        g: &Vert3d,
        h: &[f64; 6],
    ) -> (f64, f64, Vert3d, [f64; 6]) {
        let k = self.opts.aggregate_weight;

        let gn = g.norm_squared();
        let sqrtgn = gn.sqrt();

        let hf = [
            h[3] * h[5] - h[4] * h[4],
            h[4] * h[2] - h[1] * h[5],
            h[1] * h[4] - h[3] * h[2],
            h[0] * h[5] - h[2] * h[2],
            h[1] * h[2] - h[0] * h[4],
            h[0] * h[3] - h[1] * h[1],
        ];

        let hfact = g[0] * (hf[0] * g[0] + hf[1] * g[1] + hf[2] * g[2])
            + g[1] * (hf[1] * g[0] + hf[3] * g[1] + hf[4] * g[2])
            + g[2] * (hf[2] * g[0] + hf[4] * g[1] + hf[5] * g[2]);

        let hprod = g[0] * (h[0] * g[0] + h[1] * g[1] + h[2] * g[2])
            + g[1] * (h[1] * g[0] + h[3] * g[1] + h[4] * g[2])
            + g[2] * (h[2] * g[0] + h[4] * g[1] + h[5] * g[2]);

        let kg = if gn != 0.0 { hfact / (gn * gn) } else { 0.0 };
        let km = if gn != 0.0 {
            0.5 * (hprod - gn * (h[0] + h[3] + h[5])) / (gn * sqrtgn)
        } else {
            0.0
        };

        let sqrtk = f64::sqrt(f64::max(km * km - kg, 0.0));
        let k1 = f64::abs(km + sqrtk);
        let k2 = f64::abs(km - sqrtk);
        let (kmax, kdiff) = if k1 > k2 { (k1, k2 - k1) } else { (k2, k1 - k2) };

        let dv = val - 0.5;
        let factor = 1.0 - 16.0 * dv * dv * dv * dv;

        let expdiff = f64::exp(k * kdiff);
        let ksres = kmax + f64::ln(1.0 + expdiff) / k;
        let result = factor * ksres;

        // reverse sweep
        let dfactor = ksres;
        let dkmax = factor;
        let dkdiff = factor * expdiff / (1.0 + expdiff);
        let (dk1, dk2) = if k1 > k2 {
            (dkmax - dkdiff, dkdiff)
        } else {
            (dkdiff, dkmax - dkdiff)
        };

        let mut dkm;
        let mut dsqrtk;
        if km + sqrtk > 0.0 {
            dkm = dk1;
            dsqrtk = dk1;
        } else {
            dkm = -dk1;
            dsqrtk = -dk1;
        }
        if km - sqrtk > 0.0 {
            dkm += dk2;
            dsqrtk -= dk2;
        } else {
            dkm -= dk2;
            dsqrtk += dk2;
        }

        let sqrtk_safe = f64::max(sqrtk, 1e-30);
        let dkg = -0.5 * dsqrtk / sqrtk_safe;
        dkm += dsqrtk * km / sqrtk_safe;

        let dhprod = 0.5 * dkm / (gn * sqrtgn);
        let dhfact = dkg / (gn * gn);
        let mut dgn =
            -0.5 * dkm * (1.5 * hprod - 0.5 * gn * (h[0] + h[3] + h[5])) / (gn * gn * sqrtgn);
        dgn -= 2.0 * dkg * hfact / (gn * gn * gn);

        let mut dh = [
            -0.5 * dkm / sqrtgn + dhprod * g[0] * g[0],
            2.0 * dhprod * g[0] * g[1],
            2.0 * dhprod * g[0] * g[2],
            -0.5 * dkm / sqrtgn + dhprod * g[1] * g[1],
            2.0 * dhprod * g[1] * g[2],
            -0.5 * dkm / sqrtgn + dhprod * g[2] * g[2],
        ];

        let dg = Vert3d::new(
            2.0 * dgn * g[0]
                + 2.0
                    * (dhprod * (h[0] * g[0] + h[1] * g[1] + h[2] * g[2])
                        + dhfact * (hf[0] * g[0] + hf[1] * g[1] + hf[2] * g[2])),
            2.0 * dgn * g[1]
                + 2.0
                    * (dhprod * (h[1] * g[0] + h[3] * g[1] + h[4] * g[2])
                        + dhfact * (hf[1] * g[0] + hf[3] * g[1] + hf[4] * g[2])),
            2.0 * dgn * g[2]
                + 2.0
                    * (dhprod * (h[2] * g[0] + h[4] * g[1] + h[5] * g[2])
                        + dhfact * (hf[2] * g[0] + hf[4] * g[1] + hf[5] * g[2])),
        );

        // through the cofactor matrix
        let dhf = [
            dhfact * g[0] * g[0],
            2.0 * dhfact * g[0] * g[1],
            2.0 * dhfact * g[0] * g[2],
            dhfact * g[1] * g[1],
            2.0 * dhfact * g[1] * g[2],
            dhfact * g[2] * g[2],
        ];

        dh[0] += h[5] * dhf[3] - h[4] * dhf[4] + h[3] * dhf[5];
        dh[1] += -h[5] * dhf[1] + h[4] * dhf[2] + h[2] * dhf[4] - 2.0 * h[1] * dhf[5];
        dh[2] += h[4] * dhf[1] - h[3] * dhf[2] - 2.0 * h[2] * dhf[3] + h[1] * dhf[4];
        dh[3] += h[5] * dhf[0] - h[2] * dhf[2] + h[0] * dhf[5];
        dh[4] += -2.0 * h[4] * dhf[0] + h[2] * dhf[1] + h[1] * dhf[2] - h[0] * dhf[4];
        dh[5] += h[3] * dhf[0] - h[1] * dhf[1] + h[0] * dhf[3];

        let dval = -64.0 * dfactor * dv * dv * dv;

        (result, dval, dg, dh)
    }

    /// Evaluate the aggregated curvature functional for the design field `x`
    pub fn eval_constraint<C: Comm>(&mut self, comm: &C, x: &NodalVec) -> Result<f64> {
        debug!("Evaluate the curvature constraint");
        assert_eq!(x.block_size(), 1);

        self.xvec.copy_values(x);
        self.xvec.begin_distribute_values();
        self.xvec.end_distribute_values();

        compute_node_deriv_3d(
            self.forest,
            &self.xvec,
            &self.weights,
            &mut self.xderiv,
            None,
        );

        let k = self.opts.aggregate_weight;
        let nelems = self.forest.n_elems();

        // first sweep: the maximum curvature cost
        let mut max_curv = 0.0f64;
        for elem in 0..nelems {
            let (xpts, vals, derivs) = self.corner_data(elem);
            let (g, h) = fit_centroid(&xpts, &vals, &derivs, self.opts.grad_eps)?;
            let val = 0.125 * vals.iter().sum::<f64>();
            let r = self.eval_curvature(val, &g, &h);
            if r > max_curv {
                max_curv = r;
            }
        }

        let mut buf = [max_curv];
        comm.allreduce_max(&mut buf);
        self.max_curvature = buf[0];

        // second sweep: the induced-exponential aggregate
        let mut numer = 0.0;
        let mut denom = 0.0;
        for elem in 0..nelems {
            let (xpts, vals, derivs) = self.corner_data(elem);
            let (g, h) = fit_centroid(&xpts, &vals, &derivs, self.opts.grad_eps)?;
            let val = 0.125 * vals.iter().sum::<f64>();
            let r = self.eval_curvature(val, &g, &h);
            let expres = f64::exp(k * (r - self.max_curvature));
            numer += r * expres;
            denom += expres;
        }

        let mut buf = [numer, denom];
        comm.allreduce_sum(&mut buf);
        self.aggregate_numer = buf[0];
        self.aggregate_denom = buf[1];

        let func_val = self.aggregate_numer / self.aggregate_denom;
        if comm.rank() == 0 {
            info!(
                "Induced curvature: {func_val:.10e}, max curvature: {:.10e}",
                self.max_curvature
            );
        }
        Ok(func_val)
    }

    /// Evaluate the derivative of the functional with respect to the nodal
    /// design field.
    ///
    /// Must be called after [`Self::eval_constraint`]. The reverse chain
    /// runs through the curvature descriptor, the centroid fit (via the
    /// transposed pseudo-inverse), and the transpose of the derivative
    /// projection.
    pub fn eval_con_deriv<C: Comm>(&mut self, comm: &C, dfdx: &mut NodalVec) -> Result<()> {
        debug!("Evaluate the curvature constraint derivative");
        assert_eq!(dfdx.block_size(), 1);

        dfdx.zero();
        self.dfderiv.zero();

        let k = self.opts.aggregate_weight;
        let func_val = self.aggregate_numer / self.aggregate_denom;
        let nelems = self.forest.n_elems();

        for elem in 0..nelems {
            let corners = self.corner_nodes(elem);
            let (xpts, vals, derivs) = self.corner_data(elem);
            let (g, h) = fit_centroid(&xpts, &vals, &derivs, self.opts.grad_eps)?;
            let val = 0.125 * vals.iter().sum::<f64>();

            let (r, dval, dg, dh) = self.eval_curv_deriv(val, &g, &h);

            // derivative of the induced aggregate with respect to this
            // element's cost
            let w = f64::exp(k * (r - self.max_curvature));
            let alpha = w * (1.0 + k * (r - func_val)) / self.aggregate_denom;

            // reverse through the centroid fit: the adjoint of the fitted
            // coefficients maps back onto the 32 fit equations through the
            // transposed pseudo-inverse
            let mut dcoeff = DVector::<f64>::zeros(NPOLY);
            dcoeff[1] = alpha * dg[0];
            dcoeff[2] = alpha * dg[1];
            dcoeff[3] = alpha * dg[2];
            dcoeff[4] = alpha * dh[4];
            dcoeff[5] = alpha * dh[2];
            dcoeff[6] = alpha * dh[1];
            dcoeff[7] = alpha * dh[0];
            dcoeff[8] = alpha * dh[3];
            dcoeff[9] = alpha * dh[5];

            let mut centroid = Vert3d::zeros();
            for xp in &xpts {
                centroid += 0.125 * xp;
            }
            let a = fit_matrix(&xpts, &centroid);
            let svd = a.svd(true, true);
            let eps = svd.singular_values.max() * f64::EPSILON * 32.0;

            let mut t = svd.v_t.as_ref().unwrap() * dcoeff;
            for (ti, &si) in t.iter_mut().zip(svd.singular_values.iter()) {
                if si > eps {
                    *ti /= si;
                } else {
                    *ti = 0.0;
                }
            }
            let drhs = svd.u.as_ref().unwrap() * t;

            let mut dvals = [0.0; 8];
            let mut dderiv = [0.0; 24];
            for i in 0..8 {
                dvals[i] = drhs[4 * i] + 0.125 * alpha * dval;
                dderiv[3 * i] = drhs[4 * i + 1];
                dderiv[3 * i + 1] = drhs[4 * i + 2];
                dderiv[3 * i + 2] = drhs[4 * i + 3];
            }

            dfdx.set_values(&corners, &dvals, SetMode::Add);
            self.dfderiv.set_values(&corners, &dderiv, SetMode::Add);
        }

        self.dfderiv.begin_set_values(SetMode::Add);
        self.dfderiv.end_set_values(SetMode::Add);

        self.dfderiv.begin_distribute_values();
        self.dfderiv.end_distribute_values();

        // back through the derivative projection onto the design field
        add_node_deriv_transpose_3d(
            self.forest,
            self.forest,
            &self.dfderiv,
            &self.weights,
            dfdx,
        );

        dfdx.begin_set_values(SetMode::Add);
        dfdx.end_set_values(SetMode::Add);
        Ok(())
    }

    /// Write the design field and the per-element curvature cost on the
    /// corner hexahedra of the forest
    pub fn write_curvature_vtk<C: Comm>(
        &mut self,
        comm: &C,
        x: &NodalVec,
        path: impl AsRef<std::path::Path>,
    ) -> Result<()> {
        self.eval_constraint(comm, x)?;

        let mut grid = crate::io::VtkGrid::default();
        let mut xdata = Vec::new();
        let mut vals_data = Vec::new();
        let mut kval_data = Vec::new();

        for elem in 0..self.forest.n_elems() {
            let (xpts, vals, derivs) = self.corner_data(elem);
            let (g, h) = fit_centroid(&xpts, &vals, &derivs, self.opts.grad_eps)?;
            let val = 0.125 * vals.iter().sum::<f64>();
            let r = self.eval_curvature(val, &g, &h);

            let offset = grid.points.len();
            grid.points.extend_from_slice(&xpts);
            xdata.extend_from_slice(&vals);
            grid.push_tensor_hex([
                offset,
                offset + 1,
                offset + 2,
                offset + 3,
                offset + 4,
                offset + 5,
                offset + 6,
                offset + 7,
            ]);
            vals_data.push(val);
            kval_data.push(r);
        }

        grid.point_data.push(("x".to_string(), xdata));
        grid.cell_data.push(("val".to_string(), vals_data));
        grid.cell_data.push(("kval".to_string(), kval_data));
        crate::io::write_vtk_grid(&grid, path)
    }
}

#[cfg(test)]
mod tests {
    use super::{CurvatureConstraint, CurvatureOptions, fit_centroid, principal_curvatures};
    use crate::{
        Result, Vert3d,
        comm::SerialComm,
        forest::{Forest, TensorForest},
    };

    #[test]
    fn test_poly_fit_quadratic() -> Result<()> {
        // the fit reproduces gradient and Hessian of a quadratic exactly
        let f = |p: &Vert3d| {
            1.0 + 2.0 * p[0] - p[1] + 0.5 * p[2] + p[0] * p[0] + 2.0 * p[1] * p[2]
                - 0.5 * p[2] * p[2]
        };
        let grad = |p: &Vert3d| Vert3d::new(2.0 + 2.0 * p[0], -1.0 + 2.0 * p[2], 0.5 + 2.0 * p[1] - p[2]);

        let mut xpts = [Vert3d::zeros(); 8];
        let mut vals = [0.0; 8];
        let mut derivs = [0.0; 24];
        let mut c = 0;
        for k in 0..2 {
            for j in 0..2 {
                for i in 0..2 {
                    let p = Vert3d::new(0.3 * i as f64, 0.3 * j as f64, 0.3 * k as f64);
                    xpts[c] = p;
                    vals[c] = f(&p);
                    let gr = grad(&p);
                    derivs[3 * c] = gr[0];
                    derivs[3 * c + 1] = gr[1];
                    derivs[3 * c + 2] = gr[2];
                    c += 1;
                }
            }
        }

        let (g, h) = fit_centroid(&xpts, &vals, &derivs, 0.0)?;
        let centroid = Vert3d::new(0.15, 0.15, 0.15);
        let gc = grad(&centroid);
        for r in 0..3 {
            assert_delta!(g[r], gc[r], 1e-10);
        }
        let h_exact = [2.0, 0.0, 0.0, 0.0, 2.0, -1.0];
        for r in 0..6 {
            assert_delta!(h[r], h_exact[r], 1e-10);
        }
        Ok(())
    }

    #[test]
    fn test_sphere_curvature() -> Result<()> {
        // S7: for the implicit field x = 1 - r/2 the 0.5-isocontour is the
        // unit sphere; both principal curvatures are 1 at the band
        let f = |p: &Vert3d| 1.0 - 0.5 * p.norm();
        let grad = |p: &Vert3d| -0.5 * p / p.norm();

        // element of size h = 0.1 centered at (1, 0, 0)
        let h = 0.1;
        let mut xpts = [Vert3d::zeros(); 8];
        let mut vals = [0.0; 8];
        let mut derivs = [0.0; 24];
        let mut c = 0;
        for k in 0..2 {
            for j in 0..2 {
                for i in 0..2 {
                    let p = Vert3d::new(
                        1.0 - 0.5 * h + h * i as f64,
                        -0.5 * h + h * j as f64,
                        -0.5 * h + h * k as f64,
                    );
                    xpts[c] = p;
                    vals[c] = f(&p);
                    let gr = grad(&p);
                    derivs[3 * c] = gr[0];
                    derivs[3 * c + 1] = gr[1];
                    derivs[3 * c + 2] = gr[2];
                    c += 1;
                }
            }
        }

        let (g, hess) = fit_centroid(&xpts, &vals, &derivs, 0.0)?;
        let (kmax, kmin) = principal_curvatures(&g, &hess);
        assert_delta!(kmax, 1.0, 5e-2);
        assert_delta!(kmin, 1.0, 5e-2);
        Ok(())
    }

    #[test]
    fn test_constraint_value_finite() -> Result<()> {
        let forest = TensorForest::<3>::boxed(
            Vert3d::new(-1.5, -1.5, -1.5),
            [3.0, 3.0, 3.0],
            [4, 4, 4],
            2,
        );
        let comm = SerialComm::new();

        let mut x = forest.create_vec(1);
        for (i, p) in forest.points().iter().enumerate() {
            x.as_mut_slice()[i] = 1.0 - 0.5 * p.norm();
        }

        let mut con = CurvatureConstraint::new(&forest, CurvatureOptions::default());
        let val = con.eval_constraint(&comm, &x)?;
        assert!(val.is_finite());
        assert!(val > 0.0);
        assert!(con.max_curvature() >= val - 1e-12);
        Ok(())
    }

    #[test]
    fn test_curvature_deriv_fd() -> Result<()> {
        // finite-difference check of the full design-derivative chain
        let forest = TensorForest::<3>::unit_box([2, 2, 2], 2);
        let comm = SerialComm::new();

        let field = |p: &Vert3d| {
            0.4 + 0.2 * p[0] + 0.1 * p[1] + 0.15 * p[2] + 0.05 * p[0] * p[0]
                + 0.03 * p[0] * p[1]
                - 0.04 * p[1] * p[2]
        };
        let mut x = forest.create_vec(1);
        for (i, p) in forest.points().iter().enumerate() {
            x.as_mut_slice()[i] = field(p);
        }

        let opts = CurvatureOptions {
            aggregate_weight: 5.0,
            grad_eps: 1e-6,
        };
        let mut con = CurvatureConstraint::new(&forest, opts.clone());
        con.eval_constraint(&comm, &x)?;

        let mut dfdx = forest.create_vec(1);
        con.eval_con_deriv(&comm, &mut dfdx)?;

        let h = 1e-6;
        for dof in [0, 7, 13, 20] {
            let mut xp = x.clone();
            xp.as_mut_slice()[dof] += h;
            let fp =
                CurvatureConstraint::new(&forest, opts.clone()).eval_constraint(&comm, &xp)?;

            let mut xm = x.clone();
            xm.as_mut_slice()[dof] -= h;
            let fm =
                CurvatureConstraint::new(&forest, opts.clone()).eval_constraint(&comm, &xm)?;

            let fd = (fp - fm) / (2.0 * h);
            assert_delta!(dfdx.as_slice()[dof], fd, 1e-4 * fd.abs().max(1e-4));
        }
        Ok(())
    }
}
