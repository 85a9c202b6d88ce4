//! Per-element least-squares reconstruction.
//!
//! At every element knot the prescribed nodal derivative is compared with the
//! derivative of the low-order interpolation; the mismatch is fitted in a
//! weighted least-squares sense by the enrichment functions:
//! ```math
//! \min_{\bar u} \sum_{i} w_i^2 \left \| \nabla N^{enr}(\xi_i) \bar u -
//!   \left ( D_i - \nabla u_h(\xi_i) \right ) \right \|^2
//! ```
//! The system is solved with a rank-revealing SVD at machine-default
//! tolerance, so a singular patch degrades gracefully to the minimum-norm
//! enrichment.
use log::warn;
use nalgebra::DMatrix;

use crate::{
    Error, Param, Result, Vert3d, basis,
    forest::Forest,
    jacobian::{jacobian_2d, jacobian_3d, shell_frame},
};

/// Minimum-norm least-squares solve of an overdetermined system, with small
/// singular values dropped at the machine-default threshold
fn solve_least_squares(a: DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let m = a.nrows().max(a.ncols());
    let svd = a.svd(true, true);
    let eps = svd.singular_values.max() * f64::EPSILON * m as f64;
    match svd.solve(b, eps) {
        Ok(sol) => Ok(sol),
        Err(e) => Err(Error::from(e)),
    }
}

/// Reconstruct the enrichment coefficients of one shell element.
///
/// `xpts` holds the refined-element node positions, `uvals` the coarse nodal
/// field and `uderiv` the prescribed nodal derivatives (three slots per
/// variable). On return `ubar` holds `nenrich x vars_per_node` coefficients.
pub fn compute_elem_recon_2d<F: Forest<2>>(
    vars_per_node: usize,
    forest: &F,
    refined: &F,
    xpts: &[Vert3d],
    uvals: &[f64],
    uderiv: &[f64],
    ubar: &mut [f64],
) -> Result<()> {
    let order = forest.order();
    let knots = forest.knots();
    let refined_knots = refined.knots();
    let num_nodes = order * order;
    let num_refined_nodes = refined.elem_size();
    assert_eq!(xpts.len(), num_refined_nodes);

    let nenrich = basis::n_enrich_2d(order);
    let neq = 2 * num_nodes;
    let deriv_per_node = 3 * vars_per_node;
    assert_eq!(ubar.len(), nenrich * vars_per_node);

    let wvals = basis::node_weights(order);

    let mut a = DMatrix::<f64>::zeros(neq, nenrich);
    let mut b = DMatrix::<f64>::zeros(neq, vars_per_node);

    let mut nref = vec![0.0; num_refined_nodes];
    let mut dnref = vec![Param::<2>::zeros(); num_refined_nodes];
    let mut n = vec![0.0; num_nodes];
    let mut dn = vec![Param::<2>::zeros(); num_nodes];
    let mut nr = vec![0.0; nenrich];
    let mut dnr = vec![Param::<2>::zeros(); nenrich];

    let mut c = 0;
    for jj in 0..order {
        for ii in 0..order {
            let pt = Param::<2>::new(knots[ii], knots[jj]);
            let wv = wvals[ii] * wvals[jj];

            // geometry from the refined element
            refined.eval_interp_deriv(&pt, &mut nref, &mut dnref);
            let (xd, j, detj) = jacobian_2d(xpts, &dnref);
            if detj <= 0.0 {
                warn!("degenerate shell element in the reconstruction, knot rows skipped");
                c += 2;
                continue;
            }
            let (d1, d2) = shell_frame(&xd);

            // right-hand side: prescribed derivative in the local frame
            let ud = &uderiv[deriv_per_node * (ii + order * jj)..];
            for k in 0..vars_per_node {
                let d = Vert3d::new(ud[3 * k], ud[3 * k + 1], ud[3 * k + 2]);
                b[(c, k)] = wv * d1.dot(&d);
                b[(c + 1, k)] = wv * d2.dot(&d);
            }

            // minus the derivative of the low-order interpolation
            forest.eval_interp_deriv(&pt, &mut n, &mut dn);
            for k in 0..vars_per_node {
                let mut ua = 0.0;
                let mut ub = 0.0;
                for (i, d) in dn.iter().enumerate() {
                    ua += uvals[vars_per_node * i + k] * d[0];
                    ub += uvals[vars_per_node * i + k] * d[1];
                }
                let mut d = Vert3d::zeros();
                for r in 0..3 {
                    d[r] = ua * j[(r, 0)] + ub * j[(r, 1)];
                }
                b[(c, k)] -= wv * d1.dot(&d);
                b[(c + 1, k)] -= wv * d2.dot(&d);
            }

            // columns: physical derivatives of the enrichment functions
            basis::eval_enrich_deriv_2d(order, &pt, refined_knots, &mut nr, &mut dnr);
            for (e, de) in dnr.iter().enumerate() {
                let mut d = Vert3d::zeros();
                for r in 0..3 {
                    d[r] = de[0] * j[(r, 0)] + de[1] * j[(r, 1)];
                }
                a[(c, e)] = wv * d1.dot(&d);
                a[(c + 1, e)] = wv * d2.dot(&d);
            }

            c += 2;
        }
    }

    let sol = solve_least_squares(a, &b)?;
    for i in 0..nenrich {
        for k in 0..vars_per_node {
            ubar[vars_per_node * i + k] = sol[(i, k)];
        }
    }
    Ok(())
}

/// Reconstruct the enrichment coefficients of one octree element.
///
/// Same construction as [`compute_elem_recon_2d`] with three global-frame
/// rows per knot instead of the two local-frame rows.
pub fn compute_elem_recon_3d<F: Forest<3>>(
    vars_per_node: usize,
    forest: &F,
    refined: &F,
    xpts: &[Vert3d],
    uvals: &[f64],
    uderiv: &[f64],
    ubar: &mut [f64],
) -> Result<()> {
    let order = forest.order();
    let knots = forest.knots();
    let num_nodes = order * order * order;
    let num_refined_nodes = refined.elem_size();
    assert_eq!(xpts.len(), num_refined_nodes);

    let nenrich = basis::n_enrich_3d(order);
    let neq = 3 * num_nodes;
    let deriv_per_node = 3 * vars_per_node;
    assert_eq!(ubar.len(), nenrich * vars_per_node);

    let wvals = basis::node_weights(order);

    let mut a = DMatrix::<f64>::zeros(neq, nenrich);
    let mut b = DMatrix::<f64>::zeros(neq, vars_per_node);

    let mut nref = vec![0.0; num_refined_nodes];
    let mut dnref = vec![Param::<3>::zeros(); num_refined_nodes];
    let mut n = vec![0.0; num_nodes];
    let mut dn = vec![Param::<3>::zeros(); num_nodes];
    let mut nr = vec![0.0; nenrich];
    let mut dnr = vec![Param::<3>::zeros(); nenrich];

    let mut c = 0;
    for kk in 0..order {
        for jj in 0..order {
            for ii in 0..order {
                let pt = Param::<3>::new(knots[ii], knots[jj], knots[kk]);
                let wv = wvals[ii] * wvals[jj] * wvals[kk];

                refined.eval_interp_deriv(&pt, &mut nref, &mut dnref);
                let (_, j, detj) = jacobian_3d(xpts, &dnref);
                if detj <= 0.0 {
                    warn!("degenerate element in the reconstruction, knot rows skipped");
                    c += 3;
                    continue;
                }

                let slot = ii + order * jj + order * order * kk;
                let ud = &uderiv[deriv_per_node * slot..];
                for k in 0..vars_per_node {
                    b[(c, k)] = wv * ud[3 * k];
                    b[(c + 1, k)] = wv * ud[3 * k + 1];
                    b[(c + 2, k)] = wv * ud[3 * k + 2];
                }

                forest.eval_interp_deriv(&pt, &mut n, &mut dn);
                for k in 0..vars_per_node {
                    let mut upar = Param::<3>::zeros();
                    for (i, d) in dn.iter().enumerate() {
                        upar += uvals[vars_per_node * i + k] * d;
                    }
                    for r in 0..3 {
                        let d = upar[0] * j[(r, 0)] + upar[1] * j[(r, 1)] + upar[2] * j[(r, 2)];
                        b[(c + r, k)] -= wv * d;
                    }
                }

                basis::eval_enrich_deriv_3d(order, &pt, &mut nr, &mut dnr);
                for (e, de) in dnr.iter().enumerate() {
                    for r in 0..3 {
                        let d = de[0] * j[(r, 0)] + de[1] * j[(r, 1)] + de[2] * j[(r, 2)];
                        a[(c + r, e)] = wv * d;
                    }
                }

                c += 3;
            }
        }
    }

    let sol = solve_least_squares(a, &b)?;
    for i in 0..nenrich {
        for k in 0..vars_per_node {
            ubar[vars_per_node * i + k] = sol[(i, k)];
        }
    }
    Ok(())
}
