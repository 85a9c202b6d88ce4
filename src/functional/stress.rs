//! KS-aggregated stress constraint on the reconstructed field.
//!
//! The pointwise failure value is evaluated on the order-elevated
//! reconstruction at Gauss points; the constraint is the
//! Kreisselmeier-Steinhauser aggregate
//! ```math
//! c = f_{max} + \frac{1}{k} \ln \sum_q |J| w_q \, e^{k (f_q - f_{max})}
//! ```
//! with the global maximum found by a first sweep. The sensitivity threads
//! through the reconstruction operator twice: directly through the
//! least-squares right-hand side, and indirectly through the projected nodal
//! derivatives.
use log::{debug, info, warn};
use nalgebra::{DMatrix, Matrix3};

use crate::{
    Error, NodeId, Param, Result, Vert3d, basis,
    comm::Comm,
    element::Element,
    forest::Forest,
    jacobian::jacobian_3d,
    recon::{
        add_node_deriv_transpose_3d, compute_elem_recon_3d, compute_local_weights,
        compute_node_deriv_3d,
    },
    vector::{NodalVec, SetMode},
};

/// Per-call scratch for the strain evaluation
struct Scratch {
    n: Vec<f64>,
    dn: Vec<Param<3>>,
    ng: Vec<f64>,
    dng: Vec<Param<3>>,
    nr: Vec<f64>,
    dnr: Vec<Param<3>>,
}

impl Scratch {
    fn new(num_nodes: usize, num_interp_nodes: usize, nenrich: usize) -> Self {
        Self {
            n: vec![0.0; num_nodes],
            dn: vec![Param::<3>::zeros(); num_nodes],
            ng: vec![0.0; num_interp_nodes],
            dng: vec![Param::<3>::zeros(); num_interp_nodes],
            nr: vec![0.0; nenrich],
            dnr: vec![Param::<3>::zeros(); nenrich],
        }
    }
}

/// KS stress constraint evaluated on the order-elevated reconstruction.
///
/// The constraint owns its scratch vectors and the derived nodal vectors;
/// the forest and the element collaborators are borrowed per call. The state
/// field must carry three displacement components per node.
pub struct StressConstraint<'a, F: Forest<3>> {
    forest: &'a F,
    interp_forest: F,
    ks_weight: f64,
    weights: NodalVec,
    uvec: NodalVec,
    uderiv: NodalVec,
    dfduderiv: NodalVec,
    ks_max_fail: f64,
    ks_fail_sum: f64,
}

impl<'a, F: Forest<3>> StressConstraint<'a, F> {
    pub fn new(forest: &'a F, ks_weight: f64) -> Self {
        let interp_forest = forest.elevated();

        let mut weights = forest.create_vec(1);
        compute_local_weights(forest, &mut weights, None);

        let uvec = forest.create_vec(3);
        let uderiv = forest.create_vec(9);
        let dfduderiv = forest.create_vec(9);

        Self {
            forest,
            interp_forest,
            ks_weight,
            weights,
            uvec,
            uderiv,
            dfduderiv,
            ks_max_fail: 0.0,
            ks_fail_sum: 0.0,
        }
    }

    /// Maximum pointwise failure value found by the last primal evaluation
    #[must_use]
    pub fn max_fail(&self) -> f64 {
        self.ks_max_fail
    }

    /// Evaluate the constraint for the state `u`
    pub fn eval_constraint<E: Element, C: Comm>(
        &mut self,
        comm: &C,
        elements: &[E],
        u: &NodalVec,
    ) -> Result<f64> {
        let start = comm.wtime();
        let nelems = self.forest.n_elems();
        assert_eq!(elements.len(), nelems);
        assert_eq!(u.block_size(), 3);

        self.uvec.copy_values(u);
        self.uvec.begin_distribute_values();
        self.uvec.end_distribute_values();

        compute_node_deriv_3d(
            self.forest,
            &self.uvec,
            &self.weights,
            &mut self.uderiv,
            None,
        );

        let order = self.forest.order();
        let num_nodes = order * order * order;
        let num_interp_nodes = self.interp_forest.elem_size();
        let nenrich = basis::n_enrich_3d(order);

        let (gauss_pts, gauss_wts) = basis::gauss_rule(order + 1);

        let mut scratch = Scratch::new(num_nodes, num_interp_nodes, nenrich);
        let mut vars = vec![0.0; 3 * num_nodes];
        let mut varderiv = vec![0.0; 9 * num_nodes];
        let mut ubar = vec![0.0; 3 * nenrich];
        let mut xpts = vec![Vert3d::zeros(); num_interp_nodes];

        // first sweep: the maximum failure value
        let mut max_fail = -1e20;
        for (elem, element) in elements.iter().enumerate() {
            let con = match element.constitutive() {
                Some(con) => con,
                None => return Err(Error::from("element without a constitutive model")),
            };
            let nodes = self.forest.elem_nodes(elem);
            self.uvec.get_values(nodes, &mut vars);
            self.uderiv.get_values(nodes, &mut varderiv);
            self.interp_forest.elem_points(elem, &mut xpts);

            compute_elem_recon_3d(
                3,
                self.forest,
                &self.interp_forest,
                &xpts,
                &vars,
                &varderiv,
                &mut ubar,
            )?;

            for &gk in gauss_pts {
                for &gj in gauss_pts {
                    for &gi in gauss_pts {
                        let pt = Param::<3>::new(gi, gj, gk);
                        let (_, e, detj) = self.eval_strain(&pt, &xpts, &vars, &ubar, &mut scratch);
                        if detj <= 0.0 {
                            warn!("degenerate element {elem} in the KS evaluation");
                            continue;
                        }
                        let fval = con.failure(&pt, &e);
                        if fval > max_fail {
                            max_fail = fval;
                        }
                    }
                }
            }
        }

        let mut buf = [max_fail];
        comm.allreduce_max(&mut buf);
        self.ks_max_fail = buf[0];

        // second sweep: the weighted exponential sum
        let mut fail_sum = 0.0;
        for (elem, element) in elements.iter().enumerate() {
            let con = match element.constitutive() {
                Some(con) => con,
                None => return Err(Error::from("element without a constitutive model")),
            };
            let nodes = self.forest.elem_nodes(elem);
            self.uvec.get_values(nodes, &mut vars);
            self.uderiv.get_values(nodes, &mut varderiv);
            self.interp_forest.elem_points(elem, &mut xpts);

            compute_elem_recon_3d(
                3,
                self.forest,
                &self.interp_forest,
                &xpts,
                &vars,
                &varderiv,
                &mut ubar,
            )?;

            for (kk, &gk) in gauss_pts.iter().enumerate() {
                for (jj, &gj) in gauss_pts.iter().enumerate() {
                    for (ii, &gi) in gauss_pts.iter().enumerate() {
                        let pt = Param::<3>::new(gi, gj, gk);
                        let (_, e, detj) = self.eval_strain(&pt, &xpts, &vars, &ubar, &mut scratch);
                        if detj <= 0.0 {
                            continue;
                        }
                        let fval = con.failure(&pt, &e);
                        fail_sum += detj
                            * gauss_wts[ii]
                            * gauss_wts[jj]
                            * gauss_wts[kk]
                            * f64::exp(self.ks_weight * (fval - self.ks_max_fail));
                    }
                }
            }
        }

        let mut buf = [fail_sum];
        comm.allreduce_sum(&mut buf);
        self.ks_fail_sum = buf[0];

        let ks_func_val = self.ks_max_fail + f64::ln(self.ks_fail_sum) / self.ks_weight;
        if comm.rank() == 0 {
            info!(
                "KS stress value: {ks_func_val:.10e}, max stress value: {:.10e}",
                self.ks_max_fail
            );
        }
        debug!("KS forward evaluation took {:.3e} s", comm.wtime() - start);

        Ok(ks_func_val)
    }

    /// Evaluate the derivative of the constraint with respect to the design
    /// variables and the state.
    ///
    /// Must be called after [`Self::eval_constraint`]; the stored maximum and
    /// exponential sum are reused. Rows of `dfdu` listed in `bc_nodes` are
    /// zeroed at the end.
    pub fn eval_con_deriv<E: Element, C: Comm>(
        &mut self,
        comm: &C,
        elements: &[E],
        dfdx: &mut [f64],
        dfdu: &mut NodalVec,
        bc_nodes: &[NodeId],
    ) -> Result<()> {
        let start = comm.wtime();
        let nelems = self.forest.n_elems();
        assert_eq!(elements.len(), nelems);
        assert_eq!(dfdu.block_size(), 3);

        dfdx.fill(0.0);
        dfdu.zero();
        self.dfduderiv.zero();

        let order = self.forest.order();
        let knots = self.forest.knots().to_vec();
        let num_nodes = order * order * order;
        let num_interp_nodes = self.interp_forest.elem_size();
        let nenrich = basis::n_enrich_3d(order);
        let wvals = basis::node_weights(order);

        let (gauss_pts, gauss_wts) = basis::gauss_rule(order + 1);

        // m enrichment unknowns, p nodal values per component, neq rows
        let m = nenrich;
        let p = num_nodes;
        let neq = 3 * num_nodes;

        let mut scratch = Scratch::new(num_nodes, num_interp_nodes, nenrich);
        let mut vars = vec![0.0; 3 * num_nodes];
        let mut varderiv = vec![0.0; 9 * num_nodes];
        let mut ubar = vec![0.0; 3 * nenrich];
        let mut xpts = vec![Vert3d::zeros(); num_interp_nodes];

        let mut dfdu_elem = vec![0.0; 3 * p];
        let mut dfdubar = vec![0.0; 3 * m];
        let mut dfduderiv_elem = vec![0.0; 3 * neq];
        let mut a = DMatrix::<f64>::zeros(neq, m);
        let mut dbdu = DMatrix::<f64>::zeros(neq, p);
        let mut row_wv = vec![0.0; neq];

        for (elem, element) in elements.iter().enumerate() {
            let con = match element.constitutive() {
                Some(con) => con,
                None => return Err(Error::from("element without a constitutive model")),
            };
            let nodes = self.forest.elem_nodes(elem);
            self.uvec.get_values(nodes, &mut vars);
            self.uderiv.get_values(nodes, &mut varderiv);
            self.interp_forest.elem_points(elem, &mut xpts);

            compute_elem_recon_3d(
                3,
                self.forest,
                &self.interp_forest,
                &xpts,
                &vars,
                &varderiv,
                &mut ubar,
            )?;

            // partial derivatives df/du and df/dubar at the Gauss points
            dfdu_elem.fill(0.0);
            dfdubar.fill(0.0);
            for (kk, &gk) in gauss_pts.iter().enumerate() {
                for (jj, &gj) in gauss_pts.iter().enumerate() {
                    for (ii, &gi) in gauss_pts.iter().enumerate() {
                        let pt = Param::<3>::new(gi, gj, gk);
                        let (j, e, detj) = self.eval_strain(&pt, &xpts, &vars, &ubar, &mut scratch);
                        if detj <= 0.0 {
                            continue;
                        }
                        let fval = con.failure(&pt, &e);

                        let kw = detj
                            * gauss_wts[ii]
                            * gauss_wts[jj]
                            * gauss_wts[kk]
                            * f64::exp(self.ks_weight * (fval - self.ks_max_fail))
                            / self.ks_fail_sum;

                        con.add_failure_dv_sens(&pt, &e, kw, dfdx);

                        let mut dfde = [0.0; 6];
                        con.failure_strain_sens(&pt, &e, &mut dfde);

                        self.add_strain_deriv(
                            &pt,
                            &j,
                            kw,
                            &dfde,
                            &mut dfdu_elem,
                            &mut dfdubar,
                            &mut scratch,
                        );
                    }
                }
            }

            dfdu.set_values(nodes, &dfdu_elem, SetMode::Add);

            // the least-squares operator A and the right-hand-side
            // sensitivity db/du at the element knots
            a.fill(0.0);
            dbdu.fill(0.0);
            let mut c = 0;
            for kk in 0..order {
                for jj in 0..order {
                    for ii in 0..order {
                        let kt = Param::<3>::new(knots[ii], knots[jj], knots[kk]);
                        let wv = wvals[ii] * wvals[jj] * wvals[kk];
                        row_wv[c] = wv;
                        row_wv[c + 1] = wv;
                        row_wv[c + 2] = wv;

                        self.interp_forest
                            .eval_interp_deriv(&kt, &mut scratch.ng, &mut scratch.dng);
                        let (_, j, detj) = jacobian_3d(&xpts, &scratch.dng);
                        if detj <= 0.0 {
                            warn!("degenerate element {elem} in the KS sensitivity");
                            c += 3;
                            continue;
                        }

                        basis::eval_enrich_deriv_3d(order, &kt, &mut scratch.nr, &mut scratch.dnr);
                        self.forest
                            .eval_interp_deriv(&kt, &mut scratch.n, &mut scratch.dn);

                        for (aa, d) in scratch.dn.iter().enumerate() {
                            let dp = j * d;
                            dbdu[(c, aa)] = -wv * dp[0];
                            dbdu[(c + 1, aa)] = -wv * dp[1];
                            dbdu[(c + 2, aa)] = -wv * dp[2];
                        }

                        for (aa, d) in scratch.dnr.iter().enumerate() {
                            let dr = j * d;
                            a[(c, aa)] = wv * dr[0];
                            a[(c + 1, aa)] = wv * dr[1];
                            a[(c + 2, aa)] = wv * dr[2];
                        }

                        c += 3;
                    }
                }
            }

            // dubar/duderiv = (A^T A)^-1 A^T and dubar/du = (dubar/duderiv) db/du
            let ata = a.tr_mul(&a);
            let ata_inv = match ata.clone().try_inverse() {
                Some(inv) => inv,
                None => {
                    warn!("rank-deficient reconstruction operator on element {elem}");
                    let eps = f64::EPSILON * ata.amax();
                    match ata.pseudo_inverse(eps) {
                        Ok(inv) => inv,
                        Err(e) => return Err(Error::from(e)),
                    }
                }
            };
            let dubar_duderiv = &ata_inv * a.transpose();
            let dubardu = &dubar_duderiv * &dbdu;

            // chain (df/dubar)(dubar/du) into the state derivative
            dfdu_elem.fill(0.0);
            for ii in 0..m {
                for jj in 0..p {
                    for cc in 0..3 {
                        dfdu_elem[3 * jj + cc] += dfdubar[3 * ii + cc] * dubardu[(ii, jj)];
                    }
                }
            }
            dfdu.set_values(nodes, &dfdu_elem, SetMode::Add);

            // chain (df/dubar)(dubar/duderiv) into the nodal-derivative
            // sensitivity, laid out as three derivative slots per component;
            // db/dD carries the knot weight of each row
            dfduderiv_elem.fill(0.0);
            for ii in 0..neq {
                for jj in 0..m {
                    for cc in 0..3 {
                        dfduderiv_elem[9 * (ii / 3) + 3 * cc + (ii % 3)] +=
                            dfdubar[3 * jj + cc] * dubar_duderiv[(jj, ii)] * row_wv[ii];
                    }
                }
            }
            self.dfduderiv
                .set_values(nodes, &dfduderiv_elem, SetMode::Add);
        }

        self.dfduderiv.begin_set_values(SetMode::Add);
        self.dfduderiv.end_set_values(SetMode::Add);

        self.dfduderiv.begin_distribute_values();
        self.dfduderiv.end_distribute_values();

        // the indirect path: (df/duderiv)(duderiv/du)
        add_node_deriv_transpose_3d(
            self.forest,
            &self.interp_forest,
            &self.dfduderiv,
            &self.weights,
            dfdu,
        );

        dfdu.begin_set_values(SetMode::Add);
        dfdu.end_set_values(SetMode::Add);

        comm.allreduce_sum(dfdx);

        // boundary-condition mask
        for &node in bc_nodes {
            if node >= 0 {
                let start = 3 * node as usize;
                dfdu.as_mut_slice()[start..start + 3].fill(0.0);
            }
        }

        debug!("KS derivative evaluation took {:.3e} s", comm.wtime() - start);
        Ok(())
    }

    /// Write the reconstructed failure field, scaled by `ys`, sampled at the
    /// order-elevated element knots
    pub fn write_recon_vtk<E: Element>(
        &mut self,
        elements: &[E],
        u: &NodalVec,
        ys: f64,
        path: impl AsRef<std::path::Path>,
    ) -> Result<()> {
        self.uvec.copy_values(u);
        self.uvec.begin_distribute_values();
        self.uvec.end_distribute_values();

        compute_node_deriv_3d(
            self.forest,
            &self.uvec,
            &self.weights,
            &mut self.uderiv,
            None,
        );

        let order = self.forest.order();
        let ro = order + 1;
        let num_nodes = order * order * order;
        let num_interp_nodes = self.interp_forest.elem_size();
        let nenrich = basis::n_enrich_3d(order);
        let interp_knots = self.interp_forest.knots().to_vec();

        let mut scratch = Scratch::new(num_nodes, num_interp_nodes, nenrich);
        let mut vars = vec![0.0; 3 * num_nodes];
        let mut varderiv = vec![0.0; 9 * num_nodes];
        let mut ubar = vec![0.0; 3 * nenrich];
        let mut xpts = vec![Vert3d::zeros(); num_interp_nodes];

        let mut grid = crate::io::VtkGrid::default();
        let mut svm = Vec::new();

        for (elem, element) in elements.iter().enumerate() {
            let con = match element.constitutive() {
                Some(con) => con,
                None => return Err(Error::from("element without a constitutive model")),
            };
            let nodes = self.forest.elem_nodes(elem);
            self.uvec.get_values(nodes, &mut vars);
            self.uderiv.get_values(nodes, &mut varderiv);
            self.interp_forest.elem_points(elem, &mut xpts);

            compute_elem_recon_3d(
                3,
                self.forest,
                &self.interp_forest,
                &xpts,
                &vars,
                &varderiv,
                &mut ubar,
            )?;

            let offset = grid.points.len();
            grid.points.extend_from_slice(&xpts);
            for kk in 0..ro {
                for jj in 0..ro {
                    for ii in 0..ro {
                        let pt = Param::<3>::new(
                            interp_knots[ii],
                            interp_knots[jj],
                            interp_knots[kk],
                        );
                        let (_, e, _) = self.eval_strain(&pt, &xpts, &vars, &ubar, &mut scratch);
                        svm.push(con.failure(&pt, &e) * ys);
                    }
                }
            }

            for kk in 0..ro - 1 {
                for jj in 0..ro - 1 {
                    for ii in 0..ro - 1 {
                        let base = offset + ii + ro * jj + ro * ro * kk;
                        grid.push_tensor_hex([
                            base,
                            base + 1,
                            base + ro,
                            base + ro + 1,
                            base + ro * ro,
                            base + ro * ro + 1,
                            base + ro * ro + ro,
                            base + ro * ro + ro + 1,
                        ]);
                    }
                }
            }
        }

        grid.point_data.push(("svm".to_string(), svm));
        crate::io::write_vtk_grid(&grid, path)
    }

    /// Strain of the reconstructed field at a parametric point; returns the
    /// Jacobian, the engineering strain and the transformation determinant
    fn eval_strain(
        &self,
        pt: &Param<3>,
        xpts: &[Vert3d],
        vars: &[f64],
        ubar: &[f64],
        s: &mut Scratch,
    ) -> (Matrix3<f64>, [f64; 6], f64) {
        let order = self.forest.order();

        // displacement gradient in reference coordinates
        self.forest.eval_interp_deriv(pt, &mut s.n, &mut s.dn);
        let mut ud: Matrix3<f64> = Matrix3::zeros();
        for (i, d) in s.dn.iter().enumerate() {
            for k in 0..3 {
                for aa in 0..3 {
                    ud[(k, aa)] += vars[3 * i + k] * d[aa];
                }
            }
        }

        basis::eval_enrich_deriv_3d(order, pt, &mut s.nr, &mut s.dnr);
        for (i, d) in s.dnr.iter().enumerate() {
            for k in 0..3 {
                for aa in 0..3 {
                    ud[(k, aa)] += ubar[3 * i + k] * d[aa];
                }
            }
        }

        // geometry from the order-elevated element
        self.interp_forest
            .eval_interp_deriv(pt, &mut s.ng, &mut s.dng);
        let (_, j, detj) = jacobian_3d(xpts, &s.dng);

        let ux = ud * j.transpose();
        let e = [
            ux[(0, 0)],
            ux[(1, 1)],
            ux[(2, 2)],
            ux[(1, 2)] + ux[(2, 1)],
            ux[(0, 2)] + ux[(2, 0)],
            ux[(0, 1)] + ux[(1, 0)],
        ];
        (j, e, detj)
    }

    /// Back-propagate a strain sensitivity onto the nodal values and the
    /// enrichment coefficients
    #[allow(clippy::too_many_arguments)]
    fn add_strain_deriv(
        &self,
        pt: &Param<3>,
        j: &Matrix3<f64>,
        alpha: f64,
        dfde: &[f64; 6],
        dfdu: &mut [f64],
        dfdubar: &mut [f64],
        s: &mut Scratch,
    ) {
        let order = self.forest.order();
        self.forest.eval_interp_deriv(pt, &mut s.n, &mut s.dn);
        basis::eval_enrich_deriv_3d(order, pt, &mut s.nr, &mut s.dnr);

        for (i, d) in s.dn.iter().enumerate() {
            let dp = j * d;
            dfdu[3 * i] += alpha * (dfde[0] * dp[0] + dfde[4] * dp[2] + dfde[5] * dp[1]);
            dfdu[3 * i + 1] += alpha * (dfde[1] * dp[1] + dfde[3] * dp[2] + dfde[5] * dp[0]);
            dfdu[3 * i + 2] += alpha * (dfde[2] * dp[2] + dfde[3] * dp[1] + dfde[4] * dp[0]);
        }

        for (i, d) in s.dnr.iter().enumerate() {
            let dp = j * d;
            dfdubar[3 * i] += alpha * (dfde[0] * dp[0] + dfde[4] * dp[2] + dfde[5] * dp[1]);
            dfdubar[3 * i + 1] += alpha * (dfde[1] * dp[1] + dfde[3] * dp[2] + dfde[5] * dp[0]);
            dfdubar[3 * i + 2] += alpha * (dfde[2] * dp[2] + dfde[3] * dp[1] + dfde[4] * dp[0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StressConstraint;
    use crate::{
        Result,
        comm::SerialComm,
        forest::{Forest, TensorForest},
        functional::test_support::{DesignFailure, SolidElement},
        vector::NodalVec,
    };
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn rod_forest() -> TensorForest<3> {
        TensorForest::<3>::unit_box([2, 1, 1], 2)
    }

    fn rod_elements(x: Vec<f64>, nelems: usize) -> Vec<SolidElement> {
        (0..nelems)
            .map(|_| SolidElement::new(DesignFailure::new(x.clone())))
            .collect()
    }

    fn rod_state(forest: &TensorForest<3>) -> NodalVec {
        // u_x = x^2 / 2 so that e_xx = x peaks at the x = 1 end
        let mut u = forest.create_vec(3);
        for (i, p) in forest.points().iter().enumerate() {
            u.as_mut_slice()[3 * i] = 0.5 * p[0] * p[0];
        }
        u
    }

    #[test]
    fn test_ks_monotone_in_weight() -> Result<()> {
        // S3: the KS value approaches the maximum failure value
        // monotonically as the aggregation weight grows
        let forest = rod_forest();
        let comm = SerialComm::new();
        let mut x = vec![0.0; 10];
        x[0] = 1.0;
        let elements = rod_elements(x, forest.n_elems());
        let u = rod_state(&forest);

        let mut gaps = Vec::new();
        let mut max_fail = 0.0;
        for ks_weight in [10.0, 100.0, 1000.0] {
            let mut ks = StressConstraint::new(&forest, ks_weight);
            let val = ks.eval_constraint(&comm, &elements, &u)?;
            max_fail = ks.max_fail();
            gaps.push((val - max_fail).abs());
        }

        // the hot spot sits at the largest Gauss abscissa of the last element
        assert!(max_fail > 0.8 && max_fail < 1.05);
        assert!(gaps[0] > gaps[1]);
        assert!(gaps[1] > gaps[2]);
        assert!(gaps[2] < 1e-2);
        Ok(())
    }

    #[test]
    fn test_ks_design_deriv_fd() -> Result<()> {
        // S4: analytic design sensitivities against central differences
        let forest = rod_forest();
        let comm = SerialComm::new();
        let mut rng = StdRng::seed_from_u64(1234);
        let x: Vec<f64> = (0..10).map(|_| 0.5 + rng.random::<f64>()).collect();
        let u = rod_state(&forest);

        let mut ks = StressConstraint::new(&forest, 10.0);
        let elements = rod_elements(x.clone(), forest.n_elems());
        ks.eval_constraint(&comm, &elements, &u)?;

        let mut dfdx = vec![0.0; 10];
        let mut dfdu = forest.create_vec(3);
        ks.eval_con_deriv(&comm, &elements, &mut dfdx, &mut dfdu, &[])?;

        let h = 1e-6;
        for j in [0, 3, 7] {
            let mut xp = x.clone();
            xp[j] += h;
            let mut xm = x.clone();
            xm[j] -= h;

            let fp = StressConstraint::new(&forest, 10.0).eval_constraint(
                &comm,
                &rod_elements(xp, forest.n_elems()),
                &u,
            )?;
            let fm = StressConstraint::new(&forest, 10.0).eval_constraint(
                &comm,
                &rod_elements(xm, forest.n_elems()),
                &u,
            )?;
            let fd = (fp - fm) / (2.0 * h);
            assert_delta!(dfdx[j], fd, 1e-5 * fd.abs().max(1.0));
        }
        Ok(())
    }

    #[test]
    fn test_ks_state_deriv_fd() -> Result<()> {
        // S4: the full state-derivative chain, including both reconstruction
        // paths, against central differences
        let forest = rod_forest();
        let comm = SerialComm::new();
        let mut rng = StdRng::seed_from_u64(4321);
        let x: Vec<f64> = (0..10).map(|_| 0.5 + rng.random::<f64>()).collect();
        let elements = rod_elements(x, forest.n_elems());

        let mut u = rod_state(&forest);
        for v in u.as_mut_slice() {
            *v += 0.05 * (rng.random::<f64>() - 0.5);
        }

        let mut ks = StressConstraint::new(&forest, 10.0);
        ks.eval_constraint(&comm, &elements, &u)?;

        let mut dfdx = vec![0.0; 10];
        let mut dfdu = forest.create_vec(3);
        ks.eval_con_deriv(&comm, &elements, &mut dfdx, &mut dfdu, &[])?;

        let h = 1e-6;
        let n_dof = u.as_slice().len();
        for dof in [0, 5, 16, n_dof - 2] {
            let mut up = u.clone();
            up.as_mut_slice()[dof] += h;
            let fp = StressConstraint::new(&forest, 10.0).eval_constraint(&comm, &elements, &up)?;

            let mut um = u.clone();
            um.as_mut_slice()[dof] -= h;
            let fm = StressConstraint::new(&forest, 10.0).eval_constraint(&comm, &elements, &um)?;

            let fd = (fp - fm) / (2.0 * h);
            assert_delta!(dfdu.as_slice()[dof], fd, 1e-5 * fd.abs().max(1e-3));
        }
        Ok(())
    }

    #[test]
    fn test_ks_state_deriv_fd_order3() -> Result<()> {
        // the end knots of an order-3 element carry weight 1/2, which must
        // show up in the dubar/duderiv chain
        let forest = TensorForest::<3>::unit_box([1, 1, 1], 3);
        let comm = SerialComm::new();
        let mut rng = StdRng::seed_from_u64(99);
        let x: Vec<f64> = (0..10).map(|_| 0.5 + rng.random::<f64>()).collect();
        let elements = rod_elements(x, forest.n_elems());

        let mut u = rod_state(&forest);
        for v in u.as_mut_slice() {
            *v += 0.05 * (rng.random::<f64>() - 0.5);
        }

        let mut ks = StressConstraint::new(&forest, 10.0);
        ks.eval_constraint(&comm, &elements, &u)?;

        let mut dfdx = vec![0.0; 10];
        let mut dfdu = forest.create_vec(3);
        ks.eval_con_deriv(&comm, &elements, &mut dfdx, &mut dfdu, &[])?;

        let h = 1e-6;
        for dof in [1, 13, 40] {
            let mut up = u.clone();
            up.as_mut_slice()[dof] += h;
            let fp = StressConstraint::new(&forest, 10.0).eval_constraint(&comm, &elements, &up)?;

            let mut um = u.clone();
            um.as_mut_slice()[dof] -= h;
            let fm = StressConstraint::new(&forest, 10.0).eval_constraint(&comm, &elements, &um)?;

            let fd = (fp - fm) / (2.0 * h);
            assert_delta!(dfdu.as_slice()[dof], fd, 1e-5 * fd.abs().max(1e-3));
        }
        Ok(())
    }

    #[test]
    fn test_bc_mask() -> Result<()> {
        let forest = rod_forest();
        let comm = SerialComm::new();
        let mut x = vec![0.0; 10];
        x[0] = 1.0;
        let elements = rod_elements(x, forest.n_elems());
        let u = rod_state(&forest);

        let mut ks = StressConstraint::new(&forest, 10.0);
        ks.eval_constraint(&comm, &elements, &u)?;

        let mut dfdx = vec![0.0; 10];
        let mut dfdu = forest.create_vec(3);
        ks.eval_con_deriv(&comm, &elements, &mut dfdx, &mut dfdu, &[0, 2])?;

        for node in [0usize, 2] {
            for c in 0..3 {
                assert_delta!(dfdu.as_slice()[3 * node + c], 0.0, 1e-30);
            }
        }
        Ok(())
    }
}
