//! Adjoint-weighted residual error estimator.
//!
//! The element collaborator deposits a nodal-distributed localized error
//! (the adjoint-weighted element residual on the refined mesh); summing it
//! over the element corner nodes gives the per-element refinement indicator,
//! and summing everything gives the adjoint correction of the functional.
use log::{debug, info};

use crate::{
    Result, Vert3d,
    comm::Comm,
    element::Element,
    forest::Forest,
    vector::{NodalVec, SetMode},
};

/// Adjoint-weighted residual estimate on a shell forest.
///
/// `elements` are bound to the refined mesh; `aux` holds any auxiliary
/// (surface-traction) elements as `(element id, collaborator)` pairs sorted
/// by element id. `adj_refined` is the refined-minus-coarse adjoint. Returns
/// the absolute total error and the adjoint correction.
pub fn adjoint_error_est_2d<F: Forest<2>, E: Element, A: Element, C: Comm>(
    refined: &F,
    elements: &[E],
    aux: &[(usize, A)],
    u_refined: &mut NodalVec,
    adj_refined: &mut NodalVec,
    comm: &C,
    error: &mut [f64],
) -> Result<(f64, f64)> {
    debug!("Adjoint-weighted residual estimate on the shell forest");
    let nelems = refined.n_elems();
    assert_eq!(elements.len(), nelems);
    assert_eq!(error.len(), nelems);
    debug_assert!(aux.windows(2).all(|w| w[0].0 <= w[1].0));

    let vars_per_node = u_refined.block_size();
    let refined_order = refined.order();
    let num_refined_nodes = refined_order * refined_order;

    u_refined.begin_distribute_values();
    adj_refined.begin_distribute_values();
    u_refined.end_distribute_values();
    adj_refined.end_distribute_values();

    let mut nodal_error = refined.create_vec(1);

    let mut vars_interp = vec![0.0; vars_per_node * num_refined_nodes];
    let mut adj_interp = vec![0.0; vars_per_node * num_refined_nodes];
    let mut err = vec![0.0; num_refined_nodes];
    let mut xpts = vec![Vert3d::zeros(); num_refined_nodes];

    let time = 0.0;
    let mut total_corr = 0.0;
    let mut aux_count = 0;
    for (elem, element) in elements.iter().enumerate() {
        let refined_nodes = refined.elem_nodes(elem);
        refined.elem_points(elem, &mut xpts);

        u_refined.get_values(refined_nodes, &mut vars_interp);
        adj_refined.get_values(refined_nodes, &mut adj_interp);

        err.fill(0.0);
        element.add_localized_error(time, &mut err, &adj_interp, &xpts, &vars_interp);

        while aux_count < aux.len() && aux[aux_count].0 == elem {
            aux[aux_count]
                .1
                .add_localized_error(time, &mut err, &adj_interp, &xpts, &vars_interp);
            aux_count += 1;
        }

        total_corr += err.iter().sum::<f64>();
        nodal_error.set_values(refined_nodes, &err, SetMode::Add);
    }

    nodal_error.begin_set_values(SetMode::Add);
    nodal_error.end_set_values(SetMode::Add);

    nodal_error.begin_distribute_values();
    nodal_error.end_distribute_values();

    // element indicators from the corner nodes
    let mut total_error = 0.0;
    for (elem, e) in error.iter_mut().enumerate() {
        let refined_nodes = refined.elem_nodes(elem);
        nodal_error.get_values(refined_nodes, &mut err);

        let mut estimate = 0.0;
        for j in 0..2 {
            for i in 0..2 {
                estimate += err[(refined_order - 1) * i + (refined_order - 1) * j * refined_order];
            }
        }
        *e = 0.25 * estimate.abs();
        total_error += *e;
    }

    let mut totals = [total_error, total_corr];
    comm.allreduce_sum(&mut totals);
    info!(
        "Adjoint error estimate: {:.6e}, correction: {:.6e}",
        totals[0], totals[1]
    );
    Ok((totals[0], totals[1]))
}

/// Adjoint-weighted residual estimate on an octree forest
pub fn adjoint_error_est_3d<F: Forest<3>, E: Element, A: Element, C: Comm>(
    refined: &F,
    elements: &[E],
    aux: &[(usize, A)],
    u_refined: &mut NodalVec,
    adj_refined: &mut NodalVec,
    comm: &C,
    error: &mut [f64],
) -> Result<(f64, f64)> {
    debug!("Adjoint-weighted residual estimate on the octree forest");
    let nelems = refined.n_elems();
    assert_eq!(elements.len(), nelems);
    assert_eq!(error.len(), nelems);
    debug_assert!(aux.windows(2).all(|w| w[0].0 <= w[1].0));

    let vars_per_node = u_refined.block_size();
    let refined_order = refined.order();
    let num_refined_nodes = refined_order * refined_order * refined_order;

    u_refined.begin_distribute_values();
    adj_refined.begin_distribute_values();
    u_refined.end_distribute_values();
    adj_refined.end_distribute_values();

    let mut nodal_error = refined.create_vec(1);

    let mut vars_interp = vec![0.0; vars_per_node * num_refined_nodes];
    let mut adj_interp = vec![0.0; vars_per_node * num_refined_nodes];
    let mut err = vec![0.0; num_refined_nodes];
    let mut xpts = vec![Vert3d::zeros(); num_refined_nodes];

    let time = 0.0;
    let mut total_corr = 0.0;
    let mut aux_count = 0;
    for (elem, element) in elements.iter().enumerate() {
        let refined_nodes = refined.elem_nodes(elem);
        refined.elem_points(elem, &mut xpts);

        u_refined.get_values(refined_nodes, &mut vars_interp);
        adj_refined.get_values(refined_nodes, &mut adj_interp);

        err.fill(0.0);
        element.add_localized_error(time, &mut err, &adj_interp, &xpts, &vars_interp);

        while aux_count < aux.len() && aux[aux_count].0 == elem {
            aux[aux_count]
                .1
                .add_localized_error(time, &mut err, &adj_interp, &xpts, &vars_interp);
            aux_count += 1;
        }

        total_corr += err.iter().sum::<f64>();
        nodal_error.set_values(refined_nodes, &err, SetMode::Add);
    }

    nodal_error.begin_set_values(SetMode::Add);
    nodal_error.end_set_values(SetMode::Add);

    nodal_error.begin_distribute_values();
    nodal_error.end_distribute_values();

    let mut total_error = 0.0;
    for (elem, e) in error.iter_mut().enumerate() {
        let refined_nodes = refined.elem_nodes(elem);
        nodal_error.get_values(refined_nodes, &mut err);

        let mut estimate = 0.0;
        for k in 0..2 {
            for j in 0..2 {
                for i in 0..2 {
                    estimate += err[(refined_order - 1) * i
                        + (refined_order - 1) * j * refined_order
                        + (refined_order - 1) * k * refined_order * refined_order];
                }
            }
        }
        *e = 0.125 * estimate.abs();
        total_error += *e;
    }

    let mut totals = [total_error, total_corr];
    comm.allreduce_sum(&mut totals);
    info!(
        "Adjoint error estimate: {:.6e}, correction: {:.6e}",
        totals[0], totals[1]
    );
    Ok((totals[0], totals[1]))
}

#[cfg(test)]
mod tests {
    use super::adjoint_error_est_3d;
    use crate::{
        Result, Vert3d,
        comm::SerialComm,
        forest::{Forest, TensorForest},
        functional::test_support::DirichletElement,
    };

    fn nodal_field(
        forest: &TensorForest<3>,
        f: impl Fn(&Vert3d) -> f64,
    ) -> crate::vector::NodalVec {
        let mut u = forest.create_vec(1);
        for (i, p) in forest.points().iter().enumerate() {
            u.as_mut_slice()[i] = f(p);
        }
        u
    }

    #[test]
    fn test_zero_residual_zero_error() -> Result<()> {
        // a linear field has zero interior Laplace residual; with an adjoint
        // supported away from the boundary both the correction and every
        // indicator vanish
        let refined = TensorForest::<3>::unit_box([2, 2, 2], 3);
        let comm = SerialComm::new();

        let elements: Vec<_> = (0..refined.n_elems())
            .map(|_| DirichletElement::new(refined.order()))
            .collect();
        let aux: Vec<(usize, DirichletElement)> = Vec::new();

        let mut u = nodal_field(&refined, |p| 1.0 + p[0] + 2.0 * p[1] - p[2]);
        let interior = |p: &Vert3d| {
            p.iter()
                .all(|&x| x > 1e-12 && x < 1.0 - 1e-12)
        };
        let mut adj = nodal_field(&refined, |p| if interior(p) { p[0] * p[1] } else { 0.0 });

        let mut error = vec![0.0; refined.n_elems()];
        let (total, corr) = adjoint_error_est_3d(
            &refined, &elements, &aux, &mut u, &mut adj, &comm, &mut error,
        )?;

        assert_delta!(corr, 0.0, 1e-12);
        assert_delta!(total, 0.0, 1e-12);
        Ok(())
    }

    #[test]
    fn test_indicator_sums_match_total() -> Result<()> {
        let refined = TensorForest::<3>::unit_box([2, 2, 2], 3);
        let comm = SerialComm::new();

        let elements: Vec<_> = (0..refined.n_elems())
            .map(|_| DirichletElement::new(refined.order()))
            .collect();
        let aux: Vec<(usize, DirichletElement)> = Vec::new();

        let mut u = nodal_field(&refined, |p| p[0] * p[0] * p[1] + p[2]);
        let mut adj = nodal_field(&refined, |p| p[0] + 0.3 * p[1] * p[2]);

        let mut error = vec![0.0; refined.n_elems()];
        let (total, corr) = adjoint_error_est_3d(
            &refined, &elements, &aux, &mut u, &mut adj, &comm, &mut error,
        )?;

        // the element-wise indicator sums equal the returned total
        assert_delta!(total, error.iter().sum::<f64>(), 1e-14);
        assert!(corr.abs() > 1e-12);
        Ok(())
    }

    #[test]
    fn test_aux_elements_add_to_correction() -> Result<()> {
        let refined = TensorForest::<3>::unit_box([2, 1, 1], 3);
        let comm = SerialComm::new();

        let elements: Vec<_> = (0..refined.n_elems())
            .map(|_| DirichletElement::new(refined.order()))
            .collect();

        let mut u = nodal_field(&refined, |p| p[0] * p[0]);
        let mut adj = nodal_field(&refined, |p| p[0] * p[1] * p[2]);

        let mut error = vec![0.0; refined.n_elems()];
        let aux: Vec<(usize, DirichletElement)> = Vec::new();
        let (_, corr) = adjoint_error_est_3d(
            &refined, &elements, &aux, &mut u, &mut adj, &comm, &mut error,
        )?;

        // binding a traction-like element to element 0 doubles its deposit
        let aux = vec![(0, DirichletElement::new(refined.order()))];
        let (_, corr_aux) = adjoint_error_est_3d(
            &refined, &elements, &aux, &mut u, &mut adj, &comm, &mut error,
        )?;
        assert!((corr_aux - corr).abs() > 1e-12);
        Ok(())
    }
}
