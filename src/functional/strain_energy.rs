//! Strain-energy refinement indicator.
//!
//! For linear analysis the energy identity `a(u - uh, u - uh) = a(u, u) -
//! a(uh, uh)` holds by Galerkin orthogonality, so the energy of the
//! reconstruction delta on each element localizes the discretization error.
//! Each element reconstructs its enrichment delta on the order-elevated mesh
//! and hands it to the element collaborator's energy callback; the absolute
//! potential energy is the element indicator.
use log::{debug, info};

use crate::{
    Param, Result, Vert3d, basis,
    comm::Comm,
    element::Element,
    forest::Forest,
    recon::{
        compute_elem_recon_2d, compute_elem_recon_3d, compute_local_weights,
        compute_node_deriv_2d, compute_node_deriv_3d,
    },
    vector::NodalVec,
};

/// Strain-energy error estimate on a shell forest.
///
/// `elements` are the element collaborators bound to the refined mesh. On
/// return `error` holds the per-element indicators; the global estimate is
/// sum-reduced over all processes.
pub fn strain_energy_error_est_2d<F: Forest<2>, E: Element, C: Comm>(
    forest: &F,
    refined: &F,
    elements: &[E],
    u: &mut NodalVec,
    comm: &C,
    error: &mut [f64],
) -> Result<f64> {
    debug!("Strain-energy error estimate on the shell forest");
    let nelems = forest.n_elems();
    assert_eq!(elements.len(), nelems);
    assert_eq!(error.len(), nelems);

    let vars_per_node = u.block_size();
    let deriv_per_node = 3 * vars_per_node;
    let order = forest.order();
    let refined_order = refined.order();
    let refined_knots = refined.knots().to_vec();
    let num_nodes = order * order;
    let num_refined_nodes = refined_order * refined_order;
    let nenrich = basis::n_enrich_2d(order);

    u.begin_distribute_values();
    u.end_distribute_values();

    let mut weights = forest.create_vec(1);
    compute_local_weights(forest, &mut weights, None);

    let mut uderiv = forest.create_vec(deriv_per_node);
    compute_node_deriv_2d(forest, u, &weights, &mut uderiv, None);

    let mut uelem = vec![0.0; vars_per_node * num_nodes];
    let mut delem = vec![0.0; deriv_per_node * num_nodes];
    let mut ubar = vec![0.0; vars_per_node * nenrich];
    let mut vars_interp = vec![0.0; vars_per_node * num_refined_nodes];
    let dvars = vec![0.0; vars_per_node * num_refined_nodes];
    let mut xpts = vec![Vert3d::zeros(); num_refined_nodes];
    let mut nr = vec![0.0; nenrich];

    let time = 0.0;
    let mut total = [0.0];
    for (elem, (element, err)) in elements.iter().zip(error.iter_mut()).enumerate() {
        let nodes = forest.elem_nodes(elem);
        u.get_values(nodes, &mut uelem);
        uderiv.get_values(nodes, &mut delem);
        refined.elem_points(elem, &mut xpts);

        compute_elem_recon_2d(
            vars_per_node,
            forest,
            refined,
            &xpts,
            &uelem,
            &delem,
            &mut ubar,
        )?;

        // the enrichment delta on the refined element
        vars_interp.fill(0.0);
        for m in 0..refined_order {
            for nn in 0..refined_order {
                let pt = Param::<2>::new(refined_knots[nn], refined_knots[m]);
                basis::eval_enrich_2d(order, &pt, &refined_knots, &mut nr);

                let offset = vars_per_node * (nn + refined_order * m);
                for (k, &nk) in nr.iter().enumerate() {
                    for kk in 0..vars_per_node {
                        vars_interp[offset + kk] += nk * ubar[vars_per_node * k + kk];
                    }
                }
            }
        }

        let (_, pe) = element.compute_energies(time, &xpts, &vars_interp, &dvars);
        *err = pe.abs();
        total[0] += *err;
    }

    comm.allreduce_sum(&mut total);
    info!("Strain-energy error estimate: {:.6e}", total[0]);
    Ok(total[0])
}

/// Strain-energy error estimate on an octree forest
pub fn strain_energy_error_est_3d<F: Forest<3>, E: Element, C: Comm>(
    forest: &F,
    refined: &F,
    elements: &[E],
    u: &mut NodalVec,
    comm: &C,
    error: &mut [f64],
) -> Result<f64> {
    debug!("Strain-energy error estimate on the octree forest");
    let nelems = forest.n_elems();
    assert_eq!(elements.len(), nelems);
    assert_eq!(error.len(), nelems);

    let vars_per_node = u.block_size();
    let deriv_per_node = 3 * vars_per_node;
    let order = forest.order();
    let refined_order = refined.order();
    let refined_knots = refined.knots().to_vec();
    let num_nodes = order * order * order;
    let num_refined_nodes = refined_order * refined_order * refined_order;
    let nenrich = basis::n_enrich_3d(order);

    u.begin_distribute_values();
    u.end_distribute_values();

    let mut weights = forest.create_vec(1);
    compute_local_weights(forest, &mut weights, None);

    let mut uderiv = forest.create_vec(deriv_per_node);
    compute_node_deriv_3d(forest, u, &weights, &mut uderiv, None);

    let mut uelem = vec![0.0; vars_per_node * num_nodes];
    let mut delem = vec![0.0; deriv_per_node * num_nodes];
    let mut ubar = vec![0.0; vars_per_node * nenrich];
    let mut vars_interp = vec![0.0; vars_per_node * num_refined_nodes];
    let dvars = vec![0.0; vars_per_node * num_refined_nodes];
    let mut xpts = vec![Vert3d::zeros(); num_refined_nodes];
    let mut nr = vec![0.0; nenrich];

    let time = 0.0;
    let mut total = [0.0];
    for (elem, (element, err)) in elements.iter().zip(error.iter_mut()).enumerate() {
        let nodes = forest.elem_nodes(elem);
        u.get_values(nodes, &mut uelem);
        uderiv.get_values(nodes, &mut delem);
        refined.elem_points(elem, &mut xpts);

        compute_elem_recon_3d(
            vars_per_node,
            forest,
            refined,
            &xpts,
            &uelem,
            &delem,
            &mut ubar,
        )?;

        vars_interp.fill(0.0);
        for p in 0..refined_order {
            for m in 0..refined_order {
                for nn in 0..refined_order {
                    let pt = Param::<3>::new(refined_knots[nn], refined_knots[m], refined_knots[p]);
                    basis::eval_enrich_3d(order, &pt, &mut nr);

                    let offset =
                        vars_per_node * (nn + refined_order * m + refined_order * refined_order * p);
                    for (k, &nk) in nr.iter().enumerate() {
                        for kk in 0..vars_per_node {
                            vars_interp[offset + kk] += nk * ubar[vars_per_node * k + kk];
                        }
                    }
                }
            }
        }

        let (_, pe) = element.compute_energies(time, &xpts, &vars_interp, &dvars);
        *err = pe.abs();
        total[0] += *err;
    }

    comm.allreduce_sum(&mut total);
    info!("Strain-energy error estimate: {:.6e}", total[0]);
    Ok(total[0])
}
