//! Assembly of the reconstructed field on the order-elevated mesh.
//!
//! Each coarse element evaluates its reconstruction (or only the enrichment
//! delta) at the knots of the embedded refined element and adds the values
//! into the refined nodal vector. Shared refined nodes accumulate one
//! contribution per referencing element; dividing by the refined-mesh weight
//! afterwards yields the patch-averaged reconstruction.
use log::debug;

use crate::{
    Param, Result, Vert3d, basis,
    forest::Forest,
    recon::{
        compute_elem_recon_2d, compute_elem_recon_3d, compute_local_weights,
        compute_node_deriv_2d, compute_node_deriv_3d,
    },
    vector::{NodalVec, SetMode},
};

/// Add the per-element reconstruction of a shell forest into `u_refined`.
///
/// With `compute_difference` only the enrichment delta is assembled. The
/// caller finalizes the additions and normalizes by the refined-mesh weights.
pub fn add_refined_solution_2d<F: Forest<2>>(
    forest: &F,
    refined: &F,
    u: &NodalVec,
    uderiv: &NodalVec,
    u_refined: &mut NodalVec,
    compute_difference: bool,
    elems: Option<&[usize]>,
) -> Result<()> {
    let vars_per_node = u.block_size();
    let deriv_per_node = 3 * vars_per_node;

    let order = forest.order();
    let refined_order = refined.order();
    let refined_knots = refined.knots().to_vec();
    let num_nodes = order * order;
    let num_refined_nodes = refined_order * refined_order;
    debug_assert_eq!(num_refined_nodes, refined.elem_size());

    let nenrich = basis::n_enrich_2d(order);

    let mut uelem = vec![0.0; vars_per_node * num_nodes];
    let mut delem = vec![0.0; deriv_per_node * num_nodes];
    let mut ubar = vec![0.0; vars_per_node * nenrich];
    let mut uref = vec![0.0; vars_per_node * num_refined_nodes];
    let mut xpts = vec![Vert3d::zeros(); num_refined_nodes];
    let mut n = vec![0.0; num_nodes];
    let mut nr = vec![0.0; nenrich];

    let nelems = elems.map_or(forest.n_elems(), <[usize]>::len);
    for index in 0..nelems {
        let elem = elems.map_or(index, |e| e[index]);
        let nodes = forest.elem_nodes(elem);
        let refined_nodes = refined.elem_nodes(elem);

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

        uref.fill(0.0);
        for m in 0..refined_order {
            for nn in 0..refined_order {
                let pt = Param::<2>::new(refined_knots[nn], refined_knots[m]);
                let offset = vars_per_node * (nn + refined_order * m);

                if !compute_difference {
                    forest.eval_interp(&pt, &mut n);
                    for (k, &nk) in n.iter().enumerate() {
                        for kk in 0..vars_per_node {
                            uref[offset + kk] += nk * uelem[vars_per_node * k + kk];
                        }
                    }
                }

                basis::eval_enrich_2d(order, &pt, &refined_knots, &mut nr);
                for (k, &nk) in nr.iter().enumerate() {
                    for kk in 0..vars_per_node {
                        uref[offset + kk] += nk * ubar[vars_per_node * k + kk];
                    }
                }
            }
        }

        // nothing is ever written to a dependent slot
        for (i, &node) in refined_nodes.iter().enumerate() {
            if node < 0 {
                uref[vars_per_node * i..vars_per_node * (i + 1)].fill(0.0);
            }
        }

        u_refined.set_values(refined_nodes, &uref, SetMode::Add);
    }
    Ok(())
}

/// Add the per-element reconstruction of an octree forest into `u_refined`.
pub fn add_refined_solution_3d<F: Forest<3>>(
    forest: &F,
    refined: &F,
    u: &NodalVec,
    uderiv: &NodalVec,
    u_refined: &mut NodalVec,
    compute_difference: bool,
    elems: Option<&[usize]>,
) -> Result<()> {
    let vars_per_node = u.block_size();
    let deriv_per_node = 3 * vars_per_node;

    let order = forest.order();
    let refined_order = refined.order();
    let refined_knots = refined.knots().to_vec();
    let num_nodes = order * order * order;
    let num_refined_nodes = refined_order * refined_order * refined_order;
    debug_assert_eq!(num_refined_nodes, refined.elem_size());

    let nenrich = basis::n_enrich_3d(order);

    let mut uelem = vec![0.0; vars_per_node * num_nodes];
    let mut delem = vec![0.0; deriv_per_node * num_nodes];
    let mut ubar = vec![0.0; vars_per_node * nenrich];
    let mut uref = vec![0.0; vars_per_node * num_refined_nodes];
    let mut xpts = vec![Vert3d::zeros(); num_refined_nodes];
    let mut n = vec![0.0; num_nodes];
    let mut nr = vec![0.0; nenrich];

    let nelems = elems.map_or(forest.n_elems(), <[usize]>::len);
    for index in 0..nelems {
        let elem = elems.map_or(index, |e| e[index]);
        let nodes = forest.elem_nodes(elem);
        let refined_nodes = refined.elem_nodes(elem);

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

        uref.fill(0.0);
        for p in 0..refined_order {
            for m in 0..refined_order {
                for nn in 0..refined_order {
                    let pt = Param::<3>::new(refined_knots[nn], refined_knots[m], refined_knots[p]);
                    let offset =
                        vars_per_node * (nn + refined_order * m + refined_order * refined_order * p);

                    if !compute_difference {
                        forest.eval_interp(&pt, &mut n);
                        for (k, &nk) in n.iter().enumerate() {
                            for kk in 0..vars_per_node {
                                uref[offset + kk] += nk * uelem[vars_per_node * k + kk];
                            }
                        }
                    }

                    basis::eval_enrich_3d(order, &pt, &mut nr);
                    for (k, &nk) in nr.iter().enumerate() {
                        for kk in 0..vars_per_node {
                            uref[offset + kk] += nk * ubar[vars_per_node * k + kk];
                        }
                    }
                }
            }
        }

        for (i, &node) in refined_nodes.iter().enumerate() {
            if node < 0 {
                uref[vars_per_node * i..vars_per_node * (i + 1)].fill(0.0);
            }
        }

        u_refined.set_values(refined_nodes, &uref, SetMode::Add);
    }
    Ok(())
}

/// Interpolate the coarse field directly at the refined-mesh knots.
///
/// No enrichment and no averaging: each refined node is either interior to
/// one coarse element or on a shared boundary where insertion is consistent,
/// so insert-nonzero semantics suffice.
pub fn compute_interp_solution_2d<F: Forest<2>>(
    forest: &F,
    refined: &F,
    u: &mut NodalVec,
    u_refined: &mut NodalVec,
) {
    debug!("Interpolate the solution on the order-elevated shell forest");
    let vars_per_node = u.block_size();
    let refined_order = refined.order();
    let refined_knots = refined.knots().to_vec();
    let num_nodes = forest.elem_size();
    let num_refined_nodes = refined.elem_size();

    u_refined.zero();
    u.begin_distribute_values();
    u.end_distribute_values();

    let mut uelem = vec![0.0; vars_per_node * num_nodes];
    let mut uinterp = vec![0.0; vars_per_node * num_refined_nodes];
    let mut n = vec![0.0; num_nodes];

    for elem in 0..forest.n_elems() {
        let nodes = forest.elem_nodes(elem);
        u.get_values(nodes, &mut uelem);

        uinterp.fill(0.0);
        for m in 0..refined_order {
            for nn in 0..refined_order {
                let pt = Param::<2>::new(refined_knots[nn], refined_knots[m]);
                forest.eval_interp(&pt, &mut n);

                let offset = vars_per_node * (nn + refined_order * m);
                for (k, &nk) in n.iter().enumerate() {
                    for kk in 0..vars_per_node {
                        uinterp[offset + kk] += nk * uelem[vars_per_node * k + kk];
                    }
                }
            }
        }

        let refined_nodes = refined.elem_nodes(elem);
        u_refined.set_values(refined_nodes, &uinterp, SetMode::InsertNonZero);
    }

    u_refined.begin_set_values(SetMode::InsertNonZero);
    u_refined.end_set_values(SetMode::InsertNonZero);

    u_refined.begin_distribute_values();
    u_refined.end_distribute_values();
}

/// Interpolate the coarse field directly at the refined-mesh knots of an
/// octree forest
pub fn compute_interp_solution_3d<F: Forest<3>>(
    forest: &F,
    refined: &F,
    u: &mut NodalVec,
    u_refined: &mut NodalVec,
) {
    debug!("Interpolate the solution on the order-elevated octree forest");
    let vars_per_node = u.block_size();
    let refined_order = refined.order();
    let refined_knots = refined.knots().to_vec();
    let num_nodes = forest.elem_size();
    let num_refined_nodes = refined.elem_size();

    u_refined.zero();
    u.begin_distribute_values();
    u.end_distribute_values();

    let mut uelem = vec![0.0; vars_per_node * num_nodes];
    let mut uinterp = vec![0.0; vars_per_node * num_refined_nodes];
    let mut n = vec![0.0; num_nodes];

    for elem in 0..forest.n_elems() {
        let nodes = forest.elem_nodes(elem);
        u.get_values(nodes, &mut uelem);

        uinterp.fill(0.0);
        for p in 0..refined_order {
            for m in 0..refined_order {
                for nn in 0..refined_order {
                    let pt = Param::<3>::new(refined_knots[nn], refined_knots[m], refined_knots[p]);
                    forest.eval_interp(&pt, &mut n);

                    let offset =
                        vars_per_node * (nn + refined_order * m + refined_order * refined_order * p);
                    for (k, &nk) in n.iter().enumerate() {
                        for kk in 0..vars_per_node {
                            uinterp[offset + kk] += nk * uelem[vars_per_node * k + kk];
                        }
                    }
                }
            }
        }

        let refined_nodes = refined.elem_nodes(elem);
        u_refined.set_values(refined_nodes, &uinterp, SetMode::InsertNonZero);
    }

    u_refined.begin_set_values(SetMode::InsertNonZero);
    u_refined.end_set_values(SetMode::InsertNonZero);

    u_refined.begin_distribute_values();
    u_refined.end_distribute_values();
}

/// Compute the patch-averaged reconstruction of `u` on the order-elevated
/// shell forest, one topology name group at a time
pub fn compute_recon_solution_2d<F: Forest<2>>(
    forest: &F,
    refined: &F,
    u: &mut NodalVec,
    u_refined: &mut NodalVec,
    compute_difference: bool,
) -> Result<()> {
    debug!("Reconstruct the solution on the order-elevated shell forest");
    let vars_per_node = u.block_size();

    u_refined.zero();
    u.begin_distribute_values();
    u.end_distribute_values();

    let mut weights = forest.create_vec(1);
    let mut uderiv = forest.create_vec(3 * vars_per_node);

    for name in forest.group_names() {
        let elems = forest.elems_with_name(&name);
        if elems.is_empty() {
            continue;
        }
        compute_local_weights(forest, &mut weights, Some(&elems));
        compute_node_deriv_2d(forest, u, &weights, &mut uderiv, Some(&elems));
        add_refined_solution_2d(
            forest,
            refined,
            u,
            &uderiv,
            u_refined,
            compute_difference,
            Some(&elems),
        )?;
    }

    u_refined.begin_set_values(SetMode::Add);
    u_refined.end_set_values(SetMode::Add);

    let mut weights_refined = refined.create_vec(1);
    compute_local_weights(refined, &mut weights_refined, None);

    normalize_by_weights(u_refined, &weights_refined);

    u_refined.begin_distribute_values();
    u_refined.end_distribute_values();
    Ok(())
}

/// Compute the patch-averaged reconstruction of `u` on the order-elevated
/// octree forest, one topology name group at a time
pub fn compute_recon_solution_3d<F: Forest<3>>(
    forest: &F,
    refined: &F,
    u: &mut NodalVec,
    u_refined: &mut NodalVec,
    compute_difference: bool,
) -> Result<()> {
    debug!("Reconstruct the solution on the order-elevated octree forest");
    let vars_per_node = u.block_size();

    u_refined.zero();
    u.begin_distribute_values();
    u.end_distribute_values();

    let mut weights = forest.create_vec(1);
    let mut uderiv = forest.create_vec(3 * vars_per_node);

    for name in forest.group_names() {
        let elems = forest.elems_with_name(&name);
        if elems.is_empty() {
            continue;
        }
        compute_local_weights(forest, &mut weights, Some(&elems));
        compute_node_deriv_3d(forest, u, &weights, &mut uderiv, Some(&elems));
        add_refined_solution_3d(
            forest,
            refined,
            u,
            &uderiv,
            u_refined,
            compute_difference,
            Some(&elems),
        )?;
    }

    u_refined.begin_set_values(SetMode::Add);
    u_refined.end_set_values(SetMode::Add);

    let mut weights_refined = refined.create_vec(1);
    compute_local_weights(refined, &mut weights_refined, None);

    normalize_by_weights(u_refined, &weights_refined);

    u_refined.begin_distribute_values();
    u_refined.end_distribute_values();
    Ok(())
}

/// Divide each node block by its element-reference count; together with the
/// preceding additions this implements the patch average at shared nodes
fn normalize_by_weights(u: &mut NodalVec, weights: &NodalVec) {
    let bs = u.block_size();
    let w = weights.as_slice();
    for (i, &wi) in w.iter().enumerate() {
        if wi > 0.0 {
            let winv = 1.0 / wi;
            for v in &mut u.as_mut_slice()[bs * i..bs * (i + 1)] {
                *v *= winv;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Result, Vert3d,
        forest::{Forest, TensorForest},
        recon::{compute_interp_solution_3d, compute_recon_solution_2d, compute_recon_solution_3d},
    };

    fn nodal_field<const D: usize>(
        forest: &TensorForest<D>,
        f: impl Fn(&Vert3d) -> f64,
    ) -> crate::vector::NodalVec {
        let mut u = forest.create_vec(1);
        for (i, p) in forest.points().iter().enumerate() {
            u.as_mut_slice()[i] = f(p);
        }
        u
    }

    #[test]
    fn test_patch_test_3d() -> Result<()> {
        // S1: u = 1 + x + y + z on a 2x2x2 cube of order 2 is reproduced at
        // every refined node
        let forest = TensorForest::<3>::unit_box([2, 2, 2], 2);
        let refined = forest.elevated();

        let f = |p: &Vert3d| 1.0 + p[0] + p[1] + p[2];
        let mut u = nodal_field(&forest, f);
        let mut u_refined = refined.create_vec(1);

        compute_recon_solution_3d(&forest, &refined, &mut u, &mut u_refined, false)?;

        for (i, p) in refined.points().iter().enumerate() {
            assert_delta!(u_refined.as_slice()[i], f(p), 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_patch_test_difference_3d() -> Result<()> {
        // the enrichment delta of a linear field is identically zero
        let forest = TensorForest::<3>::unit_box([2, 2, 2], 2);
        let refined = forest.elevated();

        let mut u = nodal_field(&forest, |p| 1.0 + p[0] + p[1] + p[2]);
        let mut u_refined = refined.create_vec(1);

        compute_recon_solution_3d(&forest, &refined, &mut u, &mut u_refined, true)?;

        for &v in u_refined.as_slice() {
            assert_delta!(v, 0.0, 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_quadratic_interior_3d() -> Result<()> {
        // S2: u = 1 + 2x + 3y - x^2; refined nodes interior to elements whose
        // nodal derivatives are exact are reproduced exactly
        let forest = TensorForest::<3>::unit_box([4, 1, 1], 2);
        let refined = forest.elevated();

        let f = |p: &Vert3d| 1.0 + 2.0 * p[0] + 3.0 * p[1] - p[0] * p[0];
        let mut u = nodal_field(&forest, f);
        let mut u_refined = refined.create_vec(1);

        compute_recon_solution_3d(&forest, &refined, &mut u, &mut u_refined, false)?;

        // refined nodes coinciding with coarse nodes are exact everywhere
        for (i, p) in refined.points().iter().enumerate() {
            let on_coarse = forest.points().iter().any(|q| (p - q).norm() < 1e-12);
            if on_coarse {
                assert_delta!(u_refined.as_slice()[i], f(p), 1e-12);
            }
        }

        // nodes interior to the two middle elements (x-slopes exact at all
        // their nodes) are exact as well
        let ro = refined.order();
        for elem in [1, 2] {
            let refined_nodes = refined.elem_nodes(elem);
            for kk in 1..ro - 1 {
                for jj in 1..ro - 1 {
                    for ii in 1..ro - 1 {
                        let node = refined_nodes[ii + ro * jj + ro * ro * kk];
                        let p = &refined.points()[node as usize];
                        assert_delta!(u_refined.as_slice()[node as usize], f(p), 1e-10);
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_patch_test_2d_shell() -> Result<()> {
        let forest = TensorForest::<2>::unit_box([2, 2], 2);
        let refined = forest.elevated();

        let f = |p: &Vert3d| 2.0 - p[0] + 4.0 * p[1];
        let mut u = nodal_field(&forest, f);
        let mut u_refined = refined.create_vec(1);

        compute_recon_solution_2d(&forest, &refined, &mut u, &mut u_refined, false)?;

        for (i, p) in refined.points().iter().enumerate() {
            assert_delta!(u_refined.as_slice()[i], f(p), 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_recon_with_groups() -> Result<()> {
        // the group-wise sweep restricts the derivative stencils to each
        // group, which leaves linear fields exactly reproduced
        let f = |p: &Vert3d| 1.0 - 2.0 * p[0] + p[1] + 3.0 * p[2];

        let mut grouped = TensorForest::<3>::unit_box([2, 2, 1], 2);
        grouped.set_group("left", vec![0, 2]);
        grouped.set_group("right", vec![1, 3]);
        let refined = grouped.elevated();
        let mut u = nodal_field(&grouped, f);
        let mut u_refined = refined.create_vec(1);
        compute_recon_solution_3d(&grouped, &refined, &mut u, &mut u_refined, false)?;

        for (i, p) in refined.points().iter().enumerate() {
            assert_delta!(u_refined.as_slice()[i], f(p), 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_interp_solution_3d() {
        // plain order elevation reproduces any field the coarse basis spans
        let forest = TensorForest::<3>::unit_box([2, 2, 2], 2);
        let refined = forest.elevated();

        let f = |p: &Vert3d| 1.0 + p[0] - 2.0 * p[1] + 0.5 * p[0] * p[1] * p[2];
        let mut u = nodal_field(&forest, f);
        let mut u_refined = refined.create_vec(1);

        compute_interp_solution_3d(&forest, &refined, &mut u, &mut u_refined);

        for (i, p) in refined.points().iter().enumerate() {
            assert_delta!(u_refined.as_slice()[i], f(p), 1e-12);
        }
    }
}
