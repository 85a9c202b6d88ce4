//! Nodal-derivative projection.
//!
//! The physical-space gradient of the coarse field is sampled at every
//! element knot and averaged over the elements referencing each node:
//! ```math
//! D_n = \frac{1}{w_n} \sum_{K \ni n} \left . J^{-T} \nabla_\xi u_h \right |_{K, n}
//! ```
//! Contributions aimed at dependent slots are zeroed; the finalized vector is
//! consistent across processes after the add-reduction and distribution.
use log::{debug, warn};

use crate::{
    Param, Vert3d,
    forest::Forest,
    jacobian::{jacobian_2d, jacobian_3d},
    vector::{NodalVec, SetMode},
};

/// Project a coarse nodal field to weighted nodal derivatives on a shell
/// forest. `uderiv` must carry three derivative slots per variable.
pub fn compute_node_deriv_2d<F: Forest<2>>(
    forest: &F,
    u: &NodalVec,
    weights: &NodalVec,
    uderiv: &mut NodalVec,
    elems: Option<&[usize]>,
) {
    debug!("Compute the nodal derivatives on the shell forest");
    let vars_per_node = u.block_size();
    let deriv_per_node = 3 * vars_per_node;
    assert_eq!(uderiv.block_size(), deriv_per_node);

    uderiv.zero();

    let order = forest.order();
    let knots = forest.knots().to_vec();
    let size = forest.elem_size();

    let mut welem = vec![0.0; size];
    let mut uelem = vec![0.0; size * vars_per_node];
    let mut delem = vec![0.0; size * deriv_per_node];
    let mut xpts = vec![Vert3d::zeros(); size];
    let mut n = vec![0.0; size];
    let mut dn = vec![Param::<2>::zeros(); size];
    let mut ud = vec![0.0; 2 * vars_per_node];

    let nelems = elems.map_or(forest.n_elems(), <[usize]>::len);
    for index in 0..nelems {
        let elem = elems.map_or(index, |e| e[index]);
        let nodes = forest.elem_nodes(elem);

        weights.get_values(nodes, &mut welem);
        u.get_values(nodes, &mut uelem);
        forest.elem_points(elem, &mut xpts);

        for jj in 0..order {
            for ii in 0..order {
                let pt = Param::<2>::new(knots[ii], knots[jj]);
                forest.eval_interp_deriv(&pt, &mut n, &mut dn);

                let (_, j, detj) = jacobian_2d(&xpts, &dn);

                // parametric gradient of the interpolated field
                ud.fill(0.0);
                for k in 0..vars_per_node {
                    for (i, d) in dn.iter().enumerate() {
                        ud[2 * k] += uelem[vars_per_node * i + k] * d[0];
                        ud[2 * k + 1] += uelem[vars_per_node * i + k] * d[1];
                    }
                }

                let slot = ii + order * jj;
                let d = &mut delem[deriv_per_node * slot..deriv_per_node * (slot + 1)];
                if nodes[slot] >= 0 && detj > 0.0 {
                    let winv = 1.0 / welem[slot];
                    for k in 0..vars_per_node {
                        for r in 0..3 {
                            d[3 * k + r] =
                                winv * (ud[2 * k] * j[(r, 0)] + ud[2 * k + 1] * j[(r, 1)]);
                        }
                    }
                } else {
                    if detj <= 0.0 {
                        warn!("degenerate element {elem} in the derivative projection");
                    }
                    d.fill(0.0);
                }
            }
        }

        uderiv.set_values(nodes, &delem, SetMode::Add);
    }

    uderiv.begin_set_values(SetMode::Add);
    uderiv.end_set_values(SetMode::Add);

    uderiv.begin_distribute_values();
    uderiv.end_distribute_values();
}

/// Project a coarse nodal field to weighted nodal derivatives on an octree
/// forest. `uderiv` must carry three derivative slots per variable.
pub fn compute_node_deriv_3d<F: Forest<3>>(
    forest: &F,
    u: &NodalVec,
    weights: &NodalVec,
    uderiv: &mut NodalVec,
    elems: Option<&[usize]>,
) {
    debug!("Compute the nodal derivatives on the octree forest");
    let vars_per_node = u.block_size();
    let deriv_per_node = 3 * vars_per_node;
    assert_eq!(uderiv.block_size(), deriv_per_node);

    uderiv.zero();

    let order = forest.order();
    let knots = forest.knots().to_vec();
    let size = forest.elem_size();

    let mut welem = vec![0.0; size];
    let mut uelem = vec![0.0; size * vars_per_node];
    let mut delem = vec![0.0; size * deriv_per_node];
    let mut xpts = vec![Vert3d::zeros(); size];
    let mut n = vec![0.0; size];
    let mut dn = vec![Param::<3>::zeros(); size];
    let mut ud = vec![0.0; 3 * vars_per_node];

    let nelems = elems.map_or(forest.n_elems(), <[usize]>::len);
    for index in 0..nelems {
        let elem = elems.map_or(index, |e| e[index]);
        let nodes = forest.elem_nodes(elem);

        weights.get_values(nodes, &mut welem);
        u.get_values(nodes, &mut uelem);
        forest.elem_points(elem, &mut xpts);

        for kk in 0..order {
            for jj in 0..order {
                for ii in 0..order {
                    let pt = Param::<3>::new(knots[ii], knots[jj], knots[kk]);
                    forest.eval_interp_deriv(&pt, &mut n, &mut dn);

                    let (_, j, detj) = jacobian_3d(&xpts, &dn);

                    ud.fill(0.0);
                    for k in 0..vars_per_node {
                        for (i, d) in dn.iter().enumerate() {
                            ud[3 * k] += uelem[vars_per_node * i + k] * d[0];
                            ud[3 * k + 1] += uelem[vars_per_node * i + k] * d[1];
                            ud[3 * k + 2] += uelem[vars_per_node * i + k] * d[2];
                        }
                    }

                    let slot = ii + order * jj + order * order * kk;
                    let d = &mut delem[deriv_per_node * slot..deriv_per_node * (slot + 1)];
                    if nodes[slot] >= 0 && detj > 0.0 {
                        let winv = 1.0 / welem[slot];
                        for k in 0..vars_per_node {
                            for r in 0..3 {
                                d[3 * k + r] = winv
                                    * (ud[3 * k] * j[(r, 0)]
                                        + ud[3 * k + 1] * j[(r, 1)]
                                        + ud[3 * k + 2] * j[(r, 2)]);
                            }
                        }
                    } else {
                        if detj <= 0.0 {
                            warn!("degenerate element {elem} in the derivative projection");
                        }
                        d.fill(0.0);
                    }
                }
            }
        }

        uderiv.set_values(nodes, &delem, SetMode::Add);
    }

    uderiv.begin_set_values(SetMode::Add);
    uderiv.end_set_values(SetMode::Add);

    uderiv.begin_distribute_values();
    uderiv.end_distribute_values();
}

/// Apply the transpose of the nodal-derivative projection.
///
/// Back-propagates a sensitivity with respect to the nodal derivatives onto
/// the underlying nodal field: the reverse of [`compute_node_deriv_3d`], with
/// the same weighting, dependent-node masking and knot sweep. The Jacobian is
/// evaluated on the geometry of `geom`, which may be an order-elevated copy of
/// `forest` or `forest` itself. The caller finalizes `dfdu`.
pub fn add_node_deriv_transpose_3d<F: Forest<3>, G: Forest<3>>(
    forest: &F,
    geom: &G,
    dfduderiv: &NodalVec,
    weights: &NodalVec,
    dfdu: &mut NodalVec,
) {
    debug!("Apply the transpose of the nodal-derivative projection");
    let vars_per_node = dfdu.block_size();
    let deriv_per_node = 3 * vars_per_node;
    assert_eq!(dfduderiv.block_size(), deriv_per_node);

    let order = forest.order();
    let knots = forest.knots().to_vec();
    let size = forest.elem_size();
    let geom_size = geom.elem_size();

    let mut welem = vec![0.0; size];
    let mut dfd_elem = vec![0.0; size * deriv_per_node];
    let mut dfdu_elem = vec![0.0; size * vars_per_node];
    let mut xpts = vec![Vert3d::zeros(); geom_size];
    let mut ng = vec![0.0; geom_size];
    let mut dng = vec![Param::<3>::zeros(); geom_size];
    let mut n = vec![0.0; size];
    let mut dn = vec![Param::<3>::zeros(); size];
    let mut dud = vec![0.0; 3 * vars_per_node];

    for elem in 0..forest.n_elems() {
        let nodes = forest.elem_nodes(elem);

        weights.get_values(nodes, &mut welem);
        dfduderiv.get_values(nodes, &mut dfd_elem);
        geom.elem_points(elem, &mut xpts);

        dfdu_elem.fill(0.0);

        for kk in 0..order {
            for jj in 0..order {
                for ii in 0..order {
                    let pt = Param::<3>::new(knots[ii], knots[jj], knots[kk]);
                    geom.eval_interp_deriv(&pt, &mut ng, &mut dng);

                    let (_, j, detj) = jacobian_3d(&xpts, &dng);

                    forest.eval_interp_deriv(&pt, &mut n, &mut dn);

                    let slot = ii + order * jj + order * order * kk;
                    if nodes[slot] >= 0 && detj > 0.0 {
                        let winv = 1.0 / welem[slot];
                        let d = &dfd_elem[deriv_per_node * slot..deriv_per_node * (slot + 1)];

                        // reverse of the physical-gradient map
                        for k in 0..vars_per_node {
                            for a in 0..3 {
                                dud[3 * k + a] = winv
                                    * (j[(0, a)] * d[3 * k]
                                        + j[(1, a)] * d[3 * k + 1]
                                        + j[(2, a)] * d[3 * k + 2]);
                            }
                        }

                        // reverse of the parametric interpolation
                        for k in 0..vars_per_node {
                            for (i, dni) in dn.iter().enumerate() {
                                dfdu_elem[vars_per_node * i + k] += dni[0] * dud[3 * k]
                                    + dni[1] * dud[3 * k + 1]
                                    + dni[2] * dud[3 * k + 2];
                            }
                        }
                    }
                }
            }
        }

        dfdu.set_values(nodes, &dfdu_elem, SetMode::Add);
    }
}
