//! Patch-wise higher-order reconstruction.
//!
//! The pipeline: a coarse nodal field is projected to weighted nodal spatial
//! derivatives, each element solves a local least-squares problem for its
//! enrichment coefficients, and the enriched field is stitched together on an
//! order-elevated embedded mesh with patch averaging at shared nodes.
use crate::{
    forest::Forest,
    vector::{NodalVec, SetMode},
};

mod elemrecon;
mod nodederiv;
mod refined;

pub use elemrecon::{compute_elem_recon_2d, compute_elem_recon_3d};
pub use nodederiv::{add_node_deriv_transpose_3d, compute_node_deriv_2d, compute_node_deriv_3d};
pub use refined::{
    add_refined_solution_2d, add_refined_solution_3d, compute_interp_solution_2d,
    compute_interp_solution_3d, compute_recon_solution_2d, compute_recon_solution_3d,
};

/// Count how many elements reference each node through an independent slot.
///
/// The result is the normalization denominator for the nodal-derivative
/// projection and for the patch averaging on the refined mesh. With `elems`
/// the count is restricted to the given element subset.
pub fn compute_local_weights<const D: usize, F: Forest<D>>(
    forest: &F,
    weights: &mut NodalVec,
    elems: Option<&[usize]>,
) {
    assert_eq!(weights.block_size(), 1);
    weights.zero();

    let size = forest.elem_size();
    let mut welem = vec![0.0; size];

    let nelems = elems.map_or(forest.n_elems(), <[usize]>::len);
    for index in 0..nelems {
        let elem = elems.map_or(index, |e| e[index]);
        let nodes = forest.elem_nodes(elem);
        for (w, &node) in welem.iter_mut().zip(nodes.iter()) {
            *w = if node >= 0 { 1.0 } else { 0.0 };
        }
        weights.set_values(nodes, &welem, SetMode::Add);
    }

    weights.begin_set_values(SetMode::Add);
    weights.end_set_values(SetMode::Add);

    weights.begin_distribute_values();
    weights.end_distribute_values();
}
