//! Forest collaborator interface.
//!
//! The forest owns the element-node connectivity, the mesh order and knot
//! vector, the node positions and the dependent-node table. The refinement
//! logic itself lives outside this crate; the reconstruction only consumes
//! the interface below.
use crate::{
    NodeId, Param, Vert3d, basis,
    vector::{DepNodes, NodalVec},
};

mod tensor;

pub use tensor::TensorForest;

/// Quadtree (`D = 2`, shell elements embedded in 3D) or octree (`D = 3`)
/// forest of tensor-product elements.
pub trait Forest<const D: usize> {
    /// Mesh order: number of nodes per axis of an element
    fn order(&self) -> usize;

    /// Interpolation knots, `knots[0] == -1`, `knots[order - 1] == 1`
    fn knots(&self) -> &[f64];

    fn n_elems(&self) -> usize;

    /// Number of independent nodes
    fn n_nodes(&self) -> usize;

    /// Element-node connectivity, [`Self::elem_size`] entries per element;
    /// negative entries are dependent nodes
    fn conn(&self) -> &[NodeId];

    /// Physical positions of the independent nodes
    fn points(&self) -> &[Vert3d];

    fn dep_nodes(&self) -> Option<&DepNodes>;

    /// Order-elevated copy of the forest: same elements, order `p + 1`
    #[must_use]
    fn elevated(&self) -> Self
    where
        Self: Sized;

    fn elem_size(&self) -> usize {
        self.order().pow(D as u32)
    }

    fn elem_nodes(&self, elem: usize) -> &[NodeId] {
        let size = self.elem_size();
        &self.conn()[elem * size..(elem + 1) * size]
    }

    /// Physical node positions of one element; dependent nodes resolve to the
    /// weighted combination of their contributors
    fn elem_points(&self, elem: usize, xpts: &mut [Vert3d]) {
        let nodes = self.elem_nodes(elem);
        assert_eq!(xpts.len(), nodes.len());
        let pts = self.points();
        for (x, &node) in xpts.iter_mut().zip(nodes.iter()) {
            if node >= 0 {
                *x = pts[node as usize];
            } else {
                let dep = self.dep_nodes().expect("dependent node without a table");
                let (conn, weights) = dep.contributors((-node - 1) as usize);
                *x = Vert3d::zeros();
                for (&c, &w) in conn.iter().zip(weights.iter()) {
                    *x += w * pts[c as usize];
                }
            }
        }
    }

    /// Lagrange basis at a parametric point
    fn eval_interp(&self, pt: &Param<D>, n: &mut [f64]) {
        basis::eval_tensor(self.knots(), pt, n);
    }

    /// Lagrange basis and parametric gradients at a parametric point
    fn eval_interp_deriv(&self, pt: &Param<D>, n: &mut [f64], dn: &mut [Param<D>]) {
        basis::eval_tensor_deriv(self.knots(), pt, n, dn);
    }

    /// Topological group names; a forest without named groups reports a
    /// single unnamed group
    fn group_names(&self) -> Vec<String> {
        vec![String::new()]
    }

    /// Elements belonging to a named group; an unknown name is an empty group
    fn elems_with_name(&self, name: &str) -> Vec<usize> {
        if name.is_empty() {
            (0..self.n_elems()).collect()
        } else {
            Vec::new()
        }
    }

    /// Create a nodal vector sized for this forest
    fn create_vec(&self, bs: usize) -> NodalVec {
        NodalVec::new(self.n_nodes(), bs, self.dep_nodes().cloned())
    }
}
