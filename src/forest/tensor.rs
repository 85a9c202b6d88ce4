//! Structured tensor-product forest used by the tests and demos.
//!
//! A `TensorForest` is a Cartesian block of `nelems[0] x ... x nelems[D-1]`
//! elements of a given order, with nodes shared across element boundaries.
//! An optional warp maps the generated grid onto a curved geometry, which is
//! how the shell (`D = 2`) cases get out-of-plane coordinates.
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::{
    NodeId, Vert3d, basis,
    forest::Forest,
    vector::DepNodes,
};

type Warp = Arc<dyn Fn(&Vert3d) -> Vert3d + Send + Sync>;

#[derive(Clone)]
pub struct TensorForest<const D: usize> {
    order: usize,
    knots: Vec<f64>,
    nelems: [usize; D],
    origin: Vert3d,
    lengths: [f64; D],
    conn: Vec<NodeId>,
    points: Vec<Vert3d>,
    dep: Option<DepNodes>,
    groups: FxHashMap<String, Vec<usize>>,
    warp: Option<Warp>,
}

impl<const D: usize> TensorForest<D> {
    /// Cartesian block of elements over the unit square/cube
    #[must_use]
    pub fn unit_box(nelems: [usize; D], order: usize) -> Self {
        let mut lengths = [0.0; D];
        lengths.fill(1.0);
        Self::boxed(Vert3d::zeros(), lengths, nelems, order)
    }

    /// Cartesian block of elements over an axis-aligned box
    #[must_use]
    pub fn boxed(origin: Vert3d, lengths: [f64; D], nelems: [usize; D], order: usize) -> Self {
        assert!(D == 2 || D == 3);
        assert!((2..=4).contains(&order));
        assert!(nelems.iter().all(|&n| n > 0));

        let mut forest = Self {
            order,
            knots: basis::uniform_knots(order),
            nelems,
            origin,
            lengths,
            conn: Vec::new(),
            points: Vec::new(),
            dep: None,
            groups: FxHashMap::default(),
            warp: None,
        };
        forest.build();
        forest
    }

    /// Map all node positions through `f`. The warp is reapplied when the
    /// forest is order-elevated.
    #[must_use]
    pub fn warped(mut self, f: impl Fn(&Vert3d) -> Vert3d + Send + Sync + 'static) -> Self {
        let warp: Warp = Arc::new(f);
        for p in &mut self.points {
            *p = warp(p);
        }
        self.warp = Some(warp);
        self
    }

    /// Attach a named element group
    pub fn set_group(&mut self, name: &str, elems: Vec<usize>) {
        self.groups.insert(name.to_string(), elems);
    }

    /// Turn an independent node into a dependent node defined by the given
    /// contributors; every connectivity slot referencing it is rewired to the
    /// dependent-node table.
    pub fn make_dependent(&mut self, node: NodeId, conn: &[NodeId], weights: &[f64]) {
        assert!(node >= 0);
        let dep = self.dep.get_or_insert_with(DepNodes::default);
        let idx = dep.push(conn, weights);
        let encoded = -(idx as NodeId) - 1;
        for c in &mut self.conn {
            if *c == node {
                *c = encoded;
            }
        }
    }

    /// Number of node grid points along each axis
    fn node_dims(&self) -> [usize; D] {
        let mut dims = [0; D];
        for d in 0..D {
            dims[d] = self.nelems[d] * (self.order - 1) + 1;
        }
        dims
    }

    fn build(&mut self) {
        let p = self.order;
        let dims = self.node_dims();

        // node grid positions, axis by axis
        let mut axis_pos: Vec<Vec<f64>> = Vec::with_capacity(D);
        for d in 0..D {
            let h = self.lengths[d] / self.nelems[d] as f64;
            let mut pos = Vec::with_capacity(dims[d]);
            for e in 0..self.nelems[d] {
                let i0 = if e == 0 { 0 } else { 1 };
                for i in i0..p {
                    pos.push(self.origin[d] + (e as f64 + 0.5 * (self.knots[i] + 1.0)) * h);
                }
            }
            axis_pos.push(pos);
        }

        let n_nodes: usize = dims.iter().product();
        self.points = Vec::with_capacity(n_nodes);
        if D == 2 {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    self.points
                        .push(Vert3d::new(axis_pos[0][i], axis_pos[1][j], self.origin[2]));
                }
            }
        } else {
            for k in 0..dims[2] {
                for j in 0..dims[1] {
                    for i in 0..dims[0] {
                        self.points.push(Vert3d::new(
                            axis_pos[0][i],
                            axis_pos[1][j],
                            axis_pos[2][k],
                        ));
                    }
                }
            }
        }

        // element connectivity in tensor order, first axis fastest
        let n_elems: usize = self.nelems.iter().product();
        self.conn = Vec::with_capacity(n_elems * p.pow(D as u32));
        if D == 2 {
            for ey in 0..self.nelems[1] {
                for ex in 0..self.nelems[0] {
                    for jj in 0..p {
                        for ii in 0..p {
                            let gi = ex * (p - 1) + ii;
                            let gj = ey * (p - 1) + jj;
                            self.conn.push((gi + dims[0] * gj) as NodeId);
                        }
                    }
                }
            }
        } else {
            for ez in 0..self.nelems[2] {
                for ey in 0..self.nelems[1] {
                    for ex in 0..self.nelems[0] {
                        for kk in 0..p {
                            for jj in 0..p {
                                for ii in 0..p {
                                    let gi = ex * (p - 1) + ii;
                                    let gj = ey * (p - 1) + jj;
                                    let gk = ez * (p - 1) + kk;
                                    self.conn.push(
                                        (gi + dims[0] * gj + dims[0] * dims[1] * gk) as NodeId,
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<const D: usize> Forest<D> for TensorForest<D> {
    fn order(&self) -> usize {
        self.order
    }

    fn knots(&self) -> &[f64] {
        &self.knots
    }

    fn n_elems(&self) -> usize {
        self.nelems.iter().product()
    }

    fn n_nodes(&self) -> usize {
        self.points.len()
    }

    fn conn(&self) -> &[NodeId] {
        &self.conn
    }

    fn points(&self) -> &[Vert3d] {
        &self.points
    }

    fn dep_nodes(&self) -> Option<&DepNodes> {
        self.dep.as_ref()
    }

    fn elevated(&self) -> Self {
        let mut forest = Self {
            order: self.order + 1,
            knots: basis::uniform_knots(self.order + 1),
            nelems: self.nelems,
            origin: self.origin,
            lengths: self.lengths,
            conn: Vec::new(),
            points: Vec::new(),
            dep: None,
            groups: self.groups.clone(),
            warp: self.warp.clone(),
        };
        forest.build();
        if let Some(warp) = &forest.warp {
            for p in &mut forest.points {
                *p = warp(p);
            }
        }
        forest
    }

    fn group_names(&self) -> Vec<String> {
        if self.groups.is_empty() {
            vec![String::new()]
        } else {
            let mut names: Vec<_> = self.groups.keys().cloned().collect();
            names.sort_unstable();
            names
        }
    }

    fn elems_with_name(&self, name: &str) -> Vec<usize> {
        if let Some(elems) = self.groups.get(name) {
            elems.clone()
        } else if self.groups.is_empty() && name.is_empty() {
            (0..self.n_elems()).collect()
        } else {
            Vec::new()
        }
    }
}
