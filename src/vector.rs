//! Block-structured nodal vectors with dependent-node resolution.
//!
//! A `NodalVec` maps an independent node index to a fixed-length value block.
//! Dependent (hanging) nodes carry no storage of their own: reads resolve
//! through the dependent-node table, and additions are routed through the
//! table onto the independent contributors. The `begin`/`end` pairs mark the
//! collective suspension points of the SPMD contract; in this single-process
//! implementation they only enforce well-nesting and ordering.
use crate::{Error, NodeId, Result};

/// How values are combined by [`NodalVec::set_values`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetMode {
    /// Accumulate into the stored values
    Add,
    /// Overwrite the stored values, skipping zero entries
    InsertNonZero,
}

/// Dependent-node table: dependent node `d` is defined as the weighted sum of
/// the independent nodes `conn[ptr[d]..ptr[d + 1]]`.
#[derive(Clone, Debug, Default)]
pub struct DepNodes {
    ptr: Vec<usize>,
    conn: Vec<NodeId>,
    weights: Vec<f64>,
}

impl DepNodes {
    pub fn new(ptr: Vec<usize>, conn: Vec<NodeId>, weights: Vec<f64>) -> Result<Self> {
        if ptr.is_empty() || *ptr.last().unwrap() != conn.len() || conn.len() != weights.len() {
            return Err(Error::from("inconsistent dependent-node table"));
        }
        if conn.iter().any(|&c| c < 0) {
            return Err(Error::from(
                "dependent nodes may only depend on independent nodes",
            ));
        }
        Ok(Self { ptr, conn, weights })
    }

    #[must_use]
    pub fn n_dep(&self) -> usize {
        self.ptr.len() - 1
    }

    /// Independent contributors and weights of one dependent node
    #[must_use]
    pub fn contributors(&self, dep: usize) -> (&[NodeId], &[f64]) {
        let start = self.ptr[dep];
        let end = self.ptr[dep + 1];
        (&self.conn[start..end], &self.weights[start..end])
    }

    /// Append a dependent node, returning its table index
    pub fn push(&mut self, conn: &[NodeId], weights: &[f64]) -> usize {
        assert_eq!(conn.len(), weights.len());
        if self.ptr.is_empty() {
            self.ptr.push(0);
        }
        self.conn.extend_from_slice(conn);
        self.weights.extend_from_slice(weights);
        self.ptr.push(self.conn.len());
        self.ptr.len() - 2
    }
}

/// Distributed nodal vector with a fixed block size
#[derive(Clone, Debug)]
pub struct NodalVec {
    bs: usize,
    vals: Vec<f64>,
    dep: Option<DepNodes>,
    pending_set: Option<SetMode>,
    distributing: bool,
}

impl NodalVec {
    #[must_use]
    pub fn new(n_nodes: usize, bs: usize, dep: Option<DepNodes>) -> Self {
        Self {
            bs,
            vals: vec![0.0; n_nodes * bs],
            dep,
            pending_set: None,
            distributing: false,
        }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.bs
    }

    #[must_use]
    pub fn n_nodes(&self) -> usize {
        self.vals.len() / self.bs
    }

    pub fn zero(&mut self) {
        self.vals.fill(0.0);
    }

    /// Read value blocks at the given nodes; dependent nodes resolve through
    /// the table
    pub fn get_values(&self, nodes: &[NodeId], out: &mut [f64]) {
        debug_assert!(
            self.pending_set.is_none(),
            "read during a pending write-finalization"
        );
        assert_eq!(out.len(), nodes.len() * self.bs);
        for (k, &node) in nodes.iter().enumerate() {
            let block = &mut out[k * self.bs..(k + 1) * self.bs];
            if node >= 0 {
                let start = node as usize * self.bs;
                block.copy_from_slice(&self.vals[start..start + self.bs]);
            } else {
                block.fill(0.0);
                let dep = self.dep.as_ref().expect("dependent node without a table");
                let (conn, weights) = dep.contributors((-node - 1) as usize);
                for (&c, &w) in conn.iter().zip(weights.iter()) {
                    let start = c as usize * self.bs;
                    for (b, v) in block.iter_mut().zip(&self.vals[start..start + self.bs]) {
                        *b += w * v;
                    }
                }
            }
        }
    }

    /// Write value blocks at the given nodes. With [`SetMode::Add`], values
    /// destined for a dependent node are routed through the table onto its
    /// independent contributors; with [`SetMode::InsertNonZero`] dependent
    /// targets are skipped.
    pub fn set_values(&mut self, nodes: &[NodeId], vals: &[f64], mode: SetMode) {
        assert_eq!(vals.len(), nodes.len() * self.bs);
        for (k, &node) in nodes.iter().enumerate() {
            let block = &vals[k * self.bs..(k + 1) * self.bs];
            if node >= 0 {
                let start = node as usize * self.bs;
                match mode {
                    SetMode::Add => {
                        for (v, b) in self.vals[start..start + self.bs].iter_mut().zip(block) {
                            *v += b;
                        }
                    }
                    SetMode::InsertNonZero => {
                        for (v, &b) in self.vals[start..start + self.bs].iter_mut().zip(block) {
                            if b != 0.0 {
                                *v = b;
                            }
                        }
                    }
                }
            } else if mode == SetMode::Add {
                let dep = self.dep.as_ref().expect("dependent node without a table");
                let (conn, weights) = dep.contributors((-node - 1) as usize);
                for (&c, &w) in conn.iter().zip(weights.iter()) {
                    let start = c as usize * self.bs;
                    for (v, &b) in self.vals[start..start + self.bs].iter_mut().zip(block) {
                        *v += w * b;
                    }
                }
            }
        }
    }

    /// Start the cross-process reduction of pending writes
    pub fn begin_set_values(&mut self, mode: SetMode) {
        assert!(
            self.pending_set.is_none() && !self.distributing,
            "begin_set_values while another collective is open"
        );
        self.pending_set = Some(mode);
    }

    /// Finish the cross-process reduction of pending writes
    pub fn end_set_values(&mut self, mode: SetMode) {
        assert_eq!(
            self.pending_set.take(),
            Some(mode),
            "end_set_values without matching begin"
        );
    }

    /// Start pulling owner values for shared nodes
    pub fn begin_distribute_values(&mut self) {
        assert!(
            self.pending_set.is_none() && !self.distributing,
            "begin_distribute_values while another collective is open"
        );
        self.distributing = true;
    }

    /// Finish pulling owner values for shared nodes
    pub fn end_distribute_values(&mut self) {
        assert!(
            self.distributing,
            "end_distribute_values without matching begin"
        );
        self.distributing = false;
    }

    pub fn copy_values(&mut self, other: &Self) {
        assert_eq!(self.bs, other.bs);
        assert_eq!(self.vals.len(), other.vals.len());
        self.vals.copy_from_slice(&other.vals);
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.vals
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.vals
    }
}

#[cfg(test)]
mod tests {
    use super::{DepNodes, NodalVec, SetMode};

    #[test]
    fn test_add_and_read() {
        let mut v = NodalVec::new(4, 2, None);
        v.set_values(&[1, 3], &[1.0, 2.0, 3.0, 4.0], SetMode::Add);
        v.set_values(&[1], &[0.5, 0.5], SetMode::Add);
        v.begin_set_values(SetMode::Add);
        v.end_set_values(SetMode::Add);

        let mut out = [0.0; 4];
        v.get_values(&[1, 3], &mut out);
        assert_delta!(out[0], 1.5, 1e-14);
        assert_delta!(out[1], 2.5, 1e-14);
        assert_delta!(out[2], 3.0, 1e-14);
        assert_delta!(out[3], 4.0, 1e-14);
    }

    #[test]
    fn test_insert_nonzero() {
        let mut v = NodalVec::new(2, 1, None);
        v.set_values(&[0, 1], &[1.0, 2.0], SetMode::InsertNonZero);
        v.set_values(&[0, 1], &[5.0, 0.0], SetMode::InsertNonZero);
        assert_delta!(v.as_slice()[0], 5.0, 1e-14);
        assert_delta!(v.as_slice()[1], 2.0, 1e-14);
    }

    #[test]
    fn test_dependent_node_routing() {
        // node -1 depends on {0, 2} with weights {0.5, 0.5}
        let dep = DepNodes::new(vec![0, 2], vec![0, 2], vec![0.5, 0.5]).unwrap();
        let mut v = NodalVec::new(3, 1, Some(dep));

        // an add routed through the table
        v.set_values(&[-1], &[2.0], SetMode::Add);
        assert_delta!(v.as_slice()[0], 1.0, 1e-14);
        assert_delta!(v.as_slice()[1], 0.0, 1e-14);
        assert_delta!(v.as_slice()[2], 1.0, 1e-14);

        // reads resolve to the weighted combination
        v.zero();
        v.set_values(&[0, 2], &[2.0, 4.0], SetMode::Add);
        let mut out = [0.0];
        v.get_values(&[-1], &mut out);
        assert_delta!(out[0], 3.0, 1e-14);

        // inserts to dependent slots are dropped
        v.set_values(&[-1], &[100.0], SetMode::InsertNonZero);
        assert_delta!(v.as_slice()[0], 2.0, 1e-14);
        assert_delta!(v.as_slice()[2], 4.0, 1e-14);
    }

    #[test]
    #[should_panic(expected = "end_set_values without matching begin")]
    fn test_collective_nesting() {
        let mut v = NodalVec::new(1, 1, None);
        v.end_set_values(SetMode::Add);
    }
}
