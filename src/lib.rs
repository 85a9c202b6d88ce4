//! Higher-order solution reconstruction and goal-oriented error estimation
//! on quadtree/octree forests.
//!
//! A low-order nodal field is augmented with enrichment functions so that
//! spatial gradients prescribed at the nodes are reproduced by a per-element
//! least-squares fit. The reconstruction feeds
//!  - localized error indicators used to drive adaptive refinement, and
//!  - differentiable aggregate functionals (KS stress, curvature) used for
//!    gradient-based optimization.
use core::fmt;

use nalgebra::SVector;

/// Assert that two floating point values are closer than a tolerance
#[macro_export]
macro_rules! assert_delta {
    ($x:expr, $y:expr, $d:expr) => {
        assert!(
            ($x - $y).abs() < $d,
            "({:.3e} - {:.3e}).abs() = {:.3e}",
            $x,
            $y,
            ($x - $y).abs()
        )
    };
}

pub mod basis;
pub mod comm;
pub mod element;
pub mod forest;
pub mod functional;
pub mod io;
pub mod jacobian;
pub mod recon;
pub mod vector;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Debug)]
pub struct Error(String);
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "There is an error: {}", self.0)
    }
}

impl std::error::Error for Error {}

impl Error {
    #[must_use]
    pub fn from(msg: &str) -> Box<Self> {
        Box::new(Self(msg.into()))
    }
}

/// Node index in a forest. Negative values encode dependent (hanging) nodes:
/// `id < 0` refers to entry `-id - 1` of the dependent-node table.
pub type NodeId = i32;

/// Parametric point in a reference element
pub type Param<const D: usize> = SVector<f64, D>;

/// Vertex in physical space
pub type Vert3d = SVector<f64, 3>;

pub fn init_log(level: &str) {
    use std::io::Write;
    env_logger::Builder::new()
        .format(|buf, record| writeln!(buf, "{} - {}", record.level(), record.args()))
        .parse_filters(level)
        .init();
}
