//! Diagnostic output writers. These are strictly diagnostic and carry no
//! functional contract.
mod vtk;

pub use vtk::{VtkGrid, write_vtk_grid};
