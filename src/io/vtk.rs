//! Legacy-VTK output of sampled fields on unstructured hexahedral grids.
use std::path::Path;

use vtkio::model::{
    Attribute, Attributes, ByteOrder, CellType, Cells, DataSet, Piece, UnstructuredGridPiece,
    Version, VertexNumbers, Vtk,
};

use crate::{Result, Vert3d};

/// A sampled hexahedral grid with optional point and cell scalars
#[derive(Clone, Debug, Default)]
pub struct VtkGrid {
    pub points: Vec<Vert3d>,
    /// Hexahedral cells in VTK corner ordering
    pub hexes: Vec<[usize; 8]>,
    pub point_data: Vec<(String, Vec<f64>)>,
    pub cell_data: Vec<(String, Vec<f64>)>,
}

impl VtkGrid {
    /// Append a hexahedron given in tensor corner order, first axis fastest
    pub fn push_tensor_hex(&mut self, corners: [usize; 8]) {
        // VTK expects the quad loop ordering on both faces
        const PERM: [usize; 8] = [0, 1, 3, 2, 4, 5, 7, 6];
        let mut cell = [0; 8];
        for (c, &p) in cell.iter_mut().zip(PERM.iter()) {
            *c = corners[p];
        }
        self.hexes.push(cell);
    }
}

/// Write the sampled grid as a legacy ASCII VTK file
pub fn write_vtk_grid(grid: &VtkGrid, path: impl AsRef<Path>) -> Result<()> {
    let mut points = Vec::with_capacity(3 * grid.points.len());
    for p in &grid.points {
        points.extend_from_slice(&[p[0], p[1], p[2]]);
    }

    // vertices are laid out as N, i_1, ..., i_N per cell
    let mut vertices = Vec::with_capacity(9 * grid.hexes.len());
    for hex in &grid.hexes {
        vertices.push(8u32);
        for &v in hex {
            vertices.push(u32::try_from(v)?);
        }
    }

    let piece = UnstructuredGridPiece {
        points: points.into(),
        cells: Cells {
            cell_verts: VertexNumbers::Legacy {
                num_cells: grid.hexes.len() as u32,
                vertices,
            },
            types: vec![CellType::Hexahedron; grid.hexes.len()],
        },
        data: Attributes {
            point: grid
                .point_data
                .iter()
                .map(|(name, vals)| Attribute::scalars(name.as_str(), 1).with_data(vals.clone()))
                .collect(),
            cell: grid
                .cell_data
                .iter()
                .map(|(name, vals)| Attribute::scalars(name.as_str(), 1).with_data(vals.clone()))
                .collect(),
        },
    };

    let path = path.as_ref();
    let title = path
        .file_stem()
        .map_or_else(|| "untitled".to_string(), |s| s.to_string_lossy().to_string());

    Vtk {
        version: Version { major: 4, minor: 1 },
        title,
        byte_order: ByteOrder::BigEndian,
        data: DataSet::UnstructuredGrid {
            meta: None,
            pieces: vec![Piece::Inline(Box::new(piece))],
        },
        file_path: None,
    }
    .export_ascii(path)?;
    Ok(())
}
