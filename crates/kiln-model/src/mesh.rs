//! Mesh abstraction: element blocks, side sets, node sets, optional field
//! data, and structured builders for unit-domain meshes.
//!
//! The engine never reads mesh files itself; an external reader fills this
//! structure. Local node ordering inside every cell is tensor-lexicographic
//! over the per-axis Lagrange nodes (x fastest), which is also the ordering
//! the basis evaluators use, so connectivity and basis tables never need a
//! permutation between them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConsistencyError;

/// Supported cell topologies (HGRAD order 1 and 2 in 1, 2, 3 dimensions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellTopology {
    Line2,
    Line3,
    Quad4,
    Quad9,
    Hex8,
    Hex27,
}

impl CellTopology {
    pub fn dim(&self) -> usize {
        match self {
            CellTopology::Line2 | CellTopology::Line3 => 1,
            CellTopology::Quad4 | CellTopology::Quad9 => 2,
            CellTopology::Hex8 | CellTopology::Hex27 => 3,
        }
    }

    /// Geometry interpolation order (nodes per axis minus one).
    pub fn order(&self) -> usize {
        match self {
            CellTopology::Line2 | CellTopology::Quad4 | CellTopology::Hex8 => 1,
            CellTopology::Line3 | CellTopology::Quad9 | CellTopology::Hex27 => 2,
        }
    }

    pub fn nodes_per_axis(&self) -> usize {
        self.order() + 1
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes_per_axis().pow(self.dim() as u32)
    }

    /// Sides are faces of the reference box: side `2*axis + face` fixes
    /// reference coordinate `axis` at -1 (`face = 0`) or +1 (`face = 1`).
    pub fn num_sides(&self) -> usize {
        2 * self.dim()
    }

    pub fn side_axis_face(&self, side: usize) -> (usize, usize) {
        (side / 2, side % 2)
    }

    /// Local node indices lying on a side, in tensor-lexicographic order of
    /// the remaining axes.
    pub fn side_nodes(&self, side: usize) -> Vec<usize> {
        let n = self.nodes_per_axis();
        let dim = self.dim();
        let (axis, face) = self.side_axis_face(side);
        let fixed = if face == 0 { 0 } else { n - 1 };

        let mut out = Vec::new();
        let counts = [n, if dim > 1 { n } else { 1 }, if dim > 2 { n } else { 1 }];
        for iz in 0..counts[2] {
            for iy in 0..counts[1] {
                for ix in 0..counts[0] {
                    let idx = [ix, iy, iz];
                    if idx[axis] == fixed {
                        out.push(ix + counts[0] * (iy + counts[1] * iz));
                    }
                }
            }
        }
        out
    }

    /// The topology of a side of this cell.
    pub fn side_topology(&self) -> Option<CellTopology> {
        match self {
            CellTopology::Line2 | CellTopology::Line3 => None,
            CellTopology::Quad4 => Some(CellTopology::Line2),
            CellTopology::Quad9 => Some(CellTopology::Line3),
            CellTopology::Hex8 => Some(CellTopology::Quad4),
            CellTopology::Hex27 => Some(CellTopology::Quad9),
        }
    }
}

/// Boundary kind tag carried in per-(element, variable, side) side info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum SideKind {
    None = 0,
    WeakDirichlet = 1,
    Neumann = 2,
    /// Multiscale interior interface; the neighbor field carries -1.
    Interface = 4,
    StrongDirichlet = 5,
}

/// A set of topologically identical cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub topology: CellTopology,
    /// Element -> local node -> global node index.
    pub connectivity: Vec<Vec<usize>>,
}

impl Block {
    pub fn num_elements(&self) -> usize {
        self.connectivity.len()
    }
}

/// Named collection of (block, element, side) entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideSet {
    pub name: String,
    pub sides: Vec<(usize, usize, usize)>,
}

/// Named collection of global node indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSet {
    pub name: String,
    pub nodes: Vec<usize>,
}

/// In-memory mesh handed to the engine by an external reader or a builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mesh {
    pub dim: usize,
    /// Node coordinates; unused trailing components are zero.
    pub coords: Vec<[f64; 3]>,
    pub blocks: Vec<Block>,
    pub side_sets: Vec<SideSet>,
    pub node_sets: Vec<NodeSet>,
    /// Optional per-element fields (e.g. sensor locations, measurements),
    /// indexed by global element id in block order.
    pub element_data: BTreeMap<String, Vec<f64>>,
    /// Optional per-node fields (e.g. initial states).
    pub nodal_data: BTreeMap<String, Vec<f64>>,
}

impl Mesh {
    pub fn num_nodes(&self) -> usize {
        self.coords.len()
    }

    pub fn num_elements(&self) -> usize {
        self.blocks.iter().map(|b| b.num_elements()).sum()
    }

    /// Global element id of the first element in each block.
    pub fn block_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.blocks.len());
        let mut acc = 0;
        for b in &self.blocks {
            offsets.push(acc);
            acc += b.num_elements();
        }
        offsets
    }

    pub fn block(&self, name: &str) -> Result<(usize, &Block), ConsistencyError> {
        self.blocks
            .iter()
            .enumerate()
            .find(|(_, b)| b.name == name)
            .ok_or_else(|| ConsistencyError::UnknownBlock(name.to_string()))
    }

    pub fn side_set(&self, name: &str) -> Result<&SideSet, ConsistencyError> {
        self.side_sets
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConsistencyError::UnknownSideSet(name.to_string()))
    }

    pub fn node_set(&self, name: &str) -> Option<&NodeSet> {
        self.node_sets.iter().find(|s| s.name == name)
    }

    pub fn has_element_data(&self) -> bool {
        !self.element_data.is_empty()
    }

    pub fn has_nodal_data(&self) -> bool {
        !self.nodal_data.is_empty()
    }

    pub fn set_element_data(&mut self, name: &str, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.num_elements());
        self.element_data.insert(name.to_string(), values);
    }

    pub fn set_nodal_data(&mut self, name: &str, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.num_nodes());
        self.nodal_data.insert(name.to_string(), values);
    }

    /// Solution-driven node displacement hook: shift every node by the given
    /// per-node displacement (dim components per node). Remeshing proper is
    /// out of scope.
    pub fn displace_nodes(&mut self, displacement: &[f64]) {
        assert_eq!(displacement.len(), self.num_nodes() * self.dim);
        for (n, c) in self.coords.iter_mut().enumerate() {
            for d in 0..self.dim {
                c[d] += displacement[n * self.dim + d];
            }
        }
    }
}

/// Structured mesh of `n` elements on the unit interval.
pub fn unit_interval(n: usize, order: usize) -> Mesh {
    let topo = match order {
        1 => CellTopology::Line2,
        _ => CellTopology::Line3,
    };
    let nn = order * n + 1;
    let coords: Vec<[f64; 3]> = (0..nn)
        .map(|i| [i as f64 / (nn - 1) as f64, 0.0, 0.0])
        .collect();
    let connectivity = (0..n)
        .map(|e| (0..=order).map(|i| order * e + i).collect())
        .collect();

    Mesh {
        dim: 1,
        coords,
        blocks: vec![Block {
            name: "block0".to_string(),
            topology: topo,
            connectivity,
        }],
        side_sets: vec![
            SideSet {
                name: "left".to_string(),
                sides: vec![(0, 0, 0)],
            },
            SideSet {
                name: "right".to_string(),
                sides: vec![(0, n - 1, 1)],
            },
        ],
        node_sets: vec![
            NodeSet {
                name: "left".to_string(),
                nodes: vec![0],
            },
            NodeSet {
                name: "right".to_string(),
                nodes: vec![nn - 1],
            },
        ],
        element_data: BTreeMap::new(),
        nodal_data: BTreeMap::new(),
    }
}

/// Structured `nx` x `ny` quadrilateral mesh of the unit square.
pub fn unit_square(nx: usize, ny: usize, order: usize) -> Mesh {
    let topo = match order {
        1 => CellTopology::Quad4,
        _ => CellTopology::Quad9,
    };
    let nnx = order * nx + 1;
    let nny = order * ny + 1;

    let mut coords = Vec::with_capacity(nnx * nny);
    for iy in 0..nny {
        for ix in 0..nnx {
            coords.push([
                ix as f64 / (nnx - 1) as f64,
                iy as f64 / (nny - 1) as f64,
                0.0,
            ]);
        }
    }

    let node = |ix: usize, iy: usize| ix + nnx * iy;
    let mut connectivity = Vec::with_capacity(nx * ny);
    for ey in 0..ny {
        for ex in 0..nx {
            let mut conn = Vec::with_capacity((order + 1) * (order + 1));
            for iy in 0..=order {
                for ix in 0..=order {
                    conn.push(node(order * ex + ix, order * ey + iy));
                }
            }
            connectivity.push(conn);
        }
    }

    let elem = |ex: usize, ey: usize| ex + nx * ey;
    let mut left = Vec::new();
    let mut right = Vec::new();
    let mut bottom = Vec::new();
    let mut top = Vec::new();
    for ey in 0..ny {
        left.push((0, elem(0, ey), 0));
        right.push((0, elem(nx - 1, ey), 1));
    }
    for ex in 0..nx {
        bottom.push((0, elem(ex, 0), 2));
        top.push((0, elem(ex, ny - 1), 3));
    }

    let boundary_nodes = |pred: &dyn Fn(usize, usize) -> bool| -> Vec<usize> {
        let mut out = Vec::new();
        for iy in 0..nny {
            for ix in 0..nnx {
                if pred(ix, iy) {
                    out.push(node(ix, iy));
                }
            }
        }
        out
    };

    Mesh {
        dim: 2,
        coords,
        blocks: vec![Block {
            name: "block0".to_string(),
            topology: topo,
            connectivity,
        }],
        side_sets: vec![
            SideSet {
                name: "left".to_string(),
                sides: left,
            },
            SideSet {
                name: "right".to_string(),
                sides: right,
            },
            SideSet {
                name: "bottom".to_string(),
                sides: bottom,
            },
            SideSet {
                name: "top".to_string(),
                sides: top,
            },
        ],
        node_sets: vec![
            NodeSet {
                name: "left".to_string(),
                nodes: boundary_nodes(&|ix, _| ix == 0),
            },
            NodeSet {
                name: "right".to_string(),
                nodes: boundary_nodes(&|ix, _| ix == nnx - 1),
            },
            NodeSet {
                name: "bottom".to_string(),
                nodes: boundary_nodes(&|_, iy| iy == 0),
            },
            NodeSet {
                name: "top".to_string(),
                nodes: boundary_nodes(&|_, iy| iy == nny - 1),
            },
        ],
        element_data: BTreeMap::new(),
        nodal_data: BTreeMap::new(),
    }
}

/// Structured `nx` x `ny` x `nz` hexahedral mesh of the unit cube.
pub fn unit_cube(nx: usize, ny: usize, nz: usize, order: usize) -> Mesh {
    let topo = match order {
        1 => CellTopology::Hex8,
        _ => CellTopology::Hex27,
    };
    let nnx = order * nx + 1;
    let nny = order * ny + 1;
    let nnz = order * nz + 1;

    let mut coords = Vec::with_capacity(nnx * nny * nnz);
    for iz in 0..nnz {
        for iy in 0..nny {
            for ix in 0..nnx {
                coords.push([
                    ix as f64 / (nnx - 1) as f64,
                    iy as f64 / (nny - 1) as f64,
                    iz as f64 / (nnz - 1) as f64,
                ]);
            }
        }
    }

    let node = |ix: usize, iy: usize, iz: usize| ix + nnx * (iy + nny * iz);
    let mut connectivity = Vec::with_capacity(nx * ny * nz);
    for ez in 0..nz {
        for ey in 0..ny {
            for ex in 0..nx {
                let mut conn = Vec::with_capacity((order + 1).pow(3));
                for iz in 0..=order {
                    for iy in 0..=order {
                        for ix in 0..=order {
                            conn.push(node(
                                order * ex + ix,
                                order * ey + iy,
                                order * ez + iz,
                            ));
                        }
                    }
                }
                connectivity.push(conn);
            }
        }
    }

    let elem = |ex: usize, ey: usize, ez: usize| ex + nx * (ey + ny * ez);
    let mut sets: Vec<(String, Vec<(usize, usize, usize)>)> = vec![
        ("left".to_string(), Vec::new()),
        ("right".to_string(), Vec::new()),
        ("bottom".to_string(), Vec::new()),
        ("top".to_string(), Vec::new()),
        ("back".to_string(), Vec::new()),
        ("front".to_string(), Vec::new()),
    ];
    for ez in 0..nz {
        for ey in 0..ny {
            sets[0].1.push((0, elem(0, ey, ez), 0));
            sets[1].1.push((0, elem(nx - 1, ey, ez), 1));
        }
    }
    for ez in 0..nz {
        for ex in 0..nx {
            sets[2].1.push((0, elem(ex, 0, ez), 2));
            sets[3].1.push((0, elem(ex, ny - 1, ez), 3));
        }
    }
    for ey in 0..ny {
        for ex in 0..nx {
            sets[4].1.push((0, elem(ex, ey, 0), 4));
            sets[5].1.push((0, elem(ex, ey, nz - 1), 5));
        }
    }

    let side_sets = sets
        .into_iter()
        .map(|(name, sides)| SideSet { name, sides })
        .collect();

    let mut node_sets = Vec::new();
    let preds: [(&str, Box<dyn Fn(usize, usize, usize) -> bool>); 6] = [
        ("left", Box::new(|ix, _, _| ix == 0)),
        ("right", Box::new(move |ix, _, _| ix == nnx - 1)),
        ("bottom", Box::new(|_, iy, _| iy == 0)),
        ("top", Box::new(move |_, iy, _| iy == nny - 1)),
        ("back", Box::new(|_, _, iz| iz == 0)),
        ("front", Box::new(move |_, _, iz| iz == nnz - 1)),
    ];
    for (name, pred) in preds.iter() {
        let mut nodes = Vec::new();
        for iz in 0..nnz {
            for iy in 0..nny {
                for ix in 0..nnx {
                    if pred(ix, iy, iz) {
                        nodes.push(node(ix, iy, iz));
                    }
                }
            }
        }
        node_sets.push(NodeSet {
            name: name.to_string(),
            nodes,
        });
    }

    Mesh {
        dim: 3,
        coords,
        blocks: vec![Block {
            name: "block0".to_string(),
            topology: topo,
            connectivity,
        }],
        side_sets,
        node_sets,
        element_data: BTreeMap::new(),
        nodal_data: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_counts() {
        let mesh = unit_interval(4, 1);
        assert_eq!(mesh.num_nodes(), 5);
        assert_eq!(mesh.num_elements(), 4);
        assert_eq!(mesh.side_set("right").unwrap().sides, vec![(0, 3, 1)]);
    }

    #[test]
    fn square_q1_connectivity_is_lexicographic() {
        let mesh = unit_square(2, 2, 1);
        assert_eq!(mesh.num_nodes(), 9);
        // First element spans nodes (0,0)-(1,1) of the 3x3 grid.
        assert_eq!(mesh.blocks[0].connectivity[0], vec![0, 1, 3, 4]);
        assert_eq!(mesh.side_sets.len(), 4);
        assert_eq!(mesh.side_set("top").unwrap().sides.len(), 2);
    }

    #[test]
    fn square_q2_has_mid_nodes() {
        let mesh = unit_square(2, 1, 2);
        assert_eq!(mesh.num_nodes(), 5 * 3);
        assert_eq!(mesh.blocks[0].connectivity[0].len(), 9);
        assert_eq!(mesh.blocks[0].topology, CellTopology::Quad9);
    }

    #[test]
    fn cube_side_sets_cover_boundary() {
        let mesh = unit_cube(2, 2, 2, 1);
        assert_eq!(mesh.num_nodes(), 27);
        assert_eq!(mesh.num_elements(), 8);
        let total: usize = mesh.side_sets.iter().map(|s| s.sides.len()).sum();
        assert_eq!(total, 6 * 4);
    }

    #[test]
    fn side_nodes_match_grid_faces() {
        let topo = CellTopology::Quad4;
        assert_eq!(topo.side_nodes(0), vec![0, 2]); // x = -1
        assert_eq!(topo.side_nodes(1), vec![1, 3]); // x = +1
        assert_eq!(topo.side_nodes(2), vec![0, 1]); // y = -1
        assert_eq!(topo.side_nodes(3), vec![2, 3]); // y = +1

        let hex = CellTopology::Hex27;
        assert_eq!(hex.side_nodes(0).len(), 9);
        assert_eq!(hex.side_topology(), Some(CellTopology::Quad9));
    }

    #[test]
    fn node_displacement_hook_moves_coords() {
        let mut mesh = unit_interval(2, 1);
        let shift = vec![0.01; mesh.num_nodes()];
        mesh.displace_nodes(&shift);
        assert!((mesh.coords[0][0] - 0.01).abs() < 1e-15);
    }
}
