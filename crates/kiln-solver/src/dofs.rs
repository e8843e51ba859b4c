//! Degree-of-freedom manager: global numbering, owned/overlapped maps,
//! per-element index tables, and strong-Dirichlet identification.
//!
//! A dof is a (node, variable) pair with GID `node * num_vars + var`; maps
//! carry only the pairs that exist (an order-1 field on a quadratic block
//! has no dofs on mid-edge nodes, leaving gaps in the GID space, which the
//! maps absorb).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kiln_la::{Comm, CrsGraph, Export, Map};
use kiln_model::{ConsistencyError, Mesh, SideKind};

use crate::disc::Basis;
use crate::error::AssemblyError;

/// A named field with a basis order, declared by a physics module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub order: usize,
}

/// A boundary condition request, resolved against mesh side sets.
#[derive(Debug, Clone)]
pub struct BcSpec {
    pub var: String,
    pub sideset: String,
    pub kind: SideKind,
}

/// One strongly-enforced Dirichlet dof.
#[derive(Debug, Clone)]
pub struct DirichletBc {
    pub gid: u64,
    pub node: usize,
    /// Global variable id.
    pub var: usize,
    /// Function-manager name of the prescribed value.
    pub value_fn: String,
}

/// Per-block numbering tables.
#[derive(Debug, Clone)]
pub struct BlockDofs {
    pub vars: Vec<Variable>,
    /// Global variable id of each block-local variable.
    pub var_ids: Vec<usize>,
    pub bases: Vec<Basis>,
    /// var -> basis index -> local dof slot.
    pub offsets: Vec<Vec<usize>>,
    pub num_dofs_per_elem: usize,
    /// elem -> slot -> dof GID.
    pub elem_gids: Vec<Vec<u64>>,
    /// elem -> slot -> mesh node.
    pub elem_nodes: Vec<Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct DofManager {
    /// Global variable names in id order.
    pub var_names: Vec<String>,
    pub blocks: Vec<BlockDofs>,
    pub owned: Arc<Map>,
    pub overlapped: Arc<Map>,
    pub export: Export,
    pub graph_owned: Arc<CrsGraph>,
    pub graph_overlapped: Arc<CrsGraph>,
}

impl DofManager {
    /// Build the numbering from the per-block variable declarations the
    /// physics modules made.
    pub fn build(mesh: &Mesh, block_vars: &[Vec<Variable>]) -> Result<Self, AssemblyError> {
        assert_eq!(mesh.blocks.len(), block_vars.len());

        // Unify variable names across blocks.
        let mut var_names: Vec<String> = Vec::new();
        for vars in block_vars {
            for v in vars {
                if !var_names.contains(&v.name) {
                    var_names.push(v.name.clone());
                }
            }
        }
        let num_vars = var_names.len() as u64;
        let gid_of = |node: usize, var_id: usize| node as u64 * num_vars + var_id as u64;

        let mut all_gids: BTreeSet<u64> = BTreeSet::new();
        let mut blocks = Vec::with_capacity(mesh.blocks.len());

        for (b, mesh_block) in mesh.blocks.iter().enumerate() {
            let topo = mesh_block.topology;
            let vars = block_vars[b].clone();
            let mut var_ids = Vec::with_capacity(vars.len());
            let mut bases = Vec::with_capacity(vars.len());
            let mut offsets: Vec<Vec<usize>> = Vec::with_capacity(vars.len());
            let mut slot = 0;
            for v in &vars {
                let basis = Basis::new(topo, v.order)?;
                let nb = basis.num_basis();
                offsets.push((slot..slot + nb).collect());
                slot += nb;
                var_ids.push(var_names.iter().position(|n| *n == v.name).unwrap());
                bases.push(basis);
            }
            let num_dofs_per_elem = slot;

            let mut elem_gids = Vec::with_capacity(mesh_block.num_elements());
            let mut elem_nodes = Vec::with_capacity(mesh_block.num_elements());
            for conn in &mesh_block.connectivity {
                let mut gids = vec![0u64; num_dofs_per_elem];
                let mut nodes = vec![0usize; num_dofs_per_elem];
                for (v, basis) in bases.iter().enumerate() {
                    for (i, &local_node) in basis.dof_nodes().iter().enumerate() {
                        let node = conn[local_node];
                        let gid = gid_of(node, var_ids[v]);
                        gids[offsets[v][i]] = gid;
                        nodes[offsets[v][i]] = node;
                        all_gids.insert(gid);
                    }
                }
                elem_gids.push(gids);
                elem_nodes.push(nodes);
            }

            blocks.push(BlockDofs {
                vars,
                var_ids,
                bases,
                offsets,
                num_dofs_per_elem,
                elem_gids,
                elem_nodes,
            });
        }

        let comm = Comm::serial();
        let gids: Vec<u64> = all_gids.into_iter().collect();
        let owned = Arc::new(Map::new(gids.clone(), comm));
        let overlapped = Arc::new(Map::new(gids, comm));
        let export = Export::new(&overlapped, &owned);

        // Sparsity from element couplings.
        let mut row_cols: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        for block in &blocks {
            for gids in &block.elem_gids {
                for &r in gids {
                    let entry = row_cols.entry(r).or_default();
                    for &c in gids {
                        entry.insert(c);
                    }
                }
            }
        }
        let cols_for = |map: &Map| -> Vec<Vec<u64>> {
            (0..map.num_local())
                .map(|lid| {
                    row_cols
                        .get(&map.gid(lid))
                        .map(|s| s.iter().copied().collect())
                        .unwrap_or_default()
                })
                .collect()
        };
        let graph_owned = Arc::new(CrsGraph::new(owned.clone(), cols_for(&owned)));
        let graph_overlapped = Arc::new(CrsGraph::new(overlapped.clone(), cols_for(&overlapped)));

        Ok(Self {
            var_names,
            blocks,
            owned,
            overlapped,
            export,
            graph_owned,
            graph_overlapped,
        })
    }

    pub fn num_vars(&self) -> usize {
        self.var_names.len()
    }

    pub fn var_id(&self, name: &str) -> Option<usize> {
        self.var_names.iter().position(|n| n == name)
    }

    pub fn gid(&self, node: usize, var_id: usize) -> u64 {
        node as u64 * self.var_names.len() as u64 + var_id as u64
    }

    /// Identify strong-Dirichlet dofs from the BC specs. The prescribed
    /// value is fetched later through the function manager under the name
    /// `"<var> <sideset>"`.
    pub fn set_bc_data(
        &self,
        mesh: &Mesh,
        specs: &[BcSpec],
    ) -> Result<Vec<DirichletBc>, ConsistencyError> {
        let mut seen: BTreeSet<u64> = BTreeSet::new();
        let mut out = Vec::new();

        for spec in specs {
            if spec.kind != SideKind::StrongDirichlet {
                continue;
            }
            let var_id = self
                .var_id(&spec.var)
                .ok_or_else(|| ConsistencyError::UnusedVariable(spec.var.clone()))?;
            let sideset = mesh.side_set(&spec.sideset)?;
            let value_fn = format!("{} {}", spec.var, spec.sideset);

            for &(b, elem, side) in &sideset.sides {
                let block = &self.blocks[b];
                let topo = mesh.blocks[b].topology;
                let Some(v_local) = block.var_ids.iter().position(|&id| id == var_id) else {
                    continue;
                };
                let dof_nodes = block.bases[v_local].dof_nodes();
                let side_nodes = topo.side_nodes(side);
                for &local_node in &side_nodes {
                    let Some(_i) = dof_nodes.iter().position(|&n| n == local_node) else {
                        continue;
                    };
                    let node = mesh.blocks[b].connectivity[elem][local_node];
                    let gid = self.gid(node, var_id);
                    if seen.insert(gid) {
                        out.push(DirichletBc {
                            gid,
                            node,
                            var: var_id,
                            value_fn: value_fn.clone(),
                        });
                    }
                }
            }
        }
        Ok(out)
    }
}
