//! Gather/scatter index-table properties: a gather followed by a scatter
//! with additive export reconstructs the input on shared dofs, the gather
//! kinds land in their workset fields with the requested seeding, and the
//! derivative-capacity guard fires at cell registration.

mod common;

use common::{pseudo_random, thermal_settings};
use kiln_la::DistVector;
use kiln_model::mesh::unit_square;
use kiln_solver::cells::Cell;
use kiln_solver::dofs::{DofManager, Variable};
use kiln_solver::{AssemblyError, GatherKind, SeedMode, Workset};

fn build(mesh: &kiln_model::Mesh) -> (DofManager, Vec<Cell>, Workset) {
    let vars = vec![vec![Variable {
        name: "T".to_string(),
        order: 1,
    }]];
    let dofs = DofManager::build(mesh, &vars).unwrap();
    let mut cells = Vec::new();
    // Two batches to exercise shared dofs between cells.
    let ne = mesh.blocks[0].num_elements();
    for chunk in [(0..ne / 2).collect::<Vec<_>>(), (ne / 2..ne).collect()] {
        cells.push(
            Cell::new(
                0,
                chunk,
                mesh,
                &dofs.blocks[0],
                &dofs.overlapped,
                0,
                None,
                0,
            )
            .unwrap(),
        );
    }
    let ws = Workset::new(
        0,
        vec!["T".to_string()],
        dofs.blocks[0].offsets.clone(),
        dofs.blocks[0].num_dofs_per_elem,
    );
    (dofs, cells, ws)
}

#[test]
fn gather_scatter_reconstructs_shared_dofs() {
    let mesh = unit_square(4, 2, 1);
    let (dofs, cells, _) = build(&mesh);

    let mut v = DistVector::new(dofs.overlapped.clone());
    for (lid, r) in pseudo_random(v.len(), 3).iter().enumerate() {
        v.set_local(lid, 1.0 + r);
    }

    // Gather dof coefficients through the index table, scatter them back
    // with additive combine, and count multiplicities.
    let mut scattered = DistVector::new(dofs.overlapped.clone());
    let mut multiplicity = DistVector::new(dofs.overlapped.clone());
    for cell in &cells {
        for e in 0..cell.num_elems() {
            for (slot, &gid) in cell.gids[e].iter().enumerate() {
                let local = v.local(cell.index[e][slot]);
                scattered.sum_into_global(gid, local).unwrap();
                multiplicity.sum_into_global(gid, 1.0).unwrap();
            }
        }
    }

    let mut owned = DistVector::new(dofs.owned.clone());
    dofs.export
        .apply(&scattered, &mut owned, kiln_la::CombineMode::Add);
    let mut counts = DistVector::new(dofs.owned.clone());
    dofs.export
        .apply(&multiplicity, &mut counts, kiln_la::CombineMode::Add);

    for lid in 0..owned.len() {
        let gid = dofs.owned.gid(lid);
        let m = counts.local(lid);
        assert!(m >= 1.0);
        let recon = owned.local(lid) / m;
        let original = v.get_global(gid).unwrap();
        assert!(
            (recon - original).abs() < 1e-14,
            "gid {gid}: {recon} vs {original}"
        );
    }
}

#[test]
fn gather_kinds_fill_their_fields() {
    let mesh = unit_square(2, 2, 1);
    let (dofs, cells, mut ws) = build(&mesh);

    let mut v = DistVector::new(dofs.overlapped.clone());
    v.put_scalar(2.0);

    let cell = &cells[0];
    cell.update_workset(&mut ws);
    cell.gather(&mut ws, GatherKind::Soln, &v, SeedMode::Dofs);
    cell.gather(&mut ws, GatherKind::SolnDot, &v, SeedMode::DofsScaled(7.0));
    cell.gather(&mut ws, GatherKind::Adjoint, &v, SeedMode::None);
    cell.gather(&mut ws, GatherKind::AdjointDot, &v, SeedMode::None);
    cell.gather(&mut ws, GatherKind::AdjointPrev, &v, SeedMode::None);
    cell.gather(&mut ws, GatherKind::Aux, &v, SeedMode::None);

    let nq = cell.geom.num_ip;
    for p in 0..cell.num_elems() * nq {
        // Constant field: interpolation reproduces the value everywhere.
        assert!((ws.soln[0][p].val() - 2.0).abs() < 1e-13);
        assert!((ws.adj[0][p].val() - 2.0).abs() < 1e-13);
        assert!((ws.adj_dot[0][p].val() - 2.0).abs() < 1e-13);
        assert!((ws.adj_prev[0][p].val() - 2.0).abs() < 1e-13);
        assert!((ws.aux[0][p].val() - 2.0).abs() < 1e-13);

        // Seeded derivative slots reproduce the basis partition of unity.
        let dsum: f64 = (0..ws.num_dofs).map(|j| ws.soln[0][p].dx(j)).sum();
        assert!((dsum - 1.0).abs() < 1e-13);
        let dot_sum: f64 = (0..ws.num_dofs).map(|j| ws.soln_dot[0][p].dx(j)).sum();
        assert!((dot_sum - 7.0).abs() < 1e-12);
        // Unseeded gathers carry no derivatives.
        assert_eq!(ws.adj[0][p].dx(0), 0.0);
    }
}

#[test]
fn derivative_capacity_guard_fires() {
    let mesh = unit_square(2, 2, 1);
    let vars = vec![vec![Variable {
        name: "T".to_string(),
        order: 1,
    }]];
    let dofs = DofManager::build(&mesh, &vars).unwrap();

    let err = Cell::new(
        0,
        vec![0],
        &mesh,
        &dofs.blocks[0],
        &dofs.overlapped,
        0,
        None,
        kiln_solver::MAX_DERIVS, // dofs + this many extras cannot fit
    )
    .unwrap_err();
    assert!(matches!(err, AssemblyError::DerivativeCapacity { .. }));
}
