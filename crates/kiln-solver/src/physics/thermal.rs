//! Scalar thermal diffusion.
//!
//! Volume weak form at a quadrature point:
//! rho*cp*du/dt*phi + kappa*grad(u).grad(phi) - f*phi (+ v.grad(u)*phi when
//! a velocity field ux/uy/uz is present in the block). Weak Dirichlet sides
//! carry the symmetric Nitsche form with the (10*kappa/h) penalty; interface
//! sides use the numerical flux with the mortar trace.

use rayon::prelude::*;

use kiln_model::{Settings, SideKind};

use crate::dofs::Variable;
use crate::error::AssemblyError;
use crate::functions::{FunctionManager, Location};
use crate::physics::PhysicsModule;
use crate::workset::Workset;
use crate::EvalScalar;

pub struct ThermalDiffusion {
    dim: usize,
    order: usize,
    var: usize,
    velocity: [Option<usize>; 3],
}

impl ThermalDiffusion {
    pub fn new(dim: usize, settings: &Settings) -> Self {
        Self {
            dim,
            order: settings.get_int("order", 1) as usize,
            var: 0,
            velocity: [None; 3],
        }
    }
}

impl PhysicsModule for ThermalDiffusion {
    fn name(&self) -> &'static str {
        "thermal"
    }

    fn variables(&self) -> Vec<Variable> {
        vec![Variable {
            name: "T".to_string(),
            order: self.order,
        }]
    }

    fn required_functions(&self) -> Vec<&'static str> {
        vec!["density", "specific heat", "thermal diffusion", "thermal source"]
    }

    fn set_vars(&mut self, vars: &[String]) -> Result<(), AssemblyError> {
        self.var = vars
            .iter()
            .position(|v| v == "T")
            .ok_or_else(|| AssemblyError::UnknownVariable("T".to_string()))?;
        for (d, name) in ["ux", "uy", "uz"].iter().enumerate().take(self.dim) {
            self.velocity[d] = vars.iter().position(|v| v == *name);
        }
        Ok(())
    }

    fn volume_residual(
        &self,
        fm: &FunctionManager,
        ws: &mut Workset,
    ) -> Result<(), AssemblyError> {
        let rho = fm.evaluate("density", Location::Ip, ws)?;
        let cp = fm.evaluate("specific heat", Location::Ip, ws)?;
        let kappa = fm.evaluate("thermal diffusion", Location::Ip, ws)?;
        let source = fm.evaluate("thermal source", Location::Ip, ws)?;

        let geom = ws.geom.clone().expect("volume geometry bound");
        let iv = self.var;
        let basis = &geom.basis[iv];
        let nb = basis.num_basis;
        let nq = ws.num_ip;
        let dim = self.dim;
        let num_dofs = ws.num_dofs;
        let offsets = &ws.offsets[iv];
        let soln_dot = &ws.soln_dot[iv];
        let soln_grad = &ws.soln_grad[iv];
        let vel: Vec<&Vec<EvalScalar>> = self
            .velocity
            .iter()
            .take(dim)
            .filter_map(|v| v.map(|idx| &ws.soln[idx]))
            .collect();
        let convective = vel.len() == dim;

        ws.res
            .par_chunks_mut(num_dofs)
            .enumerate()
            .for_each(|(e, res_e)| {
                for k in 0..nq {
                    let p = e * nq + k;
                    let udot = soln_dot[p];
                    let gradu = soln_grad[p];
                    let mut transport = rho[p] * cp[p] * udot - source[p];
                    if convective {
                        for (d, v) in vel.iter().enumerate() {
                            transport += v[p] * gradu[d];
                        }
                    }
                    for i in 0..nb {
                        let mut contrib = transport * basis.wval(e, i, k);
                        for d in 0..dim {
                            contrib += kappa[p] * gradu[d] * basis.wgradv(e, i, k, d);
                        }
                        res_e[offsets[i]] += contrib;
                    }
                }
            });
        Ok(())
    }

    fn boundary_residual(
        &self,
        fm: &FunctionManager,
        ws: &mut Workset,
    ) -> Result<(), AssemblyError> {
        let iv = self.var;
        let nvars = ws.num_vars();
        let kinds: Vec<i32> = (0..ws.num_elems).map(|e| ws.side_kind(e, iv)).collect();
        let needs_value = kinds
            .iter()
            .any(|&k| k == SideKind::WeakDirichlet as i32 || k == SideKind::Neumann as i32);
        let needs_flux = kinds.iter().any(|&k| k == SideKind::Interface as i32);
        if !needs_value && !needs_flux {
            return Ok(());
        }

        let bdata = if needs_value {
            let name = format!("{} {}", ws.vars[iv], ws.sideset);
            Some(fm.evaluate(&name, Location::SideIp, ws)?)
        } else {
            None
        };
        if needs_flux {
            self.compute_flux(fm, ws)?;
        }
        let kappa = fm.evaluate("thermal diffusion", Location::SideIp, ws)?;

        let sg = ws.side_geom.clone().expect("side geometry bound");
        let basis = &sg.basis[iv];
        let nb = basis.num_basis;
        let nq = ws.num_ip;
        let dim = self.dim;
        let s_form = if ws.is_adjoint { 1.0 } else { ws.form_param };

        for e in 0..ws.num_elems {
            let kind = kinds[e];
            if kind == SideKind::None as i32 || kind == SideKind::StrongDirichlet as i32 {
                continue;
            }
            let h = sg.h[e];
            for k in 0..nq {
                let p = e * nq + k;
                match kind {
                    x if x == SideKind::WeakDirichlet as i32 => {
                        let g = bdata.as_ref().unwrap()[p];
                        let u = ws.soln[iv][p];
                        let gradu = ws.soln_grad[iv][p];
                        let n = sg.normals[p];
                        let mut dudn = EvalScalar::zero();
                        for d in 0..dim {
                            dudn += gradu[d] * n[d];
                        }
                        let jump = u - g;
                        let pen = 10.0 / h;
                        for i in 0..nb {
                            let wphi = basis.wval(e, i, k);
                            let mut dphidn_w = 0.0;
                            for d in 0..dim {
                                dphidn_w += basis.wgradv(e, i, k, d) * n[d];
                            }
                            let contrib = -(kappa[p] * dudn) * wphi
                                - kappa[p] * jump * (s_form * dphidn_w)
                                + kappa[p] * pen * jump * wphi;
                            ws.res[e * ws.num_dofs + ws.offsets[iv][i]] += contrib;
                        }
                    }
                    x if x == SideKind::Neumann as i32 => {
                        let g = bdata.as_ref().unwrap()[p];
                        for i in 0..nb {
                            let wphi = basis.wval(e, i, k);
                            ws.res[e * ws.num_dofs + ws.offsets[iv][i]] -= g * wphi;
                        }
                    }
                    x if x == SideKind::Interface as i32 => {
                        let fl = ws.flux[(e * nq + k) * nvars + iv];
                        for i in 0..nb {
                            let wphi = basis.wval(e, i, k);
                            ws.res[e * ws.num_dofs + ws.offsets[iv][i]] -= fl * wphi;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn compute_flux(&self, fm: &FunctionManager, ws: &mut Workset) -> Result<(), AssemblyError> {
        let kappa = fm.evaluate("thermal diffusion", Location::SideIp, ws)?;
        let sg = ws.side_geom.clone().expect("side geometry bound");
        let iv = self.var;
        let nvars = ws.num_vars();
        let nq = ws.num_ip;
        let dim = self.dim;

        for e in 0..ws.num_elems {
            let h = sg.h[e];
            for k in 0..nq {
                let p = e * nq + k;
                let u = ws.soln[iv][p];
                let gradu = ws.soln_grad[iv][p];
                let n = sg.normals[p];
                let lambda = ws.aux[iv][p];
                let mut dudn = EvalScalar::zero();
                for d in 0..dim {
                    dudn += gradu[d] * n[d];
                }
                ws.flux[(e * nq + k) * nvars + iv] =
                    kappa[p] * (10.0 / h) * (lambda - u) + kappa[p] * dudn;
            }
        }
        Ok(())
    }
}
