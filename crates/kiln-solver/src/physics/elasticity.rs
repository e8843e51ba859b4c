//! Small-strain isotropic linear elasticity.
//!
//! Volume weak form: sigma(u) : grad(phi) - b.phi with
//! sigma = lambda*tr(eps)*I + 2*mu*eps. Boundary handling is component-wise:
//! weak Dirichlet uses the penalty-consistent form scaled by (2*mu + lambda),
//! Neumann sides apply prescribed tractions.

use rayon::prelude::*;

use kiln_model::{Settings, SideKind};

use crate::dofs::Variable;
use crate::error::AssemblyError;
use crate::functions::{FunctionManager, Location};
use crate::physics::PhysicsModule;
use crate::workset::Workset;
use crate::EvalScalar;

const COMPONENTS: [&str; 3] = ["ux", "uy", "uz"];
const AXES: [&str; 3] = ["x", "y", "z"];

pub struct LinearElasticity {
    dim: usize,
    order: usize,
    vars: [usize; 3],
}

impl LinearElasticity {
    pub fn new(dim: usize, settings: &Settings) -> Self {
        Self {
            dim,
            order: settings.get_int("order", 1) as usize,
            vars: [0; 3],
        }
    }

    /// Stress at one point from the displacement gradients.
    fn stress(
        &self,
        grads: &[[EvalScalar; 3]],
        lambda: EvalScalar,
        mu: EvalScalar,
    ) -> [[EvalScalar; 3]; 3] {
        let dim = self.dim;
        let mut trace = EvalScalar::zero();
        for c in 0..dim {
            trace += grads[c][c];
        }
        let mut sigma = [[EvalScalar::zero(); 3]; 3];
        for c in 0..dim {
            for d in 0..dim {
                let eps = (grads[c][d] + grads[d][c]) * 0.5;
                sigma[c][d] = mu * 2.0 * eps;
                if c == d {
                    sigma[c][d] += lambda * trace;
                }
            }
        }
        sigma
    }
}

impl PhysicsModule for LinearElasticity {
    fn name(&self) -> &'static str {
        "elasticity"
    }

    fn variables(&self) -> Vec<Variable> {
        (0..self.dim)
            .map(|c| Variable {
                name: COMPONENTS[c].to_string(),
                order: self.order,
            })
            .collect()
    }

    fn required_functions(&self) -> Vec<&'static str> {
        // Body forces are optional; Lame coefficients and density are not.
        vec!["lambda", "mu", "density"]
    }

    fn set_vars(&mut self, vars: &[String]) -> Result<(), AssemblyError> {
        for c in 0..self.dim {
            self.vars[c] = vars
                .iter()
                .position(|v| v == COMPONENTS[c])
                .ok_or_else(|| AssemblyError::UnknownVariable(COMPONENTS[c].to_string()))?;
        }
        Ok(())
    }

    fn volume_residual(
        &self,
        fm: &FunctionManager,
        ws: &mut Workset,
    ) -> Result<(), AssemblyError> {
        let lambda = fm.evaluate("lambda", Location::Ip, ws)?;
        let mu = fm.evaluate("mu", Location::Ip, ws)?;
        let rho = fm.evaluate("density", Location::Ip, ws)?;
        let mut body: Vec<Option<Vec<EvalScalar>>> = Vec::with_capacity(self.dim);
        for c in 0..self.dim {
            let name = format!("body force {}", AXES[c]);
            body.push(if fm.is_registered(&name, Location::Ip) {
                Some(fm.evaluate(&name, Location::Ip, ws)?)
            } else {
                None
            });
        }

        let geom = ws.geom.clone().expect("volume geometry bound");
        let dim = self.dim;
        let vars = self.vars;
        let nq = ws.num_ip;
        let num_dofs = ws.num_dofs;
        let offsets = &ws.offsets;
        let soln_grad = &ws.soln_grad;
        let soln_dot = &ws.soln_dot;
        let this = &*self;

        ws.res
            .par_chunks_mut(num_dofs)
            .enumerate()
            .for_each(|(e, res_e)| {
                for k in 0..nq {
                    let p = e * nq + k;
                    let mut grads = [[EvalScalar::zero(); 3]; 3];
                    for c in 0..dim {
                        grads[c] = soln_grad[vars[c]][p];
                    }
                    let sigma = this.stress(&grads, lambda[p], mu[p]);

                    for c in 0..dim {
                        let iv = vars[c];
                        let basis = &geom.basis[iv];
                        // Inertia in transient mode plus body force.
                        let mut point_term = rho[p] * soln_dot[iv][p];
                        if let Some(b) = &body[c] {
                            point_term -= b[p];
                        }
                        for i in 0..basis.num_basis {
                            let mut contrib = point_term * basis.wval(e, i, k);
                            for d in 0..dim {
                                contrib += sigma[c][d] * basis.wgradv(e, i, k, d);
                            }
                            res_e[offsets[iv][i]] += contrib;
                        }
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
        let active = (0..self.dim).any(|c| {
            let iv = self.vars[c];
            (0..ws.num_elems).any(|e| {
                let k = ws.side_kind(e, iv);
                k != SideKind::None as i32 && k != SideKind::StrongDirichlet as i32
            })
        });
        if !active {
            return Ok(());
        }
        let lambda = fm.evaluate("lambda", Location::SideIp, ws)?;
        let mu = fm.evaluate("mu", Location::SideIp, ws)?;
        let sg = ws.side_geom.clone().expect("side geometry bound");
        let dim = self.dim;
        let nq = ws.num_ip;
        let s_form = if ws.is_adjoint { 1.0 } else { ws.form_param };

        for c in 0..dim {
            let iv = self.vars[c];
            let kinds: Vec<i32> = (0..ws.num_elems).map(|e| ws.side_kind(e, iv)).collect();
            let needs_value = kinds
                .iter()
                .any(|&k| k == SideKind::WeakDirichlet as i32 || k == SideKind::Neumann as i32);
            let bdata = if needs_value {
                let name = format!("{} {}", ws.vars[iv], ws.sideset);
                Some(fm.evaluate(&name, Location::SideIp, ws)?)
            } else {
                None
            };
            if kinds.iter().any(|&k| k == SideKind::Interface as i32) {
                self.compute_flux(fm, ws)?;
            }

            let basis = &sg.basis[iv];
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
                            let n = sg.normals[p];
                            let stiff = mu[p] * 2.0 + lambda[p];
                            let jump = u - g;

                            // Traction consistency uses the full stress row.
                            let mut grads = [[EvalScalar::zero(); 3]; 3];
                            for cc in 0..dim {
                                grads[cc] = ws.soln_grad[self.vars[cc]][p];
                            }
                            let sigma = self.stress(&grads, lambda[p], mu[p]);
                            let mut traction = EvalScalar::zero();
                            for d in 0..dim {
                                traction += sigma[c][d] * n[d];
                            }

                            for i in 0..basis.num_basis {
                                let wphi = basis.wval(e, i, k);
                                let mut dphidn_w = 0.0;
                                for d in 0..dim {
                                    dphidn_w += basis.wgradv(e, i, k, d) * n[d];
                                }
                                let contrib = -traction * wphi
                                    - stiff * jump * (s_form * dphidn_w)
                                    + stiff * (10.0 / h) * jump * wphi;
                                ws.res[e * ws.num_dofs + ws.offsets[iv][i]] += contrib;
                            }
                        }
                        x if x == SideKind::Neumann as i32 => {
                            let g = bdata.as_ref().unwrap()[p];
                            for i in 0..basis.num_basis {
                                let wphi = basis.wval(e, i, k);
                                ws.res[e * ws.num_dofs + ws.offsets[iv][i]] -= g * wphi;
                            }
                        }
                        x if x == SideKind::Interface as i32 => {
                            let fl = ws.flux[(e * nq + k) * ws.num_vars() + iv];
                            for i in 0..basis.num_basis {
                                let wphi = basis.wval(e, i, k);
                                ws.res[e * ws.num_dofs + ws.offsets[iv][i]] -= fl * wphi;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn compute_flux(&self, fm: &FunctionManager, ws: &mut Workset) -> Result<(), AssemblyError> {
        let lambda = fm.evaluate("lambda", Location::SideIp, ws)?;
        let mu = fm.evaluate("mu", Location::SideIp, ws)?;
        let sg = ws.side_geom.clone().expect("side geometry bound");
        let dim = self.dim;
        let nq = ws.num_ip;
        let nvars = ws.num_vars();

        for e in 0..ws.num_elems {
            let h = sg.h[e];
            for k in 0..nq {
                let p = e * nq + k;
                let n = sg.normals[p];
                let mut grads = [[EvalScalar::zero(); 3]; 3];
                for c in 0..dim {
                    grads[c] = ws.soln_grad[self.vars[c]][p];
                }
                let sigma = self.stress(&grads, lambda[p], mu[p]);
                for c in 0..dim {
                    let iv = self.vars[c];
                    let stiff = mu[p] * 2.0 + lambda[p];
                    let mut traction = EvalScalar::zero();
                    for d in 0..dim {
                        traction += sigma[c][d] * n[d];
                    }
                    ws.flux[(e * nq + k) * nvars + iv] = stiff * (10.0 / h)
                        * (ws.aux[iv][p] - ws.soln[iv][p])
                        + traction;
                }
            }
        }
        Ok(())
    }
}
