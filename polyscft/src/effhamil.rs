use anyhow::Result;
use hashbrown::HashMap;
use log::debug;
use polyscft_field::Real;

use crate::attribs::AttribSet;
use crate::comm::Comm;
use crate::context::EngineContext;
use crate::decomp::SlabDecomp;
use crate::error::{class_error, ErrorClass};
use crate::fftplan::FftPlan;
use crate::interaction::Interaction;
use crate::physfield::{PhysField, PhysFieldId};
use crate::updater::{ConstraintUpdater, Updater};

/// The effective Hamiltonian: owns the interaction terms and the
/// field updaters and runs the field-update half of one SCFT step.
///
/// The declared updater sequence is authoritative — the engine never
/// reorders it.
pub struct EffHamil<R: Real> {
    name: String,
    interactions: Vec<Interaction<R>>,
    updaters: Vec<Updater<R>>,
    constraint_updater: Option<ConstraintUpdater<R>>,
}

impl<R: Real> EffHamil<R> {
    pub fn from_attribs(name: &str, tas: &AttribSet) -> Result<Self> {
        match tas.kind()?.as_str() {
            "canonicalMF" => {}
            other => {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("unknown EffHamil kind {other:?}"),
                ))
            }
        }

        let mut interactions = Vec::new();
        for (iname, itas) in tas.children_of_kind("Interaction") {
            interactions.push(Interaction::from_attribs(iname, itas)?);
        }
        let mut updaters = Vec::new();
        for (uname, utas) in tas.children_of_kind("Updater") {
            updaters.push(Updater::from_attribs(uname, utas)?);
        }

        Ok(EffHamil {
            name: name.to_string(),
            interactions,
            updaters,
            constraint_updater: None,
        })
    }

    /// A Hamiltonian with no interaction or updater terms; the
    /// constraint bookkeeping still runs every step.
    pub fn empty(name: &str) -> Self {
        EffHamil {
            name: name.to_string(),
            interactions: Vec::new(),
            updaters: Vec::new(),
            constraint_updater: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interactions(&self) -> &[Interaction<R>] {
        &self.interactions
    }

    pub fn updaters(&self) -> &[Updater<R>] {
        &self.updaters
    }

    pub fn build_solvers(
        &mut self,
        phys: &mut [PhysField<R>],
        phys_names: &HashMap<String, PhysFieldId>,
        plan: &FftPlan<R>,
        decomp: &SlabDecomp,
        constraint: PhysFieldId,
    ) -> Result<()> {
        for term in &mut self.interactions {
            term.build_solvers(phys, phys_names, decomp)?;
        }
        for upd in &mut self.updaters {
            upd.build_solvers(phys, phys_names, plan, decomp, decomp.num_cells_local())?;
        }
        self.constraint_updater = Some(ConstraintUpdater::new(constraint));
        Ok(())
    }

    /// The field-update half of one outer step: constraint bookkeeping
    /// first, then every user updater in declaration order.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        t: usize,
        phys: &mut [PhysField<R>],
        fft: &mut FftPlan<R>,
        comm: &dyn Comm<R>,
        ctx: &mut EngineContext<R>,
        constraint: PhysFieldId,
        total_cells_global: usize,
    ) -> Result<()> {
        debug!("effHamil {}: step {t}", self.name);
        self.constraint_updater
            .as_ref()
            .expect("EffHamil used before build_solvers")
            .update(phys);

        for term in &mut self.interactions {
            term.update(R::from_usize(t));
        }

        for upd in &mut self.updaters {
            upd.update(
                t,
                phys,
                &self.interactions,
                fft,
                comm,
                ctx,
                constraint,
                total_cells_global,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use crate::decomp::local_slab_sizes;
    use crate::fftplan::FftLayout;
    use crate::grid::UniCartGrid;

    const INPUT: &str = r#"{
        "kind": "canonicalMF",
        "Interaction floryAB": { "kind": "flory", "scfields": ["monoA", "monoB"],
                                 "chiN": 12.0 },
        "Updater steep": { "kind": "steepestDescent",
                           "updateFields": ["monoA", "monoB"],
                           "relaxlambda": 0.1, "shiftPressureFlag": "off" }
    }"#;

    #[test]
    fn updaters_run_in_declaration_order_after_the_constraint() {
        let gtas = AttribSet::from_json_str(
            "Grid",
            r#"{ "kind": "uniCartGrid", "numCellsGlobal": [8, 1, 1] }"#,
        )
        .unwrap();
        let grid = UniCartGrid::<f64>::from_attribs("grid", &gtas, &[]).unwrap();
        let sizes = local_slab_sizes(&grid, &SerialComm);
        let decomp = SlabDecomp::build("decomp", "Domain.decomp", false, &grid, &sizes).unwrap();
        let mut plan = FftPlan::new("fft", &grid, FftLayout::Normal);
        let mut ctx = EngineContext::new(0, 0);
        let shape = grid.num_cells_global();
        let mk = |name: &str, kind: &str, ctx: &mut EngineContext<f64>| {
            let tas = AttribSet::from_json_str(
                "PhysField",
                &format!(r#"{{ "kind": "{kind}" }}"#),
            )
            .unwrap();
            PhysField::from_attribs(name, &tas, shape, ctx).unwrap()
        };
        let mut phys = vec![
            mk("monoA", "monomerDens", &mut ctx),
            mk("monoB", "monomerDens", &mut ctx),
            mk("defaultPressure", "constraint", &mut ctx),
        ];
        let names: HashMap<String, PhysFieldId> = phys
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name().to_string(), PhysFieldId(i)))
            .collect();

        let tas = AttribSet::from_json_str("EffHamil", INPUT).unwrap();
        let mut eh = EffHamil::<f64>::from_attribs("hamil", &tas).unwrap();
        eh.build_solvers(&mut phys, &names, &plan, &decomp, PhysFieldId(2))
            .unwrap();
        assert_eq!(eh.interactions().len(), 1);
        assert_eq!(eh.updaters().len(), 1);

        phys[0].dens_mut().reset(0.5);
        phys[1].dens_mut().reset(0.5);
        eh.update(0, &mut phys, &mut plan, &SerialComm, &mut ctx, PhysFieldId(2), 8)
            .unwrap();

        // The constraint published full availability, and the descent
        // moved both conjugates by −λ·χN·φ.
        assert_eq!(phys[2].dens().at([0, 0, 0]), 1.0);
        for id in 0..2 {
            for &v in phys[id].conj().as_slice() {
                assert!((v + 0.6).abs() < 1e-12);
            }
        }
    }
}
