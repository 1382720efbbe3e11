use anyhow::Result;
use log::debug;
use polyscft_field::Real;

use crate::attribs::AttribSet;
use crate::comm::Comm;
use crate::context::EngineContext;
use crate::decomp::SlabDecomp;
use crate::error::{class_error, ErrorClass};
use crate::grid::UniCartGrid;
use crate::interaction::Interaction;
use crate::physfield::PhysField;
use crate::polymer::Polymer;
use crate::solvent::Solvent;

/// The closed set of history kinds.
enum HistoryKind {
    /// Total free energy: interaction terms plus the chain and solvent
    /// entropy contributions.
    FreeEnergy { calc_disorder: bool },
    /// The uniform χN of one interaction, tracking time ramps.
    FloryConstChi { interaction: String },
    /// χN sampled at one grid point of one interaction's field.
    FloryChiAtPoint {
        interaction: String,
        point: [i64; 3],
    },
}

/// A time-series diagnostic collector. The time and data vectors grow
/// in lockstep; serialization attributes are produced at dump time.
pub struct History<R: Real> {
    name: String,
    path: String,
    period: usize,
    kind: HistoryKind,
    times: Vec<R>,
    data: Vec<R>,
}

impl<R: Real> History<R> {
    pub fn from_attribs(name: &str, tas: &AttribSet) -> Result<Self> {
        let kind = match tas.kind()?.as_str() {
            "freeEnergy" => HistoryKind::FreeEnergy {
                calc_disorder: tas.flag_or("calcDisorder", true)?,
            },
            "floryConstChi" => HistoryKind::FloryConstChi {
                interaction: tas.get_string("interactionName")?,
            },
            "floryChiAtPoint" => {
                let point = if tas.has_prm_vec("point") {
                    let v = tas.get_opt_vec("point")?;
                    let mut p = [0i64; 3];
                    for (d, &x) in v.iter().take(3).enumerate() {
                        p[d] = x;
                    }
                    p
                } else {
                    // Chosen at build from the synchronized stream.
                    [-1, -1, -1]
                };
                HistoryKind::FloryChiAtPoint {
                    interaction: tas.get_string("interactionName")?,
                    point,
                }
            }
            other => {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("unknown History kind {other:?}"),
                ))
            }
        };

        let period = tas.option_or("updatePeriodicity", 1)?;
        if period < 1 {
            return Err(class_error(
                ErrorClass::InvalidAttribute,
                tas.path(),
                "updatePeriodicity must be at least 1",
            ));
        }

        Ok(History {
            name: name.to_string(),
            path: tas.path().to_string(),
            period: period as usize,
            kind,
            times: Vec::new(),
            data: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn times(&self) -> &[R] {
        &self.times
    }

    pub fn data(&self) -> &[R] {
        &self.data
    }

    /// Validates references and fixes a random sample point when one
    /// was not specified.
    pub fn build_solvers(
        &mut self,
        interactions: &[Interaction<R>],
        grid: &UniCartGrid<R>,
        ctx: &mut EngineContext<R>,
    ) -> Result<()> {
        match &mut self.kind {
            HistoryKind::FreeEnergy { .. } => {}
            HistoryKind::FloryConstChi { interaction }
            | HistoryKind::FloryChiAtPoint { interaction, .. } => {
                if !interactions.iter().any(|i| i.name() == interaction.as_str()) {
                    return Err(class_error(
                        ErrorClass::UnknownObject,
                        &self.path,
                        format!("no Interaction named {interaction:?}"),
                    ));
                }
            }
        }
        if let HistoryKind::FloryChiAtPoint { point, .. } = &mut self.kind {
            if point[0] < 0 {
                *point = grid.random_global_point(ctx);
                debug!("history {}: sampling chiN at {:?}", self.name, point);
            } else {
                *point = grid.fold(*point);
            }
        }
        Ok(())
    }

    /// Samples the observable when the step lands on the periodicity.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        t: usize,
        phys: &[PhysField<R>],
        interactions: &[Interaction<R>],
        polymers: &[Polymer<R>],
        solvents: &[Solvent<R>],
        grid: &UniCartGrid<R>,
        decomp: &SlabDecomp,
        comm: &dyn Comm<R>,
    ) -> Result<()> {
        if t % self.period != 0 {
            return Ok(());
        }

        let value = match &self.kind {
            HistoryKind::FreeEnergy { calc_disorder } => free_energy(
                phys,
                interactions,
                polymers,
                solvents,
                comm,
                grid.total_cells_global(),
                *calc_disorder,
            )?,
            HistoryKind::FloryConstChi { interaction } => {
                let term = interactions
                    .iter()
                    .find(|i| i.name() == interaction.as_str())
                    .expect("validated at build");
                term.param_uniform()?
            }
            HistoryKind::FloryChiAtPoint { interaction, point } => {
                let term = interactions
                    .iter()
                    .find(|i| i.name() == interaction.as_str())
                    .expect("validated at build");
                // Only the owning rank contributes; the reduction
                // spreads the sample to everyone.
                let local = if decomp.has_position(*point) {
                    let l = grid.to_local(*point, decomp);
                    let n = decomp.num_cells_local();
                    let idx = (l[0] as usize * n[1] + l[1] as usize) * n[2] + l[2] as usize;
                    term.chi_at(idx)
                } else {
                    R::ZERO
                };
                comm.all_reduce_sum(local)?
            }
        };

        self.times.push(R::from_usize(t));
        self.data.push(value);
        debug_assert_eq!(self.times.len(), self.data.len());
        Ok(())
    }
}

/// `F = Σ_int F_int − Σ_p (φ_p/f_p)·ln Q_p − Σ_s φ_s·ln Q_s`.
pub fn free_energy<R: Real>(
    phys: &[PhysField<R>],
    interactions: &[Interaction<R>],
    polymers: &[Polymer<R>],
    solvents: &[Solvent<R>],
    comm: &dyn Comm<R>,
    total_cells_global: usize,
    calc_disorder: bool,
) -> Result<R> {
    let mut f = R::ZERO;
    for term in interactions {
        f += term.calc_fe(phys, comm, total_cells_global, calc_disorder)?;
    }
    for p in polymers {
        f -= p.volfrac() / p.f_chain() * p.log_big_q();
    }
    for s in solvents {
        f -= s.volfrac() * s.big_q().ln();
    }
    Ok(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use crate::decomp::local_slab_sizes;
    use crate::physfield::PhysFieldId;
    use hashbrown::HashMap;

    fn world() -> (
        UniCartGrid<f64>,
        SlabDecomp,
        Vec<PhysField<f64>>,
        Vec<Interaction<f64>>,
        EngineContext<f64>,
    ) {
        let gtas = AttribSet::from_json_str(
            "Grid",
            r#"{ "kind": "uniCartGrid", "numCellsGlobal": [8, 8, 1] }"#,
        )
        .unwrap();
        let grid = UniCartGrid::from_attribs("grid", &gtas, &[]).unwrap();
        let sizes = local_slab_sizes(&grid, &SerialComm);
        let decomp = SlabDecomp::build("decomp", "Domain.decomp", false, &grid, &sizes).unwrap();
        let mut ctx = EngineContext::new(2, 0);
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
        ];
        let names: HashMap<String, PhysFieldId> = phys
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name().to_string(), PhysFieldId(i)))
            .collect();
        let itas = AttribSet::from_json_str(
            "Interaction",
            r#"{ "kind": "flory", "scfields": ["monoA", "monoB"], "chiN": 15.0 }"#,
        )
        .unwrap();
        let mut term = Interaction::from_attribs("floryAB", &itas).unwrap();
        term.build_solvers(&mut phys, &names, &decomp).unwrap();
        (grid, decomp, phys, vec![term], ctx)
    }

    #[test]
    fn free_energy_history_samples_on_its_period() {
        let (grid, decomp, mut phys, inter, mut ctx) = world();
        phys[0].dens_mut().reset(0.4);
        phys[1].dens_mut().reset(0.6);

        let tas = AttribSet::from_json_str(
            "History",
            r#"{ "kind": "freeEnergy", "updatePeriodicity": 2 }"#,
        )
        .unwrap();
        let mut h = History::<f64>::from_attribs("fe", &tas).unwrap();
        h.build_solvers(&inter, &grid, &mut ctx).unwrap();

        for t in 0..5 {
            h.update(t, &phys, &inter, &[], &[], &grid, &decomp, &SerialComm)
                .unwrap();
        }
        assert_eq!(h.times(), &[0.0, 2.0, 4.0]);
        assert_eq!(h.data().len(), 3);
        // With no species terms, F is the Flory energy alone.
        for &f in h.data() {
            assert!((f - 3.6).abs() < 1e-12);
        }
    }

    #[test]
    fn chi_at_point_samples_the_interaction_parameter() {
        let (grid, decomp, phys, inter, mut ctx) = world();
        let tas = AttribSet::from_json_str(
            "History",
            r#"{ "kind": "floryChiAtPoint", "interactionName": "floryAB",
                 "point": [3, 4, 0] }"#,
        )
        .unwrap();
        let mut h = History::<f64>::from_attribs("chiPt", &tas).unwrap();
        h.build_solvers(&inter, &grid, &mut ctx).unwrap();
        h.update(0, &phys, &inter, &[], &[], &grid, &decomp, &SerialComm)
            .unwrap();
        assert_eq!(h.data(), &[15.0]);
    }

    #[test]
    fn unknown_interaction_references_fail_the_build() {
        let (grid, _decomp, _phys, inter, mut ctx) = world();
        let tas = AttribSet::from_json_str(
            "History",
            r#"{ "kind": "floryConstChi", "interactionName": "nope" }"#,
        )
        .unwrap();
        let mut h = History::<f64>::from_attribs("chi", &tas).unwrap();
        assert!(h.build_solvers(&inter, &grid, &mut ctx).is_err());
    }
}
