use anyhow::Result;
use hashbrown::HashMap;
use log::{info, warn, Level};
use polyscft_field::Real;

use crate::attribs::AttribSet;
use crate::boundary::Boundary;
use crate::catalog::validate_kind;
use crate::comm::{Comm, SerialComm};
use crate::context::EngineContext;
use crate::decomp::SlabDecomp;
use crate::effhamil::EffHamil;
use crate::error::{class_error, ErrorClass};
use crate::fftplan::{FftLayout, FftPlan};
use crate::grid::UniCartGrid;
use crate::history::{free_energy, History};
use crate::io::{dump_file_name, history_file_name, DumpReader, DumpWriter, JsonDump};
use crate::physfield::{PhysField, PhysFieldId, PhysFieldKind};
use crate::polymer::Polymer;
use crate::solvent::Solvent;
use crate::timed;
use crate::timing::TimingTree;

/// Command-line overrides applied on top of the input tree.
#[derive(Clone, Debug, Default)]
pub struct RunOverrides {
    pub nsteps: Option<usize>,
    pub dump_periodicity: Option<usize>,
    pub restart_seq: Option<usize>,
    pub output_base: Option<String>,
}

/// The root of the object tree: owns every holder, drives the outer
/// time-step loop, and schedules dumps.
pub struct Domain<R: Real> {
    name: String,
    nsteps: usize,
    dump_periodicity: usize,
    output_base: String,
    step0: usize,
    seq: usize,
    grid: UniCartGrid<R>,
    decomp: SlabDecomp,
    comm: Box<dyn Comm<R>>,
    fft: FftPlan<R>,
    ctx: EngineContext<R>,
    phys: Vec<PhysField<R>>,
    phys_names: HashMap<String, PhysFieldId>,
    constraint: PhysFieldId,
    polymers: Vec<Polymer<R>>,
    solvents: Vec<Solvent<R>>,
    boundaries: Vec<Boundary<R>>,
    effhamil: EffHamil<R>,
    histories: Vec<History<R>>,
}

impl<R: Real> std::fmt::Debug for Domain<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("nsteps", &self.nsteps)
            .field("dump_periodicity", &self.dump_periodicity)
            .field("output_base", &self.output_base)
            .field("step0", &self.step0)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl<R: Real> Domain<R> {
    /// Two-phase build of the whole object graph: construct and
    /// allocate in dependency order, then resolve every cross-object
    /// reference by name. Any failure aborts with no partial graph.
    pub fn build(tas: &AttribSet, overrides: &RunOverrides) -> Result<Self> {
        let nsteps = overrides
            .nsteps
            .unwrap_or(tas.option_or("nsteps", 1)? as usize);
        let dump_periodicity = overrides
            .dump_periodicity
            .unwrap_or(tas.option_or("dumpPeriodicity", 0)? as usize);
        let output_base = overrides
            .output_base
            .clone()
            .unwrap_or_else(|| tas.name().to_string());
        let seed = tas.option_or("randomSeed", 0)? as u64;

        let comm: Box<dyn Comm<R>> = Box::new(SerialComm);
        for (_, ctas) in tas.children_of_kind("Comm") {
            validate_kind("Comm", &ctas.kind()?, ctas.path())?;
        }
        let mut ctx = EngineContext::new(seed, comm.rank());

        // L0: grid and decomposition.
        let domain_cells = if tas.has_prm_vec("numCellsGlobal") {
            tas.get_opt_vec("numCellsGlobal")?
        } else {
            Vec::new()
        };
        let grid_children = tas.children_of_kind("Grid");
        let (gname, gtas) = grid_children.first().ok_or_else(|| {
            class_error(ErrorClass::UnknownObject, tas.path(), "no Grid declared")
        })?;
        validate_kind("Grid", &gtas.kind()?, gtas.path())?;
        let grid = UniCartGrid::from_attribs(gname, gtas, &domain_cells)?;

        let decomp = match tas.children_of_kind("Decomp").first() {
            Some((dname, dtas)) => SlabDecomp::from_attribs(dname, dtas, &grid, comm.as_ref())?,
            None => {
                let sizes = crate::decomp::local_slab_sizes(&grid, comm.as_ref());
                SlabDecomp::build("decomp", tas.path(), false, &grid, &sizes)?
            }
        };

        // L1: the transform plan; its layout must match the slab axis.
        let fft = match tas.children_of_kind("FFT").first() {
            Some((fname, ftas)) => {
                validate_kind("FFT", &ftas.kind()?, ftas.path())?;
                let plan = FftPlan::from_attribs(fname, ftas, &grid)?;
                let wants_transpose = plan.layout() == FftLayout::Transpose;
                if wants_transpose != decomp.transpose() {
                    return Err(class_error(
                        ErrorClass::InvalidAttribute,
                        ftas.path(),
                        "FFT layout and Decomp transposeFlag disagree",
                    ));
                }
                plan
            }
            None => {
                let layout = if decomp.transpose() {
                    FftLayout::Transpose
                } else {
                    FftLayout::Normal
                };
                FftPlan::new("fft", &grid, layout)
            }
        };

        // L2: physical fields; an incompressibility constraint always
        // exists, declared or implicit.
        let local_shape = decomp.num_cells_local();
        let mut phys: Vec<PhysField<R>> = Vec::new();
        let mut phys_names: HashMap<String, PhysFieldId> = HashMap::new();
        for (pname, ptas) in tas.children_of_kind("PhysField") {
            validate_kind("PhysField", &ptas.kind()?, ptas.path())?;
            if phys_names.contains_key(pname) {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    ptas.path(),
                    format!("duplicate PhysField name {pname:?}"),
                ));
            }
            let pf = PhysField::from_attribs(pname, ptas, local_shape, &mut ctx)?;
            phys_names.insert(pname.to_string(), PhysFieldId(phys.len()));
            phys.push(pf);
        }
        if !phys.iter().any(|p| p.kind() == PhysFieldKind::Constraint) {
            let ptas = AttribSet::from_json_str("defaultPressure", r#"{ "kind": "constraint" }"#)?;
            let pf = PhysField::from_attribs("defaultPressure", &ptas, local_shape, &mut ctx)?;
            phys_names.insert("defaultPressure".to_string(), PhysFieldId(phys.len()));
            phys.push(pf);
        }
        let constraint = PhysFieldId(
            phys.iter()
                .position(|p| p.kind() == PhysFieldKind::Constraint)
                .expect("constraint field exists"),
        );

        // L3: species. The first polymer fixes the scale length.
        let mut polymers = Vec::new();
        for (pname, ptas) in tas.children_of_kind("Polymer") {
            validate_kind("Polymer", &ptas.kind()?, ptas.path())?;
            polymers.push(Polymer::from_attribs(pname, ptas)?);
        }
        match polymers.first() {
            Some(p) => ctx.set_scale_length(p.length()),
            None => ctx.set_scale_length(1),
        }
        for p in &mut polymers {
            p.build_data(&ctx, local_shape)?;
            p.build_solvers(&mut phys, &phys_names, &fft)?;
        }

        let mut solvents = Vec::new();
        for (sname, stas) in tas.children_of_kind("Solvent") {
            validate_kind("Solvent", &stas.kind()?, stas.path())?;
            let mut s = Solvent::from_attribs(sname, stas)?;
            s.build_data(local_shape);
            s.build_solvers(&mut phys, &phys_names)?;
            solvents.push(s);
        }

        let mut boundaries = Vec::new();
        for (bname, btas) in tas.children_of_kind("Boundary") {
            validate_kind("Boundary", &btas.kind()?, btas.path())?;
            let mut b = Boundary::from_attribs(bname, btas)?;
            b.build_solvers(&grid, &decomp, &mut phys, &phys_names, &mut ctx)?;
            boundaries.push(b);
        }

        // L4/L5: the effective Hamiltonian and the diagnostics.
        let mut effhamil = match tas.children_of_kind("EffHamil").first() {
            Some((ename, etas)) => {
                validate_kind("EffHamil", &etas.kind()?, etas.path())?;
                EffHamil::from_attribs(ename, etas)?
            }
            None => EffHamil::empty("effHamil"),
        };
        effhamil.build_solvers(&mut phys, &phys_names, &fft, &decomp, constraint)?;

        let mut histories = Vec::new();
        for (hname, htas) in tas.children_of_kind("History") {
            validate_kind("History", &htas.kind()?, htas.path())?;
            let mut h = History::from_attribs(hname, htas)?;
            h.build_solvers(effhamil.interactions(), &grid, &mut ctx)?;
            histories.push(h);
        }

        // The species fractions must fill the free volume.
        let total_vf: R = polymers.iter().map(|p| p.volfrac()).sum::<R>()
            + solvents.iter().map(|s| s.volfrac()).sum::<R>();
        let v_excl = comm.all_reduce_sum(phys[constraint.0].calc_local_volume())?;
        let v_total = R::from_usize(grid.total_cells_global());
        let expected = R::ONE - v_excl / v_total;
        if (total_vf - expected).abs() > R::from_f64(1e-3) {
            warn!(
                "species volume fractions sum to {total_vf}, expected {expected} \
                 (1 - V_excluded/V)"
            );
        }

        let mut domain = Domain {
            name: tas.name().to_string(),
            nsteps,
            dump_periodicity,
            output_base,
            step0: 0,
            seq: 0,
            grid,
            decomp,
            comm,
            fft,
            ctx,
            phys,
            phys_names,
            constraint,
            polymers,
            solvents,
            boundaries,
            effhamil,
            histories,
        };
        if let Some(seq) = overrides.restart_seq {
            domain.restore(seq)?;
        }
        Ok(domain)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nsteps(&self) -> usize {
        self.nsteps
    }

    pub fn phys_field(&self, name: &str) -> Option<&PhysField<R>> {
        self.phys_names.get(name).map(|id| &self.phys[id.0])
    }

    pub fn polymers(&self) -> &[Polymer<R>] {
        &self.polymers
    }

    pub fn histories(&self) -> &[History<R>] {
        &self.histories
    }

    /// Current total free energy, including the disorder reference.
    pub fn free_energy(&self) -> Result<R> {
        free_energy(
            &self.phys,
            self.effhamil.interactions(),
            &self.polymers,
            &self.solvents,
            self.comm.as_ref(),
            self.grid.total_cells_global(),
            true,
        )
    }

    /// One outer SCFT step: densities are rebuilt from the current
    /// conjugate fields, then the fields are advanced.
    pub fn update(&mut self, t: usize) -> Result<()> {
        let mut timing = TimingTree::new("step", Level::Debug);

        for pf in &mut self.phys {
            pf.reset_density();
        }
        for b in &mut self.boundaries {
            b.update(&self.grid, &self.decomp, &mut self.phys, &mut self.ctx)?;
        }

        timed!(timing, "polymers", {
            for p in &mut self.polymers {
                p.update(
                    R::from_usize(t),
                    &mut self.phys,
                    &mut self.fft,
                    self.comm.as_ref(),
                    &self.ctx,
                    self.constraint,
                )?;
            }
        });
        for s in &mut self.solvents {
            s.update(&mut self.phys, self.comm.as_ref(), &self.ctx, self.constraint)?;
        }

        timed!(timing, "field update", {
            self.effhamil.update(
                t,
                &mut self.phys,
                &mut self.fft,
                self.comm.as_ref(),
                &mut self.ctx,
                self.constraint,
                self.grid.total_cells_global(),
            )?
        });

        for h in &mut self.histories {
            h.update(
                t,
                &self.phys,
                self.effhamil.interactions(),
                &self.polymers,
                &self.solvents,
                &self.grid,
                &self.decomp,
                self.comm.as_ref(),
            )?;
        }

        timing.pop();
        Ok(())
    }

    /// Runs the outer loop to completion, dumping on the configured
    /// periodicity.
    pub fn run(&mut self) -> Result<()> {
        let first = self.step0;
        let last = self.step0 + self.nsteps;
        info!("domain {}: steps {first}..{last}", self.name);
        for t in first..last {
            self.update(t)?;
            if self.dump_periodicity > 0 && (t + 1) % self.dump_periodicity == 0 {
                self.seq += 1;
                let mut writer = JsonDump::new();
                self.dump(t, &mut writer)?;
            }
        }
        Ok(())
    }

    /// Writes every persisted object at the current sequence number.
    pub fn dump(&mut self, t: usize, writer: &mut dyn DumpWriter) -> Result<()> {
        let seq = self.seq;
        let mesh = self.grid.name().to_string();

        for pf in &self.phys {
            let path = dump_file_name(&self.output_base, pf.name(), seq);
            writer.open_file(&path)?;
            let shape = pf.dens().shape();
            let as_f64 = |xs: &[R]| xs.iter().map(|x| (*x).to_f64()).collect::<Vec<_>>();
            writer.write_dataset("density", &shape, &as_f64(pf.dens().as_slice()))?;
            writer.write_attribute("density", "vsType", "variable")?;
            writer.write_attribute("density", "vsMesh", &mesh)?;
            writer.write_dataset("conjugate", &shape, &as_f64(pf.conj().as_slice()))?;
            writer.write_attribute("conjugate", "vsType", "variable")?;
            writer.write_attribute("conjugate", "vsMesh", &mesh)?;
            if let Some(wall) = pf.wall_dens() {
                writer.write_dataset("wallDensity", &shape, &as_f64(wall.as_slice()))?;
                writer.write_attribute("wallDensity", "vsType", "variable")?;
                writer.write_attribute("wallDensity", "vsMesh", &mesh)?;
            }
            writer.write_dataset("step", &[1], &[t as f64])?;
            writer.close_file()?;
        }

        for p in &self.polymers {
            let path = dump_file_name(&self.output_base, p.name(), seq);
            writer.open_file(&path)?;
            writer.write_dataset("logQ", &[1], &[p.log_big_q().to_f64()])?;
            writer.write_dataset("bigQ", &[1], &[p.big_q().to_f64()])?;
            writer.close_file()?;
        }

        for b in &self.boundaries {
            let path = dump_file_name(&self.output_base, b.name(), seq);
            writer.open_file(&path)?;
            let mut positions = Vec::with_capacity(b.points().len() * 3);
            let mut values = Vec::with_capacity(b.points().len());
            for &(p, v) in b.points() {
                positions.extend(p.iter().map(|&x| x as f64));
                values.push(v.to_f64());
            }
            writer.write_dataset("positions", &[values.len(), 3], &positions)?;
            writer.write_dataset("values", &[values.len()], &values)?;
            writer.close_file()?;
        }

        if !self.histories.is_empty() {
            // The history file extends along the time axis in place:
            // each dump rewrites the full, longer series.
            let path = history_file_name(&self.output_base);
            writer.open_file(&path)?;
            for h in &self.histories {
                let n = h.data().len();
                let times: Vec<f64> = h.times().iter().map(|x| (*x).to_f64()).collect();
                let data: Vec<f64> = h.data().iter().map(|x| (*x).to_f64()).collect();
                let tname = format!("{}_time", h.name());
                writer.write_dataset(&tname, &[n], &times)?;
                writer.write_dataset(h.name(), &[n], &data)?;
                writer.write_attribute(h.name(), "vsType", "mesh")?;
                writer.write_attribute(h.name(), "vsKind", "uniform")?;
                writer.write_attribute(h.name(), "vsStartCell", "0")?;
                writer.write_attribute(h.name(), "vsNumCells", &n.to_string())?;
                let lo = times.first().copied().unwrap_or(0.0);
                let hi = times.last().copied().unwrap_or(0.0);
                writer.write_attribute(h.name(), "vsLowerBounds", &lo.to_string())?;
                writer.write_attribute(h.name(), "vsUpperBounds", &hi.to_string())?;
            }
            writer.close_file()?;
        }
        Ok(())
    }

    /// Restores density and conjugate pairs from dump sequence `seq`.
    fn restore(&mut self, seq: usize) -> Result<()> {
        let mut step = 0usize;
        for id in 0..self.phys.len() {
            let name = self.phys[id].name().to_string();
            let path = dump_file_name(&self.output_base, &name, seq);
            let mut reader = JsonDump::new();
            DumpReader::open_file(&mut reader, &path)?;

            let shape = self.phys[id].dens().shape();
            for (dataset, into_conj) in [("density", false), ("conjugate", true)] {
                let (dshape, data) = reader.read_dataset(dataset)?;
                if dshape != shape.to_vec() {
                    return Err(class_error(
                        ErrorClass::ShapeMismatch,
                        self.phys[id].path(),
                        format!(
                            "restored {dataset} has shape {dshape:?}, expected {shape:?}"
                        ),
                    ));
                }
                let field = if into_conj {
                    self.phys[id].conj_mut()
                } else {
                    self.phys[id].dens_mut()
                };
                for (x, &v) in field.as_mut_slice().iter_mut().zip(&data) {
                    *x = R::from_f64(v);
                }
            }
            let (_, sdata) = reader.read_dataset("step")?;
            step = sdata.first().copied().unwrap_or(0.0) as usize;
            DumpReader::close_file(&mut reader)?;
        }
        self.step0 = step + 1;
        self.seq = seq;
        info!("restored dump sequence {seq}, resuming at step {}", self.step0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIBLOCK_INPUT: &str = r#"{
        "nsteps": 10,
        "dumpPeriodicity": 0,
        "randomSeed": 7,
        "Grid grid": { "kind": "uniCartGrid", "numCellsGlobal": [16, 1, 1] },
        "Decomp decomp": { "kind": "fftw", "transposeFlag": "off" },
        "FFT fft": { "kind": "normalfftw", "gridKind": "grid" },
        "PhysField monoA": { "kind": "monomerDens", "initcond": "random", "initScale": 0.1 },
        "PhysField monoB": { "kind": "monomerDens", "initcond": "random", "initScale": 0.1 },
        "Polymer bcp": {
            "kind": "blockCopolymer", "volfrac": 1.0, "length": 20,
            "Block blockA": { "kind": "flexPseudoSpec", "scfield": "monoA", "length": 6,
                              "tailjoined": ["blockB"] },
            "Block blockB": { "kind": "flexPseudoSpec", "scfield": "monoB", "length": 14,
                              "headjoined": ["blockA"] }
        },
        "EffHamil hamil": {
            "kind": "canonicalMF",
            "Interaction floryAB": { "kind": "flory", "scfields": ["monoA", "monoB"],
                                     "chiN": 12.0 },
            "Updater steep": { "kind": "steepestDescent",
                               "updateFields": ["monoA", "monoB"],
                               "relaxlambda": 0.05 }
        },
        "History fe": { "kind": "freeEnergy", "updatePeriodicity": 1 }
    }"#;

    fn build(input: &str) -> Domain<f64> {
        let tas = AttribSet::from_json_str("Domain", input).unwrap();
        Domain::build(&tas, &RunOverrides::default()).unwrap()
    }

    #[test]
    fn a_full_domain_builds_and_steps() {
        let mut d = build(DIBLOCK_INPUT);
        d.update(0).unwrap();
        // Densities deposited by both species fill the box.
        let phi_a = d.phys_field("monoA").unwrap().dens().mean();
        let phi_b = d.phys_field("monoB").unwrap().dens().mean();
        assert!((phi_a - 0.3).abs() < 1e-6, "phi_a = {phi_a}");
        assert!((phi_b - 0.7).abs() < 1e-6);
        assert_eq!(d.histories()[0].data().len(), 1);
    }

    #[test]
    fn steepest_descent_relaxes_toward_incompressibility_with_monotone_f() {
        let mut d = build(&DIBLOCK_INPUT.replace("\"nsteps\": 10", "\"nsteps\": 400"));
        let mut energies = Vec::new();
        for t in 0..400 {
            d.update(t).unwrap();
            energies.push(d.free_energy().unwrap());
        }

        // Average composition is conserved.
        let phi_a = d.phys_field("monoA").unwrap().dens().mean();
        assert!((phi_a - 0.3).abs() < 1e-3);

        // Incompressibility residual shrinks toward the fixed point.
        let mut worst: f64 = 0.0;
        let a = d.phys_field("monoA").unwrap().dens().clone();
        let b = d.phys_field("monoB").unwrap().dens().clone();
        for (&x, &y) in a.as_slice().iter().zip(b.as_slice()) {
            worst = worst.max((x + y - 1.0).abs());
        }
        assert!(worst < 5e-3, "incompressibility residual {worst}");

        // Noise-free steepest descent is non-increasing once past the
        // initial transient.
        for pair in energies[100..].windows(2) {
            assert!(pair[1] <= pair[0] + 1e-9, "F rose: {} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn dump_and_restore_roundtrip_preserves_the_fields() {
        let dir = std::env::temp_dir().join("polyscft_domain_test");
        std::fs::create_dir_all(&dir).unwrap();
        let base = dir.join("run").display().to_string();

        let input = DIBLOCK_INPUT.replace("\"dumpPeriodicity\": 0", "\"dumpPeriodicity\": 5");
        let tas = AttribSet::from_json_str("Domain", &input).unwrap();
        let overrides = RunOverrides {
            nsteps: Some(5),
            output_base: Some(base.clone()),
            ..Default::default()
        };
        let mut d = Domain::<f64>::build(&tas, &overrides).unwrap();
        d.run().unwrap();
        let w_before: Vec<f64> = d
            .phys_field("monoA")
            .unwrap()
            .conj()
            .as_slice()
            .to_vec();

        let overrides = RunOverrides {
            restart_seq: Some(1),
            output_base: Some(base),
            ..Default::default()
        };
        let d2 = Domain::<f64>::build(&tas, &overrides).unwrap();
        let w_after: Vec<f64> = d2
            .phys_field("monoA")
            .unwrap()
            .conj()
            .as_slice()
            .to_vec();
        assert_eq!(w_before, w_after);
    }

    #[test]
    fn missing_grid_is_an_unknown_object_error() {
        let tas = AttribSet::from_json_str("Domain", r#"{ "nsteps": 1 }"#).unwrap();
        let err = Domain::<f64>::build(&tas, &RunOverrides::default()).unwrap_err();
        assert_eq!(
            crate::error::classify(&err),
            Some(ErrorClass::UnknownObject)
        );
    }

    #[test]
    fn mismatched_fft_layout_and_decomp_flag_are_rejected() {
        let input = DIBLOCK_INPUT.replace("\"kind\": \"normalfftw\"", "\"kind\": \"transposefftw\"");
        let tas = AttribSet::from_json_str("Domain", &input).unwrap();
        let err = Domain::<f64>::build(&tas, &RunOverrides::default()).unwrap_err();
        assert_eq!(
            crate::error::classify(&err),
            Some(ErrorClass::InvalidAttribute)
        );
    }
}
