use anyhow::Result;
use hashbrown::HashMap;
use log::debug;
use polyscft_field::{GridField, Real};

use crate::attribs::AttribSet;
use crate::comm::Comm;
use crate::decomp::SlabDecomp;
use crate::error::{class_error, ErrorClass};
use crate::physfield::{PhysField, PhysFieldId};
use crate::stfunc::StFunc;

/// The closed set of interaction kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InteractionKind {
    /// Flory χN coupling between two monomer densities.
    Flory,
    /// χN coupling between one monomer density and the static wall
    /// density of the constraint field.
    FloryWall,
}

/// One energy functional term of the effective Hamiltonian.
pub struct Interaction<R: Real> {
    name: String,
    path: String,
    kind: InteractionKind,
    scfield_names: Vec<String>,
    fields: Vec<PhysFieldId>,
    wall_field_name: String,
    wall_field: Option<PhysFieldId>,
    chi_n: R,
    chi_func: Option<StFunc<R>>,
    chi_n_field: Option<GridField<R>>,
    chi_field_func: Option<StFunc<R>>,
    shift_dens: bool,
}

impl<R: Real> Interaction<R> {
    pub fn from_attribs(name: &str, tas: &AttribSet) -> Result<Self> {
        let kind = match tas.kind()?.as_str() {
            "flory" => InteractionKind::Flory,
            "floryWall" => InteractionKind::FloryWall,
            other => {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("unknown Interaction kind {other:?}"),
                ))
            }
        };

        let scfield_names = tas.get_str_vec("scfields")?;
        let arity = match kind {
            InteractionKind::Flory => 2,
            InteractionKind::FloryWall => 1,
        };
        if scfield_names.len() != arity {
            return Err(class_error(
                ErrorClass::TooManyFields,
                tas.path(),
                format!(
                    "{:?} takes {arity} scfields, got {}",
                    tas.kind()?,
                    scfield_names.len()
                ),
            ));
        }

        // An STFunc child either ramps the uniform χN in time or lays
        // it out in space.
        let mut chi_func = None;
        let mut chi_field_func = None;
        if let Some((_, func_tas)) = tas.children_of_kind("STFunc").first() {
            let f = StFunc::from_attribs(func_tas)?;
            if f.is_time_dependent() {
                chi_func = Some(f);
            } else {
                chi_field_func = Some(f);
            }
        }

        Ok(Interaction {
            name: name.to_string(),
            path: tas.path().to_string(),
            kind,
            scfield_names,
            fields: Vec::new(),
            wall_field_name: tas.string_or("boundaryfield", "defaultPressure")?,
            wall_field: None,
            chi_n: R::from_f64(tas.get_param("chiN")?),
            chi_func,
            chi_n_field: None,
            chi_field_func,
            shift_dens: tas.flag_or("shiftDensFlag", true)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InteractionKind {
        self.kind
    }

    pub fn has_sc_field(&self, field_name: &str) -> bool {
        self.scfield_names.iter().any(|n| n == field_name)
    }

    /// The partner field of a two-body term.
    pub fn get_other_phys_field(&self, field_name: &str) -> Result<PhysFieldId> {
        if !self.has_sc_field(field_name) {
            return Err(class_error(
                ErrorClass::UnknownObject,
                &self.path,
                format!("{field_name:?} is not a member of this interaction"),
            ));
        }
        if self.scfield_names.len() > 2 {
            return Err(class_error(
                ErrorClass::TooManyFields,
                &self.path,
                "more than 2 contained phys fields",
            ));
        }
        self.scfield_names
            .iter()
            .zip(&self.fields)
            .find(|(n, _)| n.as_str() != field_name)
            .map(|(_, &id)| id)
            .ok_or_else(|| {
                class_error(
                    ErrorClass::UnknownObject,
                    &self.path,
                    "interaction has no partner field",
                )
            })
    }

    /// The uniform χN; fails when χN varies in space.
    pub fn param_uniform(&self) -> Result<R> {
        if self.chi_n_field.is_some() {
            return Err(class_error(
                ErrorClass::InvalidAttribute,
                &self.path,
                "uniform parameter queried on a spatially varying chiN",
            ));
        }
        Ok(self.chi_n)
    }

    /// Resolves field references and lays out a spatial χN, if any.
    pub fn build_solvers(
        &mut self,
        phys: &mut [PhysField<R>],
        phys_names: &HashMap<String, PhysFieldId>,
        decomp: &SlabDecomp,
    ) -> Result<()> {
        self.fields.clear();
        for fname in &self.scfield_names {
            let &id = phys_names.get(fname).ok_or_else(|| {
                class_error(
                    ErrorClass::UnknownObject,
                    &self.path,
                    format!("no PhysField named {fname:?}"),
                )
            })?;
            phys[id.0].register_interaction(&self.name);
            self.fields.push(id);
        }

        // All member fields must live on the same grid.
        let shape0 = phys[self.fields[0].0].dens().shape();
        for &id in &self.fields[1..] {
            if phys[id.0].dens().shape() != shape0 {
                return Err(class_error(
                    ErrorClass::ShapeMismatch,
                    &self.path,
                    "member phys fields live on different grids",
                ));
            }
        }

        if self.kind == InteractionKind::FloryWall {
            let &wid = phys_names.get(&self.wall_field_name).ok_or_else(|| {
                class_error(
                    ErrorClass::UnknownObject,
                    &self.path,
                    format!("no PhysField named {:?}", self.wall_field_name),
                )
            })?;
            if phys[wid.0].wall_dens().is_none() {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    &self.path,
                    format!("{:?} is not a constraint field", self.wall_field_name),
                ));
            }
            self.wall_field = Some(wid);
        }

        if let Some(f) = &self.chi_field_func {
            // Evaluate the expression at global coordinates of the
            // local cells.
            let shifts = decomp.local_to_global_shifts();
            let mut field = GridField::zeros(shape0);
            for ix in 0..shape0[0] {
                for iy in 0..shape0[1] {
                    for iz in 0..shape0[2] {
                        let x = [
                            R::from_usize(ix + shifts[0]),
                            R::from_usize(iy + shifts[1]),
                            R::from_usize(iz + shifts[2]),
                        ];
                        field.set([ix, iy, iz], f.eval(x, R::ZERO));
                    }
                }
            }
            self.chi_n_field = Some(field);
        }
        debug!("interaction {}: chiN = {}", self.name, self.chi_n);
        Ok(())
    }

    /// Ramp the uniform χN in time, when configured.
    pub fn update(&mut self, t: R) {
        if let Some(f) = &self.chi_func {
            self.chi_n = f.eval([R::ZERO; 3], t);
        }
    }

    /// χN at a local cell, from the spatial field when one is laid out.
    pub fn chi_at(&self, i: usize) -> R {
        match &self.chi_n_field {
            Some(field) => field.as_slice()[i],
            None => self.chi_n,
        }
    }

    /// Adds this term's `dF/dφ_wrt` into `out`; additive so a caller
    /// can fold several interactions into one total derivative.
    pub fn calc_dfd(
        &self,
        phys: &[PhysField<R>],
        wrt_field_name: &str,
        out: &mut GridField<R>,
    ) -> Result<()> {
        match self.kind {
            InteractionKind::Flory => {
                let other = self.get_other_phys_field(wrt_field_name)?;
                let dens = phys[other.0].dens();
                for (i, (o, &d)) in out
                    .as_mut_slice()
                    .iter_mut()
                    .zip(dens.as_slice())
                    .enumerate()
                {
                    *o += self.chi_at(i) * d;
                }
            }
            InteractionKind::FloryWall => {
                if !self.has_sc_field(wrt_field_name) {
                    return Err(class_error(
                        ErrorClass::UnknownObject,
                        &self.path,
                        format!("{wrt_field_name:?} is not a member of this interaction"),
                    ));
                }
                let wall = phys[self.wall_field.expect("wall wiring").0]
                    .wall_dens()
                    .expect("constraint wall buffer");
                let shift = if self.shift_dens { wall.mean() } else { R::ZERO };
                for (i, (o, &w)) in out
                    .as_mut_slice()
                    .iter_mut()
                    .zip(wall.as_slice())
                    .enumerate()
                {
                    *o += self.chi_at(i) * (w - shift);
                }
            }
        }
        Ok(())
    }

    /// Free energy of this term, reduced over ranks:
    /// `(1/V)·Σ_r [χN·φ_A·φ_B − χN·ρ̄_A·ρ̄_B·ψ_w·(1−ψ_w)]`.
    pub fn calc_fe(
        &self,
        phys: &[PhysField<R>],
        comm: &dyn Comm<R>,
        total_cells_global: usize,
        include_disorder: bool,
    ) -> Result<R> {
        let mut local = R::ZERO;
        match self.kind {
            InteractionKind::Flory => {
                let a = phys[self.fields[0].0].dens();
                let b = phys[self.fields[1].0].dens();
                for (i, (&pa, &pb)) in a.as_slice().iter().zip(b.as_slice()).enumerate() {
                    local += self.chi_at(i) * pa * pb;
                }
                if include_disorder {
                    if let Some(wid) = self.wall_field_or_default(phys) {
                        let rho = phys[self.fields[0].0].dens_average()
                            * phys[self.fields[1].0].dens_average();
                        let wall = phys[wid.0].wall_dens().expect("constraint wall buffer");
                        for (i, &w) in wall.as_slice().iter().enumerate() {
                            local -= self.chi_at(i) * rho * w * (R::ONE - w);
                        }
                    }
                }
            }
            InteractionKind::FloryWall => {
                let a = phys[self.fields[0].0].dens();
                let wall = phys[self.wall_field.expect("wall wiring").0]
                    .wall_dens()
                    .expect("constraint wall buffer");
                let (shift_a, shift_w) = if self.shift_dens {
                    (phys[self.fields[0].0].dens_average(), wall.mean())
                } else {
                    (R::ZERO, R::ZERO)
                };
                for (i, (&pa, &w)) in a.as_slice().iter().zip(wall.as_slice()).enumerate() {
                    local += self.chi_at(i) * (pa - shift_a) * (w - shift_w);
                }
            }
        }
        let total = comm.all_reduce_sum(local)?;
        Ok(total / R::from_usize(total_cells_global))
    }

    /// The constraint field used by the disorder subtraction, when one
    /// is wired anywhere in the arena.
    fn wall_field_or_default(&self, phys: &[PhysField<R>]) -> Option<PhysFieldId> {
        if let Some(id) = self.wall_field {
            return Some(id);
        }
        phys.iter()
            .position(|p| p.wall_dens().is_some())
            .map(PhysFieldId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use crate::context::EngineContext;
    use crate::decomp::{local_slab_sizes, SlabDecomp};
    use crate::grid::UniCartGrid;

    fn setup(shape_json: &str) -> (Vec<PhysField<f64>>, HashMap<String, PhysFieldId>, SlabDecomp)
    {
        let gtas = AttribSet::from_json_str(
            "Grid",
            &format!(r#"{{ "kind": "uniCartGrid", "numCellsGlobal": {shape_json} }}"#),
        )
        .unwrap();
        let grid = UniCartGrid::<f64>::from_attribs("grid", &gtas, &[]).unwrap();
        let sizes = local_slab_sizes(&grid, &SerialComm);
        let decomp = SlabDecomp::build("decomp", "Domain.decomp", false, &grid, &sizes).unwrap();
        let mut ctx = EngineContext::new(0, 0);
        let mk = |name: &str, kind: &str, ctx: &mut EngineContext<f64>| {
            let tas = AttribSet::from_json_str(
                "PhysField",
                &format!(r#"{{ "kind": "{kind}" }}"#),
            )
            .unwrap();
            PhysField::from_attribs(name, &tas, grid.num_cells_global(), ctx).unwrap()
        };
        let fields = vec![
            mk("monoA", "monomerDens", &mut ctx),
            mk("monoB", "monomerDens", &mut ctx),
            mk("defaultPressure", "constraint", &mut ctx),
        ];
        let names = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name().to_string(), PhysFieldId(i)))
            .collect();
        (fields, names, decomp)
    }

    fn flory(chi: f64) -> Interaction<f64> {
        let tas = AttribSet::from_json_str(
            "Interaction",
            &format!(r#"{{ "kind": "flory", "scfields": ["monoA", "monoB"], "chiN": {chi} }}"#),
        )
        .unwrap();
        Interaction::from_attribs("floryAB", &tas).unwrap()
    }

    #[test]
    fn uniform_densities_reproduce_the_mean_field_energy() {
        // Spec scenario: χN = 15, φ_A = 0.4, φ_B = 0.6 → F = 3.6 and
        // dF/dφ_A ≡ 9.0.
        let (mut phys, names, decomp) = setup("[8, 8, 1]");
        let mut term = flory(15.0);
        term.build_solvers(&mut phys, &names, &decomp).unwrap();
        phys[0].dens_mut().reset(0.4);
        phys[1].dens_mut().reset(0.6);

        let fe = term.calc_fe(&phys, &SerialComm, 64, true).unwrap();
        assert!((fe - 3.6).abs() < 1e-12);

        let mut dfd = GridField::zeros([8, 8, 1]);
        term.calc_dfd(&phys, "monoA", &mut dfd).unwrap();
        for &v in dfd.as_slice() {
            assert!((v - 9.0).abs() < 1e-12);
        }
    }

    #[test]
    fn calc_dfd_is_additive_across_calls() {
        let (mut phys, names, decomp) = setup("[4, 4, 1]");
        let mut term = flory(10.0);
        term.build_solvers(&mut phys, &names, &decomp).unwrap();
        phys[1].dens_mut().reset(0.5);

        let mut dfd = GridField::zeros([4, 4, 1]);
        term.calc_dfd(&phys, "monoA", &mut dfd).unwrap();
        term.calc_dfd(&phys, "monoA", &mut dfd).unwrap();
        for &v in dfd.as_slice() {
            assert!((v - 10.0).abs() < 1e-12);
        }
    }

    #[test]
    fn constant_expression_matches_the_uniform_scalar() {
        let (mut phys, names, decomp) = setup("[4, 4, 1]");
        phys[1].dens_mut().reset(0.5);

        let mut uniform = flory(8.0);
        uniform.build_solvers(&mut phys, &names, &decomp).unwrap();

        let tas = AttribSet::from_json_str(
            "Interaction",
            r#"{ "kind": "flory", "scfields": ["monoA", "monoB"], "chiN": 8.0,
                 "STFunc profile": { "kind": "constant", "value": 8.0 } }"#,
        )
        .unwrap();
        let mut spatial = Interaction::<f64>::from_attribs("floryAB", &tas).unwrap();
        spatial.build_solvers(&mut phys, &names, &decomp).unwrap();
        assert!(spatial.param_uniform().is_err());

        let mut a = GridField::zeros([4, 4, 1]);
        let mut b = GridField::zeros([4, 4, 1]);
        uniform.calc_dfd(&phys, "monoA", &mut a).unwrap();
        spatial.calc_dfd(&phys, "monoA", &mut b).unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn time_ramped_chi_updates_each_step() {
        let (mut phys, names, decomp) = setup("[4, 4, 1]");
        let tas = AttribSet::from_json_str(
            "Interaction",
            r#"{ "kind": "flory", "scfields": ["monoA", "monoB"], "chiN": 5.0,
                 "STFunc ramp": { "kind": "linearRamp", "startValue": 5.0, "rate": 0.1,
                                  "stopValue": 6.0 } }"#,
        )
        .unwrap();
        let mut term = Interaction::<f64>::from_attribs("floryAB", &tas).unwrap();
        term.build_solvers(&mut phys, &names, &decomp).unwrap();
        term.update(5.0);
        assert!((term.param_uniform().unwrap() - 5.5).abs() < 1e-12);
        term.update(500.0);
        assert!((term.param_uniform().unwrap() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn wall_term_couples_to_the_wall_imprint() {
        let (mut phys, names, decomp) = setup("[8, 1, 1]");
        let wall = phys[2].wall_dens_mut().unwrap();
        wall.set([0, 0, 0], 1.0);
        wall.set([1, 0, 0], 1.0);

        let tas = AttribSet::from_json_str(
            "Interaction",
            r#"{ "kind": "floryWall", "scfields": ["monoA"], "chiN": 4.0,
                 "shiftDensFlag": "off" }"#,
        )
        .unwrap();
        let mut term = Interaction::<f64>::from_attribs("wallA", &tas).unwrap();
        term.build_solvers(&mut phys, &names, &decomp).unwrap();

        let mut dfd = GridField::zeros([8, 1, 1]);
        term.calc_dfd(&phys, "monoA", &mut dfd).unwrap();
        assert_eq!(dfd.at([0, 0, 0]), 4.0);
        assert_eq!(dfd.at([5, 0, 0]), 0.0);
    }

    #[test]
    fn unknown_members_are_rejected() {
        let (phys, _names, _decomp) = setup("[4, 4, 1]");
        let term = flory(1.0);
        let mut out = GridField::zeros([4, 4, 1]);
        // Not built: membership check still guards.
        assert!(term.calc_dfd(&phys, "nope", &mut out).is_err());
    }
}
