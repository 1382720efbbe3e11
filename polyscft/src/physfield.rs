use anyhow::Result;
use polyscft_field::{GridField, Real};

use crate::attribs::AttribSet;
use crate::context::EngineContext;
use crate::error::{class_error, ErrorClass};

/// Arena index of a PhysField inside the Domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysFieldId(pub usize);

/// The closed set of physical-field kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhysFieldKind {
    /// Monomer density with its chemical-potential conjugate.
    MonomerDens,
    /// Charge density with the electric potential as conjugate.
    ChargeDens,
    /// Incompressibility constraint: available-volume density with the
    /// pressure as conjugate, plus the static wall imprint buffer.
    Constraint,
}

impl PhysFieldKind {
    pub fn parse(kind: &str, path: &str) -> Result<Self> {
        match kind {
            "monomerDens" => Ok(PhysFieldKind::MonomerDens),
            "chargeDens" => Ok(PhysFieldKind::ChargeDens),
            "constraint" => Ok(PhysFieldKind::Constraint),
            other => Err(class_error(
                ErrorClass::InvalidAttribute,
                path,
                format!("unknown PhysField kind {other:?}"),
            )),
        }
    }
}

/// A named physical observable: a density field paired with its
/// conjugate field, the target average density accumulated at build,
/// and the names of the objects that reference it.
pub struct PhysField<R: Real> {
    name: String,
    path: String,
    kind: PhysFieldKind,
    dens: GridField<R>,
    conj: GridField<R>,
    wall_dens: Option<GridField<R>>,
    dens_average: R,
    max_threshold: R,
    interactions: Vec<String>,
    blocks: Vec<String>,
    solvents: Vec<String>,
}

impl<R: Real> PhysField<R> {
    pub fn from_attribs(
        name: &str,
        tas: &AttribSet,
        local_shape: [usize; 3],
        ctx: &mut EngineContext<R>,
    ) -> Result<Self> {
        let kind = PhysFieldKind::parse(&tas.kind()?, tas.path())?;

        let mut conj = GridField::zeros(local_shape);
        match tas.string_or("initcond", "zero")?.as_str() {
            "zero" => {}
            "random" => {
                // Symmetry-breaking noise on the conjugate field, drawn
                // from the globally synchronized stream.
                let scale = R::from_f64(tas.param_or("initScale", 0.01)?);
                for v in conj.as_mut_slice() {
                    *v = scale * (ctx.uniform_global() - R::HALF);
                }
            }
            other => {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("unknown initcond {other:?}"),
                ))
            }
        }

        let wall_dens = match kind {
            PhysFieldKind::Constraint => Some(GridField::zeros(local_shape)),
            _ => None,
        };

        Ok(PhysField {
            name: name.to_string(),
            path: tas.path().to_string(),
            kind,
            dens: GridField::zeros(local_shape),
            conj,
            wall_dens,
            dens_average: R::ZERO,
            max_threshold: R::from_f64(tas.param_or("maxDensThreshold", 1.0)?),
            interactions: Vec::new(),
            blocks: Vec::new(),
            solvents: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> PhysFieldKind {
        self.kind
    }

    pub fn dens(&self) -> &GridField<R> {
        &self.dens
    }

    pub fn dens_mut(&mut self) -> &mut GridField<R> {
        &mut self.dens
    }

    pub fn conj(&self) -> &GridField<R> {
        &self.conj
    }

    pub fn conj_mut(&mut self) -> &mut GridField<R> {
        &mut self.conj
    }

    /// The static wall imprint; present only on the constraint kind.
    pub fn wall_dens(&self) -> Option<&GridField<R>> {
        self.wall_dens.as_ref()
    }

    pub fn wall_dens_mut(&mut self) -> Option<&mut GridField<R>> {
        self.wall_dens.as_mut()
    }

    /// Zeroes the density so species contributions can accumulate.
    pub fn reset_density(&mut self) {
        self.dens.reset(R::ZERO);
    }

    pub fn dens_average(&self) -> R {
        self.dens_average
    }

    /// Accumulates a species volume fraction into the target average.
    pub fn add_to_dens_average(&mut self, volfrac: R) {
        self.dens_average += volfrac;
    }

    pub fn max_threshold(&self) -> R {
        self.max_threshold
    }

    pub fn register_interaction(&mut self, name: &str) {
        self.interactions.push(name.to_string());
    }

    pub fn register_block(&mut self, name: &str) {
        self.blocks.push(name.to_string());
    }

    pub fn register_solvent(&mut self, name: &str) {
        self.solvents.push(name.to_string());
    }

    pub fn registered_interactions(&self) -> &[String] {
        &self.interactions
    }

    pub fn registered_blocks(&self) -> &[String] {
        &self.blocks
    }

    pub fn registered_solvents(&self) -> &[String] {
        &self.solvents
    }

    /// Excluded volume on this rank, `V_local − V_free`, from the wall
    /// imprint. Zero for non-constraint kinds.
    pub fn calc_local_volume(&self) -> R {
        let Some(wall) = &self.wall_dens else {
            return R::ZERO;
        };
        let mut v_free = R::ZERO;
        for &w in wall.as_slice() {
            v_free += (R::ONE - w).max(R::ZERO);
        }
        R::from_usize(wall.size()) - v_free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(kind: &str, extra: &str) -> PhysField<f64> {
        let tas = AttribSet::from_json_str(
            "PhysField",
            &format!(r#"{{ "kind": "{kind}"{extra} }}"#),
        )
        .unwrap();
        let mut ctx = EngineContext::new(5, 0);
        PhysField::from_attribs("monoA", &tas, [4, 4, 1], &mut ctx).unwrap()
    }

    #[test]
    fn densities_start_at_zero_and_reset() {
        let mut pf = build("monomerDens", "");
        pf.dens_mut().reset(0.7);
        pf.reset_density();
        assert_eq!(pf.dens().sum_all(), 0.0);
        assert_eq!(pf.kind(), PhysFieldKind::MonomerDens);
        assert!(pf.wall_dens().is_none());
    }

    #[test]
    fn random_initcond_perturbs_the_conjugate_field() {
        let pf = build("monomerDens", r#", "initcond": "random", "initScale": 0.1"#);
        let w = pf.conj();
        assert!(w.max_val() > 0.0 && w.min_val() < 0.0);
        assert!(w.max_val() <= 0.05 + 1e-12);
    }

    #[test]
    fn constraint_tracks_excluded_volume() {
        let mut pf = build("constraint", "");
        assert_eq!(pf.calc_local_volume(), 0.0);
        let wall = pf.wall_dens_mut().unwrap();
        wall.set([0, 0, 0], 1.0);
        wall.set([1, 0, 0], 0.5);
        assert!((pf.calc_local_volume() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn dens_average_accumulates_referencing_species() {
        let mut pf = build("monomerDens", "");
        pf.add_to_dens_average(0.3);
        pf.add_to_dens_average(0.2);
        assert!((pf.dens_average() - 0.5).abs() < 1e-12);
        pf.register_block("blockA");
        pf.register_solvent("solv");
        assert_eq!(pf.registered_blocks(), ["blockA".to_string()]);
    }
}
