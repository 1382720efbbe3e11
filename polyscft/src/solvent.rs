use anyhow::Result;
use hashbrown::HashMap;
use log::debug;
use polyscft_field::{GridField, Real};

use crate::attribs::AttribSet;
use crate::comm::Comm;
use crate::context::EngineContext;
use crate::error::{class_error, ErrorClass};
use crate::physfield::{PhysField, PhysFieldId};

/// The closed set of solvent kinds.
#[derive(Clone, Copy, Debug)]
pub enum SolventKind<R: Real> {
    Simple,
    /// Small ions: also deposits `Z·φ` into a charge density field.
    Ions { valence: R },
}

/// A single-segment species. Its statistical weight is local,
/// `exp(-(size/N_ref)·w(r))`, so the partition function and density
/// come from one quadrature instead of a propagator solve.
pub struct Solvent<R: Real> {
    name: String,
    path: String,
    kind: SolventKind<R>,
    volfrac: R,
    /// Molecular size in monomer units.
    size: R,
    scfield_name: String,
    scfield: Option<PhysFieldId>,
    chargefield_name: Option<String>,
    chargefield: Option<PhysFieldId>,
    big_q: R,
    wfac: GridField<R>,
}

impl<R: Real> Solvent<R> {
    pub fn from_attribs(name: &str, tas: &AttribSet) -> Result<Self> {
        let kind = match tas.kind()?.as_str() {
            "simpleSolvent" => SolventKind::Simple,
            "simpleIons" => SolventKind::Ions {
                valence: R::from_f64(tas.get_param("valence")?),
            },
            other => {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("unknown Solvent kind {other:?}"),
                ))
            }
        };

        let chargefield_name = if tas.has_string("chargefield") {
            Some(tas.get_string("chargefield")?)
        } else {
            None
        };
        if matches!(kind, SolventKind::Ions { .. }) && chargefield_name.is_none() {
            return Err(class_error(
                ErrorClass::InvalidAttribute,
                tas.path(),
                "simpleIons needs a chargefield attribute",
            ));
        }

        Ok(Solvent {
            name: name.to_string(),
            path: tas.path().to_string(),
            kind,
            volfrac: R::from_f64(tas.get_param("volfrac")?),
            size: R::from_f64(tas.param_or("size", 1.0)?),
            scfield_name: tas.get_string("scfield")?,
            scfield: None,
            chargefield_name,
            chargefield: None,
            big_q: R::ONE,
            wfac: GridField::zeros([1, 1, 1]),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volfrac(&self) -> R {
        self.volfrac
    }

    pub fn big_q(&self) -> R {
        self.big_q
    }

    pub fn build_data(&mut self, local_shape: [usize; 3]) {
        self.wfac = GridField::zeros(local_shape);
    }

    pub fn build_solvers(
        &mut self,
        phys: &mut [PhysField<R>],
        phys_names: &HashMap<String, PhysFieldId>,
    ) -> Result<()> {
        let &sc = phys_names.get(&self.scfield_name).ok_or_else(|| {
            class_error(
                ErrorClass::UnknownObject,
                &self.path,
                format!("no PhysField named {:?}", self.scfield_name),
            )
        })?;
        self.scfield = Some(sc);
        phys[sc.0].register_solvent(&self.name);
        phys[sc.0].add_to_dens_average(self.volfrac);

        if let Some(cn) = &self.chargefield_name {
            let &cf = phys_names.get(cn).ok_or_else(|| {
                class_error(
                    ErrorClass::UnknownObject,
                    &self.path,
                    format!("no PhysField named {cn:?}"),
                )
            })?;
            self.chargefield = Some(cf);
        }
        Ok(())
    }

    /// Deposits `φ_c·exp(-(size/N_ref)·w)/Q_s` into the density.
    pub fn update(
        &mut self,
        phys: &mut [PhysField<R>],
        comm: &dyn Comm<R>,
        ctx: &EngineContext<R>,
        constraint: PhysFieldId,
    ) -> Result<()> {
        if self.volfrac == R::ZERO {
            self.big_q = R::ONE;
            return Ok(());
        }
        let sc = self.scfield.expect("solvent used before build_solvers");
        let neg_scale = -self.size / R::from_usize(ctx.scale_length());

        self.wfac.reset(R::ZERO);
        self.wfac += phys[sc.0].conj();
        self.wfac.scale(neg_scale);
        self.wfac.apply_exp();

        // Free volume left by the constraints normalizes Q.
        let local_cells = R::from_usize(self.wfac.size());
        let local_free = local_cells - phys[constraint.0].calc_local_volume();
        let v_free = comm.all_reduce_sum(local_free)?;
        let q = comm.all_reduce_sum(self.wfac.sum_all())? / v_free;
        self.big_q = q;
        debug!("solvent {}: Q = {}", self.name, q);

        self.wfac.scale(self.volfrac / q);
        *phys[sc.0].dens_mut() += &self.wfac;

        if let SolventKind::Ions { valence } = self.kind {
            let cf = self.chargefield.expect("ion wiring");
            self.wfac.scale(valence);
            *phys[cf.0].dens_mut() += &self.wfac;
        }
        Ok(())
    }
}
