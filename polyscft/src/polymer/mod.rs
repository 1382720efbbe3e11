pub mod block;
pub mod quad;

use anyhow::Result;
use hashbrown::HashMap;
use log::{debug, warn};
use polyscft_field::{GridField, Real};

use crate::attribs::AttribSet;
use crate::comm::Comm;
use crate::context::EngineContext;
use crate::error::{class_error, ErrorClass};
use crate::fftplan::FftPlan;
use crate::physfield::{PhysField, PhysFieldId};
use crate::stfunc::StFunc;

use block::{Block, BlockEnd, BlockKind};
use quad::{contour_weights, SchulzDistrib};

/// Chain-length dispersity of a polymer species.
enum Dispersity {
    Monodisperse,
    /// Schulz–Zimm distribution integrated over Gauss–Laguerre nodes.
    Schulz {
        distrib: SchulzDistrib,
        num_quad: usize,
    },
}

/// A polymer species: an ordered collection of connected blocks, a
/// chain volume fraction, and the per-step partition function the
/// density deposits are normalized by.
pub struct Polymer<R: Real> {
    name: String,
    path: String,
    volfrac: R,
    vf_func: Option<StFunc<R>>,
    length: usize,
    dispersity: Dispersity,
    blocks: Vec<Block<R>>,
    block_attribs: Vec<AttribSet>,
    f_chain: R,
    big_q: R,
    log_q: R,
    local_shape: [usize; 3],
}

impl<R: Real> Polymer<R> {
    pub fn from_attribs(name: &str, tas: &AttribSet) -> Result<Self> {
        let dispersity = match tas.kind()?.as_str() {
            "blockCopolymer" => Dispersity::Monodisperse,
            "polyDisperseBCP" => {
                let pdi = tas.get_param("pdi")?;
                if pdi <= 1.0 {
                    return Err(class_error(
                        ErrorClass::InvalidAttribute,
                        tas.path(),
                        "pdi must exceed 1 for a polydisperse chain",
                    ));
                }
                Dispersity::Schulz {
                    distrib: SchulzDistrib::from_pdi(tas.get_option("length")? as f64, pdi),
                    num_quad: tas.option_or("numQuadPoints", 8)? as usize,
                }
            }
            other => {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("unknown Polymer kind {other:?}"),
                ))
            }
        };

        let mut vf_func = None;
        if let Some((_, func_tas)) = tas.children_of_kind("STFunc").first() {
            vf_func = Some(StFunc::from_attribs(func_tas)?);
        }

        let mut blocks = Vec::new();
        let mut block_attribs = Vec::new();
        for (bname, btas) in tas.children_of_kind("Block") {
            blocks.push(Block::from_attribs(bname, btas)?);
            block_attribs.push(btas.clone());
        }
        if blocks.is_empty() {
            return Err(class_error(
                ErrorClass::InvalidAttribute,
                tas.path(),
                "polymer has no blocks",
            ));
        }

        Ok(Polymer {
            name: name.to_string(),
            path: tas.path().to_string(),
            volfrac: R::from_f64(tas.get_param("volfrac")?),
            vf_func,
            length: tas.get_option_usize("length")?,
            dispersity,
            blocks,
            block_attribs,
            f_chain: R::ZERO,
            big_q: R::ONE,
            log_q: R::ZERO,
            local_shape: [1, 1, 1],
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn volfrac(&self) -> R {
        self.volfrac
    }

    pub fn big_q(&self) -> R {
        self.big_q
    }

    /// `ln Q` of the chain ensemble; the dispersity-weighted average
    /// for polydisperse species.
    pub fn log_big_q(&self) -> R {
        self.log_q
    }

    /// Total normalized contour length of the chain, `Σ_b ns·ds`.
    pub fn f_chain(&self) -> R {
        self.f_chain
    }

    pub fn blocks(&self) -> &[Block<R>] {
        &self.blocks
    }

    /// Discretizes contours and allocates propagators. The scale
    /// length must already be set (the holder takes it from the first
    /// polymer).
    pub fn build_data(&mut self, ctx: &EngineContext<R>, local_shape: [usize; 3]) -> Result<()> {
        let n_ref = ctx.scale_length();
        self.local_shape = local_shape;
        self.f_chain = R::ZERO;
        for (b, tas) in self.blocks.iter_mut().zip(&self.block_attribs) {
            b.finalize_contour(tas, n_ref)?;
            b.build_data(local_shape);
            self.f_chain += b.contour_span();
        }
        Ok(())
    }

    /// Resolves cross-references by name and wires the junctions.
    pub fn build_solvers(
        &mut self,
        phys: &mut [PhysField<R>],
        phys_names: &HashMap<String, PhysFieldId>,
        plan: &FftPlan<R>,
    ) -> Result<()> {
        for b in &self.blocks {
            if matches!(b.kind(), BlockKind::Semiflexible) {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    b.path(),
                    "semiflexible blocks are not supported: the orientation-space \
                     solver and the flexible/semiflexible junction conversion are \
                     not implemented",
                ));
            }
        }

        let index: HashMap<&str, usize> = self
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.name(), i))
            .collect();

        // Resolve junction partners before any block is mutated.
        let mut wiring = Vec::with_capacity(self.blocks.len());
        for b in &self.blocks {
            let resolve_end = |names: &[String], my_end: &str| -> Result<Vec<(usize, BlockEnd)>> {
                names
                    .iter()
                    .map(|n| {
                        let &j = index.get(n.as_str()).ok_or_else(|| {
                            class_error(
                                ErrorClass::UnknownObject,
                                b.path(),
                                format!("{my_end}-joined block {n:?} not found in chain"),
                            )
                        })?;
                        let partner = &self.blocks[j];
                        let me = b.name();
                        let end = if partner.tail_joined_names().iter().any(|x| x == me) {
                            BlockEnd::Tail
                        } else if partner.head_joined_names().iter().any(|x| x == me) {
                            BlockEnd::Head
                        } else {
                            return Err(class_error(
                                ErrorClass::InvalidAttribute,
                                b.path(),
                                format!("junction with {n:?} is not declared on both blocks"),
                            ));
                        };
                        Ok((j, end))
                    })
                    .collect()
            };
            let head = resolve_end(b.head_joined_names(), "head")?;
            let tail = resolve_end(b.tail_joined_names(), "tail")?;

            let &sc = phys_names.get(b.scfield_name()).ok_or_else(|| {
                class_error(
                    ErrorClass::UnknownObject,
                    b.path(),
                    format!("no PhysField named {:?}", b.scfield_name()),
                )
            })?;
            let charge = match b.chargefield_name() {
                None => None,
                Some(cn) => Some(*phys_names.get(cn).ok_or_else(|| {
                    class_error(
                        ErrorClass::UnknownObject,
                        b.path(),
                        format!("no PhysField named {cn:?}"),
                    )
                })?),
            };
            wiring.push((sc, charge, head, tail));
        }
        drop(index);

        for (b, (sc, charge, head, tail)) in self.blocks.iter_mut().zip(wiring) {
            phys[sc.0].register_block(b.name());
            phys[sc.0].add_to_dens_average(self.volfrac * b.contour_span() / self.f_chain);
            b.build_solvers(sc, charge, head, tail, plan);
        }
        Ok(())
    }

    /// One outer-step update: recompute the split-step factors, solve
    /// every propagator, and deposit densities.
    pub fn update(
        &mut self,
        t: R,
        phys: &mut [PhysField<R>],
        fft: &mut FftPlan<R>,
        comm: &dyn Comm<R>,
        ctx: &EngineContext<R>,
        constraint: PhysFieldId,
    ) -> Result<()> {
        if let Some(f) = &self.vf_func {
            self.volfrac = f.eval([R::ZERO; 3], t);
        }
        if self.volfrac == R::ZERO {
            // A ghost species deposits nothing regardless of topology.
            self.big_q = R::ONE;
            self.log_q = R::ZERO;
            return Ok(());
        }

        let nodes: Vec<(R, R)> = match &self.dispersity {
            Dispersity::Monodisperse => vec![(R::ONE, R::ONE)],
            Dispersity::Schulz { distrib, num_quad } => distrib
                .length_quadrature(*num_quad)
                .into_iter()
                .map(|(l, w)| (R::from_f64(l), R::from_f64(w)))
                .collect(),
        };

        let n_ref = ctx.scale_length();
        self.log_q = R::ZERO;
        for &(lambda, weight) in &nodes {
            for b in &mut self.blocks {
                b.reset(phys, n_ref, lambda);
            }
            self.run_scan(fft)?;
            let q = self.partition_function(phys, comm, constraint)?;

            let prefactor = weight * self.volfrac / (q * self.f_chain * lambda);
            for b in &mut self.blocks {
                let weights = contour_weights(b.ns(), b.ds() * lambda);
                b.set_phys_fields(phys, prefactor, &weights);
            }
            self.big_q = q;
            self.log_q += weight * q.ln();
        }
        debug!("polymer {}: log Q = {}", self.name, self.log_q);
        Ok(())
    }

    /// Scans the chain until every block is solved in both directions,
    /// advancing any block whose junction prerequisites are met.
    fn run_scan(&mut self, fft: &mut FftPlan<R>) -> Result<()> {
        loop {
            let mut progress = false;
            let mut remaining = false;
            for i in 0..self.blocks.len() {
                for end in [BlockEnd::Head, BlockEnd::Tail] {
                    if self.blocks[i].solved(end) {
                        continue;
                    }
                    if !self.prereqs_met(i, end) {
                        remaining = true;
                        continue;
                    }
                    let ic = self.junction_ic(i, end);
                    self.blocks[i].solve_q(end, ic, fft);
                    progress = true;
                }
            }
            if !remaining {
                return Ok(());
            }
            if !progress {
                return Err(class_error(
                    ErrorClass::UnreachableBlock,
                    &self.path,
                    "chain scan stalled; block connectivity is inconsistent",
                ));
            }
        }
    }

    fn prereqs_met(&self, i: usize, end: BlockEnd) -> bool {
        self.blocks[i]
            .connections(end)
            .iter()
            .all(|&(j, jend)| self.blocks[j].solved(jend.opposite()))
    }

    /// The initial condition at a block end: 1 at a free end, the
    /// pointwise product of the arriving full-contour propagators at
    /// an internal junction.
    fn junction_ic(&self, i: usize, end: BlockEnd) -> GridField<R> {
        let mut ic = GridField::constant(self.local_shape, R::ONE);
        for &(j, jend) in self.blocks[i].connections(end) {
            ic *= self.blocks[j].terminal_q(jend);
        }
        ic
    }

    /// `Q = (1/V_free)·Σ_r q(r)` at a free chain end, reduced over
    /// ranks. All free ends must agree; disagreement beyond 1e-5
    /// relative is reported.
    fn partition_function(
        &self,
        phys: &[PhysField<R>],
        comm: &dyn Comm<R>,
        constraint: PhysFieldId,
    ) -> Result<R> {
        let local_cells = R::from_usize(self.local_shape.iter().product());
        let local_free = local_cells - phys[constraint.0].calc_local_volume();
        let v_free = comm.all_reduce_sum(local_free)?;

        let mut q_vals = Vec::new();
        for b in &self.blocks {
            if b.is_free_end(BlockEnd::Head) {
                let local = b.terminal_q(BlockEnd::Head).sum_all();
                q_vals.push(comm.all_reduce_sum(local)? / v_free);
            }
            if b.is_free_end(BlockEnd::Tail) {
                let local = b.terminal_q(BlockEnd::Tail).sum_all();
                q_vals.push(comm.all_reduce_sum(local)? / v_free);
            }
        }
        let &q = q_vals.first().ok_or_else(|| {
            class_error(
                ErrorClass::UnreachableBlock,
                &self.path,
                "chain has no free ends",
            )
        })?;

        let tol = R::from_f64(1e-5);
        for &other in &q_vals[1..] {
            if ((other - q) / q).abs() > tol {
                warn!(
                    "polymer {}: free-end partition functions disagree: {} vs {}",
                    self.name, q, other
                );
            }
        }
        Ok(q)
    }
}
