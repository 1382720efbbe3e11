use anyhow::Result;
use itertools::izip;
use log::debug;
use polyscft_field::{GridField, Real};

use crate::attribs::AttribSet;
use crate::error::{class_error, ErrorClass};
use crate::fftplan::FftPlan;
use crate::physfield::{PhysField, PhysFieldId};

/// The two ends of a block's contour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockEnd {
    Head,
    Tail,
}

impl BlockEnd {
    pub fn opposite(self) -> Self {
        match self {
            BlockEnd::Head => BlockEnd::Tail,
            BlockEnd::Tail => BlockEnd::Head,
        }
    }
}

/// Per-step lifecycle of a block inside the chain driver's scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Uninitialized,
    Ready,
    Reset,
    ForwardDone,
    BackwardDone,
    Deposited,
}

/// The closed set of block kinds.
#[derive(Clone, Copy, Debug)]
pub enum BlockKind<R: Real> {
    Flexible,
    /// Flexible Gaussian block carrying a smeared charge: the w-factor
    /// gains `exp(-(ds/2)·Z·α·N_ref·ψ)` and the block deposits
    /// `Z·α·φ` into its charge density field.
    ChargedFlexible { valence: R, smear: R },
    /// Wormlike block over (r, u). The orientation-space solver is not
    /// implemented; chains containing one are rejected at build.
    Semiflexible,
}

/// One chemically homogeneous segment of a chain: owns the forward and
/// backward propagator ladders and the pseudo-spectral MDE sweep
/// between them.
pub struct Block<R: Real> {
    name: String,
    path: String,
    kind: BlockKind<R>,
    /// Block length in monomer units.
    length: usize,
    /// Contour steps; `ds·ns` is the block's share of the chain
    /// contour normalized by the scale length.
    ns: usize,
    ds: R,
    b_seg_ratio: R,
    scfield_name: String,
    scfield: Option<PhysFieldId>,
    chargefield_name: Option<String>,
    chargefield: Option<PhysFieldId>,
    head_joined_names: Vec<String>,
    tail_joined_names: Vec<String>,
    /// Resolved junction partners: `(block index, partner end at this
    /// junction)`.
    head_cnt: Vec<(usize, BlockEnd)>,
    tail_cnt: Vec<(usize, BlockEnd)>,
    qf: Vec<GridField<R>>,
    qb: Vec<GridField<R>>,
    wfac: GridField<R>,
    k2_base: Vec<R>,
    k2fac: Vec<R>,
    tmp: GridField<R>,
    res: GridField<R>,
    state: BlockState,
    solved_head: bool,
    solved_tail: bool,
}

impl<R: Real> Block<R> {
    pub fn from_attribs(name: &str, tas: &AttribSet) -> Result<Self> {
        let kind = match tas.kind()?.as_str() {
            "flexPseudoSpec" => BlockKind::Flexible,
            "chargeFlexPseudoSpec" => BlockKind::ChargedFlexible {
                valence: R::from_f64(tas.get_param("za")?),
                smear: R::from_f64(tas.param_or("alpha", 1.0)?),
            },
            "semiflexibleBlock" => BlockKind::Semiflexible,
            other => {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("unknown Block kind {other:?}"),
                ))
            }
        };

        let chargefield_name = if tas.has_string("chargefield") {
            Some(tas.get_string("chargefield")?)
        } else {
            None
        };
        if matches!(kind, BlockKind::ChargedFlexible { .. }) && chargefield_name.is_none() {
            return Err(class_error(
                ErrorClass::InvalidAttribute,
                tas.path(),
                "charged block needs a chargefield attribute",
            ));
        }

        Ok(Block {
            name: name.to_string(),
            path: tas.path().to_string(),
            kind,
            length: tas.get_option_usize("length")?,
            ns: 0,
            ds: R::ZERO,
            b_seg_ratio: R::from_f64(tas.param_or("bSegRatio", 1.0)?),
            scfield_name: tas.get_string("scfield")?,
            scfield: None,
            chargefield_name,
            chargefield: None,
            head_joined_names: if tas.has_prm_vec("headjoined") {
                tas.get_str_vec("headjoined")?
            } else {
                Vec::new()
            },
            tail_joined_names: if tas.has_prm_vec("tailjoined") {
                tas.get_str_vec("tailjoined")?
            } else {
                Vec::new()
            },
            head_cnt: Vec::new(),
            tail_cnt: Vec::new(),
            qf: Vec::new(),
            qb: Vec::new(),
            wfac: GridField::zeros([1, 1, 1]),
            k2_base: Vec::new(),
            k2fac: Vec::new(),
            tmp: GridField::zeros([1, 1, 1]),
            res: GridField::zeros([1, 1, 1]),
            state: BlockState::Uninitialized,
            solved_head: false,
            solved_tail: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> &BlockKind<R> {
        &self.kind
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn ns(&self) -> usize {
        self.ns
    }

    pub fn ds(&self) -> R {
        self.ds
    }

    /// Normalized contour span of this block, `ns·ds`.
    pub fn contour_span(&self) -> R {
        R::from_usize(self.ns) * self.ds
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn scfield(&self) -> PhysFieldId {
        self.scfield.expect("block used before build_solvers")
    }

    pub fn scfield_name(&self) -> &str {
        &self.scfield_name
    }

    pub fn chargefield_name(&self) -> Option<&str> {
        self.chargefield_name.as_deref()
    }

    pub fn head_joined_names(&self) -> &[String] {
        &self.head_joined_names
    }

    pub fn tail_joined_names(&self) -> &[String] {
        &self.tail_joined_names
    }

    pub fn connections(&self, end: BlockEnd) -> &[(usize, BlockEnd)] {
        match end {
            BlockEnd::Head => &self.head_cnt,
            BlockEnd::Tail => &self.tail_cnt,
        }
    }

    pub fn is_free_end(&self, end: BlockEnd) -> bool {
        self.connections(end).is_empty()
    }

    pub fn solved(&self, from: BlockEnd) -> bool {
        match from {
            BlockEnd::Head => self.solved_head,
            BlockEnd::Tail => self.solved_tail,
        }
    }

    /// Fixes the contour discretization once the scale length is known.
    ///
    /// The block covers `length/N_ref` of normalized contour; a `ds`
    /// attribute picks the step, defaulting to one step per monomer.
    pub fn finalize_contour(&mut self, tas: &AttribSet, n_ref: usize) -> Result<()> {
        let span = R::from_usize(self.length) / R::from_usize(n_ref);
        let ns = if tas.has_param("ds") {
            let ds = R::from_f64(tas.get_param("ds")?);
            if ds <= R::ZERO {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    "ds must be positive",
                ));
            }
            ((span / ds).to_f64().round() as usize).max(1)
        } else {
            self.length.max(1)
        };
        self.ns = ns;
        self.ds = span / R::from_usize(ns);
        Ok(())
    }

    /// Allocates the propagator ladders and scratch fields.
    pub fn build_data(&mut self, local_shape: [usize; 3]) {
        assert!(self.ns > 0, "finalize_contour must run before build_data");
        self.qf = (0..=self.ns).map(|_| GridField::zeros(local_shape)).collect();
        self.qb = (0..=self.ns).map(|_| GridField::zeros(local_shape)).collect();
        self.wfac = GridField::zeros(local_shape);
        self.tmp = GridField::zeros(local_shape);
        self.res = GridField::zeros(local_shape);
    }

    /// Resolves cross-references and precomputes the k-space factor.
    pub fn build_solvers(
        &mut self,
        scfield: PhysFieldId,
        chargefield: Option<PhysFieldId>,
        head_cnt: Vec<(usize, BlockEnd)>,
        tail_cnt: Vec<(usize, BlockEnd)>,
        plan: &FftPlan<R>,
    ) {
        self.scfield = Some(scfield);
        self.chargefield = chargefield;
        self.head_cnt = head_cnt;
        self.tail_cnt = tail_cnt;
        self.k2_base = plan.k_norm_sq();
        self.k2fac = vec![R::ZERO; self.k2_base.len()];
        self.state = BlockState::Ready;
    }

    /// Recomputes the split-step factors from the current conjugate
    /// fields and clears the per-step solve flags. `ds_scale` rescales
    /// the contour step for polydisperse chain-length nodes.
    pub fn reset(&mut self, phys: &[PhysField<R>], n_ref: usize, ds_scale: R) {
        let ds = self.ds * ds_scale;
        let half = -R::HALF * ds;

        let w = phys[self.scfield().0].conj();
        self.wfac
            .as_mut_slice()
            .iter_mut()
            .zip(w.as_slice())
            .for_each(|(f, &wv)| *f = (half * wv).exp());

        if let BlockKind::ChargedFlexible { valence, smear } = self.kind {
            let psi = phys[self.chargefield.expect("charged block wiring").0].conj();
            let fac_z = valence * smear * R::from_usize(n_ref);
            self.wfac
                .as_mut_slice()
                .iter_mut()
                .zip(psi.as_slice())
                .for_each(|(f, &pv)| *f *= (half * fac_z * pv).exp());
        }

        let bb = self.b_seg_ratio * self.b_seg_ratio;
        for (f, &k2) in self.k2fac.iter_mut().zip(self.k2_base.iter()) {
            *f = (-ds * bb * k2).exp();
        }

        self.solved_head = false;
        self.solved_tail = false;
        self.state = BlockState::Reset;
        debug!("block {} reset, ds = {}", self.name, ds);
    }

    /// Runs one pseudo-spectral sweep from the given end, starting
    /// from the junction (or free-end) initial condition:
    /// `q[s+1] = wfac ⊙ F⁻¹[k² ⊙ F[wfac ⊙ q[s]]] / V`.
    pub fn solve_q(&mut self, from: BlockEnd, ic: GridField<R>, fft: &mut FftPlan<R>) {
        let inv_v = R::ONE / R::from_usize(fft.fft_size());
        let ladder = match from {
            BlockEnd::Head => &mut self.qf,
            BlockEnd::Tail => &mut self.qb,
        };
        ladder[0] = ic;
        for s in 0..self.ns {
            self.tmp.as_mut_slice().copy_from_slice(ladder[s].as_slice());
            self.tmp *= &self.wfac;
            fft.scaled_pair(self.tmp.as_slice(), &self.k2fac, self.res.as_mut_slice());
            let next = &mut ladder[s + 1];
            next.as_mut_slice().copy_from_slice(self.res.as_slice());
            next.scale(inv_v);
            *next *= &self.wfac;
        }

        match from {
            BlockEnd::Head => self.solved_head = true,
            BlockEnd::Tail => self.solved_tail = true,
        }
        self.state = if self.solved_head && self.solved_tail {
            BlockState::BackwardDone
        } else {
            BlockState::ForwardDone
        };
    }

    /// The full-contour propagator from a sweep that started at the
    /// opposite end of `end` — what this block hands across the
    /// junction at `end`.
    pub fn terminal_q(&self, end: BlockEnd) -> &GridField<R> {
        match end {
            BlockEnd::Tail => &self.qf[self.ns],
            BlockEnd::Head => &self.qb[self.ns],
        }
    }

    /// Deposits this block's density, `prefactor·Σ_s w_s·q_f[s]·q_b[ns-s]`,
    /// into its PhysField (and the charge field for charged blocks).
    pub fn set_phys_fields(
        &mut self,
        phys: &mut [PhysField<R>],
        prefactor: R,
        weights: &[R],
    ) {
        assert_eq!(weights.len(), self.ns + 1);
        debug_assert!(self.solved_head && self.solved_tail);

        self.tmp.reset(R::ZERO);
        for s in 0..=self.ns {
            let slice_tmp = self.tmp.as_mut_slice();
            let f = self.qf[s].as_slice();
            let b = self.qb[self.ns - s].as_slice();
            let ws = weights[s];
            for (t, &fv, &bv) in izip!(slice_tmp.iter_mut(), f, b) {
                *t += ws * fv * bv;
            }
        }
        self.tmp.scale(prefactor);

        let dens = phys[self.scfield().0].dens_mut();
        *dens += &self.tmp;

        if let BlockKind::ChargedFlexible { valence, smear } = self.kind {
            self.tmp.scale(valence * smear);
            let charge = phys[self.chargefield.expect("charged block wiring").0].dens_mut();
            *charge += &self.tmp;
        }

        self.state = BlockState::Deposited;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribs::AttribSet;
    use crate::context::EngineContext;
    use crate::fftplan::{FftLayout, FftPlan};
    use crate::grid::UniCartGrid;

    fn small_grid() -> UniCartGrid<f64> {
        let tas = AttribSet::from_json_str(
            "Grid",
            r#"{ "kind": "uniCartGrid", "numCellsGlobal": [8, 8, 8] }"#,
        )
        .unwrap();
        UniCartGrid::from_attribs("grid", &tas, &[]).unwrap()
    }

    fn free_block(grid: &UniCartGrid<f64>, plan: &FftPlan<f64>) -> Block<f64> {
        let tas = AttribSet::from_json_str(
            "Block",
            r#"{ "kind": "flexPseudoSpec", "scfield": "monoA", "length": 20 }"#,
        )
        .unwrap();
        let mut b = Block::from_attribs("blockA", &tas).unwrap();
        b.finalize_contour(&tas, 20).unwrap();
        b.build_data(grid.num_cells_global());
        b.build_solvers(PhysFieldId(0), None, Vec::new(), Vec::new(), plan);
        b
    }

    fn mono_field(shape: [usize; 3]) -> PhysField<f64> {
        let tas =
            AttribSet::from_json_str("PhysField", r#"{ "kind": "monomerDens" }"#).unwrap();
        let mut ctx = EngineContext::new(0, 0);
        PhysField::from_attribs("monoA", &tas, shape, &mut ctx).unwrap()
    }

    #[test]
    fn free_block_with_zero_field_keeps_q_at_one() {
        let grid = small_grid();
        let mut plan = FftPlan::new("fft", &grid, FftLayout::Normal);
        let mut block = free_block(&grid, &plan);
        let phys = vec![mono_field(grid.num_cells_global())];

        block.reset(&phys, 20, 1.0);
        assert_eq!(block.state(), BlockState::Reset);
        let ones = GridField::constant(grid.num_cells_global(), 1.0);
        block.solve_q(BlockEnd::Head, ones.clone(), &mut plan);
        assert_eq!(block.state(), BlockState::ForwardDone);
        block.solve_q(BlockEnd::Tail, ones, &mut plan);
        assert_eq!(block.state(), BlockState::BackwardDone);

        // exp(ds·∇²) of a constant is the constant.
        let q_end = block.terminal_q(BlockEnd::Tail);
        for &v in q_end.as_slice() {
            assert!((v - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn uniform_field_damps_q_exponentially() {
        let grid = small_grid();
        let mut plan = FftPlan::new("fft", &grid, FftLayout::Normal);
        let mut block = free_block(&grid, &plan);
        let mut phys = vec![mono_field(grid.num_cells_global())];
        phys[0].conj_mut().reset(2.0);

        block.reset(&phys, 20, 1.0);
        let ones = GridField::constant(grid.num_cells_global(), 1.0);
        block.solve_q(BlockEnd::Head, ones, &mut plan);

        // With w uniform the kinetic factor is inert: q(1) = e^{-w}.
        let expect = (-2.0f64).exp();
        for &v in block.terminal_q(BlockEnd::Tail).as_slice() {
            assert!((v - expect).abs() < 1e-9);
        }
    }

    #[test]
    fn deposit_of_an_ideal_block_is_uniform() {
        let grid = small_grid();
        let mut plan = FftPlan::new("fft", &grid, FftLayout::Normal);
        let mut block = free_block(&grid, &plan);
        let mut phys = vec![mono_field(grid.num_cells_global())];

        block.reset(&phys, 20, 1.0);
        let ones = GridField::constant(grid.num_cells_global(), 1.0);
        block.solve_q(BlockEnd::Head, ones.clone(), &mut plan);
        block.solve_q(BlockEnd::Tail, ones, &mut plan);

        let weights = crate::polymer::quad::contour_weights(block.ns(), block.ds());
        // φ_c = 0.4, Q = 1, f_chain = 1.
        block.set_phys_fields(&mut phys, 0.4, &weights);
        assert_eq!(block.state(), BlockState::Deposited);
        for &v in phys[0].dens().as_slice() {
            assert!((v - 0.4).abs() < 1e-9);
        }
    }

    #[test]
    fn contour_defaults_to_one_step_per_monomer() {
        let tas = AttribSet::from_json_str(
            "Block",
            r#"{ "kind": "flexPseudoSpec", "scfield": "monoA", "length": 30 }"#,
        )
        .unwrap();
        let mut b = Block::<f64>::from_attribs("blockA", &tas).unwrap();
        b.finalize_contour(&tas, 60).unwrap();
        assert_eq!(b.ns(), 30);
        assert!((b.ds() - 1.0 / 60.0).abs() < 1e-12);
        assert!((b.contour_span() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn explicit_ds_rounds_to_a_whole_step_count() {
        let tas = AttribSet::from_json_str(
            "Block",
            r#"{ "kind": "flexPseudoSpec", "scfield": "monoA", "length": 50, "ds": 0.01 }"#,
        )
        .unwrap();
        let mut b = Block::<f64>::from_attribs("blockA", &tas).unwrap();
        b.finalize_contour(&tas, 50).unwrap();
        assert_eq!(b.ns(), 100);
        assert!((b.ds() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn charged_blocks_require_a_charge_field() {
        let tas = AttribSet::from_json_str(
            "Block",
            r#"{ "kind": "chargeFlexPseudoSpec", "scfield": "monoA", "length": 10, "za": 1.0 }"#,
        )
        .unwrap();
        assert!(Block::<f64>::from_attribs("blockA", &tas).is_err());
    }
}
