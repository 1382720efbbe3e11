use anyhow::Result;
use hashbrown::HashMap;
use log::debug;
use polyscft_field::{GridField, Real};

use crate::attribs::AttribSet;
use crate::comm::Comm;
use crate::context::EngineContext;
use crate::decomp::SlabDecomp;
use crate::error::{class_error, ErrorClass};
use crate::fftplan::FftPlan;
use crate::interaction::Interaction;
use crate::physfield::{PhysField, PhysFieldId, PhysFieldKind};

/// Step gating shared by every updater kind: applies only on steps
/// with `start ≤ t ≤ end` and `(t − start) mod period = 0`.
#[derive(Clone, Copy, Debug)]
pub struct ApplyWindow {
    start: usize,
    period: usize,
    end: usize,
}

impl ApplyWindow {
    pub fn from_attribs(tas: &AttribSet) -> Result<Self> {
        let period = tas.option_or("applyFrequency", 1)?;
        if period < 1 {
            return Err(class_error(
                ErrorClass::InvalidAttribute,
                tas.path(),
                "applyFrequency must be at least 1",
            ));
        }
        Ok(ApplyWindow {
            start: tas.option_or("applyStart", 0)? as usize,
            period: period as usize,
            end: tas.option_or("applyEnd", i64::MAX)? as usize,
        })
    }

    pub fn applies(&self, t: usize) -> bool {
        t >= self.start && t <= self.end && (t - self.start) % self.period == 0
    }
}

/// Enforces incompressibility bookkeeping: clips the wall imprint at
/// the density threshold and publishes the available-volume density
/// `1 − φ_excluded` on the constraint field.
pub struct ConstraintUpdater<R: Real> {
    field: PhysFieldId,
    _marker: core::marker::PhantomData<R>,
}

impl<R: Real> ConstraintUpdater<R> {
    pub fn new(field: PhysFieldId) -> Self {
        ConstraintUpdater {
            field,
            _marker: core::marker::PhantomData,
        }
    }

    pub fn update(&self, phys: &mut [PhysField<R>]) {
        let threshold = phys[self.field.0].max_threshold();
        let pf = &mut phys[self.field.0];
        let Some(wall) = pf.wall_dens_mut() else {
            return;
        };
        for w in wall.as_mut_slice() {
            *w = (*w).min(threshold);
        }
        let excluded: Vec<R> = wall.as_slice().to_vec();
        let dens = pf.dens_mut();
        for (d, w) in dens.as_mut_slice().iter_mut().zip(excluded) {
            *d = (R::ONE - w).max(R::ZERO);
        }
    }

    /// Excluded volume on this rank, fed into Q normalizations.
    pub fn calc_local_volume(&self, phys: &[PhysField<R>]) -> R {
        phys[self.field.0].calc_local_volume()
    }
}

/// Rule-specific state of an updater.
enum UpdaterKind<R: Real> {
    SteepestDescent {
        noise_strength: R,
        relax_lambdas: Vec<R>,
        shift_pressure: bool,
        dh: Vec<GridField<R>>,
        ptmp: GridField<R>,
    },
    SimpleSpecFilter {
        cutoff_factor: R,
        filter_strength: R,
        abs: Vec<R>,
        mask: Vec<R>,
        res: Vec<R>,
    },
    MultiSpecFilter {
        spec_cells: [usize; 3],
        cutoff_factors: Vec<R>,
        filter_strength: R,
        abs: Vec<R>,
        mask: Vec<R>,
        res: Vec<R>,
    },
    Poisson {
        relax: R,
        bjerrum: R,
        kernel: Vec<R>,
        res: Vec<R>,
    },
}

/// A rule that evolves one or more conjugate fields.
pub struct Updater<R: Real> {
    name: String,
    path: String,
    window: ApplyWindow,
    update_field_names: Vec<String>,
    update_fields: Vec<PhysFieldId>,
    kind: UpdaterKind<R>,
}

impl<R: Real> Updater<R> {
    pub fn from_attribs(name: &str, tas: &AttribSet) -> Result<Self> {
        let update_field_names = tas.get_str_vec("updateFields")?;
        if update_field_names.is_empty() {
            return Err(class_error(
                ErrorClass::InvalidAttribute,
                tas.path(),
                "updateFields must not be empty",
            ));
        }
        let window = ApplyWindow::from_attribs(tas)?;

        let kind = match tas.kind()?.as_str() {
            "steepestDescent" => {
                let lambdas = if tas.has_prm_vec("relaxlambdas") {
                    tas.get_prm_vec("relaxlambdas")?
                } else {
                    vec![tas.get_param("relaxlambda")?]
                };
                let mut relax_lambdas: Vec<R> =
                    lambdas.into_iter().map(R::from_f64).collect();
                if relax_lambdas.len() == 1 {
                    relax_lambdas =
                        vec![relax_lambdas[0]; update_field_names.len()];
                }
                if relax_lambdas.len() != update_field_names.len() {
                    return Err(class_error(
                        ErrorClass::InvalidAttribute,
                        tas.path(),
                        "relaxlambdas length does not match updateFields",
                    ));
                }
                UpdaterKind::SteepestDescent {
                    noise_strength: R::from_f64(tas.param_or("noiseStrength", 0.0)?),
                    relax_lambdas,
                    shift_pressure: tas.flag_or("shiftPressureFlag", true)?,
                    dh: Vec::new(),
                    ptmp: GridField::zeros([1, 1, 1]),
                }
            }
            "simpleSpecFilter" => UpdaterKind::SimpleSpecFilter {
                cutoff_factor: R::from_f64(tas.get_param("cutoffFactor")?),
                filter_strength: R::from_f64(tas.param_or("filterStrength", 0.0)?),
                abs: Vec::new(),
                mask: Vec::new(),
                res: Vec::new(),
            },
            "multiSpecFilter" => {
                let cells = tas.get_opt_vec("numSpecCells")?;
                let mut spec_cells = [1usize; 3];
                for (d, &c) in cells.iter().take(3).enumerate() {
                    if c < 1 {
                        return Err(class_error(
                            ErrorClass::InvalidAttribute,
                            tas.path(),
                            "numSpecCells entries must be positive",
                        ));
                    }
                    spec_cells[d] = c as usize;
                }
                let cutoff_factors: Vec<R> = tas
                    .get_prm_vec("cutoffFactors")?
                    .into_iter()
                    .map(R::from_f64)
                    .collect();
                if cutoff_factors.len() != spec_cells.iter().product::<usize>() {
                    return Err(class_error(
                        ErrorClass::InvalidAttribute,
                        tas.path(),
                        "cutoffFactors length must equal the spectral cell count",
                    ));
                }
                UpdaterKind::MultiSpecFilter {
                    spec_cells,
                    cutoff_factors,
                    filter_strength: R::from_f64(tas.param_or("filterStrength", 0.0)?),
                    abs: Vec::new(),
                    mask: Vec::new(),
                    res: Vec::new(),
                }
            }
            "poissonUpdater" => UpdaterKind::Poisson {
                relax: R::from_f64(tas.param_or("relaxlambda", 1.0)?),
                bjerrum: R::from_f64(tas.param_or("bjerrumLen", 1.0)?),
                kernel: Vec::new(),
                res: Vec::new(),
            },
            other => {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("unknown Updater kind {other:?}"),
                ))
            }
        };

        Ok(Updater {
            name: name.to_string(),
            path: tas.path().to_string(),
            window,
            update_field_names,
            update_fields: Vec::new(),
            kind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> ApplyWindow {
        self.window
    }

    pub fn build_solvers(
        &mut self,
        phys: &[PhysField<R>],
        phys_names: &HashMap<String, PhysFieldId>,
        plan: &FftPlan<R>,
        decomp: &SlabDecomp,
        local_shape: [usize; 3],
    ) -> Result<()> {
        self.update_fields.clear();
        for fname in &self.update_field_names {
            let &id = phys_names.get(fname).ok_or_else(|| {
                class_error(
                    ErrorClass::UnknownObject,
                    &self.path,
                    format!("no PhysField named {fname:?}"),
                )
            })?;
            self.update_fields.push(id);
        }

        let fft_size = plan.fft_size();
        match &mut self.kind {
            UpdaterKind::SteepestDescent { dh, ptmp, .. } => {
                *dh = (0..self.update_fields.len())
                    .map(|_| GridField::zeros(local_shape))
                    .collect();
                *ptmp = GridField::zeros(local_shape);
            }
            UpdaterKind::SimpleSpecFilter { abs, mask, res, .. } => {
                *abs = vec![R::ZERO; fft_size];
                *mask = vec![R::ZERO; fft_size];
                *res = vec![R::ZERO; fft_size];
            }
            UpdaterKind::MultiSpecFilter { abs, mask, res, .. } => {
                if decomp.transpose() {
                    return Err(class_error(
                        ErrorClass::InvalidAttribute,
                        &self.path,
                        "multiSpecFilter does not support the transpose decomposition",
                    ));
                }
                *abs = vec![R::ZERO; fft_size];
                *mask = vec![R::ZERO; fft_size];
                *res = vec![R::ZERO; fft_size];
            }
            UpdaterKind::Poisson { kernel, res, .. } => {
                let id = self.update_fields[0];
                if phys[id.0].kind() != PhysFieldKind::ChargeDens {
                    return Err(class_error(
                        ErrorClass::InvalidAttribute,
                        &self.path,
                        "poissonUpdater drives a chargeDens field",
                    ));
                }
                *kernel = plan
                    .k_norm_sq()
                    .into_iter()
                    .map(|k2| if k2 == R::ZERO { R::ZERO } else { R::ONE / k2 })
                    .collect();
                *res = vec![R::ZERO; fft_size];
            }
        }
        Ok(())
    }

    /// Applies the rule at step `t`; a no-op outside the apply window.
    pub fn update(
        &mut self,
        t: usize,
        phys: &mut [PhysField<R>],
        interactions: &[Interaction<R>],
        fft: &mut FftPlan<R>,
        comm: &dyn Comm<R>,
        ctx: &mut EngineContext<R>,
        constraint: PhysFieldId,
        total_cells_global: usize,
    ) -> Result<()> {
        if !self.window.applies(t) {
            return Ok(());
        }
        debug!("updater {} applies at step {t}", self.name);

        match &mut self.kind {
            UpdaterKind::SteepestDescent {
                noise_strength,
                relax_lambdas,
                shift_pressure,
                dh,
                ptmp,
            } => {
                // Total functional derivative per driven field, minus
                // the incompressibility pressure.
                for (idx, &fid) in self.update_fields.iter().enumerate() {
                    let out = &mut dh[idx];
                    out.reset(R::ZERO);
                    let fname = phys[fid.0].name().to_string();
                    for term in interactions {
                        if term.has_sc_field(&fname) {
                            term.calc_dfd(phys, &fname, out)?;
                        }
                    }
                    *out -= phys[constraint.0].conj();
                    if *noise_strength > R::ZERO {
                        for v in out.as_mut_slice() {
                            *v += *noise_strength * (ctx.uniform_rank() - R::HALF);
                        }
                    }
                }

                for (idx, &fid) in self.update_fields.iter().enumerate() {
                    phys[fid.0]
                        .conj_mut()
                        .add_scaled(&dh[idx], -relax_lambdas[idx]);
                }

                // Pressure is the mean of the post-update conjugates.
                ptmp.reset(R::ZERO);
                for &fid in &self.update_fields {
                    *ptmp += phys[fid.0].conj();
                }
                ptmp.scale(R::ONE / R::from_usize(self.update_fields.len()));
                if *shift_pressure {
                    let mean = comm.all_reduce_sum(ptmp.sum_all())?
                        / R::from_usize(total_cells_global);
                    ptmp.shift(-mean);
                }
                phys[constraint.0]
                    .conj_mut()
                    .as_mut_slice()
                    .copy_from_slice(ptmp.as_slice());
            }

            UpdaterKind::SimpleSpecFilter {
                cutoff_factor,
                filter_strength,
                abs,
                mask,
                res,
            } => {
                // A zero cutoff must be the exact identity: even a
                // filtering pass with cutoff 0 perturbs the fields.
                if *cutoff_factor <= R::ZERO {
                    return Ok(());
                }
                let inv_v = R::ONE / R::from_usize(fft.fft_size());
                for &fid in &self.update_fields {
                    subtract_global_average(phys[fid.0].conj_mut(), comm, total_cells_global)?;
                    let w = phys[fid.0].conj();
                    fft.forward_abs(w.as_slice(), abs);
                    let local_max =
                        abs.iter().copied().fold(R::neg_infinity(), R::max);
                    let cutoff = *cutoff_factor * comm.all_reduce_max(local_max)?;
                    for (m, &a) in mask.iter_mut().zip(abs.iter()) {
                        *m = if a < cutoff { *filter_strength } else { R::ONE };
                    }
                    fft.scaled_pair(w.as_slice(), mask, res);
                    let w = phys[fid.0].conj_mut();
                    for (wv, &r) in w.as_mut_slice().iter_mut().zip(res.iter()) {
                        *wv = inv_v * r;
                    }
                }
            }

            UpdaterKind::MultiSpecFilter {
                spec_cells,
                cutoff_factors,
                filter_strength,
                abs,
                mask,
                res,
            } => {
                let dims = phys[self.update_fields[0].0].conj().shape();
                let inv_v = R::ONE / R::from_usize(fft.fft_size());
                for &fid in &self.update_fields {
                    subtract_global_average(phys[fid.0].conj_mut(), comm, total_cells_global)?;
                    let w = phys[fid.0].conj();
                    fft.forward_abs(w.as_slice(), abs);
                    let local_max =
                        abs.iter().copied().fold(R::neg_infinity(), R::max);
                    let max = comm.all_reduce_max(local_max)?;

                    // Per-cell cutoffs over a coarse partition of
                    // k-space, normal layout only.
                    let mut i = 0;
                    for i0 in 0..dims[0] {
                        let c0 = i0 * spec_cells[0] / dims[0];
                        for i1 in 0..dims[1] {
                            let c1 = i1 * spec_cells[1] / dims[1];
                            for i2 in 0..dims[2] {
                                let c2 = i2 * spec_cells[2] / dims[2];
                                let cell =
                                    (c0 * spec_cells[1] + c1) * spec_cells[2] + c2;
                                let cutoff = cutoff_factors[cell] * max;
                                mask[i] = if abs[i] < cutoff {
                                    *filter_strength
                                } else {
                                    R::ONE
                                };
                                i += 1;
                            }
                        }
                    }

                    fft.scaled_pair(w.as_slice(), mask, res);
                    let w = phys[fid.0].conj_mut();
                    for (wv, &r) in w.as_mut_slice().iter_mut().zip(res.iter()) {
                        *wv = inv_v * r;
                    }
                }
            }

            UpdaterKind::Poisson {
                relax,
                bjerrum,
                kernel,
                res,
            } => {
                // −∇²ψ = ρ in Fourier space, k = 0 mode pinned to zero.
                let fid = self.update_fields[0];
                let inv_v = R::ONE / R::from_usize(fft.fft_size());
                let rho = phys[fid.0].dens();
                fft.scaled_pair(rho.as_slice(), kernel, res);
                let scale = *bjerrum * inv_v;
                let lam = *relax;
                let psi = phys[fid.0].conj_mut();
                for (p, &r) in psi.as_mut_slice().iter_mut().zip(res.iter()) {
                    *p = (R::ONE - lam) * *p + lam * scale * r;
                }
            }
        }
        Ok(())
    }
}

/// Shifts a field to zero global mean.
fn subtract_global_average<R: Real>(
    field: &mut GridField<R>,
    comm: &dyn Comm<R>,
    total_cells_global: usize,
) -> Result<()> {
    let mean = comm.all_reduce_sum(field.sum_all())? / R::from_usize(total_cells_global);
    field.shift(-mean);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use crate::decomp::local_slab_sizes;
    use crate::fftplan::FftLayout;
    use crate::grid::UniCartGrid;

    fn world(
        cells: &str,
    ) -> (
        UniCartGrid<f64>,
        SlabDecomp,
        FftPlan<f64>,
        Vec<PhysField<f64>>,
        HashMap<String, PhysFieldId>,
        EngineContext<f64>,
    ) {
        let gtas = AttribSet::from_json_str(
            "Grid",
            &format!(r#"{{ "kind": "uniCartGrid", "numCellsGlobal": {cells} }}"#),
        )
        .unwrap();
        let grid = UniCartGrid::from_attribs("grid", &gtas, &[]).unwrap();
        let sizes = local_slab_sizes(&grid, &SerialComm);
        let decomp = SlabDecomp::build("decomp", "Domain.decomp", false, &grid, &sizes).unwrap();
        let plan = FftPlan::new("fft", &grid, FftLayout::Normal);
        let mut ctx = EngineContext::new(9, 0);
        let shape = grid.num_cells_global();
        let mk = |name: &str, kind: &str, ctx: &mut EngineContext<f64>| {
            let tas = AttribSet::from_json_str(
                "PhysField",
                &format!(r#"{{ "kind": "{kind}" }}"#),
            )
            .unwrap();
            PhysField::from_attribs(name, &tas, shape, ctx).unwrap()
        };
        let phys = vec![
            mk("monoA", "monomerDens", &mut ctx),
            mk("monoB", "monomerDens", &mut ctx),
            mk("charge", "chargeDens", &mut ctx),
            mk("defaultPressure", "constraint", &mut ctx),
        ];
        let names = phys
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name().to_string(), PhysFieldId(i)))
            .collect();
        (grid, decomp, plan, phys, names, ctx)
    }

    fn flory(chi: f64, phys: &mut [PhysField<f64>], names: &HashMap<String, PhysFieldId>, decomp: &SlabDecomp) -> Interaction<f64> {
        let tas = AttribSet::from_json_str(
            "Interaction",
            &format!(r#"{{ "kind": "flory", "scfields": ["monoA", "monoB"], "chiN": {chi} }}"#),
        )
        .unwrap();
        let mut term = Interaction::from_attribs("floryAB", &tas).unwrap();
        term.build_solvers(phys, names, decomp).unwrap();
        term
    }

    #[test]
    fn apply_window_gates_exactly() {
        let tas = AttribSet::from_json_str(
            "Updater",
            r#"{ "kind": "poissonUpdater", "updateFields": ["charge"],
                 "applyStart": 10, "applyFrequency": 5, "applyEnd": 30 }"#,
        )
        .unwrap();
        let u = Updater::<f64>::from_attribs("pois", &tas).unwrap();
        let w = u.window();
        assert!(!w.applies(9));
        assert!(w.applies(10));
        assert!(!w.applies(12));
        assert!(w.applies(25));
        assert!(w.applies(30));
        assert!(!w.applies(35));
    }

    #[test]
    fn updates_outside_the_window_are_no_ops() {
        let (_grid, decomp, mut plan, mut phys, names, mut ctx) = world("[8, 1, 1]");
        let tas = AttribSet::from_json_str(
            "Updater",
            r#"{ "kind": "steepestDescent", "updateFields": ["monoA", "monoB"],
                 "relaxlambda": 0.1, "applyStart": 100 }"#,
        )
        .unwrap();
        let mut u = Updater::<f64>::from_attribs("steep", &tas).unwrap();
        u.build_solvers(&phys, &names, &plan, &decomp, [8, 1, 1]).unwrap();

        phys[0].dens_mut().reset(0.4);
        let before: Vec<f64> = phys[0].conj().as_slice().to_vec();
        let inter = [flory(10.0, &mut phys, &names, &decomp)];
        u.update(0, &mut phys, &inter, &mut plan, &SerialComm, &mut ctx, PhysFieldId(3), 8)
            .unwrap();
        assert_eq!(phys[0].conj().as_slice(), &before[..]);
    }

    #[test]
    fn steepest_descent_moves_w_down_the_gradient() {
        let (_grid, decomp, mut plan, mut phys, names, mut ctx) = world("[8, 1, 1]");
        phys[0].dens_mut().reset(0.4);
        phys[1].dens_mut().reset(0.6);
        let inter = [flory(15.0, &mut phys, &names, &decomp)];

        let tas = AttribSet::from_json_str(
            "Updater",
            r#"{ "kind": "steepestDescent", "updateFields": ["monoA", "monoB"],
                 "relaxlambdas": [0.1, 0.1], "shiftPressureFlag": "off" }"#,
        )
        .unwrap();
        let mut u = Updater::<f64>::from_attribs("steep", &tas).unwrap();
        u.build_solvers(&phys, &names, &plan, &decomp, [8, 1, 1]).unwrap();
        u.update(0, &mut phys, &inter, &mut plan, &SerialComm, &mut ctx, PhysFieldId(3), 8)
            .unwrap();

        // dH_A = χN·φ_B − p = 9 with p = 0; w_A = −0.1·9.
        for &v in phys[0].conj().as_slice() {
            assert!((v + 0.9).abs() < 1e-12);
        }
        // dH_B = χN·φ_A = 6; w_B = −0.6; pressure = (w_A + w_B)/2.
        for &v in phys[3].conj().as_slice() {
            assert!((v + 0.75).abs() < 1e-12);
        }
    }

    #[test]
    fn zero_cutoff_spectral_filter_is_the_identity() {
        let (_grid, decomp, mut plan, mut phys, names, mut ctx) = world("[16, 1, 1]");
        let tas = AttribSet::from_json_str(
            "Updater",
            r#"{ "kind": "simpleSpecFilter", "updateFields": ["monoA"],
                 "cutoffFactor": 0.0, "filterStrength": 0.0 }"#,
        )
        .unwrap();
        let mut u = Updater::<f64>::from_attribs("filter", &tas).unwrap();
        u.build_solvers(&phys, &names, &plan, &decomp, [16, 1, 1]).unwrap();

        let w = phys[0].conj_mut();
        for i in 0..16 {
            w.set([i, 0, 0], (i as f64 * 0.37).sin());
        }
        let before: Vec<f64> = phys[0].conj().as_slice().to_vec();
        u.update(0, &mut phys, &[], &mut plan, &SerialComm, &mut ctx, PhysFieldId(3), 16)
            .unwrap();
        assert_eq!(phys[0].conj().as_slice(), &before[..]);
    }

    #[test]
    fn spectral_filter_damps_weak_modes_and_keeps_strong_ones() {
        let (_grid, decomp, mut plan, mut phys, names, mut ctx) = world("[32, 1, 1]");
        // Strong mode 1 plus a weak mode 5.
        let w = phys[0].conj_mut();
        for i in 0..32 {
            let x = 2.0 * std::f64::consts::PI * i as f64 / 32.0;
            w.set([i, 0, 0], x.cos() + 1e-3 * (5.0 * x).cos());
        }
        let tas = AttribSet::from_json_str(
            "Updater",
            r#"{ "kind": "simpleSpecFilter", "updateFields": ["monoA"],
                 "cutoffFactor": 0.5, "filterStrength": 0.0 }"#,
        )
        .unwrap();
        let mut u = Updater::<f64>::from_attribs("filter", &tas).unwrap();
        u.build_solvers(&phys, &names, &plan, &decomp, [32, 1, 1]).unwrap();
        u.update(0, &mut phys, &[], &mut plan, &SerialComm, &mut ctx, PhysFieldId(3), 32)
            .unwrap();

        // The weak harmonic is gone; the strong one survives intact.
        let after = phys[0].conj();
        for i in 0..32 {
            let x = 2.0 * std::f64::consts::PI * i as f64 / 32.0;
            assert!((after.at([i, 0, 0]) - x.cos()).abs() < 1e-9);
        }
    }

    #[test]
    fn poisson_updater_inverts_the_laplacian() {
        // Spec scenario: ρ = cos(2πx/L) on n = (64,1,1), L = 1 →
        // ψ = (L/2π)²·cos(2πx/L).
        let gtas = AttribSet::from_json_str(
            "Grid",
            r#"{ "kind": "uniCartGrid", "numCellsGlobal": [64, 1, 1],
                 "cellSizes": [0.015625, 1.0, 1.0] }"#,
        )
        .unwrap();
        let grid = UniCartGrid::<f64>::from_attribs("grid", &gtas, &[]).unwrap();
        let sizes = local_slab_sizes(&grid, &SerialComm);
        let decomp = SlabDecomp::build("decomp", "Domain.decomp", false, &grid, &sizes).unwrap();
        let mut plan = FftPlan::new("fft", &grid, FftLayout::Normal);
        let mut ctx = EngineContext::new(0, 0);
        let ptas = AttribSet::from_json_str("PhysField", r#"{ "kind": "chargeDens" }"#).unwrap();
        let mut phys = vec![
            PhysField::from_attribs("charge", &ptas, [64, 1, 1], &mut ctx).unwrap(),
        ];
        let names: HashMap<String, PhysFieldId> =
            [("charge".to_string(), PhysFieldId(0))].into();

        let rho = phys[0].dens_mut();
        for i in 0..64 {
            let x = i as f64 / 64.0;
            rho.set([i, 0, 0], (2.0 * std::f64::consts::PI * x).cos());
        }

        let tas = AttribSet::from_json_str(
            "Updater",
            r#"{ "kind": "poissonUpdater", "updateFields": ["charge"] }"#,
        )
        .unwrap();
        let mut u = Updater::<f64>::from_attribs("pois", &tas).unwrap();
        u.build_solvers(&phys, &names, &plan, &decomp, [64, 1, 1]).unwrap();
        u.update(0, &mut phys, &[], &mut plan, &SerialComm, &mut ctx, PhysFieldId(0), 64)
            .unwrap();

        let scale = (1.0 / (2.0 * std::f64::consts::PI)).powi(2);
        let psi = phys[0].conj();
        for i in 0..64 {
            let x = i as f64 / 64.0;
            let want = scale * (2.0 * std::f64::consts::PI * x).cos();
            assert!((psi.at([i, 0, 0]) - want).abs() < 1e-10);
        }
    }

    #[test]
    fn multi_spec_filter_rejects_the_transpose_layout() {
        let (grid, _decomp, plan, phys, names, _ctx) = world("[8, 8, 1]");
        let sizes = local_slab_sizes(&grid, &SerialComm);
        let tdecomp =
            SlabDecomp::build("decomp", "Domain.decomp", true, &grid, &sizes).unwrap();
        let tas = AttribSet::from_json_str(
            "Updater",
            r#"{ "kind": "multiSpecFilter", "updateFields": ["monoA"],
                 "numSpecCells": [2, 2, 1], "cutoffFactors": [0.1, 0.2, 0.3, 0.4] }"#,
        )
        .unwrap();
        let mut u = Updater::<f64>::from_attribs("mfilter", &tas).unwrap();
        let err = u
            .build_solvers(&phys, &names, &plan, &tdecomp, [8, 8, 1])
            .unwrap_err();
        assert_eq!(
            crate::error::classify(&err),
            Some(ErrorClass::InvalidAttribute)
        );
    }

    #[test]
    fn constraint_updater_publishes_available_volume() {
        let (_grid, _decomp, _plan, mut phys, _names, _ctx) = world("[8, 1, 1]");
        let wall = phys[3].wall_dens_mut().unwrap();
        wall.set([0, 0, 0], 2.0);
        wall.set([1, 0, 0], 0.25);

        let cu = ConstraintUpdater::new(PhysFieldId(3));
        cu.update(&mut phys);
        // Clipped at the threshold, published as 1 − φ_excluded.
        assert_eq!(phys[3].wall_dens().unwrap().at([0, 0, 0]), 1.0);
        assert_eq!(phys[3].dens().at([0, 0, 0]), 0.0);
        assert_eq!(phys[3].dens().at([1, 0, 0]), 0.75);
        assert_eq!(phys[3].dens().at([5, 0, 0]), 1.0);
        assert!((cu.calc_local_volume(&phys) - 1.25).abs() < 1e-12);
    }
}
