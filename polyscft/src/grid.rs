use anyhow::Result;
use polyscft_field::Real;
use unroll::unroll_for_loops;

use crate::attribs::AttribSet;
use crate::context::EngineContext;
use crate::decomp::SlabDecomp;
use crate::error::{class_error, ErrorClass};

/// Uniform Cartesian lattice with periodic boundary conditions.
///
/// Shapes are padded 3-vectors; a 2D run sets the trailing extent to 1.
/// Cell counts must be powers of two per axis — the spectral kernels
/// are radix-2 — with `n = 1` degenerating to the identity transform.
#[derive(Clone, Debug)]
pub struct UniCartGrid<R: Real> {
    name: String,
    num_cells_global: [usize; 3],
    cell_sizes: [R; 3],
    ndim: usize,
}

impl<R: Real> UniCartGrid<R> {
    pub fn from_attribs(name: &str, tas: &AttribSet, domain_cells: &[i64]) -> Result<Self> {
        let cells = if tas.has_prm_vec("numCellsGlobal") {
            tas.get_opt_vec("numCellsGlobal")?
        } else {
            domain_cells.to_vec()
        };
        let ndim = cells.len();
        if !(1..=3).contains(&ndim) {
            return Err(class_error(
                ErrorClass::InvalidAttribute,
                tas.path(),
                format!("numCellsGlobal must have 1..=3 entries, got {ndim}"),
            ));
        }

        let mut num_cells_global = [1usize; 3];
        for (d, &n) in cells.iter().enumerate() {
            if n < 1 {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("numCellsGlobal[{d}] = {n} is not positive"),
                ));
            }
            let n = n as usize;
            if !n.is_power_of_two() {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("numCellsGlobal[{d}] = {n} is not a power of two"),
                ));
            }
            num_cells_global[d] = n;
        }

        let mut cell_sizes = [R::ONE; 3];
        if tas.has_prm_vec("cellSizes") {
            let sizes = tas.get_prm_vec("cellSizes")?;
            for (d, &s) in sizes.iter().take(3).enumerate() {
                cell_sizes[d] = R::from_f64(s);
            }
        }

        Ok(UniCartGrid {
            name: name.to_string(),
            num_cells_global,
            cell_sizes,
            ndim,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn num_cells_global(&self) -> [usize; 3] {
        self.num_cells_global
    }

    pub fn total_cells_global(&self) -> usize {
        self.num_cells_global.iter().product()
    }

    pub fn cell_sizes(&self) -> [R; 3] {
        self.cell_sizes
    }

    /// Physical box lengths `n_i * Δ_i` per axis.
    pub fn global_lengths(&self) -> [R; 3] {
        let mut lengths = [R::ONE; 3];
        for d in 0..3 {
            lengths[d] = R::from_usize(self.num_cells_global[d]) * self.cell_sizes[d];
        }
        lengths
    }

    pub fn center_global(&self) -> [i64; 3] {
        let mut c = [0i64; 3];
        for d in 0..3 {
            c[d] = (self.num_cells_global[d] / 2) as i64;
        }
        c
    }

    /// Draws a grid point from the globally synchronized stream.
    pub fn random_global_point(&self, ctx: &mut EngineContext<R>) -> [i64; 3] {
        let mut p = [0i64; 3];
        for d in 0..3 {
            let u: R = ctx.uniform_global();
            let n = R::from_usize(self.num_cells_global[d]);
            p[d] = (u * n).floor().to_f64() as i64;
        }
        p
    }

    /// Canonical periodic map: componentwise positive representative
    /// of `p_i mod n_i`.
    #[unroll_for_loops]
    pub fn fold(&self, p: [i64; 3]) -> [i64; 3] {
        let mut folded = [0i64; 3];
        for d in 0..3 {
            folded[d] = p[d].rem_euclid(self.num_cells_global[d] as i64);
        }
        folded
    }

    /// Minimum-image distance between two grid points, in index space.
    pub fn shortest_distance(&self, v1: [i64; 3], v2: [i64; 3]) -> R {
        let mut sum_sq = R::ZERO;
        for d in 0..3 {
            let n = self.num_cells_global[d] as i64;
            let mut dr = (v1[d] - v2[d]).abs() % n;
            dr = dr.min(n - dr);
            let dr = R::from_f64(dr as f64);
            sum_sq += dr * dr;
        }
        sum_sq.sqrt()
    }

    /// Global point to rank-local coordinates, per the decomposition.
    pub fn to_local(&self, p: [i64; 3], decomp: &SlabDecomp) -> [i64; 3] {
        let shifts = decomp.local_to_global_shifts();
        let mut q = [0i64; 3];
        for d in 0..3 {
            q[d] = p[d] - shifts[d] as i64;
        }
        q
    }

    /// Rank-local point back to global coordinates.
    pub fn to_global(&self, p: [i64; 3], decomp: &SlabDecomp) -> [i64; 3] {
        let shifts = decomp.local_to_global_shifts();
        let mut q = [0i64; 3];
        for d in 0..3 {
            q[d] = p[d] + shifts[d] as i64;
        }
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(cells: [i64; 3]) -> UniCartGrid<f64> {
        let tas = AttribSet::from_json_str(
            "Grid",
            &format!(
                r#"{{ "kind": "uniCartGrid", "numCellsGlobal": [{}, {}, {}] }}"#,
                cells[0], cells[1], cells[2]
            ),
        )
        .unwrap();
        UniCartGrid::from_attribs("grid", &tas, &[]).unwrap()
    }

    #[test]
    fn fold_is_idempotent_and_positive() {
        let g = grid([32, 32, 32]);
        let p = [-1, 35, 64];
        let once = g.fold(p);
        assert_eq!(once, [31, 3, 0]);
        assert_eq!(g.fold(once), once);
    }

    #[test]
    fn minimum_image_distance_wraps() {
        // Spec scenario: (0,0,0) to (31,0,0) on a 32^3 box is 1 cell.
        let g = grid([32, 32, 32]);
        let d = g.shortest_distance([0, 0, 0], [31, 0, 0]);
        assert!((d - 1.0).abs() < 1e-12);
        let d = g.shortest_distance([0, 0, 0], [16, 16, 0]);
        assert!((d - (2.0f64 * 256.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn center_of_degenerate_axis_is_zero() {
        let g = grid([32, 32, 1]);
        assert_eq!(g.center_global(), [16, 16, 0]);
    }

    #[test]
    fn random_points_are_in_range_and_synchronized() {
        let g = grid([8, 4, 2]);
        let mut ctx_a = EngineContext::<f64>::new(3, 0);
        let mut ctx_b = EngineContext::<f64>::new(3, 1);
        for _ in 0..32 {
            let p = g.random_global_point(&mut ctx_a);
            let q = g.random_global_point(&mut ctx_b);
            assert_eq!(p, q);
            for d in 0..3 {
                assert!(p[d] >= 0 && p[d] < g.num_cells_global()[d] as i64);
            }
        }
    }

    #[test]
    fn non_power_of_two_grids_are_rejected() {
        let tas = AttribSet::from_json_str(
            "Grid",
            r#"{ "kind": "uniCartGrid", "numCellsGlobal": [12, 8, 1] }"#,
        )
        .unwrap();
        assert!(UniCartGrid::<f64>::from_attribs("grid", &tas, &[]).is_err());
    }

    #[test]
    fn lengths_scale_with_cell_sizes() {
        let tas = AttribSet::from_json_str(
            "Grid",
            r#"{ "kind": "uniCartGrid", "numCellsGlobal": [64, 1, 1], "cellSizes": [0.015625, 1.0, 1.0] }"#,
        )
        .unwrap();
        let g = UniCartGrid::<f64>::from_attribs("grid", &tas, &[]).unwrap();
        let lengths = g.global_lengths();
        assert!((lengths[0] - 1.0).abs() < 1e-12);
    }

    // log2_strict is the power-of-two authority for plan builds.
    #[test]
    fn grid_extents_admit_radix2_plans() {
        let g = grid([32, 4, 1]);
        for d in 0..3 {
            let _ = polyscft_util::log2_strict(g.num_cells_global()[d]);
        }
    }
}
