use anyhow::Result;
use polyscft_field::Real;

use crate::attribs::AttribSet;
use crate::comm::Comm;
use crate::error::{class_error, ErrorClass};
use crate::grid::UniCartGrid;

/// Per-rank extents the FFT layer reports for its slab layout, in the
/// shape the distributed planner hands back: the x-slab owned by this
/// rank, and the y-slab it owns after a transposed forward transform.
#[derive(Clone, Copy, Debug)]
pub struct FftLocalSizes {
    pub local_nx: usize,
    pub local_x_start: usize,
    pub local_ny_after_transpose: usize,
    pub local_y_start_after_transpose: usize,
    pub total_local_size: usize,
}

/// Computes the slab extents for this rank. With a single rank every
/// slab is the full axis; a multi-rank run splits the slab axis evenly
/// with the low ranks taking any remainder.
pub fn local_slab_sizes<R: Real>(grid: &UniCartGrid<R>, comm: &dyn Comm<R>) -> FftLocalSizes {
    let n = grid.num_cells_global();
    let (rank, size) = (comm.rank(), comm.size());

    let split = |extent: usize| {
        let base = extent / size;
        let rem = extent % size;
        let local = base + usize::from(rank < rem);
        let start = rank * base + rank.min(rem);
        (local, start)
    };

    let (local_nx, local_x_start) = split(n[0]);
    let (local_ny_after_transpose, local_y_start_after_transpose) = split(n[1]);
    FftLocalSizes {
        local_nx,
        local_x_start,
        local_ny_after_transpose,
        local_y_start_after_transpose,
        total_local_size: local_nx * n[1] * n[2],
    }
}

/// Slab decomposition of the simulation box.
///
/// The x axis is partitioned across ranks; with the transpose flag set
/// the y axis is partitioned instead, matching the layout of data that
/// stays in reciprocal space after a transposed forward transform.
#[derive(Clone, Debug)]
pub struct SlabDecomp {
    name: String,
    transpose: bool,
    num_cells_local: [usize; 3],
    shifts: [usize; 3],
}

impl SlabDecomp {
    pub fn from_attribs<R: Real>(
        name: &str,
        tas: &AttribSet,
        grid: &UniCartGrid<R>,
        comm: &dyn Comm<R>,
    ) -> Result<Self> {
        let kind = tas.kind()?;
        match kind.as_str() {
            "regular" | "fftw" => {}
            other => {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("unknown Decomp kind {other:?}"),
                ))
            }
        }
        let transpose = tas.flag_or("transposeFlag", false)?;
        let sizes = local_slab_sizes(grid, comm);
        Self::build(name, tas.path(), transpose, grid, &sizes)
    }

    pub fn build<R: Real>(
        name: &str,
        path: &str,
        transpose: bool,
        grid: &UniCartGrid<R>,
        sizes: &FftLocalSizes,
    ) -> Result<Self> {
        let global = grid.num_cells_global();
        let mut num_cells_local = global;
        let mut shifts = [0usize; 3];
        if transpose {
            num_cells_local[1] = sizes.local_ny_after_transpose;
            shifts[1] = sizes.local_y_start_after_transpose;
        } else {
            num_cells_local[0] = sizes.local_nx;
            shifts[0] = sizes.local_x_start;
        }

        let axis = usize::from(transpose);
        if num_cells_local[axis] == 0 {
            return Err(class_error(
                ErrorClass::InvalidDecomposition,
                path,
                format!("rank has zero local extent on axis {axis}"),
            ));
        }

        Ok(SlabDecomp {
            name: name.to_string(),
            transpose,
            num_cells_local,
            shifts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transpose(&self) -> bool {
        self.transpose
    }

    pub fn num_cells_local(&self) -> [usize; 3] {
        self.num_cells_local
    }

    pub fn total_cells_local(&self) -> usize {
        self.num_cells_local.iter().product()
    }

    /// Offsets from local to global coordinates; nonzero only in the
    /// partitioned axis.
    pub fn local_to_global_shifts(&self) -> [usize; 3] {
        self.shifts
    }

    /// True iff the global point lies in this rank's x and y slabs.
    pub fn has_position(&self, p: [i64; 3]) -> bool {
        for d in 0..2 {
            let start = self.shifts[d] as i64;
            let end = start + self.num_cells_local[d] as i64;
            if p[d] < start || p[d] >= end {
                return false;
            }
        }
        true
    }
}
