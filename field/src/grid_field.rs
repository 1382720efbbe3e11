use core::ops::{AddAssign, MulAssign, SubAssign};

use itertools::izip;
use serde::{Deserialize, Serialize};
use unroll::unroll_for_loops;

use crate::types::Real;

/// A tensor of `R` cells over the local extent of a grid.
///
/// The shape is always carried as a padded 3-vector `(nx, ny, nz)`;
/// lower-dimensional simulations set the trailing extents to 1. Two
/// fields may be composed elementwise only when they were built over
/// the same grid, which the arithmetic impls check by shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct GridField<R: Real> {
    shape: [usize; 3],
    values: Vec<R>,
}

impl<R: Real> GridField<R> {
    pub fn zeros(shape: [usize; 3]) -> Self {
        Self::constant(shape, R::ZERO)
    }

    pub fn constant(shape: [usize; 3], value: R) -> Self {
        let size = shape.iter().product();
        GridField {
            shape,
            values: vec![value; size],
        }
    }

    pub fn from_values(shape: [usize; 3], values: Vec<R>) -> Self {
        assert_eq!(
            values.len(),
            shape.iter().product::<usize>(),
            "value length does not match shape {shape:?}"
        );
        GridField { shape, values }
    }

    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// The number of cells stored.
    #[inline]
    pub fn size(&self) -> usize {
        self.values.len()
    }

    /// Row-major cell index of the local coordinate `p`.
    #[inline]
    #[unroll_for_loops]
    pub fn cell_index(&self, p: [usize; 3]) -> usize {
        let mut idx = 0;
        for d in 0..3 {
            debug_assert!(p[d] < self.shape[d]);
            idx = idx * self.shape[d] + p[d];
        }
        idx
    }

    #[inline]
    pub fn at(&self, p: [usize; 3]) -> R {
        self.values[self.cell_index(p)]
    }

    #[inline]
    pub fn set(&mut self, p: [usize; 3], v: R) {
        let idx = self.cell_index(p);
        self.values[idx] = v;
    }

    #[inline]
    pub fn as_slice(&self) -> &[R] {
        &self.values
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [R] {
        &mut self.values
    }

    /// Sets every cell to `v`.
    pub fn reset(&mut self, v: R) {
        self.values.iter_mut().for_each(|x| *x = v);
    }

    /// Multiplies every cell by `s`.
    pub fn scale(&mut self, s: R) {
        self.values.iter_mut().for_each(|x| *x *= s);
    }

    /// Adds `s` to every cell.
    pub fn shift(&mut self, s: R) {
        self.values.iter_mut().for_each(|x| *x += s);
    }

    /// Replaces every cell `x` with `e^x`.
    pub fn apply_exp(&mut self) {
        self.values.iter_mut().for_each(|x| *x = x.exp());
    }

    /// `self += s * other`, elementwise.
    pub fn add_scaled(&mut self, other: &Self, s: R) {
        self.check_same_grid(other);
        for (x, &y) in izip!(self.values.iter_mut(), other.values.iter()) {
            *x += s * y;
        }
    }

    pub fn max_val(&self) -> R {
        self.values.iter().copied().fold(R::neg_infinity(), R::max)
    }

    pub fn min_val(&self) -> R {
        self.values.iter().copied().fold(R::infinity(), R::min)
    }

    pub fn sum_all(&self) -> R {
        self.values.iter().copied().sum()
    }

    /// Arithmetic mean over the local cells.
    pub fn mean(&self) -> R {
        self.sum_all() / R::from_usize(self.size())
    }

    #[inline]
    fn check_same_grid(&self, other: &Self) {
        assert_eq!(
            self.shape, other.shape,
            "elementwise algebra requires fields over the same grid"
        );
    }
}

impl<R: Real> AddAssign<&GridField<R>> for GridField<R> {
    fn add_assign(&mut self, rhs: &GridField<R>) {
        self.check_same_grid(rhs);
        for (x, &y) in self.values.iter_mut().zip(rhs.values.iter()) {
            *x += y;
        }
    }
}

impl<R: Real> SubAssign<&GridField<R>> for GridField<R> {
    fn sub_assign(&mut self, rhs: &GridField<R>) {
        self.check_same_grid(rhs);
        for (x, &y) in self.values.iter_mut().zip(rhs.values.iter()) {
            *x -= y;
        }
    }
}

impl<R: Real> MulAssign<&GridField<R>> for GridField<R> {
    fn mul_assign(&mut self, rhs: &GridField<R>) {
        self.check_same_grid(rhs);
        for (x, &y) in self.values.iter_mut().zip(rhs.values.iter()) {
            *x *= y;
        }
    }
}
