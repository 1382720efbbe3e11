use core::fmt::{Debug, Display};
use core::iter::{Product, Sum};
use core::ops::{AddAssign, DivAssign, MulAssign, SubAssign};

use num::Float;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Sampling from the half-open unit interval.
pub trait Sample: Sized {
    /// Samples a single value in `[0, 1)` using `rng`.
    fn sample<R>(rng: &mut R) -> Self
    where
        R: rand::RngCore + ?Sized;

    /// Samples a [`Vec`] of values of length `n` using `rng`.
    #[inline]
    fn sample_vec<R>(rng: &mut R, n: usize) -> Vec<Self>
    where
        R: rand::RngCore + ?Sized,
    {
        (0..n).map(|_| Self::sample(rng)).collect()
    }
}

/// The floating precision a simulation runs at.
///
/// Everything numeric in the engine is generic over this trait; `f32`
/// and `f64` are the two instantiations, mirroring the single/double
/// builds of pseudo-spectral codes.
pub trait Real:
    'static
    + Copy
    + Float
    + AddAssign<Self>
    + SubAssign<Self>
    + MulAssign<Self>
    + DivAssign<Self>
    + Sum
    + Product
    + Debug
    + Default
    + Display
    + Sample
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
{
    const ZERO: Self;
    const ONE: Self;
    const TWO: Self;
    const NEG_ONE: Self;
    const HALF: Self;
    const PI: Self;

    /// Tolerance for the `backward(forward(x))/V == x` transform
    /// round-trip contract at this precision.
    const FFT_ROUNDTRIP_TOL: Self;

    fn from_f64(x: f64) -> Self;
    fn to_f64(self) -> f64;

    #[inline]
    fn from_usize(n: usize) -> Self {
        Self::from_f64(n as f64)
    }
}

static_assertions::assert_impl_all!(f32: Real);
static_assertions::assert_impl_all!(f64: Real);

impl Sample for f32 {
    #[inline]
    fn sample<R>(rng: &mut R) -> Self
    where
        R: rand::RngCore + ?Sized,
    {
        // 24 uniform mantissa bits in [0, 1).
        (rng.next_u32() >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
    }
}

impl Sample for f64 {
    #[inline]
    fn sample<R>(rng: &mut R) -> Self
    where
        R: rand::RngCore + ?Sized,
    {
        // 53 uniform mantissa bits in [0, 1).
        (rng.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }
}

impl Real for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const TWO: Self = 2.0;
    const NEG_ONE: Self = -1.0;
    const HALF: Self = 0.5;
    const PI: Self = core::f32::consts::PI;
    const FFT_ROUNDTRIP_TOL: Self = 1e-5;

    #[inline]
    fn from_f64(x: f64) -> Self {
        x as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Real for f64 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const TWO: Self = 2.0;
    const NEG_ONE: Self = -1.0;
    const HALF: Self = 0.5;
    const PI: Self = core::f64::consts::PI;
    const FFT_ROUNDTRIP_TOL: Self = 1e-10;

    #[inline]
    fn from_f64(x: f64) -> Self {
        x
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}
