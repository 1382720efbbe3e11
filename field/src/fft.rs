use num::complex::Complex;
use polyscft_util::{log2_strict, reverse_index_bits_in_place};

use crate::types::Real;

/// Per-stage twiddle factors for a radix-2 transform of length `n`.
///
/// `root_table[s]` holds the first `2^s` powers of `e^{-2πi/2^{s+1}}`,
/// the roots consumed by stage `s` of the decimation-in-time butterfly.
pub type FftRootTable<R> = Vec<Vec<Complex<R>>>;

pub fn fft_root_table<R: Real>(n: usize) -> FftRootTable<R> {
    let lg_n = log2_strict(n);
    let mut root_table = Vec::with_capacity(lg_n);
    for lg_m in 1..=lg_n {
        let half_m = 1 << (lg_m - 1);
        let m = half_m * 2;
        // Angles computed in f64 and narrowed once, so single precision
        // does not accumulate recurrence error across a long row.
        let root_row = (0..half_m)
            .map(|j| {
                let angle = -2.0 * std::f64::consts::PI * (j as f64) / (m as f64);
                Complex::new(R::from_f64(angle.cos()), R::from_f64(angle.sin()))
            })
            .collect();
        root_table.push(root_row);
    }
    root_table
}

/// In-place forward DFT: `out[k] = Σ_r in[r]·e^{-2πi k r / n}`.
///
/// Unnormalized; a forward/inverse round trip multiplies by `n`.
pub fn fft_in_place<R: Real>(values: &mut [Complex<R>], root_table: &FftRootTable<R>) {
    reverse_index_bits_in_place(values);

    let n = values.len();
    let lg_n = log2_strict(n);

    if root_table.len() != lg_n {
        panic!(
            "Expected root table of length {}, but it was {}.",
            lg_n,
            root_table.len()
        );
    }

    // Stage 0 twiddles are all unity; skip the multiplication.
    if lg_n > 0 {
        for k in (0..n).step_by(2) {
            let u = values[k];
            let t = values[k + 1];
            values[k] = u + t;
            values[k + 1] = u - t;
        }
    }

    for lg_half_m in 1..lg_n {
        let half_m = 1 << lg_half_m;
        let m = half_m * 2;
        let omega_row = &root_table[lg_half_m];
        for k in (0..n).step_by(m) {
            for j in 0..half_m {
                let omega = omega_row[j];
                let t = omega * values[k + half_m + j];
                let u = values[k + j];
                values[k + j] = u + t;
                values[k + half_m + j] = u - t;
            }
        }
    }
}

/// In-place inverse DFT: `out[r] = Σ_k in[k]·e^{+2πi k r / n}`.
///
/// Unnormalized, like [`fft_in_place`]; uses the identity
/// `ifft(x) = conj(fft(conj(x)))` so one root table serves both
/// directions.
pub fn ifft_in_place<R: Real>(values: &mut [Complex<R>], root_table: &FftRootTable<R>) {
    for v in values.iter_mut() {
        *v = v.conj();
    }
    fft_in_place(values, root_table);
    for v in values.iter_mut() {
        *v = v.conj();
    }
}

#[cfg(test)]
mod tests {
    use num::complex::Complex;
    use num::Zero;

    use super::*;

    fn naive_dft(input: &[Complex<f64>]) -> Vec<Complex<f64>> {
        let n = input.len();
        (0..n)
            .map(|k| {
                let mut sum = Complex::zero();
                for (r, &x) in input.iter().enumerate() {
                    let angle = -2.0 * std::f64::consts::PI * (k * r) as f64 / n as f64;
                    sum += x * Complex::new(angle.cos(), angle.sin());
                }
                sum
            })
            .collect()
    }

    #[test]
    fn fft_matches_naive_dft() {
        let n = 32;
        let input: Vec<Complex<f64>> = (0..n)
            .map(|i| Complex::new((i * 37 % 11) as f64 - 5.0, (i * 13 % 7) as f64))
            .collect();
        let expected = naive_dft(&input);

        let mut values = input.clone();
        let roots = fft_root_table::<f64>(n);
        fft_in_place(&mut values, &roots);

        for (got, want) in values.iter().zip(&expected) {
            assert!((got - want).norm() < 1e-9, "{got} != {want}");
        }
    }

    #[test]
    fn fft_ifft_roundtrip_scales_by_n() {
        let n = 64;
        let input: Vec<Complex<f64>> = (0..n)
            .map(|i| Complex::new((i as f64).sin(), (i as f64 * 0.3).cos()))
            .collect();
        let roots = fft_root_table::<f64>(n);

        let mut values = input.clone();
        fft_in_place(&mut values, &roots);
        ifft_in_place(&mut values, &roots);

        let inv_n = 1.0 / n as f64;
        for (got, want) in values.iter().zip(&input) {
            assert!((got * inv_n - want).norm() < 1e-12);
        }
    }

    #[test]
    fn length_one_transform_is_identity() {
        let roots = fft_root_table::<f64>(1);
        let mut values = vec![Complex::new(2.5, -1.0)];
        fft_in_place(&mut values, &roots);
        assert_eq!(values[0], Complex::new(2.5, -1.0));
    }
}
