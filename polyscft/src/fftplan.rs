use anyhow::Result;
use num::complex::Complex;
use num::Zero;
use polyscft_field::fft::{fft_in_place, fft_root_table, ifft_in_place, FftRootTable};
use polyscft_field::Real;
use polyscft_util::transpose_xy;

use crate::attribs::AttribSet;
use crate::error::{class_error, ErrorClass};
use crate::grid::UniCartGrid;

/// Data layout of a plan's reciprocal-space arrays.
///
/// `Normal` keeps slabs on x throughout. `Transpose` leaves the
/// forward output distributed along y (stored `(y, x, z)` row-major)
/// and consumes that layout on the backward pass, which halves
/// communication for consumers that work in k-space and come back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FftLayout {
    Normal,
    Transpose,
}

/// Real-to-real transform plan bound to a grid.
///
/// The six public operations take caller buffers of `fft_size()`
/// reals. Transforms are unnormalized in both directions: a
/// forward/backward round trip multiplies by `V = Π n_i`, and callers
/// apply `1/V` exactly once.
///
/// `forward`/`backward` use a separable halfcomplex packing (per axis:
/// `out[k] = Re X[k]` for `k ≤ n/2`, `out[n-k] = Im X[k]` otherwise),
/// which is lossless for real data. The fused operations
/// (`scaled_pair`, `convolve_real`, `forward_abs`) keep the complex
/// spectrum internal and return real parts, like the solver layer of
/// the physics expects.
pub struct FftPlan<R: Real> {
    name: String,
    layout: FftLayout,
    dims: [usize; 3],
    lengths: [R; 3],
    roots: Vec<FftRootTable<R>>,
    cbuf: Vec<Complex<R>>,
    tbuf: Vec<Complex<R>>,
    line: Vec<Complex<R>>,
    rbuf: Vec<R>,
    rtmp: Vec<R>,
}

impl<R: Real> FftPlan<R> {
    pub fn from_attribs(name: &str, tas: &AttribSet, grid: &UniCartGrid<R>) -> Result<Self> {
        let layout = match tas.kind()?.as_str() {
            "normalfftw" => FftLayout::Normal,
            "transposefftw" => FftLayout::Transpose,
            other => {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("unknown FFT kind {other:?}"),
                ))
            }
        };
        Ok(Self::new(name, grid, layout))
    }

    pub fn new(name: &str, grid: &UniCartGrid<R>, layout: FftLayout) -> Self {
        let dims = grid.num_cells_global();
        let total = dims.iter().product();
        let max_dim = dims.iter().copied().max().unwrap();
        let roots = dims.iter().map(|&n| fft_root_table::<R>(n)).collect();
        FftPlan {
            name: name.to_string(),
            layout,
            dims,
            lengths: grid.global_lengths(),
            roots,
            cbuf: vec![Complex::zero(); total],
            tbuf: vec![Complex::zero(); total],
            line: vec![Complex::zero(); max_dim],
            rbuf: vec![R::ZERO; total],
            rtmp: vec![R::ZERO; total],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> FftLayout {
        self.layout
    }

    /// Number of reals in every transform buffer.
    pub fn fft_size(&self) -> usize {
        self.dims.iter().product()
    }

    /// `|k|^2` per cell in this plan's k-space layout, with the usual
    /// folded signed frequencies `k_d = 2π m_d / L_d`.
    pub fn k_norm_sq(&self) -> Vec<R> {
        let two_pi = R::TWO * R::PI;
        let kfreq = |i: usize, n: usize, len: R| {
            let m = if i <= n / 2 { i as i64 } else { i as i64 - n as i64 };
            two_pi * R::from_f64(m as f64) / len
        };

        let (n0, n1, n2) = (self.dims[0], self.dims[1], self.dims[2]);
        let (l0, l1, l2) = (self.lengths[0], self.lengths[1], self.lengths[2]);
        let mut out = Vec::with_capacity(self.fft_size());
        match self.layout {
            FftLayout::Normal => {
                for i0 in 0..n0 {
                    let kx = kfreq(i0, n0, l0);
                    for i1 in 0..n1 {
                        let ky = kfreq(i1, n1, l1);
                        for i2 in 0..n2 {
                            let kz = kfreq(i2, n2, l2);
                            out.push(kx * kx + ky * ky + kz * kz);
                        }
                    }
                }
            }
            FftLayout::Transpose => {
                for i1 in 0..n1 {
                    let ky = kfreq(i1, n1, l1);
                    for i0 in 0..n0 {
                        let kx = kfreq(i0, n0, l0);
                        for i2 in 0..n2 {
                            let kz = kfreq(i2, n2, l2);
                            out.push(kx * kx + ky * ky + kz * kz);
                        }
                    }
                }
            }
        }
        out
    }

    /// Packed real forward transform into a caller buffer.
    pub fn forward(&mut self, x: &[R], out: &mut [R]) {
        self.check_len(x.len());
        self.check_len(out.len());
        self.rbuf.copy_from_slice(x);
        for d in 0..3 {
            self.r2hc_axis(d);
        }
        match self.layout {
            FftLayout::Normal => out.copy_from_slice(&self.rbuf),
            FftLayout::Transpose => {
                transpose_xy(&self.rbuf, out, self.dims[0], self.dims[1], self.dims[2])
            }
        }
    }

    /// Packed real backward transform; inverse of [`Self::forward`] up
    /// to the `V` round-trip factor.
    pub fn backward(&mut self, x: &[R], out: &mut [R]) {
        self.check_len(x.len());
        self.check_len(out.len());
        match self.layout {
            FftLayout::Normal => self.rbuf.copy_from_slice(x),
            FftLayout::Transpose => {
                transpose_xy(x, &mut self.rbuf, self.dims[1], self.dims[0], self.dims[2])
            }
        }
        for d in (0..3).rev() {
            self.hc2r_axis(d);
        }
        out.copy_from_slice(&self.rbuf);
    }

    /// `out[k] = |FFT(x)[k]|` in the plan's k-space layout.
    pub fn forward_abs(&mut self, x: &[R], out: &mut [R]) {
        self.check_len(x.len());
        self.check_len(out.len());
        self.load_complex(x, false);
        self.forward_complex();
        match self.layout {
            FftLayout::Normal => {
                for (o, c) in out.iter_mut().zip(self.cbuf.iter()) {
                    *o = c.norm();
                }
            }
            FftLayout::Transpose => {
                transpose_xy(
                    &self.cbuf,
                    &mut self.tbuf,
                    self.dims[0],
                    self.dims[1],
                    self.dims[2],
                );
                for (o, c) in out.iter_mut().zip(self.tbuf.iter()) {
                    *o = c.norm();
                }
            }
        }
    }

    /// `out = backward(forward(x) ⊙ k_scale)`, the Laplacian step.
    pub fn scaled_pair(&mut self, x: &[R], k_scale: &[R], out: &mut [R]) {
        self.fused_pair(x, k_scale, out, false);
    }

    /// As [`Self::scaled_pair`], treating the input as purely
    /// imaginary; the caller still receives `Re[result]`.
    pub fn scaled_pair_im(&mut self, x: &[R], k_scale: &[R], out: &mut [R]) {
        self.fused_pair(x, k_scale, out, true);
    }

    /// `out = backward(forward(a) ⊙ b)` for an already-k-space `b`.
    pub fn convolve_real(&mut self, a: &[R], b: &[R], out: &mut [R]) {
        self.fused_pair(a, b, out, false);
    }

    fn fused_pair(&mut self, x: &[R], k_scale: &[R], out: &mut [R], imaginary: bool) {
        self.check_len(x.len());
        self.check_len(k_scale.len());
        self.check_len(out.len());
        self.load_complex(x, imaginary);
        self.forward_complex();

        match self.layout {
            FftLayout::Normal => {
                for (c, &s) in self.cbuf.iter_mut().zip(k_scale.iter()) {
                    *c = c.scale(s);
                }
            }
            FftLayout::Transpose => {
                // The caller's scale array lives in the transposed
                // layout; visit the spectrum through the transpose.
                transpose_xy(
                    &self.cbuf,
                    &mut self.tbuf,
                    self.dims[0],
                    self.dims[1],
                    self.dims[2],
                );
                for (c, &s) in self.tbuf.iter_mut().zip(k_scale.iter()) {
                    *c = c.scale(s);
                }
                transpose_xy(
                    &self.tbuf,
                    &mut self.cbuf,
                    self.dims[1],
                    self.dims[0],
                    self.dims[2],
                );
            }
        }

        self.backward_complex();
        for (o, c) in out.iter_mut().zip(self.cbuf.iter()) {
            *o = c.re;
        }
    }

    fn check_len(&self, len: usize) {
        assert_eq!(
            len,
            self.fft_size(),
            "transform buffer must hold fft_size() = {} reals",
            self.fft_size()
        );
    }

    fn load_complex(&mut self, x: &[R], imaginary: bool) {
        if imaginary {
            for (c, &v) in self.cbuf.iter_mut().zip(x.iter()) {
                *c = Complex::new(R::ZERO, v);
            }
        } else {
            for (c, &v) in self.cbuf.iter_mut().zip(x.iter()) {
                *c = Complex::new(v, R::ZERO);
            }
        }
    }

    fn forward_complex(&mut self) {
        for d in 0..3 {
            self.transform_axis(d, false);
        }
    }

    fn backward_complex(&mut self) {
        for d in (0..3).rev() {
            self.transform_axis(d, true);
        }
    }

    /// Applies the 1D complex transform along axis `d` to every line
    /// of the scratch spectrum.
    fn transform_axis(&mut self, d: usize, inverse: bool) {
        let n = self.dims[d];
        if n == 1 {
            return;
        }
        let stride = self.dims[d + 1..].iter().product::<usize>();
        let total = self.fft_size();
        let outer = total / (n * stride);
        let roots = &self.roots[d];
        let line = &mut self.line[..n];

        for o in 0..outer {
            for inner in 0..stride {
                let base = o * n * stride + inner;
                for (i, v) in line.iter_mut().enumerate() {
                    *v = self.cbuf[base + i * stride];
                }
                if inverse {
                    ifft_in_place(line, roots);
                } else {
                    fft_in_place(line, roots);
                }
                for (i, &v) in line.iter().enumerate() {
                    self.cbuf[base + i * stride] = v;
                }
            }
        }
    }

    /// Real-to-halfcomplex along axis `d` of the real scratch.
    fn r2hc_axis(&mut self, d: usize) {
        let n = self.dims[d];
        if n == 1 {
            return;
        }
        let stride = self.dims[d + 1..].iter().product::<usize>();
        let total = self.fft_size();
        let outer = total / (n * stride);
        let roots = &self.roots[d];
        let line = &mut self.line[..n];

        for o in 0..outer {
            for inner in 0..stride {
                let base = o * n * stride + inner;
                for (i, v) in line.iter_mut().enumerate() {
                    *v = Complex::new(self.rbuf[base + i * stride], R::ZERO);
                }
                fft_in_place(line, roots);
                // Pack the Hermitian spectrum into n reals.
                self.rtmp[base] = line[0].re;
                for k in 1..n / 2 {
                    self.rtmp[base + k * stride] = line[k].re;
                    self.rtmp[base + (n - k) * stride] = line[k].im;
                }
                self.rtmp[base + (n / 2) * stride] = line[n / 2].re;
            }
        }

        let (rbuf, rtmp) = (&mut self.rbuf, &self.rtmp);
        rbuf.copy_from_slice(rtmp);
    }

    /// Halfcomplex-to-real along axis `d` of the real scratch.
    fn hc2r_axis(&mut self, d: usize) {
        let n = self.dims[d];
        if n == 1 {
            return;
        }
        let stride = self.dims[d + 1..].iter().product::<usize>();
        let total = self.fft_size();
        let outer = total / (n * stride);
        let roots = &self.roots[d];
        let line = &mut self.line[..n];

        for o in 0..outer {
            for inner in 0..stride {
                let base = o * n * stride + inner;
                line[0] = Complex::new(self.rbuf[base], R::ZERO);
                line[n / 2] = Complex::new(self.rbuf[base + (n / 2) * stride], R::ZERO);
                for k in 1..n / 2 {
                    let re = self.rbuf[base + k * stride];
                    let im = self.rbuf[base + (n - k) * stride];
                    line[k] = Complex::new(re, im);
                    line[n - k] = Complex::new(re, -im);
                }
                ifft_in_place(line, roots);
                for (i, v) in line.iter().enumerate() {
                    self.rtmp[base + i * stride] = v.re;
                }
            }
        }

        let (rbuf, rtmp) = (&mut self.rbuf, &self.rtmp);
        rbuf.copy_from_slice(rtmp);
    }
}
