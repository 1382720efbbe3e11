use polyscft_field::Real;

/// Quadrature weights for the contour integral over one block.
///
/// Returns `ns + 1` weights summing to `ns·ds`: composite Simpson when
/// the step count is even, trapezoid otherwise.
pub fn contour_weights<R: Real>(ns: usize, ds: R) -> Vec<R> {
    assert!(ns >= 1, "a block needs at least one contour step");
    let mut w = vec![R::ZERO; ns + 1];
    if ns % 2 == 0 {
        let third = ds / R::from_f64(3.0);
        w[0] = third;
        w[ns] = third;
        for (s, wi) in w.iter_mut().enumerate().take(ns).skip(1) {
            *wi = if s % 2 == 1 {
                R::from_f64(4.0) * third
            } else {
                R::TWO * third
            };
        }
    } else {
        w[0] = R::HALF * ds;
        w[ns] = R::HALF * ds;
        for wi in w.iter_mut().take(ns).skip(1) {
            *wi = ds;
        }
    }
    w
}

/// `ln Γ(x)` for `x > 0`, by the Lanczos approximation.
pub fn ln_gamma(x: f64) -> f64 {
    const COF: [f64; 6] = [
        76.18009172947146,
        -86.50532032941677,
        24.01409824083091,
        -1.231739572450155,
        0.1208650973866179e-2,
        -0.5395239384953e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000000000190015;
    for c in COF {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.5066282746310005 * ser / x).ln()
}

/// Abscissas and weights of `n`-point generalized Gauss–Laguerre
/// quadrature: `∫_0^∞ x^α e^{-x} f(x) dx ≈ Σ w_i f(x_i)`.
///
/// Newton iteration on the Laguerre recurrence; `n` up to a few tens
/// is all the polydisperse solver ever asks for.
pub fn gauss_laguerre(n: usize, alpha: f64) -> (Vec<f64>, Vec<f64>) {
    const EPS: f64 = 1e-14;
    const MAX_ITERS: usize = 64;
    assert!(n >= 1);

    let mut x = vec![0.0; n];
    let mut w = vec![0.0; n];
    let nf = n as f64;

    let mut z = 0.0;
    for i in 0..n {
        // Seed each root from the previous one.
        if i == 0 {
            z = (1.0 + alpha) * (3.0 + 0.92 * alpha) / (1.0 + 2.4 * nf + 1.8 * alpha);
        } else if i == 1 {
            z += (15.0 + 6.25 * alpha) / (1.0 + 0.9 * alpha + 2.5 * nf);
        } else {
            let ai = (i - 1) as f64;
            z += ((1.0 + 2.55 * ai) / (1.9 * ai) + 1.26 * ai * alpha / (1.0 + 3.5 * ai))
                * (z - x[i - 2])
                / (1.0 + 0.3 * alpha);
        }

        let mut pp = 0.0;
        let mut p2 = 0.0;
        let mut converged = false;
        for _ in 0..MAX_ITERS {
            let mut p1 = 1.0;
            p2 = 0.0;
            for j in 0..n {
                let p3 = p2;
                p2 = p1;
                let jf = j as f64;
                p1 = ((2.0 * jf + 1.0 + alpha - z) * p2 - (jf + alpha) * p3) / (jf + 1.0);
            }
            pp = (nf * p1 - (nf + alpha) * p2) / z;
            let z1 = z;
            z = z1 - p1 / pp;
            if (z - z1).abs() <= EPS * z.abs().max(1.0) {
                converged = true;
                break;
            }
        }
        assert!(converged, "Gauss-Laguerre root {i} did not converge");

        x[i] = z;
        w[i] = -(ln_gamma(alpha + nf) - ln_gamma(nf)).exp() / (pp * nf * p2);
    }
    (x, w)
}

/// Schulz–Zimm chain-length distribution,
/// `p(n) = (n/nb)^{α-1} e^{-n/nb} / (nb·Γ(α))`,
/// with number average `α·nb` and polydispersity `(α+1)/α`.
#[derive(Clone, Copy, Debug)]
pub struct SchulzDistrib {
    alpha: f64,
    nb: f64,
}

impl SchulzDistrib {
    /// Distribution with the given shape `α` and scale `nb`.
    pub fn new(alpha: f64, nb: f64) -> Self {
        assert!(alpha > 0.0 && nb > 0.0);
        SchulzDistrib { alpha, nb }
    }

    /// Distribution with number average `n_avg` and polydispersity
    /// index `pdi > 1`.
    pub fn from_pdi(n_avg: f64, pdi: f64) -> Self {
        assert!(pdi > 1.0, "polydispersity index must exceed 1");
        let alpha = 1.0 / (pdi - 1.0);
        SchulzDistrib::new(alpha, n_avg / alpha)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn num_aver(&self) -> f64 {
        self.alpha * self.nb
    }

    pub fn weight_aver(&self) -> f64 {
        (self.alpha + 1.0) * self.nb
    }

    pub fn pdi(&self) -> f64 {
        (self.alpha + 1.0) / self.alpha
    }

    pub fn p_dist(&self, n: f64) -> f64 {
        let u = n / self.nb;
        u.powf(self.alpha - 1.0) * (-u).exp() / (self.nb * ln_gamma(self.alpha).exp())
    }

    /// Chain-length quadrature nodes and weights: pairs `(λ_i, ω_i)`
    /// with `λ_i` the length relative to the number average and
    /// `Σ ω_i = 1`, such that `∫ p(n) f(n) dn ≈ Σ ω_i f(λ_i·n_avg)`.
    pub fn length_quadrature(&self, num_points: usize) -> Vec<(f64, f64)> {
        let (x, w) = gauss_laguerre(num_points, self.alpha - 1.0);
        let norm = ln_gamma(self.alpha).exp();
        x.iter()
            .zip(&w)
            .map(|(&xi, &wi)| (xi * self.nb / self.num_aver(), wi / norm))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simpson_weights_integrate_smooth_functions() {
        let ns = 100;
        let ds = 0.01f64;
        let w = contour_weights(ns, ds);
        assert_eq!(w.len(), ns + 1);
        let total: f64 = w.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        // ∫_0^1 s^2 ds = 1/3, Simpson is exact for cubics.
        let integral: f64 = w
            .iter()
            .enumerate()
            .map(|(s, wi)| wi * (s as f64 * ds).powi(2))
            .sum();
        assert!((integral - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn odd_step_counts_fall_back_to_trapezoid() {
        let w = contour_weights::<f64>(5, 0.2);
        let total: f64 = w.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(w[0], 0.1);
        assert_eq!(w[2], 0.2);
    }

    #[test]
    fn ln_gamma_hits_known_values() {
        assert!((ln_gamma(1.0)).abs() < 1e-12);
        assert!((ln_gamma(5.0) - 24.0f64.ln()).abs() < 1e-10);
        assert!((ln_gamma(0.5) - std::f64::consts::PI.sqrt().ln()).abs() < 1e-10);
    }

    #[test]
    fn gauss_laguerre_integrates_moments_exactly() {
        // ∫ x^0.5 e^-x x^m dx = Γ(m + 1.5).
        let (x, w) = gauss_laguerre(8, 0.5);
        for m in 0..4 {
            let got: f64 = x.iter().zip(&w).map(|(&xi, &wi)| wi * xi.powi(m)).sum();
            let want = ln_gamma(m as f64 + 1.5).exp();
            assert!((got - want).abs() < 1e-9 * want, "moment {m}");
        }
    }

    #[test]
    fn schulz_quadrature_is_normalized_with_unit_mean() {
        let dist = SchulzDistrib::from_pdi(50.0, 1.2);
        assert!((dist.pdi() - 1.2).abs() < 1e-12);
        assert!((dist.num_aver() - 50.0).abs() < 1e-9);
        let nodes = dist.length_quadrature(12);
        let mass: f64 = nodes.iter().map(|&(_, w)| w).sum();
        let mean: f64 = nodes.iter().map(|&(l, w)| l * w).sum();
        assert!((mass - 1.0).abs() < 1e-8);
        assert!((mean - 1.0).abs() < 1e-8);
    }
}
