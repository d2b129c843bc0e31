//! Even-degree real spherical harmonic basis.
//!
//! Diffusion signal is antipodally symmetric, so only even harmonic degrees
//! are carried. Coefficients of degree `l` occupy the index range
//! `[n_for_l(l - 2), n_for_l(l))`, with order `m` running from `-l` to `l`
//! within each degree block.

use ndarray::Array1;

/// Number of coefficients for an even-degree basis truncated at `lmax`.
pub const fn n_for_l(lmax: usize) -> usize {
    (lmax + 1) * (lmax + 2) / 2
}

/// Largest even degree supported by `n` samples, i.e. the largest even `l`
/// with `n_for_l(l) <= n`. Returns 0 when `n` is too small for any fit.
pub fn l_for_n(n: usize) -> usize {
    let mut l = 0;
    while n_for_l(l + 2) <= n {
        l += 2;
    }
    l
}

/// Flat coefficient index of degree `l`, order `m` (`-l <= m <= l`).
#[inline]
pub(crate) fn index_of(l: usize, m: i64) -> usize {
    ((l * (l + 1) / 2) as i64 + m) as usize
}

/// Evaluate the basis functions at `dir` up to degree `lmax`.
///
/// The result is the design row relating a coefficient vector to the signal
/// amplitude along `dir`. Directions need not be normalized; a zero vector
/// (the customary b=0 placeholder) is evaluated at the +z pole so that the
/// row stays finite.
pub fn delta(dir: [f64; 3], lmax: usize) -> Array1<f32> {
    let norm = (dir[0] * dir[0] + dir[1] * dir[1] + dir[2] * dir[2]).sqrt();
    let u = if norm > 1e-12 {
        [dir[0] / norm, dir[1] / norm, dir[2] / norm]
    } else {
        [0.0, 0.0, 1.0]
    };

    let azimuth = u[1].atan2(u[0]);
    let ct = u[2].clamp(-1.0, 1.0);
    let st = (1.0 - ct * ct).max(0.0).sqrt();

    let mut coefs = Array1::<f32>::zeros(n_for_l(lmax));

    // Sectoral seed, raised one order per outer iteration.
    let mut pmm = (1.0 / (4.0 * std::f64::consts::PI)).sqrt();
    for m in 0..=lmax {
        if m == 0 {
            for_each_degree(lmax, m, ct, pmm, |l, p| {
                coefs[index_of(l, 0)] = p as f32;
            });
        } else {
            let c = std::f64::consts::SQRT_2 * (m as f64 * azimuth).cos();
            let s = std::f64::consts::SQRT_2 * (m as f64 * azimuth).sin();
            for_each_degree(lmax, m, ct, pmm, |l, p| {
                coefs[index_of(l, m as i64)] = (p * c) as f32;
                coefs[index_of(l, -(m as i64))] = (p * s) as f32;
            });
        }
        pmm *= -((2 * m + 3) as f64 / (2 * m + 2) as f64).sqrt() * st;
    }

    coefs
}

/// Normalized associated Legendre recurrence at fixed order `m`, visiting
/// even degrees `l` in `[m, lmax]`. `pmm` is the sectoral value `P(m, m)`.
fn for_each_degree<F: FnMut(usize, f64)>(lmax: usize, m: usize, ct: f64, pmm: f64, mut visit: F) {
    let mut prev2 = pmm;
    if m % 2 == 0 {
        visit(m, prev2);
    }
    if m == lmax {
        return;
    }
    let mut prev1 = ((2 * m + 3) as f64).sqrt() * ct * pmm;
    if (m + 1) % 2 == 0 {
        visit(m + 1, prev1);
    }
    for l in (m + 2)..=lmax {
        let lf = l as f64;
        let mf = m as f64;
        let a = ((4.0 * lf * lf - 1.0) / (lf * lf - mf * mf)).sqrt();
        let b = (((lf - 1.0) * (lf - 1.0) - mf * mf) / (4.0 * (lf - 1.0) * (lf - 1.0) - 1.0)).sqrt();
        let p = a * (ct * prev1 - b * prev2);
        if l % 2 == 0 {
            visit(l, p);
        }
        prev2 = prev1;
        prev1 = p;
    }
}
