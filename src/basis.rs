//! Per-shell basis matrices mapping spherical-harmonic coefficients to
//! shell-specific signal amplitudes.
//!
//! Without response functions every shell uses the identity basis over
//! `n_for_l(lmax)` coefficients. With response functions the coefficient
//! space decomposes into one block per response (e.g. per tissue type), and
//! each shell's basis scales every degree block by that response's
//! coefficient for the shell.

use ndarray::Array2;

use crate::recon::ReconError;
use crate::sh::n_for_l;
use crate::shells::Shells;

/// Total number of coefficients per voxel for the given decomposition.
pub fn ncoef(lmax: usize, responses: &[Array2<f32>]) -> usize {
    if responses.is_empty() {
        n_for_l(lmax)
    } else {
        responses.iter().map(|r| n_for_l(2 * (r.ncols() - 1))).sum()
    }
}

/// Build one basis matrix per shell.
///
/// Each response table holds one row per shell and one column per even
/// degree (column `k` is the response coefficient for degree `2k`).
///
/// # Errors
///
/// Returns an error if a response table is empty, has a row count different
/// from the shell count, or spans a degree beyond `lmax`.
pub fn shell_basis(
    shells: &Shells,
    lmax: usize,
    responses: &[Array2<f32>],
) -> Result<Vec<Array2<f32>>, ReconError> {
    for (index, r) in responses.iter().enumerate() {
        if r.ncols() == 0 {
            return Err(ReconError::EmptyResponse { index });
        }
        if r.nrows() != shells.count() {
            return Err(ReconError::ResponseShellMismatch {
                index,
                rows: r.nrows(),
                shells: shells.count(),
            });
        }
        let degree = 2 * (r.ncols() - 1);
        if degree > lmax {
            return Err(ReconError::ResponseDegree {
                index,
                degree,
                lmax,
            });
        }
    }

    let nc = ncoef(lmax, responses);
    let mut bases = Vec::with_capacity(shells.count());
    for s in 0..shells.count() {
        if responses.is_empty() {
            bases.push(Array2::eye(n_for_l(lmax)));
            continue;
        }
        let mut b = Array2::<f32>::zeros((nc, n_for_l(lmax)));
        let mut j = 0;
        for r in responses {
            for band in 0..r.ncols() {
                let degree = 2 * band;
                let start = if degree == 0 { 0 } else { n_for_l(degree - 2) };
                for i in start..n_for_l(degree) {
                    b[(j, i)] = r[(s, band)];
                    j += 1;
                }
            }
        }
        bases.push(b);
    }
    Ok(bases)
}
