//! Motion-corrected slice-to-volume reconstruction operator.
//!
//! [`ReconOperator`] is a matrix-free linear map between a volumetric field
//! of per-voxel spherical-harmonic coefficients and the stack of acquired
//! 2D slices in scanner space. Each acquired slice carries its own rigid
//! motion estimate; the operator fuses the motion geometry, a
//! slice-selection blur, cubic-spline interpolation, and the per-shell
//! directional basis into forward, adjoint, and normal-equation
//! applications that are exact adjoints of one another. An external
//! least-squares solver drives it through the [`Projector`] trait.

use log::{debug, trace};
use nalgebra::{Matrix4, Point3, Vector3};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use thiserror::Error;

use crate::basis;
use crate::geometry::{self, VolumeGrid};
use crate::kernels::{SSP_RADIUS, SliceProfile, bspline_weights};
use crate::sh;
use crate::shells::Shells;

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("gradient table is empty")]
    EmptyGradientTable,

    #[error("gradient table has shape {rows}x{cols}; expected one [x, y, z, b] row per volume")]
    GradientTableShape { rows: usize, cols: usize },

    #[error("shell partition covers {shells} volumes but the gradient table has {volumes}")]
    ShellCoverage { shells: usize, volumes: usize },

    #[error("maximum harmonic degree must be even, got {0}")]
    OddHarmonicDegree(usize),

    #[error("shell b={bvalue:.0} has {count} volumes, supporting lmax {supported}; requested {requested}")]
    UnsupportedDegree {
        bvalue: f32,
        count: usize,
        supported: usize,
        requested: usize,
    },

    #[error("motion table has {cols} columns; expected 6 rigid parameters per row")]
    MotionTableShape { cols: usize },

    #[error("motion table has {rows} rows; expected {volumes} (per volume) or {slices} (per slice)")]
    MotionTableSize {
        rows: usize,
        volumes: usize,
        slices: usize,
    },

    #[error("response function {index} is empty")]
    EmptyResponse { index: usize },

    #[error("response function {index} has {rows} rows; expected one per shell ({shells})")]
    ResponseShellMismatch {
        index: usize,
        rows: usize,
        shells: usize,
    },

    #[error("response function {index} spans degree {degree}; requested lmax is {lmax}")]
    ResponseDegree {
        index: usize,
        degree: usize,
        lmax: usize,
    },

    #[error("voxel-to-scanner transform is singular")]
    SingularTransform,

    #[error("weight vector has {got} entries; expected one per slice ({expected})")]
    WeightVectorSize { got: usize, expected: usize },

    #[error("reliability weights must be non-negative; entry {index} is {value}")]
    NegativeWeight { index: usize, value: f32 },
}

/// Matrix-free projection between coefficient space and slice space.
///
/// Buffer layouts are fixed: coefficient buffers hold
/// `nx * ny * nz * ncoef` values with the coefficient index fastest; slice
/// buffers hold `nv * nz * nx * ny` values ordered by volume, through-plane
/// position, then in-plane pixel.
pub trait Projector {
    /// `(slice-space length, coefficient-space length)` of the operator.
    fn dimensions(&self) -> (usize, usize);

    /// Predict slice data from a coefficient field.
    fn apply_forward(&self, coefs: &[f32], slices: &mut [f32]);

    /// Transpose projection: gather weighted slice data into coefficients.
    fn apply_adjoint(&self, slices: &[f32], coefs: &mut [f32]);

    /// Normal equations: the adjoint applied to the forward projection.
    fn apply_normal(&self, input: &[f32], output: &mut [f32]);
}

/// Slice-to-volume reconstruction operator.
///
/// Constructed once per reconstruction run from the grid geometry, rigid
/// motion table, gradient table, harmonic degree, and optional per-shell
/// response functions. The design matrix is fixed at construction; the
/// per-slice reliability weights may be replaced between projection calls
/// via [`ReconOperator::set_weights`].
pub struct ReconOperator {
    grid: VolumeGrid,
    nv: usize,
    ncoef: usize,
    motion: Array2<f32>,
    ssp: SliceProfile,
    design: Array2<f32>,
    weights: Array1<f32>,
}

impl ReconOperator {
    /// Build the operator and its design matrix.
    ///
    /// `grad` holds one `[x, y, z, b]` row per acquired volume and `shells`
    /// is the matching b-value partition, consumed as-is. `motion` holds one
    /// `[tx, ty, tz, rx, ry, rz]` row per volume, or one per slice.
    ///
    /// # Errors
    ///
    /// Any configuration inconsistency aborts construction: an odd `lmax`, a
    /// malformed gradient or motion table, a shell with too few volumes for
    /// the requested degree, or an invalid response-function table.
    pub fn new(
        grid: VolumeGrid,
        shells: &Shells,
        grad: &Array2<f32>,
        motion: Array2<f32>,
        lmax: usize,
        responses: &[Array2<f32>],
        ssp: SliceProfile,
    ) -> Result<Self, ReconError> {
        if lmax % 2 != 0 {
            return Err(ReconError::OddHarmonicDegree(lmax));
        }
        if grad.nrows() == 0 {
            return Err(ReconError::EmptyGradientTable);
        }
        if grad.ncols() != 4 {
            return Err(ReconError::GradientTableShape {
                rows: grad.nrows(),
                cols: grad.ncols(),
            });
        }
        let nv = grad.nrows();
        if shells.volume_count() != nv {
            return Err(ReconError::ShellCoverage {
                shells: shells.volume_count(),
                volumes: nv,
            });
        }
        for shell in shells.iter() {
            let supported = sh::l_for_n(shell.count());
            if supported < lmax {
                return Err(ReconError::UnsupportedDegree {
                    bvalue: shell.mean_bvalue(),
                    count: shell.count(),
                    supported,
                    requested: lmax,
                });
            }
        }
        if motion.ncols() != 6 {
            return Err(ReconError::MotionTableShape {
                cols: motion.ncols(),
            });
        }
        let nz = grid.dim().2;
        if motion.nrows() != nv && motion.nrows() != nv * nz {
            return Err(ReconError::MotionTableSize {
                rows: motion.nrows(),
                volumes: nv,
                slices: nv * nz,
            });
        }

        let shell_basis = basis::shell_basis(shells, lmax, responses)?;
        let ncoef = basis::ncoef(lmax, responses);
        let vol2shell = shells.volume_to_shell();
        let per_slice_motion = motion.nrows() == nv * nz;

        debug!(
            "initialising design matrix: {} rows, {} coefficients",
            nv * nz,
            ncoef
        );
        let mut design = Array2::<f32>::zeros((nv * nz, ncoef));
        design
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row, mut out)| {
                let v = row / nz;
                let p = if per_slice_motion {
                    motion.row(row)
                } else {
                    motion.row(v)
                };
                let rot = geometry::rotation_xyz(p[3] as f64, p[4] as f64, p[5] as f64);
                let dir = rot
                    * Vector3::new(
                        grad[(v, 0)] as f64,
                        grad[(v, 1)] as f64,
                        grad[(v, 2)] as f64,
                    );
                let delta = sh::delta([dir.x, dir.y, dir.z], lmax);
                out.assign(&shell_basis[vol2shell[v]].dot(&delta));
            });

        let weights = Array1::ones(nv * nz);
        Ok(Self {
            grid,
            nv,
            ncoef,
            motion,
            ssp,
            design,
            weights,
        })
    }

    /// The reconstruction grid this operator projects onto.
    pub fn grid(&self) -> &VolumeGrid {
        &self.grid
    }

    /// Number of coefficients per voxel.
    pub fn ncoef(&self) -> usize {
        self.ncoef
    }

    /// Length of a coefficient buffer: `nx * ny * nz * ncoef`.
    pub fn coef_len(&self) -> usize {
        self.grid.voxel_count() * self.ncoef
    }

    /// Length of a slice-data buffer: `nv * nz * nx * ny`.
    pub fn data_len(&self) -> usize {
        self.slice_count() * self.pixels_per_slice()
    }

    /// Total number of acquired slices, `nv * nz`.
    pub fn slice_count(&self) -> usize {
        self.nv * self.grid.dim().2
    }

    /// The design matrix relating coefficients to per-slice amplitudes, one
    /// row per acquired slice.
    pub fn design(&self) -> ArrayView2<'_, f32> {
        self.design.view()
    }

    /// Current per-slice reliability weights.
    pub fn weights(&self) -> ArrayView1<'_, f32> {
        self.weights.view()
    }

    /// Replace the per-slice reliability weights, e.g. between iterations of
    /// a re-weighted fit. The design matrix and geometry are untouched.
    ///
    /// # Errors
    ///
    /// Rejects a vector whose length is not the slice count, or with any
    /// negative entry.
    pub fn set_weights(&mut self, weights: Array1<f32>) -> Result<(), ReconError> {
        if weights.len() != self.slice_count() {
            return Err(ReconError::WeightVectorSize {
                got: weights.len(),
                expected: self.slice_count(),
            });
        }
        if let Some((index, &value)) = weights.iter().enumerate().find(|&(_, &w)| w < 0.0) {
            return Err(ReconError::NegativeWeight { index, value });
        }
        self.weights = weights;
        Ok(())
    }

    fn pixels_per_slice(&self) -> usize {
        let (nx, ny, _) = self.grid.dim();
        nx * ny
    }

    /// Affine map taking this slice's voxel coordinates through the rigid
    /// motion at its acquisition time into reconstruction voxel coordinates.
    fn slice_transform(&self, v: usize, z: usize) -> Matrix4<f64> {
        let nz = self.grid.dim().2;
        let row = if self.motion.nrows() == self.nv {
            v
        } else {
            v * nz + z
        };
        let rigid = geometry::rigid_transform(self.motion.row(row));
        self.grid.scanner_to_voxel() * rigid * self.grid.voxel_to_scanner()
    }

    /// Visit the sparse interpolation taps around fractional voxel
    /// coordinate `pr`: separable 4x4x4 cubic B-spline weights, with
    /// out-of-bounds taps dropped.
    #[inline]
    fn for_each_tap<F: FnMut(usize, f32)>(&self, pr: &Point3<f64>, mut visit: F) {
        let (nx, ny, nz) = self.grid.dim();
        let (gx, gy, gz) = (pr.x.ceil(), pr.y.ceil(), pr.z.ceil());
        let wx = bspline_weights(1.0 - (gx - pr.x));
        let wy = bspline_weights(1.0 - (gy - pr.y));
        let wz = bspline_weights(1.0 - (gz - pr.z));
        for rz in -2i64..2 {
            let pz = gz as i64 + rz;
            if pz < 0 || pz >= nz as i64 {
                continue;
            }
            let wzv = wz[(rz + 2) as usize];
            for ry in -2i64..2 {
                let py = gy as i64 + ry;
                if py < 0 || py >= ny as i64 {
                    continue;
                }
                let wyv = wy[(ry + 2) as usize];
                for rx in -2i64..2 {
                    let px = gx as i64 + rx;
                    if px < 0 || px >= nx as i64 {
                        continue;
                    }
                    let w = wx[(rx + 2) as usize] * wyv * wzv;
                    visit((pz as usize * ny + py as usize) * nx + px as usize, w as f32);
                }
            }
        }
    }

    /// Per-voxel amplitude of slice `idx`: the coefficient field contracted
    /// against that slice's design row.
    fn slice_amplitude(&self, coefs: &[f32], idx: usize) -> Vec<f32> {
        let row = self.design.row(idx);
        coefs
            .chunks_exact(self.ncoef)
            .map(|c| c.iter().zip(row.iter()).map(|(a, b)| a * b).sum())
            .collect()
    }

    /// Project a slice's voxel-space amplitude field onto its 2D pixels.
    fn project_slice_forward(&self, idx: usize, out: &mut [f32], amplitude: &[f32]) {
        let (nx, ny, nz) = self.grid.dim();
        let (v, z) = (idx / nz, idx % nz);
        let ts2r = self.slice_transform(v, z);
        for s in -SSP_RADIUS..=SSP_RADIUS {
            let ws = self.ssp.value(s);
            if ws == 0.0 {
                continue;
            }
            let mut i = 0;
            for y in 0..ny {
                for x in 0..nx {
                    let pr = ts2r.transform_point(&Point3::new(
                        x as f64,
                        y as f64,
                        (z as i64 + s as i64) as f64,
                    ));
                    let mut acc = 0.0f32;
                    self.for_each_tap(&pr, |vox, w| acc += w * amplitude[vox]);
                    out[i] += ws * acc;
                    i += 1;
                }
            }
        }
    }

    /// Transpose of [`Self::project_slice_forward`]: gather a slice's pixels
    /// into a voxel-space field through the same weight pattern.
    fn project_slice_adjoint(&self, idx: usize, field: &mut [f32], data: &[f32]) {
        let (nx, ny, nz) = self.grid.dim();
        let (v, z) = (idx / nz, idx % nz);
        let ts2r = self.slice_transform(v, z);
        for s in -SSP_RADIUS..=SSP_RADIUS {
            let ws = self.ssp.value(s);
            if ws == 0.0 {
                continue;
            }
            let mut i = 0;
            for y in 0..ny {
                for x in 0..nx {
                    let value = ws * data[i];
                    i += 1;
                    if value == 0.0 {
                        continue;
                    }
                    let pr = ts2r.transform_point(&Point3::new(
                        x as f64,
                        y as f64,
                        (z as i64 + s as i64) as f64,
                    ));
                    self.for_each_tap(&pr, |vox, w| field[vox] += w * value);
                }
            }
        }
    }

    /// Rank-one update of the coefficient accumulator: the weighted
    /// voxel-space field times the slice's design row.
    fn accumulate_design(&self, acc: &mut [f32], idx: usize, field: &[f32]) {
        let weight = self.weights[idx];
        if weight == 0.0 {
            return;
        }
        let row = self.design.row(idx);
        for (vox, &f) in field.iter().enumerate() {
            if f == 0.0 {
                continue;
            }
            let scale = weight * f;
            let dst = &mut acc[vox * self.ncoef..(vox + 1) * self.ncoef];
            for (d, &y) in dst.iter_mut().zip(row.iter()) {
                *d += scale * y;
            }
        }
    }

    /// Map-reduce over the slice index space: each worker folds slices into
    /// a private zero coefficient buffer, and the buffers are summed once
    /// all slices are done. Accumulation across slices into shared output
    /// must go through this, never through in-place writes.
    fn reduce_slices<F>(&self, per_slice: F) -> Vec<f32>
    where
        F: Fn(usize, &mut [f32]) + Sync,
    {
        let len = self.coef_len();
        let slices = self.slice_count();
        let chunk = slices.div_ceil(rayon::current_num_threads().max(1)).max(1);
        (0..slices)
            .into_par_iter()
            .fold_chunks(chunk, || vec![0.0f32; len], |mut acc, idx| {
                per_slice(idx, &mut acc);
                acc
            })
            .reduce(
                || vec![0.0f32; len],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                    a
                },
            )
    }

    /// Forward projection. See [`Projector::apply_forward`].
    ///
    /// # Panics
    ///
    /// Panics if a buffer length does not match [`Self::coef_len`] /
    /// [`Self::data_len`].
    pub fn apply_forward(&self, coefs: &[f32], slices: &mut [f32]) {
        assert_eq!(coefs.len(), self.coef_len(), "coefficient buffer length");
        assert_eq!(slices.len(), self.data_len(), "slice buffer length");
        trace!("forward projection over {} slices", self.slice_count());
        let nxy = self.pixels_per_slice();
        slices
            .par_chunks_mut(nxy)
            .enumerate()
            .for_each(|(idx, out)| {
                out.fill(0.0);
                let amplitude = self.slice_amplitude(coefs, idx);
                self.project_slice_forward(idx, out, &amplitude);
            });
    }

    /// Adjoint projection with reliability weighting. See
    /// [`Projector::apply_adjoint`].
    ///
    /// # Panics
    ///
    /// Panics if a buffer length does not match [`Self::data_len`] /
    /// [`Self::coef_len`].
    pub fn apply_adjoint(&self, slices: &[f32], coefs: &mut [f32]) {
        assert_eq!(slices.len(), self.data_len(), "slice buffer length");
        assert_eq!(coefs.len(), self.coef_len(), "coefficient buffer length");
        trace!("adjoint projection over {} slices", self.slice_count());
        let nxy = self.pixels_per_slice();
        let voxels = self.grid.voxel_count();
        let reduced = self.reduce_slices(|idx, acc| {
            let mut field = vec![0.0f32; voxels];
            self.project_slice_adjoint(idx, &mut field, &slices[idx * nxy..(idx + 1) * nxy]);
            self.accumulate_design(acc, idx, &field);
        });
        coefs.copy_from_slice(&reduced);
    }

    /// Normal-equation application: the forward and adjoint slice kernels
    /// chained per slice on the same intermediate. See
    /// [`Projector::apply_normal`].
    ///
    /// # Panics
    ///
    /// Panics if a buffer length does not match [`Self::coef_len`].
    pub fn apply_normal(&self, input: &[f32], output: &mut [f32]) {
        assert_eq!(input.len(), self.coef_len(), "input buffer length");
        assert_eq!(output.len(), self.coef_len(), "output buffer length");
        trace!("normal projection over {} slices", self.slice_count());
        let nxy = self.pixels_per_slice();
        let voxels = self.grid.voxel_count();
        let reduced = self.reduce_slices(|idx, acc| {
            let amplitude = self.slice_amplitude(input, idx);
            let mut projected = vec![0.0f32; nxy];
            self.project_slice_forward(idx, &mut projected, &amplitude);
            let mut field = vec![0.0f32; voxels];
            self.project_slice_adjoint(idx, &mut field, &projected);
            self.accumulate_design(acc, idx, &field);
        });
        output.copy_from_slice(&reduced);
    }
}

impl Projector for ReconOperator {
    fn dimensions(&self) -> (usize, usize) {
        (self.data_len(), self.coef_len())
    }

    fn apply_forward(&self, coefs: &[f32], slices: &mut [f32]) {
        ReconOperator::apply_forward(self, coefs, slices);
    }

    fn apply_adjoint(&self, slices: &[f32], coefs: &mut [f32]) {
        ReconOperator::apply_adjoint(self, slices, coefs);
    }

    fn apply_normal(&self, input: &[f32], output: &mut [f32]) {
        ReconOperator::apply_normal(self, input, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Eight directions on a single b=1000 shell; supports lmax 2.
    fn gradient_table() -> Array2<f32> {
        let dirs = [
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.577, 0.577, 0.577],
            [-0.577, 0.577, 0.577],
            [0.577, -0.577, 0.577],
            [0.707, 0.0, -0.707],
            [0.0, 0.707, 0.707],
        ];
        Array2::from_shape_fn((8, 4), |(i, j)| if j < 3 { dirs[i][j] } else { 1000.0 })
    }

    fn small_motion(rows: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, 6), |_| rng.gen_range(-0.1..0.1))
    }

    fn build(motion: Array2<f32>, lmax: usize, responses: &[Array2<f32>]) -> ReconOperator {
        let grad = gradient_table();
        let shells = Shells::new(&grad).unwrap();
        let grid = VolumeGrid::isotropic((6, 6, 6), 1.0);
        ReconOperator::new(
            grid,
            &shells,
            &grad,
            motion,
            lmax,
            responses,
            SliceProfile::default(),
        )
        .unwrap()
    }

    fn random_vec(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn dot(a: &[f32], b: &[f32]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(&x, &y)| f64::from(x) * f64::from(y))
            .sum()
    }

    #[test]
    fn rejects_odd_degree() {
        let grad = gradient_table();
        let shells = Shells::new(&grad).unwrap();
        let grid = VolumeGrid::isotropic((6, 6, 6), 1.0);
        let result = ReconOperator::new(
            grid,
            &shells,
            &grad,
            Array2::zeros((8, 6)),
            3,
            &[],
            SliceProfile::default(),
        );
        assert!(matches!(result, Err(ReconError::OddHarmonicDegree(3))));
    }

    #[test]
    fn rejects_bad_motion_row_count() {
        let grad = gradient_table();
        let shells = Shells::new(&grad).unwrap();
        let grid = VolumeGrid::isotropic((6, 6, 6), 1.0);
        let result = ReconOperator::new(
            grid,
            &shells,
            &grad,
            Array2::zeros((5, 6)),
            2,
            &[],
            SliceProfile::default(),
        );
        assert!(matches!(
            result,
            Err(ReconError::MotionTableSize {
                rows: 5,
                volumes: 8,
                slices: 48
            })
        ));
    }

    #[test]
    fn rejects_degree_beyond_shell_support() {
        // Eight volumes support lmax 2 (6 coefficients), not lmax 4 (15).
        let grad = gradient_table();
        let shells = Shells::new(&grad).unwrap();
        let grid = VolumeGrid::isotropic((6, 6, 6), 1.0);
        let result = ReconOperator::new(
            grid,
            &shells,
            &grad,
            Array2::zeros((8, 6)),
            4,
            &[],
            SliceProfile::default(),
        );
        assert!(matches!(
            result,
            Err(ReconError::UnsupportedDegree {
                count: 8,
                supported: 2,
                requested: 4,
                ..
            })
        ));
    }

    #[test]
    fn forward_and_adjoint_are_adjoint() {
        // <F u, v> == <u, F' v> for random vectors, with per-slice motion.
        let op = build(small_motion(48, 7), 2, &[]);
        let u = random_vec(op.coef_len(), 11);
        let v = random_vec(op.data_len(), 13);

        let mut fu = vec![0.0f32; op.data_len()];
        op.apply_forward(&u, &mut fu);
        let mut ftv = vec![0.0f32; op.coef_len()];
        op.apply_adjoint(&v, &mut ftv);

        let lhs = dot(&fu, &v);
        let rhs = dot(&u, &ftv);
        assert_relative_eq!(lhs, rhs, epsilon = 1e-2, max_relative = 1e-3);
    }

    #[test]
    fn adjointness_holds_with_response_decomposition() {
        let responses = [array![[0.8f32, 0.2]], array![[0.5f32]]];
        let op = build(small_motion(8, 21), 2, &responses);
        assert_eq!(op.ncoef(), 7);

        let u = random_vec(op.coef_len(), 23);
        let v = random_vec(op.data_len(), 29);
        let mut fu = vec![0.0f32; op.data_len()];
        op.apply_forward(&u, &mut fu);
        let mut ftv = vec![0.0f32; op.coef_len()];
        op.apply_adjoint(&v, &mut ftv);
        assert_relative_eq!(
            dot(&fu, &v),
            dot(&u, &ftv),
            epsilon = 1e-2,
            max_relative = 1e-3
        );
    }

    #[test]
    fn normal_equals_adjoint_of_forward() {
        let mut op = build(small_motion(8, 3), 2, &[]);
        op.set_weights(Array1::from_elem(48, 0.7)).unwrap();
        let u = random_vec(op.coef_len(), 17);

        let mut forwarded = vec![0.0f32; op.data_len()];
        op.apply_forward(&u, &mut forwarded);
        let mut chained = vec![0.0f32; op.coef_len()];
        op.apply_adjoint(&forwarded, &mut chained);

        let mut normal = vec![0.0f32; op.coef_len()];
        op.apply_normal(&u, &mut normal);

        for (a, b) in normal.iter().zip(&chained) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn zero_motion_projects_constant_field_uniformly() {
        // One b=0 volume, identity basis at lmax 0: an interior pixel of the
        // forward projection equals the coefficient value scaled by the
        // degree-0 basis constant, since both the spline taps and the slice
        // profile sum to one.
        let grad = array![[0.0f32, 0.0, 0.0, 0.0]];
        let shells = Shells::new(&grad).unwrap();
        let grid = VolumeGrid::isotropic((6, 6, 9), 1.0);
        let op = ReconOperator::new(
            grid,
            &shells,
            &grad,
            Array2::zeros((1, 6)),
            0,
            &[],
            SliceProfile::default(),
        )
        .unwrap();

        let coefs = vec![2.0f32; op.coef_len()];
        let mut slices = vec![0.0f32; op.data_len()];
        op.apply_forward(&coefs, &mut slices);

        let y00 = 1.0 / (4.0 * std::f64::consts::PI).sqrt();
        let expected = 2.0 * y00;
        let nxy = 36;
        for (x, y) in [(2, 2), (3, 3), (2, 3)] {
            let value = slices[4 * nxy + y * 6 + x];
            assert_relative_eq!(f64::from(value), expected, epsilon = 1e-5);
        }
    }

    #[test]
    fn out_of_bounds_geometry_contributes_nothing() {
        let mut motion = Array2::<f32>::zeros((8, 6));
        motion.column_mut(0).fill(1.0e4);
        let op = build(motion, 2, &[]);

        let coefs = vec![1.0f32; op.coef_len()];
        let mut slices = vec![0.0f32; op.data_len()];
        op.apply_forward(&coefs, &mut slices);
        assert!(slices.iter().all(|&v| v == 0.0));

        let data = vec![1.0f32; op.data_len()];
        let mut back = vec![0.0f32; op.coef_len()];
        op.apply_adjoint(&data, &mut back);
        assert!(back.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn weights_scale_adjoint_and_normal_linearly() {
        let mut op = build(small_motion(8, 5), 2, &[]);
        let v = random_vec(op.data_len(), 31);
        let u = random_vec(op.coef_len(), 37);

        let mut adjoint_unit = vec![0.0f32; op.coef_len()];
        op.apply_adjoint(&v, &mut adjoint_unit);
        let mut normal_unit = vec![0.0f32; op.coef_len()];
        op.apply_normal(&u, &mut normal_unit);

        op.set_weights(Array1::from_elem(48, 2.5)).unwrap();
        let mut adjoint_scaled = vec![0.0f32; op.coef_len()];
        op.apply_adjoint(&v, &mut adjoint_scaled);
        let mut normal_scaled = vec![0.0f32; op.coef_len()];
        op.apply_normal(&u, &mut normal_scaled);

        for (s, u1) in adjoint_scaled.iter().zip(&adjoint_unit) {
            assert_abs_diff_eq!(*s, 2.5 * u1, epsilon = 1e-4);
        }
        for (s, u1) in normal_scaled.iter().zip(&normal_unit) {
            assert_abs_diff_eq!(*s, 2.5 * u1, epsilon = 1e-4);
        }
    }

    #[test]
    fn weight_setter_validates_input() {
        let mut op = build(Array2::zeros((8, 6)), 2, &[]);
        assert!(matches!(
            op.set_weights(Array1::ones(8)),
            Err(ReconError::WeightVectorSize {
                got: 8,
                expected: 48
            })
        ));
        let mut bad = Array1::ones(48);
        bad[3] = -0.5;
        assert!(matches!(
            op.set_weights(bad),
            Err(ReconError::NegativeWeight { index: 3, .. })
        ));
    }

    #[test]
    fn exposes_operator_dimensions() {
        let op = build(Array2::zeros((8, 6)), 2, &[]);
        let projector: &dyn Projector = &op;
        assert_eq!(projector.dimensions(), (op.data_len(), op.coef_len()));
        assert_eq!(op.coef_len(), 6 * 6 * 6 * 6);
        assert_eq!(op.data_len(), 8 * 6 * 36);
    }
}
