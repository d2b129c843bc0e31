//! # dwi-svr
//!
//! Motion-corrected slice-to-volume reconstruction for diffusion MRI.
//!
//! This crate provides the core linear operator used when reconstructing an
//! angularly-resolved diffusion signal from 2D-slice acquisitions, where
//! each acquired slice may be displaced by its own rigid-body motion
//! estimate. The operator maps between a volumetric field of per-voxel
//! spherical-harmonic coefficients and the stack of acquired slices in
//! scanner space, and exposes forward, adjoint, and normal-equation
//! applications for use inside an iterative least-squares solver. Slices
//! are processed in parallel using rayon.
//!
//! Image file I/O, gradient/motion table parsing, and the solver itself are
//! left to the caller; all inputs arrive as in-memory tables. The crate
//! assumes:
//!  - one gradient direction and b-value per acquired volume,
//!  - rigid motion given per volume or per individual slice
//!    (`[tx, ty, tz, rx, ry, rz]`, rotations composed X then Y then Z),
//!  - acquired slices on the same grid as the reconstruction volume.
//!
//! # Examples
//!
//! ## Projecting a coefficient field into slice space
//!
//! Build the operator for a single-shell acquisition without subject
//! motion, then predict the acquired slices from a coefficient field:
//!
//! ```
//! use dwi_svr::geometry::VolumeGrid;
//! use dwi_svr::kernels::SliceProfile;
//! use dwi_svr::recon::ReconOperator;
//! use dwi_svr::shells::Shells;
//! use ndarray::{Array2, array};
//!
//! let grad = array![
//!     [1.0f32, 0.0, 0.0, 1000.0],
//!     [0.0, 1.0, 0.0, 1000.0],
//!     [0.0, 0.0, 1.0, 1000.0],
//!     [0.577, 0.577, 0.577, 1000.0],
//!     [-0.577, 0.577, 0.577, 1000.0],
//!     [0.577, -0.577, 0.577, 1000.0],
//! ];
//! let shells = Shells::new(&grad)?;
//! let grid = VolumeGrid::isotropic((16, 16, 10), 2.0);
//! let motion = Array2::<f32>::zeros((6, 6));
//! let op = ReconOperator::new(
//!     grid,
//!     &shells,
//!     &grad,
//!     motion,
//!     2,
//!     &[],
//!     SliceProfile::gaussian(2.0),
//! )?;
//!
//! let coefs = vec![0.0f32; op.coef_len()];
//! let mut slices = vec![0.0f32; op.data_len()];
//! op.apply_forward(&coefs, &mut slices);
//! # Ok::<(), dwi_svr::recon::ReconError>(())
//! ```

pub mod basis;
pub mod geometry;
pub mod kernels;
pub mod recon;
pub mod sh;
pub mod shells;
