//! Reconstruction grid geometry and rigid-motion transforms.
//!
//! All transforms are homogeneous 4x4 matrices in `f64`; signal arithmetic
//! elsewhere in the crate stays in `f32`. Rigid motion rows are
//! `[tx, ty, tz, rx, ry, rz]` with rotations composed intrinsically about
//! X, then Y, then Z.

use nalgebra::{Matrix4, Rotation3, Vector3};
use ndarray::ArrayView1;

use crate::recon::ReconError;

/// The fixed geometry of the reconstruction volume: grid dimensions plus the
/// voxel-to-scanner affine map and its inverse.
#[derive(Debug, Clone)]
pub struct VolumeGrid {
    dim: (usize, usize, usize),
    voxel2scanner: Matrix4<f64>,
    scanner2voxel: Matrix4<f64>,
}

impl VolumeGrid {
    /// Build a grid from its dimensions `(nx, ny, nz)` and the homogeneous
    /// voxel-to-scanner transform.
    ///
    /// # Errors
    ///
    /// Returns an error if the transform is not invertible.
    pub fn new(
        dim: (usize, usize, usize),
        voxel_to_scanner: Matrix4<f64>,
    ) -> Result<Self, ReconError> {
        let scanner2voxel = voxel_to_scanner
            .try_inverse()
            .ok_or(ReconError::SingularTransform)?;
        Ok(Self {
            dim,
            voxel2scanner: voxel_to_scanner,
            scanner2voxel,
        })
    }

    /// Axis-aligned grid with isotropic voxel spacing and the scanner origin
    /// at voxel (0, 0, 0).
    pub fn isotropic(dim: (usize, usize, usize), spacing: f64) -> Self {
        assert!(spacing > 0.0, "voxel spacing must be positive");
        let mut voxel2scanner = Matrix4::identity();
        let mut scanner2voxel = Matrix4::identity();
        for i in 0..3 {
            voxel2scanner[(i, i)] = spacing;
            scanner2voxel[(i, i)] = 1.0 / spacing;
        }
        Self {
            dim,
            voxel2scanner,
            scanner2voxel,
        }
    }

    /// Grid dimensions `(nx, ny, nz)`.
    pub fn dim(&self) -> (usize, usize, usize) {
        self.dim
    }

    /// Total number of voxels.
    pub fn voxel_count(&self) -> usize {
        self.dim.0 * self.dim.1 * self.dim.2
    }

    pub(crate) fn voxel_to_scanner(&self) -> &Matrix4<f64> {
        &self.voxel2scanner
    }

    pub(crate) fn scanner_to_voxel(&self) -> &Matrix4<f64> {
        &self.scanner2voxel
    }
}

/// Rotation from three angles, composed about X, then Y, then Z.
pub(crate) fn rotation_xyz(rx: f64, ry: f64, rz: f64) -> Rotation3<f64> {
    Rotation3::from_axis_angle(&Vector3::x_axis(), rx)
        * Rotation3::from_axis_angle(&Vector3::y_axis(), ry)
        * Rotation3::from_axis_angle(&Vector3::z_axis(), rz)
}

/// Homogeneous rigid transform from a 6-parameter motion row.
pub(crate) fn rigid_transform(params: ArrayView1<f32>) -> Matrix4<f64> {
    let rot = rotation_xyz(params[3] as f64, params[4] as f64, params[5] as f64);
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(rot.matrix());
    m[(0, 3)] = params[0] as f64;
    m[(1, 3)] = params[1] as f64;
    m[(2, 3)] = params[2] as f64;
    m
}
