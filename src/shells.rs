//! Grouping of acquired volumes into b-value shells.
//!
//! Multi-shell diffusion acquisitions interleave volumes at a handful of
//! nominal diffusion weightings, with scanner-reported b-values jittering
//! around each nominal value. Volumes are clustered by b-value proximity;
//! every volume belongs to exactly one shell. The reconstruction operator
//! consumes the resulting partition as-is and never re-derives it.

use ndarray::Array2;

use crate::recon::ReconError;

/// Maximum b-value spread (s/mm^2) within a single shell.
pub const BVALUE_TOLERANCE: f32 = 80.0;

/// Shells with a mean b-value below this are treated as b=0.
pub const BZERO_THRESHOLD: f32 = 10.0;

/// One b-value shell: the acquired-volume indices sharing a diffusion
/// weighting, and their mean b-value.
#[derive(Debug, Clone)]
pub struct Shell {
    volumes: Vec<usize>,
    mean_bvalue: f32,
}

impl Shell {
    /// Indices of the acquired volumes in this shell.
    pub fn volumes(&self) -> &[usize] {
        &self.volumes
    }

    /// Number of volumes in this shell.
    pub fn count(&self) -> usize {
        self.volumes.len()
    }

    /// Mean b-value over the shell's volumes.
    pub fn mean_bvalue(&self) -> f32 {
        self.mean_bvalue
    }

    pub fn is_bzero(&self) -> bool {
        self.mean_bvalue < BZERO_THRESHOLD
    }
}

/// Partition of all acquired volumes into b-value shells, ordered by
/// ascending mean b-value.
#[derive(Debug, Clone)]
pub struct Shells {
    shells: Vec<Shell>,
    volume_count: usize,
}

impl Shells {
    /// Detect shells in a gradient table with one `[x, y, z, b]` row per
    /// acquired volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is empty or not four columns wide.
    pub fn new(grad: &Array2<f32>) -> Result<Self, ReconError> {
        if grad.nrows() == 0 {
            return Err(ReconError::EmptyGradientTable);
        }
        if grad.ncols() != 4 {
            return Err(ReconError::GradientTableShape {
                rows: grad.nrows(),
                cols: grad.ncols(),
            });
        }

        let mut order: Vec<usize> = (0..grad.nrows()).collect();
        order.sort_by(|&a, &b| {
            grad[(a, 3)]
                .partial_cmp(&grad[(b, 3)])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut shells: Vec<Shell> = Vec::new();
        for volume in order {
            let bvalue = grad[(volume, 3)];
            let mut start_new = true;
            if let Some(shell) = shells.last_mut() {
                if (bvalue - shell.mean_bvalue).abs() <= BVALUE_TOLERANCE {
                    let n = shell.volumes.len() as f32;
                    shell.mean_bvalue = (shell.mean_bvalue * n + bvalue) / (n + 1.0);
                    shell.volumes.push(volume);
                    start_new = false;
                }
            }
            if start_new {
                shells.push(Shell {
                    volumes: vec![volume],
                    mean_bvalue: bvalue,
                });
            }
        }

        Ok(Self {
            shells,
            volume_count: grad.nrows(),
        })
    }

    /// Number of shells.
    pub fn count(&self) -> usize {
        self.shells.len()
    }

    /// Total number of acquired volumes across all shells.
    pub fn volume_count(&self) -> usize {
        self.volume_count
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Shell> {
        self.shells.iter()
    }

    /// Map from acquired-volume index to shell index.
    pub fn volume_to_shell(&self) -> Vec<usize> {
        let mut map = vec![0usize; self.volume_count];
        for (s, shell) in self.shells.iter().enumerate() {
            for &v in &shell.volumes {
                map[v] = s;
            }
        }
        map
    }
}

impl std::ops::Index<usize> for Shells {
    type Output = Shell;

    fn index(&self, index: usize) -> &Shell {
        &self.shells[index]
    }
}
