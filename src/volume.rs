//! In-memory image types
//!
//! All voxel data is flattened in Fortran order (x varies fastest) to match
//! the NIfTI convention: index = x + y*nx + z*nx*ny (+ t*nx*ny*nz for stacks).

use std::collections::BTreeSet;

use crate::error::{PipelineError, Result};
use crate::utils::affine::{self, Affine};

/// Largest element-wise affine difference (mm) still treated as the same grid.
/// Headers store the sform in float32, so exact equality is too strict.
pub const AFFINE_TOLERANCE: f64 = 1e-3;

/// Voxel grid of an image: dimensions, voxel size and voxel-to-world affine
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    /// Dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Voxel-to-world transform (4x4, row-major)
    pub affine: Affine,
}

impl Geometry {
    /// Grid with an axis-aligned affine scaled by the voxel size
    pub fn new(dims: (usize, usize, usize), voxel_size: (f64, f64, f64)) -> Self {
        let (vsx, vsy, vsz) = voxel_size;
        Geometry {
            dims,
            voxel_size,
            affine: [
                vsx, 0.0, 0.0, 0.0,
                0.0, vsy, 0.0, 0.0,
                0.0, 0.0, vsz, 0.0,
                0.0, 0.0, 0.0, 1.0,
            ],
        }
    }

    pub fn with_affine(mut self, affine: Affine) -> Self {
        self.affine = affine;
        self
    }

    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    #[inline]
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        i + j * self.dims.0 + k * self.dims.0 * self.dims.1
    }

    /// Inverse of `index`
    #[inline]
    pub fn coords(&self, idx: usize) -> (usize, usize, usize) {
        let (nx, ny, _) = self.dims;
        (idx % nx, (idx / nx) % ny, idx / (nx * ny))
    }

    /// World coordinate (mm) of a continuous voxel position
    pub fn voxel_to_world(&self, p: [f64; 3]) -> [f64; 3] {
        affine::apply(&self.affine, p)
    }

    /// Fail with `GeometryMismatch` unless both grids coincide
    ///
    /// Dimensions must be identical and every affine element must agree
    /// within [`AFFINE_TOLERANCE`].
    pub fn ensure_matches(&self, other: &Geometry, left: &str, right: &str) -> Result<()> {
        if self.dims != other.dims {
            return Err(PipelineError::GeometryMismatch {
                left: left.to_string(),
                right: right.to_string(),
                detail: format!("dimensions {:?} vs {:?}", self.dims, other.dims),
            });
        }
        let diff = affine::max_abs_difference(&self.affine, &other.affine);
        if diff > AFFINE_TOLERANCE {
            return Err(PipelineError::GeometryMismatch {
                left: left.to_string(),
                right: right.to_string(),
                detail: format!("affines differ by up to {:.4} mm", diff),
            });
        }
        Ok(())
    }
}

/// A single 3-D volume
#[derive(Clone, Debug)]
pub struct Volume {
    pub data: Vec<f64>,
    pub geometry: Geometry,
}

impl Volume {
    pub fn new(data: Vec<f64>, geometry: Geometry) -> Result<Self> {
        if data.len() != geometry.n_voxels() {
            return Err(PipelineError::contract(format!(
                "volume holds {} voxels but its grid {:?} needs {}",
                data.len(),
                geometry.dims,
                geometry.n_voxels()
            )));
        }
        Ok(Volume { data, geometry })
    }

    /// Intensity-weighted centre of mass in world coordinates
    ///
    /// Negative intensities are ignored. Returns `None` for an image
    /// without positive signal.
    pub fn center_of_mass(&self) -> Option<[f64; 3]> {
        let mut total = 0.0;
        let mut acc = [0.0f64; 3];
        for (idx, &v) in self.data.iter().enumerate() {
            if v > 0.0 && v.is_finite() {
                let (i, j, k) = self.geometry.coords(idx);
                acc[0] += v * i as f64;
                acc[1] += v * j as f64;
                acc[2] += v * k as f64;
                total += v;
            }
        }
        if total <= 0.0 {
            return None;
        }
        let voxel = [acc[0] / total, acc[1] / total, acc[2] / total];
        Some(self.geometry.voxel_to_world(voxel))
    }
}

/// A 4-D diffusion-weighted stack, one 3-D volume per gradient entry
#[derive(Clone, Debug)]
pub struct DiffusionStack {
    /// Volumes back to back, each in Fortran order
    pub data: Vec<f64>,
    pub geometry: Geometry,
    pub n_volumes: usize,
}

impl DiffusionStack {
    pub fn new(data: Vec<f64>, geometry: Geometry, n_volumes: usize) -> Result<Self> {
        let expected = geometry.n_voxels() * n_volumes;
        if data.len() != expected {
            return Err(PipelineError::contract(format!(
                "diffusion stack holds {} samples, expected {} ({} volumes of {:?})",
                data.len(),
                expected,
                n_volumes,
                geometry.dims
            )));
        }
        Ok(DiffusionStack { data, geometry, n_volumes })
    }

    /// Assemble a stack from equally sized volumes
    pub fn from_volumes(geometry: Geometry, volumes: &[Vec<f64>]) -> Result<Self> {
        let n = geometry.n_voxels();
        let mut data = Vec::with_capacity(n * volumes.len());
        for (t, v) in volumes.iter().enumerate() {
            if v.len() != n {
                return Err(PipelineError::contract(format!(
                    "volume {} holds {} voxels, expected {}",
                    t,
                    v.len(),
                    n
                )));
            }
            data.extend_from_slice(v);
        }
        DiffusionStack::new(data, geometry, volumes.len())
    }

    pub fn volume(&self, t: usize) -> &[f64] {
        let n = self.geometry.n_voxels();
        &self.data[t * n..(t + 1) * n]
    }

    /// Signal of every volume at one voxel
    pub fn voxel_signal(&self, idx: usize, out: &mut [f64]) {
        let n = self.geometry.n_voxels();
        for (t, s) in out.iter_mut().enumerate().take(self.n_volumes) {
            *s = self.data[t * n + idx];
        }
    }

    /// Same stack with volumes permuted: volume `t` of the result is `order[t]`
    pub fn reordered(&self, order: &[usize]) -> Result<Self> {
        let volumes: Vec<Vec<f64>> = order.iter().map(|&t| self.volume(t).to_vec()).collect();
        DiffusionStack::from_volumes(self.geometry.clone(), &volumes)
    }
}

/// Binary brain mask in atlas space
#[derive(Clone, Debug)]
pub struct BrainMask {
    pub voxels: Vec<u8>,
    pub geometry: Geometry,
}

impl BrainMask {
    /// Threshold a volume at 0.5
    pub fn from_volume(volume: &Volume) -> Self {
        let voxels = volume.data.iter()
            .map(|&v| if v > 0.5 { 1 } else { 0 })
            .collect();
        BrainMask { voxels, geometry: volume.geometry.clone() }
    }

    /// Mask covering the whole grid
    pub fn full(geometry: Geometry) -> Self {
        BrainMask { voxels: vec![1; geometry.n_voxels()], geometry }
    }

    pub fn count(&self) -> usize {
        self.voxels.iter().filter(|&&m| m > 0).count()
    }

    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        self.voxels[idx] > 0
    }
}

/// Discrete region labelling in atlas space; 0 is background
#[derive(Clone, Debug)]
pub struct LabelVolume {
    pub labels: Vec<u32>,
    pub geometry: Geometry,
}

impl LabelVolume {
    /// Convert stored intensities to integer region IDs
    ///
    /// Values are rounded to the nearest integer; negative or non-finite
    /// values break the labelling contract.
    pub fn from_volume(volume: &Volume) -> Result<Self> {
        let mut labels = Vec::with_capacity(volume.data.len());
        for (idx, &v) in volume.data.iter().enumerate() {
            if !v.is_finite() || v < -0.5 || v > u32::MAX as f64 {
                return Err(PipelineError::contract(format!(
                    "label volume holds invalid region id {} at voxel {:?}",
                    v,
                    volume.geometry.coords(idx)
                )));
            }
            labels.push(v.round() as u32);
        }
        Ok(LabelVolume { labels, geometry: volume.geometry.clone() })
    }

    /// Sorted distinct non-background labels
    pub fn distinct_labels(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.labels.iter().copied().filter(|&l| l != 0).collect();
        set.into_iter().collect()
    }

    /// Number of distinct non-background labels
    pub fn region_count(&self) -> usize {
        self.distinct_labels().len()
    }

    #[inline]
    pub fn label_at(&self, i: usize, j: usize, k: usize) -> u32 {
        self.labels[self.geometry.index(i, j, k)]
    }
}
