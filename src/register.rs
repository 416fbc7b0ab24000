//! Rigid alignment of diffusion data to the atlas
//!
//! Two translation-only registrations are chained: structural → atlas and
//! mean b0 → structural. Their composition maps every atlas voxel into the
//! diffusion stack, which is then resampled onto the atlas grid.
//!
//! Transforms are pull maps: a registration of `moving` onto `fixed` returns
//! the affine taking fixed world coordinates (mm) to moving world
//! coordinates, which is what resampling needs.
//!
//! Optimisation is a compass (pattern) search on normalised
//! cross-correlation started from the centre-of-mass offset. The b0 and the
//! structural image have different contrast (CSF is bright on b0, dark on
//! T1), so that pair is scored by the magnitude of the correlation.
//! Correlation assumes a roughly linear intensity relation; strongly
//! non-linear contrast pairs may still settle away from the true offset.
//!
//! Reference:
//! Kolda, T.G., Lewis, R.M., Torczon, V. (2003). "Optimization by direct
//! search: new perspectives on some classical and modern methods."
//! SIAM Review, 45(3):385-482.

use std::path::{Path, PathBuf};

use log::{debug, info};
use rayon::prelude::*;

use crate::error::{PipelineError, Result};
use crate::gradients::GradientTable;
use crate::layout::OutputLayout;
use crate::nifti_io;
use crate::utils::affine::{self, Affine};
use crate::utils::trilinear;
use crate::volume::{DiffusionStack, Geometry, Volume};

const STAGE: &str = "registration";

/// Compass search settings
#[derive(Clone, Debug)]
pub struct RegistrationParams {
    /// First probe distance in mm
    pub initial_step_mm: f64,
    /// Search stops once the probe distance drops below this
    pub min_step_mm: f64,
    /// Probe rounds allowed before giving up
    pub max_iterations: usize,
    /// Fixed-image voxels sampled every `sample_stride` along each axis
    pub sample_stride: usize,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            initial_step_mm: 4.0,
            min_step_mm: 0.05,
            max_iterations: 200,
            sample_stride: 2,
        }
    }
}

/// How the intensities of the two images relate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Contrast {
    /// Same modality: maximise the correlation
    Same,
    /// Different modality: maximise its magnitude, so inverted contrast aligns too
    Inverted,
}

/// Outcome of one registration
#[derive(Clone, Debug)]
pub struct Registration {
    /// Fixed world → moving world
    pub transform: Affine,
    /// Normalised cross-correlation at the solution (its magnitude for [`Contrast::Inverted`])
    pub similarity: f64,
    pub iterations: usize,
}

/// Fixed-image samples evaluated at every probe
struct SamplePoints {
    world: Vec<[f64; 3]>,
    values: Vec<f64>,
}

impl SamplePoints {
    fn from_volume(fixed: &Volume, stride: usize) -> Self {
        let stride = stride.max(1);
        let (nx, ny, nz) = fixed.geometry.dims;
        let mut world = Vec::new();
        let mut values = Vec::new();
        for k in (0..nz).step_by(stride) {
            for j in (0..ny).step_by(stride) {
                for i in (0..nx).step_by(stride) {
                    let v = fixed.data[fixed.geometry.index(i, j, k)];
                    world.push(fixed.geometry.voxel_to_world([i as f64, j as f64, k as f64]));
                    values.push(if v.is_finite() { v } else { 0.0 });
                }
            }
        }
        SamplePoints { world, values }
    }
}

/// Normalised cross-correlation; NaN when either side is constant
fn ncc(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    if n == 0.0 {
        return f64::NAN;
    }
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let da = x - mean_a;
        let db = y - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom <= 1e-12 {
        return f64::NAN;
    }
    cov / denom
}

/// Similarity of `moving` shifted by `t` against the fixed samples
fn similarity(
    samples: &SamplePoints,
    moving: &Volume,
    world_to_voxel: &Affine,
    contrast: Contrast,
    t: [f64; 3],
) -> f64 {
    let resampled: Vec<f64> = samples
        .world
        .iter()
        .map(|w| {
            let q = affine::apply(world_to_voxel, [w[0] + t[0], w[1] + t[1], w[2] + t[2]]);
            trilinear(&moving.data, moving.geometry.dims, q)
        })
        .collect();
    let score = ncc(&samples.values, &resampled);
    match contrast {
        Contrast::Same => score,
        Contrast::Inverted => score.abs(),
    }
}

/// Translation registration of `moving` onto `fixed`
///
/// # Arguments
/// * `moving` - Image to be resampled
/// * `fixed` - Reference grid
/// * `params` - Search settings
/// * `contrast` - Intensity relation between the two images
///
/// # Returns
/// The pull map fixed world → moving world, or `NonConvergence` when an
/// image has no positive signal, the similarity is undefined, or the search
/// exceeds `max_iterations`.
pub fn register_translation(
    moving: &Volume,
    fixed: &Volume,
    params: &RegistrationParams,
    contrast: Contrast,
) -> Result<Registration> {
    let com_fixed = fixed
        .center_of_mass()
        .ok_or_else(|| PipelineError::non_convergence(STAGE, "fixed image has no positive signal"))?;
    let com_moving = moving
        .center_of_mass()
        .ok_or_else(|| PipelineError::non_convergence(STAGE, "moving image has no positive signal"))?;
    let world_to_voxel = affine::invert(&moving.geometry.affine).ok_or_else(|| {
        PipelineError::non_convergence(STAGE, "moving image affine is singular")
    })?;

    let samples = SamplePoints::from_volume(fixed, params.sample_stride);

    let mut t = [
        com_moving[0] - com_fixed[0],
        com_moving[1] - com_fixed[1],
        com_moving[2] - com_fixed[2],
    ];
    let mut best = similarity(&samples, moving, &world_to_voxel, contrast, t);
    if !best.is_finite() {
        return Err(PipelineError::non_convergence(
            STAGE,
            "similarity is undefined at the initial estimate",
        ));
    }
    debug!("initial offset [{:.3}, {:.3}, {:.3}] mm, ncc {:.6}", t[0], t[1], t[2], best);

    let mut step = params.initial_step_mm;
    let mut iterations = 0;
    while step >= params.min_step_mm {
        iterations += 1;
        if iterations > params.max_iterations {
            return Err(PipelineError::non_convergence(
                STAGE,
                format!("no convergence after {} iterations (step {:.4} mm)", params.max_iterations, step),
            ));
        }

        let mut improved: Option<([f64; 3], f64)> = None;
        for axis in 0..3 {
            for sign in [1.0, -1.0] {
                let mut candidate = t;
                candidate[axis] += sign * step;
                let score = similarity(&samples, moving, &world_to_voxel, contrast, candidate);
                let threshold = improved.map(|(_, s)| s).unwrap_or(best);
                if score > threshold + 1e-12 {
                    improved = Some((candidate, score));
                }
            }
        }

        match improved {
            Some((candidate, score)) => {
                t = candidate;
                best = score;
            }
            None => step *= 0.5,
        }
    }

    debug!(
        "converged after {} iterations: offset [{:.3}, {:.3}, {:.3}] mm, ncc {:.6}",
        iterations, t[0], t[1], t[2], best
    );
    Ok(Registration {
        transform: affine::translation(t),
        similarity: best,
        iterations,
    })
}

/// Voxelwise mean of the unweighted volumes
pub fn mean_b0(stack: &DiffusionStack, table: &GradientTable) -> Result<Volume> {
    if table.len() != stack.n_volumes {
        return Err(PipelineError::contract(format!(
            "gradient table has {} entries but the stack has {} volumes",
            table.len(),
            stack.n_volumes
        )));
    }
    let b0s: Vec<usize> = table
        .b0s_mask()
        .iter()
        .enumerate()
        .filter_map(|(t, &is_b0)| if is_b0 { Some(t) } else { None })
        .collect();
    if b0s.is_empty() {
        return Err(PipelineError::contract("no b0 volume to register"));
    }

    let n = stack.geometry.n_voxels();
    let mut mean = vec![0.0; n];
    for &t in &b0s {
        for (m, &v) in mean.iter_mut().zip(stack.volume(t)) {
            *m += v;
        }
    }
    let scale = 1.0 / b0s.len() as f64;
    mean.iter_mut().for_each(|m| *m *= scale);
    Volume::new(mean, stack.geometry.clone())
}

/// Resample every volume of `stack` onto `target`
///
/// `transform` maps target world coordinates to stack world coordinates.
/// Samples falling outside the stack's field of view are zero.
pub fn resample_stack(stack: &DiffusionStack, target: &Geometry, transform: &Affine) -> Result<DiffusionStack> {
    let world_to_voxel = affine::invert(&stack.geometry.affine)
        .ok_or_else(|| PipelineError::non_convergence(STAGE, "diffusion affine is singular"))?;
    // target voxel -> stack voxel
    let pull = affine::multiply(&world_to_voxel, &affine::multiply(transform, &target.affine));

    let n = target.n_voxels();
    let positions: Vec<[f64; 3]> = (0..n)
        .map(|idx| {
            let (i, j, k) = target.coords(idx);
            affine::apply(&pull, [i as f64, j as f64, k as f64])
        })
        .collect();

    let dims = stack.geometry.dims;
    let volumes: Vec<Vec<f64>> = (0..stack.n_volumes)
        .into_par_iter()
        .map(|t| {
            let source = stack.volume(t);
            positions.iter().map(|&q| trilinear(source, dims, q)).collect()
        })
        .collect();

    DiffusionStack::from_volumes(target.clone(), &volumes)
}

/// Inputs of the alignment stage
#[derive(Clone, Copy, Debug)]
pub struct AlignmentRequest<'a> {
    /// Canonicalized diffusion stack (b0 first)
    pub reference: &'a Path,
    pub table: &'a GradientTable,
    pub structural: &'a Path,
    pub atlas: &'a Path,
    pub layout: &'a OutputLayout,
}

/// Artifacts and transforms produced by alignment
#[derive(Clone, Debug)]
pub struct AlignmentOutput {
    pub aligned: PathBuf,
    pub structural_to_atlas: Registration,
    pub b0_to_structural: Registration,
    /// Atlas world → diffusion world
    pub diffusion_to_atlas: Affine,
}

fn write_transform(path: &Path, transform: &Affine) -> Result<()> {
    std::fs::write(path, affine::format_matrix(transform))
        .map_err(|e| PipelineError::io(path, format!("Failed to write transform: {}", e)))
}

/// Align the diffusion stack to the atlas grid
///
/// Writes the mean b0, the three transforms and the aligned stack under the
/// layout's scratch and `reg_dti` directories.
pub fn align_to_atlas(request: &AlignmentRequest<'_>, params: &RegistrationParams) -> Result<AlignmentOutput> {
    let layout = request.layout;
    let stack = nifti_io::read_stack(request.reference)?;
    let b0 = mean_b0(&stack, request.table)?;
    nifti_io::write_volume(&layout.mean_b0(), &b0)?;

    let structural = nifti_io::read_volume(request.structural)?;
    let atlas = nifti_io::read_volume(request.atlas)?;

    let structural_to_atlas = register_translation(&structural, &atlas, params, Contrast::Same)?;
    info!(
        "structural -> atlas: ncc {:.4} after {} iterations",
        structural_to_atlas.similarity, structural_to_atlas.iterations
    );
    let b0_to_structural = register_translation(&b0, &structural, params, Contrast::Inverted)?;
    info!(
        "b0 -> structural: ncc {:.4} after {} iterations",
        b0_to_structural.similarity, b0_to_structural.iterations
    );

    // atlas world -> structural world -> b0 world
    let diffusion_to_atlas = affine::multiply(&b0_to_structural.transform, &structural_to_atlas.transform);

    write_transform(&layout.xfm_structural_to_atlas(), &structural_to_atlas.transform)?;
    write_transform(&layout.xfm_b0_to_structural(), &b0_to_structural.transform)?;
    write_transform(&layout.xfm_diffusion_to_atlas(), &diffusion_to_atlas)?;

    let aligned = resample_stack(&stack, &atlas.geometry, &diffusion_to_atlas)?;
    let aligned_path = layout.aligned_volume();
    nifti_io::write_stack(&aligned_path, &aligned)?;

    Ok(AlignmentOutput {
        aligned: aligned_path,
        structural_to_atlas,
        b0_to_structural,
        diffusion_to_atlas,
    })
}
