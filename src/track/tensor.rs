//! Diffusion tensor estimation
//!
//! Fits the single-tensor model `ln S = ln S0 - b gᵀ D g` in every brain
//! voxel by linear least squares on the log signal. The design matrix is
//! shared by all voxels, so its Moore-Penrose pseudo-inverse is computed
//! once; under-determined acquisitions get the minimum-norm tensor.
//!
//! Reference:
//! Basser, P.J., Mattiello, J., LeBihan, D. (1994). "Estimation of the
//! effective self-diffusion tensor from the NMR spin echo."
//! Journal of Magnetic Resonance B, 103(3):247-254.

use std::path::Path;

use log::debug;
use rayon::prelude::*;

use crate::archive::{write_npz, NpyArray};
use crate::error::{PipelineError, Result};
use crate::gradients::GradientTable;
use crate::utils::{symmetric_eigen, tensor_eigen};
use crate::volume::{BrainMask, DiffusionStack, Geometry};

const STAGE: &str = "tensor fit";

/// Unknowns per voxel: six tensor elements and ln S0
const N_COEFFS: usize = 7;

/// Tensor model settings
#[derive(Clone, Debug)]
pub struct TensorFitParams {
    /// Signals are clamped to at least this before taking the log
    pub min_signal: f64,
    /// Relative eigenvalue cutoff when inverting the normal equations
    pub rank_tolerance: f64,
}

impl Default for TensorFitParams {
    fn default() -> Self {
        Self {
            min_signal: 1e-6,
            rank_tolerance: 1e-10,
        }
    }
}

/// Per-voxel tensor model on the stack's grid
///
/// Tensors are stored as (Dxx, Dyy, Dzz, Dxy, Dxz, Dyz). Voxels outside the
/// mask hold zeros everywhere.
#[derive(Clone, Debug)]
pub struct TensorField {
    pub geometry: Geometry,
    pub tensors: Vec<[f64; 6]>,
    /// Eigenvalues, descending, clamped at zero
    pub evals: Vec<[f64; 3]>,
    /// Principal eigenvector (unit length, zero outside the mask)
    pub principal: Vec<[f64; 3]>,
    pub fa: Vec<f64>,
}

impl TensorField {
    /// Persist as an `.npz` archive with members `lower_triangular`,
    /// `evals`, `evecs` and `fa`, all in Fortran voxel order
    pub fn write_archive(&self, path: &Path) -> Result<()> {
        let (nx, ny, nz) = self.geometry.dims;
        let n = self.geometry.n_voxels();

        // Dxx, Dxy, Dyy, Dxz, Dyz, Dzz
        const LOWER: [usize; 6] = [0, 3, 1, 4, 5, 2];
        let mut lower = Vec::with_capacity(n * 6);
        for &c in &LOWER {
            lower.extend(self.tensors.iter().map(|t| t[c]));
        }

        let mut evals = Vec::with_capacity(n * 3);
        let mut evecs = Vec::with_capacity(n * 3);
        for c in 0..3 {
            evals.extend(self.evals.iter().map(|e| e[c]));
            evecs.extend(self.principal.iter().map(|v| v[c]));
        }

        let entries = [
            ("lower_triangular", NpyArray::f64(vec![nx, ny, nz, 6], lower).fortran()),
            ("evals", NpyArray::f64(vec![nx, ny, nz, 3], evals).fortran()),
            ("evecs", NpyArray::f64(vec![nx, ny, nz, 3], evecs).fortran()),
            ("fa", NpyArray::f64(vec![nx, ny, nz], self.fa.clone()).fortran()),
        ];
        write_npz(path, &entries).map_err(|e| PipelineError::io(path, e))
    }
}

/// Fractional anisotropy from eigenvalues
pub fn fractional_anisotropy(evals: &[f64; 3]) -> f64 {
    let [l1, l2, l3] = *evals;
    let denom = l1 * l1 + l2 * l2 + l3 * l3;
    if denom <= 0.0 || !denom.is_finite() {
        return 0.0;
    }
    let num = (l1 - l2).powi(2) + (l2 - l3).powi(2) + (l3 - l1).powi(2);
    ((0.5 * num / denom).sqrt()).clamp(0.0, 1.0)
}

fn design_row(b: f64, g: &[f64; 3]) -> [f64; N_COEFFS] {
    [
        -b * g[0] * g[0],
        -b * g[1] * g[1],
        -b * g[2] * g[2],
        -2.0 * b * g[0] * g[1],
        -2.0 * b * g[0] * g[2],
        -2.0 * b * g[1] * g[2],
        1.0,
    ]
}

/// Pseudo-inverse of the design matrix, `N_COEFFS` rows by `n_volumes` columns
fn design_pseudo_inverse(table: &GradientTable, tolerance: f64) -> Result<Vec<[f64; N_COEFFS]>> {
    let rows: Vec<[f64; N_COEFFS]> = table
        .bvals()
        .iter()
        .zip(table.bvecs())
        .map(|(&b, g)| design_row(b, g))
        .collect();

    let mut normal = [[0.0; N_COEFFS]; N_COEFFS];
    for row in &rows {
        for r in 0..N_COEFFS {
            for c in 0..N_COEFFS {
                normal[r][c] += row[r] * row[c];
            }
        }
    }

    let eig = symmetric_eigen(&normal)
        .ok_or_else(|| PipelineError::non_convergence(STAGE, "design matrix is not finite"))?;
    let largest = eig.values.iter().copied().fold(0.0, f64::max);
    let cutoff = tolerance * largest;
    let rank = eig.values.iter().filter(|&&v| v > cutoff).count();
    debug!("design matrix: {} volumes, rank {}", rows.len(), rank);
    if rank < 2 {
        return Err(PipelineError::non_convergence(
            STAGE,
            format!("design matrix has rank {}; the acquisition has no diffusion weighting", rank),
        ));
    }

    // (BᵀB)⁺ = V diag(1/λ) Vᵀ over the retained eigenpairs
    let mut normal_pinv = [[0.0; N_COEFFS]; N_COEFFS];
    for (e, &lambda) in eig.values.iter().enumerate() {
        if lambda <= cutoff {
            continue;
        }
        let v = eig.vector(e);
        for r in 0..N_COEFFS {
            for c in 0..N_COEFFS {
                normal_pinv[r][c] += v[r] * v[c] / lambda;
            }
        }
    }

    // B⁺ = (BᵀB)⁺ Bᵀ, stored column by column (one column per volume)
    Ok(rows
        .iter()
        .map(|row| {
            let mut col = [0.0; N_COEFFS];
            for (r, out) in col.iter_mut().enumerate() {
                *out = (0..N_COEFFS).map(|c| normal_pinv[r][c] * row[c]).sum();
            }
            col
        })
        .collect())
}

struct VoxelFit {
    tensor: [f64; 6],
    evals: [f64; 3],
    principal: [f64; 3],
    fa: f64,
}

impl VoxelFit {
    const EMPTY: VoxelFit = VoxelFit {
        tensor: [0.0; 6],
        evals: [0.0; 3],
        principal: [0.0; 3],
        fa: 0.0,
    };
}

fn fit_voxel(signal: &[f64], pinv: &[[f64; N_COEFFS]], min_signal: f64) -> VoxelFit {
    let mut coeffs = [0.0; N_COEFFS];
    for (s, col) in signal.iter().zip(pinv) {
        let y = s.max(min_signal).ln();
        for (c, w) in coeffs.iter_mut().zip(col) {
            *c += w * y;
        }
    }
    let tensor = [coeffs[0], coeffs[1], coeffs[2], coeffs[3], coeffs[4], coeffs[5]];

    let Some(eig) = tensor_eigen(&tensor) else {
        return VoxelFit::EMPTY;
    };
    // ascending -> descending
    let evals = [
        eig.values[2].max(0.0),
        eig.values[1].max(0.0),
        eig.values[0].max(0.0),
    ];
    VoxelFit {
        tensor,
        evals,
        principal: eig.vector(2),
        fa: fractional_anisotropy(&evals),
    }
}

/// Fit a tensor in every mask voxel
///
/// # Arguments
/// * `stack` - Aligned diffusion stack
/// * `mask` - Brain mask on the same grid
/// * `table` - Gradient table in stack order
/// * `params` - Model settings
pub fn fit_tensors(
    stack: &DiffusionStack,
    mask: &BrainMask,
    table: &GradientTable,
    params: &TensorFitParams,
) -> Result<TensorField> {
    if table.len() != stack.n_volumes {
        return Err(PipelineError::contract(format!(
            "gradient table has {} entries but the stack has {} volumes",
            table.len(),
            stack.n_volumes
        )));
    }
    let n = stack.geometry.n_voxels();
    if mask.voxels.len() != n {
        return Err(PipelineError::contract(format!(
            "mask holds {} voxels, the stack grid has {}",
            mask.voxels.len(),
            n
        )));
    }
    if mask.count() == 0 {
        return Err(PipelineError::contract("brain mask is empty"));
    }

    let pinv = design_pseudo_inverse(table, params.rank_tolerance)?;
    let n_volumes = stack.n_volumes;

    let fits: Vec<VoxelFit> = (0..n)
        .into_par_iter()
        .map_init(
            || vec![0.0; n_volumes],
            |signal, idx| {
                if !mask.contains(idx) {
                    return VoxelFit::EMPTY;
                }
                stack.voxel_signal(idx, signal);
                fit_voxel(signal, &pinv, params.min_signal)
            },
        )
        .collect();

    let mut field = TensorField {
        geometry: stack.geometry.clone(),
        tensors: Vec::with_capacity(n),
        evals: Vec::with_capacity(n),
        principal: Vec::with_capacity(n),
        fa: Vec::with_capacity(n),
    };
    for fit in fits {
        field.tensors.push(fit.tensor);
        field.evals.push(fit.evals);
        field.principal.push(fit.principal);
        field.fa.push(fit.fa);
    }
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Signals for a diagonal tensor under a six-direction scheme plus one b0
    fn six_direction_table() -> GradientTable {
        let s = std::f64::consts::FRAC_1_SQRT_2;
        GradientTable::new(
            vec![0.0, 1000.0, 1000.0, 1000.0, 1000.0, 1000.0, 1000.0],
            vec![
                [0.0; 3],
                [s, s, 0.0],
                [s, 0.0, s],
                [0.0, s, s],
                [s, -s, 0.0],
                [s, 0.0, -s],
                [0.0, s, -s],
            ],
            50.0,
        )
        .unwrap()
    }

    fn synth_stack(table: &GradientTable, d: [f64; 6], s0: f64, dims: (usize, usize, usize)) -> DiffusionStack {
        let g = Geometry::new(dims, (1.0, 1.0, 1.0));
        let n = g.n_voxels();
        let volumes: Vec<Vec<f64>> = table
            .bvals()
            .iter()
            .zip(table.bvecs())
            .map(|(&b, v)| {
                let q = d[0] * v[0] * v[0]
                    + d[1] * v[1] * v[1]
                    + d[2] * v[2] * v[2]
                    + 2.0 * d[3] * v[0] * v[1]
                    + 2.0 * d[4] * v[0] * v[2]
                    + 2.0 * d[5] * v[1] * v[2];
                vec![s0 * (-b * q).exp(); n]
            })
            .collect();
        DiffusionStack::from_volumes(g, &volumes).unwrap()
    }

    #[test]
    fn test_fa_limits() {
        assert_eq!(fractional_anisotropy(&[1.0, 1.0, 1.0]), 0.0);
        assert!((fractional_anisotropy(&[1.0, 0.0, 0.0]) - 1.0).abs() < 1e-12);
        assert_eq!(fractional_anisotropy(&[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_recovers_full_tensor() {
        let table = six_direction_table();
        let d = [1.7e-3, 0.4e-3, 0.3e-3, 0.1e-3, 0.0, 0.05e-3];
        let stack = synth_stack(&table, d, 1000.0, (2, 2, 1));
        let mask = BrainMask::full(stack.geometry.clone());

        let field = fit_tensors(&stack, &mask, &table, &TensorFitParams::default()).unwrap();
        for (got, want) in field.tensors[0].iter().zip(d.iter()) {
            assert!((got - want).abs() < 1e-8, "{} vs {}", got, want);
        }
        assert!(field.fa[0] > 0.5);
        assert!(field.principal[0][0].abs() > 0.9);
        assert!(field.evals[0][0] >= field.evals[0][1] && field.evals[0][1] >= field.evals[0][2]);
    }

    #[test]
    fn test_axis_scheme_minimum_norm() {
        // Only three directions: off-diagonals are unobservable and come back zero
        let table = GradientTable::new(
            vec![0.0, 1000.0, 1000.0, 1000.0],
            vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            50.0,
        )
        .unwrap();
        let d = [1.5e-3, 0.3e-3, 0.3e-3, 0.0, 0.0, 0.0];
        let stack = synth_stack(&table, d, 800.0, (2, 1, 1));
        let mask = BrainMask::full(stack.geometry.clone());

        let field = fit_tensors(&stack, &mask, &table, &TensorFitParams::default()).unwrap();
        let t = field.tensors[1];
        assert!((t[0] - 1.5e-3).abs() < 1e-8);
        assert!((t[1] - 0.3e-3).abs() < 1e-8);
        assert!(t[3].abs() < 1e-12 && t[4].abs() < 1e-12 && t[5].abs() < 1e-12);
        assert!(field.principal[1][0].abs() > 0.999);
    }

    #[test]
    fn test_outside_mask_is_zero() {
        let table = six_direction_table();
        let stack = synth_stack(&table, [1e-3, 0.5e-3, 0.5e-3, 0.0, 0.0, 0.0], 500.0, (2, 1, 1));
        let mut mask = BrainMask::full(stack.geometry.clone());
        mask.voxels[1] = 0;

        let field = fit_tensors(&stack, &mask, &table, &TensorFitParams::default()).unwrap();
        assert_eq!(field.tensors[1], [0.0; 6]);
        assert_eq!(field.fa[1], 0.0);
        assert_eq!(field.principal[1], [0.0; 3]);
        assert!(field.fa[0] > 0.0);
    }

    #[test]
    fn test_empty_mask_rejected() {
        let table = six_direction_table();
        let stack = synth_stack(&table, [1e-3, 1e-3, 1e-3, 0.0, 0.0, 0.0], 500.0, (2, 1, 1));
        let mask = BrainMask { voxels: vec![0, 0], geometry: stack.geometry.clone() };
        let err = fit_tensors(&stack, &mask, &table, &TensorFitParams::default()).unwrap_err();
        assert!(matches!(err, PipelineError::DataContract(_)));
    }

    #[test]
    fn test_b0_only_does_not_converge() {
        let table = GradientTable::new(vec![0.0, 0.0], vec![[0.0; 3], [0.0; 3]], 50.0).unwrap();
        let g = Geometry::new((1, 1, 1), (1.0, 1.0, 1.0));
        let stack = DiffusionStack::from_volumes(g.clone(), &[vec![100.0], vec![100.0]]).unwrap();
        let mask = BrainMask::full(g);
        let err = fit_tensors(&stack, &mask, &table, &TensorFitParams::default()).unwrap_err();
        assert!(matches!(err, PipelineError::NonConvergence { .. }));
    }

    #[test]
    fn test_archive_members() {
        let table = six_direction_table();
        let stack = synth_stack(&table, [1e-3, 0.5e-3, 0.5e-3, 0.0, 0.0, 0.0], 500.0, (2, 1, 1));
        let mask = BrainMask::full(stack.geometry.clone());
        let field = fit_tensors(&stack, &mask, &table, &TensorFitParams::default()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tensors.npz");
        field.write_archive(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        for member in ["lower_triangular.npy", "evals.npy", "evecs.npy", "fa.npy"] {
            assert!(text.contains(member), "missing {}", member);
        }
        assert!(text.contains("'shape': (2, 1, 1, 6)"));
    }
}
