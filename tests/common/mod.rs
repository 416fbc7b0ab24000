//! Common test utilities for connectome-core integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use connectome_core::nifti_io;
use connectome_core::pipeline::PipelineInputs;
use connectome_core::volume::{DiffusionStack, Geometry, Volume};

/// Compute RMSE between two arrays, only within mask (non-zero values)
pub fn rmse(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for i in 0..a.len() {
        if mask[i] > 0 {
            let diff = a[i] - b[i];
            sum_sq += diff * diff;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt()
}

/// Largest absolute element-wise difference
pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

pub const DIMS: (usize, usize, usize) = (12, 6, 6);
pub const BLOB_CENTER: [f64; 3] = [5.5, 2.5, 2.5];

/// Attenuation exp(-b * D) along x, y and z for b = 1000
pub const ATTENUATION: [f64; 3] = [0.22313016014842982, 0.7408182206817179, 0.7408182206817179];

/// Smooth positive image peaked at `BLOB_CENTER`
pub fn blob(geometry: &Geometry) -> Vec<f64> {
    (0..geometry.n_voxels())
        .map(|idx| {
            let (i, j, k) = geometry.coords(idx);
            let r2 = (i as f64 - BLOB_CENTER[0]).powi(2)
                + (j as f64 - BLOB_CENTER[1]).powi(2)
                + (k as f64 - BLOB_CENTER[2]).powi(2);
            200.0 + 800.0 * (-r2 / 18.0).exp()
        })
        .collect()
}

/// Three slabs along x (labels 1, 2, 3); the y = 0 row is background
pub fn slab_labels(geometry: &Geometry) -> Vec<f64> {
    (0..geometry.n_voxels())
        .map(|idx| {
            let (i, j, _) = geometry.coords(idx);
            if j == 0 {
                0.0
            } else {
                (i / 4 + 1) as f64
            }
        })
        .collect()
}

/// Synthetic subject written to a temporary directory
///
/// Four diffusion volumes (b = 1000 along x, b0, b = 1000 along y and z),
/// so the b0 is not first and the stack gets canonicalized. Structural,
/// atlas and b0 share one image, so registration is the identity. The
/// tensor is prolate along x in every voxel.
pub struct SyntheticSubject {
    pub dir: tempfile::TempDir,
    pub geometry: Geometry,
    /// Diffusion volumes in canonical order (b0 first)
    pub canonical_volumes: Vec<Vec<f64>>,
    pub dwi: PathBuf,
    pub bvals: PathBuf,
    pub bvecs: PathBuf,
    pub structural: PathBuf,
    pub atlas: PathBuf,
    pub mask: PathBuf,
    pub labels: PathBuf,
}

impl SyntheticSubject {
    pub fn create() -> Self {
        Self::create_with_bvals("1000 0 1000 1000\n")
    }

    /// Same subject with a custom b-value file
    pub fn create_with_bvals(bvals_text: &str) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let geometry = Geometry::new(DIMS, (1.0, 1.0, 1.0));
        let b0 = blob(&geometry);
        let weighted = |a: f64| -> Vec<f64> { b0.iter().map(|v| v * a).collect() };

        let dwi_x = weighted(ATTENUATION[0]);
        let dwi_y = weighted(ATTENUATION[1]);
        let dwi_z = weighted(ATTENUATION[2]);
        let stack = DiffusionStack::from_volumes(
            geometry.clone(),
            &[dwi_x.clone(), b0.clone(), dwi_y.clone(), dwi_z.clone()],
        )
        .expect("stack");

        let root = dir.path().to_path_buf();
        let dwi = root.join("sub01_dwi.nii.gz");
        let bvals = root.join("sub01_dwi.bval");
        let bvecs = root.join("sub01_dwi.bvec");
        let structural = root.join("sub01_T1w.nii.gz");
        let atlas = root.join("template.nii.gz");
        let mask = root.join("template_brainmask.nii.gz");
        let labels = root.join("slabs.nii.gz");

        nifti_io::write_stack(&dwi, &stack).expect("write dwi");
        fs::write(&bvals, bvals_text).expect("write bvals");
        fs::write(&bvecs, "1 0 0 0\n0 0 1 0\n0 0 0 1\n").expect("write bvecs");

        let volume = |data: Vec<f64>| Volume::new(data, geometry.clone()).expect("volume");
        nifti_io::write_volume(&structural, &volume(b0.clone())).expect("write structural");
        nifti_io::write_volume(&atlas, &volume(b0.clone())).expect("write atlas");
        nifti_io::write_volume(&mask, &volume(vec![1.0; geometry.n_voxels()])).expect("write mask");
        nifti_io::write_volume(&labels, &volume(slab_labels(&geometry))).expect("write labels");

        SyntheticSubject {
            dir,
            geometry,
            canonical_volumes: vec![b0, dwi_x, dwi_y, dwi_z],
            dwi,
            bvals,
            bvecs,
            structural,
            atlas,
            mask,
            labels,
        }
    }

    pub fn output_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn inputs(&self, output_dir: &Path) -> PipelineInputs {
        PipelineInputs {
            dwi: self.dwi.clone(),
            bvals: self.bvals.clone(),
            bvecs: self.bvecs.clone(),
            structural: self.structural.clone(),
            atlas: self.atlas.clone(),
            mask: self.mask.clone(),
            labels: self.labels.clone(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Positional command-line arguments in order
    pub fn cli_args(&self, output_dir: &Path) -> Vec<PathBuf> {
        vec![
            self.dwi.clone(),
            self.bvals.clone(),
            self.bvecs.clone(),
            self.structural.clone(),
            self.atlas.clone(),
            self.mask.clone(),
            self.labels.clone(),
            output_dir.to_path_buf(),
        ]
    }
}

/// Sorted file names directly under `dir`
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
