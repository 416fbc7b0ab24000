//! Output directory tree and derived-artifact names
//!
//! Every artifact lives under the output root and is named from the base
//! name of the diffusion stack (`D`) and of the label volume (`L`):
//!
//! ```text
//! <root>/tmp/D_t1.nii.gz              canonicalized reference stack
//! <root>/tmp/D_b0.nii.gz              mean b0 used for registration
//! <root>/tmp/D_xfm_*.mat              registration transforms
//! <root>/reg_dti/D_aligned.nii.gz     aligned diffusion stack
//! <root>/tensors/D_tensors.npz        tensor field archive
//! <root>/fibers/D_fibers.npz          streamline archive
//! <root>/graphs/D_L.graphml           connectivity graph
//! ```

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{PipelineError, Result};

/// Subdirectories created under the output root, in creation order
pub const SUBDIRECTORIES: [&str; 5] = ["tmp", "reg_dti", "tensors", "fibers", "graphs"];

/// File name with up to two extensions removed
///
/// `sub01_dwi.nii.gz` -> `sub01_dwi`, `labels.nii` -> `labels`.
pub fn base_name(path: &Path) -> String {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for _ in 0..2 {
        if let Some(pos) = name.rfind('.') {
            if pos > 0 {
                name.truncate(pos);
            }
        }
    }
    name
}

/// Derived artifact paths for one pipeline run
#[derive(Clone, Debug)]
pub struct OutputLayout {
    root: PathBuf,
    dwi_name: String,
    label_name: String,
}

impl OutputLayout {
    pub fn new(root: &Path, dwi: &Path, labels: &Path) -> Self {
        OutputLayout {
            root: root.to_path_buf(),
            dwi_name: base_name(dwi),
            label_name: base_name(labels),
        }
    }

    pub fn dwi_name(&self) -> &str {
        &self.dwi_name
    }

    pub fn label_name(&self) -> &str {
        &self.label_name
    }

    /// Ensure the root and every subdirectory exist
    ///
    /// Existing directories are left untouched, so provisioning an existing
    /// tree is a no-op. Any creation failure aborts with `Provisioning`.
    pub fn provision(&self) -> Result<Vec<PathBuf>> {
        let mut created = Vec::with_capacity(SUBDIRECTORIES.len() + 1);
        ensure_dir(&self.root)?;
        created.push(self.root.clone());
        for sub in SUBDIRECTORIES {
            let dir = self.root.join(sub);
            ensure_dir(&dir)?;
            created.push(dir);
        }
        Ok(created)
    }

    fn in_dir(&self, sub: &str, suffix: &str) -> PathBuf {
        self.root.join(sub).join(format!("{}{}", self.dwi_name, suffix))
    }

    /// Canonicalized reference stack (b0 first)
    pub fn reference_volume(&self) -> PathBuf {
        self.in_dir("tmp", "_t1.nii.gz")
    }

    pub fn mean_b0(&self) -> PathBuf {
        self.in_dir("tmp", "_b0.nii.gz")
    }

    pub fn xfm_structural_to_atlas(&self) -> PathBuf {
        self.in_dir("tmp", "_xfm_t1w2temp.mat")
    }

    pub fn xfm_b0_to_structural(&self) -> PathBuf {
        self.in_dir("tmp", "_xfm_b0w2t1w.mat")
    }

    pub fn xfm_diffusion_to_atlas(&self) -> PathBuf {
        self.in_dir("tmp", "_xfm_dti2temp.mat")
    }

    pub fn aligned_volume(&self) -> PathBuf {
        self.in_dir("reg_dti", "_aligned.nii.gz")
    }

    pub fn tensors(&self) -> PathBuf {
        self.in_dir("tensors", "_tensors.npz")
    }

    pub fn fibers(&self) -> PathBuf {
        self.in_dir("fibers", "_fibers.npz")
    }

    pub fn graph(&self) -> PathBuf {
        self.root
            .join("graphs")
            .join(format!("{}_{}.graphml", self.dwi_name, self.label_name))
    }

    /// Name given to the connectivity graph
    pub fn graph_name(&self) -> String {
        format!("{}_{}", self.dwi_name, self.label_name)
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|source| PipelineError::Provisioning {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("directory ready: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_dirs(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_base_name_strips_two_extensions() {
        assert_eq!(base_name(Path::new("/data/sub01_dwi.nii.gz")), "sub01_dwi");
        assert_eq!(base_name(Path::new("labels.nii")), "labels");
        assert_eq!(base_name(Path::new("atlas")), "atlas");
        assert_eq!(base_name(Path::new("a.b.nii.gz")), "a.b");
        assert_eq!(base_name(Path::new(".hidden")), ".hidden");
    }

    #[test]
    fn test_artifact_paths() {
        let layout = OutputLayout::new(
            Path::new("/out"),
            Path::new("/in/KKI2009_113_1_DTI.nii.gz"),
            Path::new("/atlas/desikan.nii.gz"),
        );
        assert_eq!(layout.reference_volume(), PathBuf::from("/out/tmp/KKI2009_113_1_DTI_t1.nii.gz"));
        assert_eq!(layout.aligned_volume(), PathBuf::from("/out/reg_dti/KKI2009_113_1_DTI_aligned.nii.gz"));
        assert_eq!(layout.tensors(), PathBuf::from("/out/tensors/KKI2009_113_1_DTI_tensors.npz"));
        assert_eq!(layout.fibers(), PathBuf::from("/out/fibers/KKI2009_113_1_DTI_fibers.npz"));
        assert_eq!(layout.graph(), PathBuf::from("/out/graphs/KKI2009_113_1_DTI_desikan.graphml"));
        assert_eq!(layout.graph_name(), "KKI2009_113_1_DTI_desikan");
    }

    #[test]
    fn test_provision_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("derivatives").join("sub01");
        let layout = OutputLayout::new(&root, Path::new("dwi.nii.gz"), Path::new("labels.nii.gz"));

        let first = layout.provision().unwrap();
        let before = list_dirs(&root);
        let second = layout.provision().unwrap();
        let after = list_dirs(&root);

        assert_eq!(first, second);
        assert_eq!(before, after);
        assert_eq!(after, vec!["fibers", "graphs", "reg_dti", "tensors", "tmp"]);
    }

    #[test]
    fn test_provision_fails_when_root_is_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("occupied");
        std::fs::write(&root, b"not a directory").unwrap();

        let layout = OutputLayout::new(&root, Path::new("dwi.nii.gz"), Path::new("labels.nii.gz"));
        let err = layout.provision().unwrap_err();
        assert!(matches!(err, PipelineError::Provisioning { .. }));
    }
}
