//! Connectome-Core: structural connectome estimation from diffusion MRI
//!
//! Turns a diffusion-weighted acquisition into a region-to-region
//! connectivity graph on an atlas parcellation.
//!
//! # Modules
//! - `pipeline`: Stage orchestration, state machine and run report
//! - `layout`: Output directory tree and artifact naming
//! - `gradients`: Gradient table parsing and stack canonicalization
//! - `register`: Translation registration and resampling to the atlas
//! - `track`: Tensor fitting and deterministic tractography
//! - `graph`: Connectivity graph construction and GraphML export
//! - `nifti_io`: NIfTI reading and writing
//! - `archive`: NumPy `.npy`/`.npz` archives
//! - `volume`: Voxel grids, stacks, masks and label volumes
//! - `utils`: Affine algebra, interpolation, eigendecomposition

// Data model
pub mod error;
pub mod volume;

// Stage modules
pub mod layout;
pub mod gradients;
pub mod register;
pub mod track;
pub mod graph;
pub mod pipeline;

// Shared numerics
pub mod utils;

// I/O modules
pub mod archive;
pub mod nifti_io;

pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineConfig, PipelineFailure, PipelineInputs, PipelineReport};
