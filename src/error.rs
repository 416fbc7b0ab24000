//! Error types for connectome estimation.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by any stage of the pipeline.
///
/// No stage recovers locally: every variant propagates to the orchestrator,
/// which wraps it in a [`crate::pipeline::PipelineFailure`] naming the stage.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The output tree could not be created (permissions, quota, a file in the way).
    #[error("cannot create output directory '{}': {source}", path.display())]
    Provisioning {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Inputs disagree with each other, e.g. a gradient table whose length
    /// differs from the number of diffusion volumes.
    #[error("data contract violated: {0}")]
    DataContract(String),

    /// Two volumes that must share a voxel grid do not.
    #[error("geometry mismatch between {left} and {right}: {detail}")]
    GeometryMismatch {
        left: String,
        right: String,
        detail: String,
    },

    /// Registration or tensor fitting could not produce a usable estimate.
    #[error("{stage} did not converge: {detail}")]
    NonConvergence { stage: &'static str, detail: String },

    /// Missing, unreadable, corrupt or unwritable file.
    #[error("I/O error on '{}': {message}", path.display())]
    Io { path: PathBuf, message: String },
}

impl PipelineError {
    /// Attach a path to a codec-level error message.
    pub fn io(path: &Path, message: impl Into<String>) -> Self {
        PipelineError::Io {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        PipelineError::DataContract(message.into())
    }

    pub fn non_convergence(stage: &'static str, detail: impl Into<String>) -> Self {
        PipelineError::NonConvergence {
            stage,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
