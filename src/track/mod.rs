//! Tensor estimation and deterministic tractography
//!
//! - `tensor`: log-linear tensor fit, FA and principal directions
//! - `eudx`: seeding and Euler streamline integration

pub mod eudx;
pub mod tensor;

pub use eudx::{seed_points, track, Streamline, StreamlineSet, TrackingParams};
pub use tensor::{fit_tensors, fractional_anisotropy, TensorField, TensorFitParams};

use log::info;

use crate::error::Result;
use crate::gradients::GradientTable;
use crate::volume::{BrainMask, DiffusionStack};

/// Fit tensors on the aligned stack and track through them
pub fn fit_and_track(
    stack: &DiffusionStack,
    mask: &BrainMask,
    table: &GradientTable,
    fit: &TensorFitParams,
    tracking: &TrackingParams,
) -> Result<(TensorField, StreamlineSet)> {
    stack
        .geometry
        .ensure_matches(&mask.geometry, "aligned diffusion stack", "brain mask")?;

    let field = fit_tensors(stack, mask, table, fit)?;
    let brain = mask.count();
    let mean_fa = field.fa.iter().sum::<f64>() / brain as f64;
    info!("fitted {} tensors, mean FA {:.3}", brain, mean_fa);

    let streamlines = track(&field, mask, tracking)?;
    info!("tracked {} streamlines", streamlines.len());
    Ok((field, streamlines))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::volume::Geometry;

    #[test]
    fn test_mask_grid_must_match_stack() {
        let table = GradientTable::new(
            vec![0.0, 1000.0],
            vec![[0.0; 3], [1.0, 0.0, 0.0]],
            50.0,
        )
        .unwrap();
        let g = Geometry::new((2, 2, 2), (1.0, 1.0, 1.0));
        let stack = DiffusionStack::from_volumes(g, &[vec![100.0; 8], vec![50.0; 8]]).unwrap();
        let mask = BrainMask::full(Geometry::new((2, 2, 3), (1.0, 1.0, 1.0)));

        let err = fit_and_track(&stack, &mask, &table, &TensorFitParams::default(), &TrackingParams::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::GeometryMismatch { .. }));
    }
}
