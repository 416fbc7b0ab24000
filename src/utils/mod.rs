//! Shared numerics: affine algebra, interpolation, eigendecomposition

pub mod affine;
pub mod eigen;
pub mod interpolation;

pub use affine::Affine;
pub use eigen::{symmetric_eigen, tensor_eigen, SymmetricEigen};
pub use interpolation::{nearest_voxel, trilinear};
