//! `mg-tensor` - Dense tensors with pluggable compute kernels for molgen.
//!
//! This crate provides:
//! - A row-major f32 `Tensor` with axis selection and stacking
//! - A `ComputeBackend` trait for the numerical kernels (dense, norm, attention)
//! - A reference `CpuBackend`, optionally parallelised with rayon
//! - Shape utilities

pub mod backend;
pub mod cpu;
pub mod error;
pub mod shape;
pub mod tensor;

// Re-export primary types at the crate root for convenience.
pub use backend::{Activation, AttentionDims, ComputeBackend, MASKED_SCORE};
pub use cpu::CpuBackend;
pub use error::{Result, TensorError};
pub use shape::Shape;
pub use tensor::Tensor;
