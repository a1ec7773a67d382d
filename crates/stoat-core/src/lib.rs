//! # stoat-core
//!
//! Core tensor type and reverse-mode autodiff engine for Stoat.
//!
//! This crate provides:
//! - [`NdArray`] — dense n-dimensional `f64` array with all numeric kernels
//! - [`Shape`] — extents, row-major strides, and broadcasting rules
//! - [`Variable`] — a computation-graph node wrapping a value with gradient
//!   tracking metadata
//! - [`Op`] — the closed set of differentiable operations and their
//!   backward rules
//! - [`Error`] / [`Result`] — the shared error type across the library
//!
//! The engine is a dense-buffer, single-process CPU reference
//! implementation: build Variables from input data, chain them through the
//! arithmetic/shape/correlation surface, then call
//! [`Variable::backward`] on a scalar output to accumulate gradients into
//! every upstream Variable created with gradient tracking.

mod backward;
pub mod error;
pub mod ndarray;
pub mod op;
pub mod shape;
pub mod variable;

pub use error::{Error, ErrorKind, Result};
pub use ndarray::NdArray;
pub use op::Op;
pub use shape::Shape;
pub use variable::{VarId, Variable};
