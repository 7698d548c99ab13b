//! # Dipolar Core
//!
//! The interaction operator of the coupled dipole approximation on a regular
//! lattice. Given the per-dipole unknowns $\mathbf{x}$, it computes
//! $\mathbf{A}\mathbf{x}$ (or $\mathbf{A}^H\mathbf{x}$) for the matrix
//! $\mathbf{A} = \mathbf{I} - \mathbf{S}\mathbf{G}\mathbf{S}$ that an
//! iterative solver inverts.
//!
//! ## Architecture
//!
//! Both operators implement the [`operator::MatVec`] trait and are selected
//! at startup through [`operator::OperatorKind`]. The primary implementation
//! is the FFT convolution ([`operator::DenseFftOperator`]); the pairwise sum
//! ([`operator::DirectOperator`]) covers small systems and validation. All
//! communication between partitions goes through
//! [`dipolar_compute::Communicator`].
//!
//! ## Modules
//!
//! - [`special`]: Cosine and sine integrals.
//! - [`types`]: Dipole lattice, coupling table, packed tensors.
//! - [`params`]: Physics configuration.
//! - [`grid`]: Padded FFT grid, partitioning and index maps.
//! - [`interaction`]: Interaction term under each formulation.
//! - [`fft`]: Axis transforms and transposes.
//! - [`operator`]: Kernel build and the two operators.

pub mod fft;
pub mod grid;
pub mod interaction;
pub mod operator;
pub mod params;
pub mod special;
pub mod types;

pub use grid::{GridError, GridLayout};
pub use interaction::{InteractionError, InteractionTerm, IntegralTables};
pub use operator::{
    build_operator, DenseFftOperator, DirectOperator, InitOutcome, MatVec, MatVecError,
    MatVecRequest, MatVecStats, OperatorKind, OperatorOptions, Problem,
};
pub use params::{InteractionKind, PhysicsParams};
pub use types::{CouplingTable, DipoleLattice};
