//! Interaction operator of the coupled dipole approximation.
//!
//! The iterative solver only ever needs the product of the interaction matrix
//! with a vector,
//!
//! $$\mathbf{y} = \mathbf{A}\mathbf{x}, \qquad
//!   \mathbf{A} = \mathbf{I} - \mathbf{S}\,\mathbf{G}\,\mathbf{S},$$
//!
//! where $\mathbf{S}$ is the block-diagonal matrix of per-material coupling
//! square roots and $\mathbf{G}$ the interaction tensor between every pair of
//! dipoles. Two strategies implement the [`MatVec`] trait:
//!
//! - [`DenseFftOperator`]: $\mathbf{G}$ is translation invariant on the
//!   lattice, so the product is a convolution evaluated with FFTs on a
//!   zero-padded grid. $O(N \log N)$ per call.
//! - [`DirectOperator`]: explicit sum over all pairs. $O(N^2)$ per call,
//!   used for small systems and to validate the FFT operator.
//!
//! Both operate on the dipoles owned by the calling partition; all
//! partitions must call [`MatVec::apply`] together.

pub mod dense;
pub mod direct;
pub mod kernel;

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use dipolar_compute::{CommError, Communicator};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::{GridError, GridLayout};
use crate::interaction::{IntegralTables, InteractionError};
use crate::params::{InteractionKind, PhysicsParams};
use crate::types::{CouplingTable, DipoleLattice, LatticeError};

pub use dense::DenseFftOperator;
pub use direct::DirectOperator;
pub use kernel::{build_kernel, estimate_memory, Kernel, KernelStats};

/// Errors raised by the kernel build and the operators.
#[derive(Debug, Error)]
pub enum MatVecError {
    #[error("Inner product requested, but it is not supported in this run mode")]
    InnerProductUnsupported,

    #[error("Inconsistent configuration: {0}")]
    Config(String),

    #[error("Size of {what} overflows the address space (factors {factors:?})")]
    SizeOverflow {
        what: &'static str,
        factors: Vec<usize>,
    },

    #[error("Vector of length {actual} given, the local part has length {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Dipole {index} uses material {material}, but only {available} coupling entries exist")]
    UnknownMaterial {
        index: usize,
        material: usize,
        available: usize,
    },

    #[error("Lattice bounding box {lattice:?} differs from the grid layout box {layout:?}")]
    BoxMismatch {
        lattice: [usize; 3],
        layout: [usize; 3],
    },

    #[error("{failed} of {partitions} partitions failed while {stage}")]
    PartitionFailed {
        stage: &'static str,
        failed: usize,
        partitions: usize,
    },

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Lattice(#[from] LatticeError),

    #[error(transparent)]
    Interaction(#[from] InteractionError),

    #[error(transparent)]
    Comm(#[from] CommError),
}

/// What a single call of [`MatVec::apply`] should compute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatVecRequest {
    /// Apply $\mathbf{A}^H$ instead of $\mathbf{A}$.
    pub hermitian: bool,
    /// Also return $\lVert\mathbf{y}\rVert^2$ summed over all partitions.
    pub inner_product: bool,
}

/// Accumulated performance counters of one operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatVecStats {
    /// Number of completed calls.
    pub invocations: u64,
    /// Wall time of all calls, in seconds.
    pub wall_time: f64,
    /// Part of `wall_time` spent in collective communication, in seconds.
    pub comm_time: f64,
}

impl MatVecStats {
    pub fn record(&mut self, wall: Duration, comm: Duration) {
        self.invocations += 1;
        self.wall_time += wall.as_secs_f64();
        self.comm_time += comm.as_secs_f64();
    }

    /// Mean wall time per call, in seconds.
    pub fn mean_time(&self) -> f64 {
        if self.invocations == 0 {
            0.0
        } else {
            self.wall_time / self.invocations as f64
        }
    }
}

/// A distributed linear operator applied to the local part of a vector.
pub trait MatVec {
    /// Short name for reports.
    fn name(&self) -> &str;

    /// Length of the local part of the argument and result vectors
    /// (three entries per owned dipole).
    fn local_len(&self) -> usize;

    /// Compute `resultvec = A x` (or `A^H x`) for the local part `argvec`.
    ///
    /// `argvec` is never modified. Returns the global squared norm of the
    /// result when `request.inner_product` is set. Every failure is reported
    /// before `resultvec` is touched, except a communication failure in the
    /// middle of the call, which leaves it unspecified.
    fn apply(
        &mut self,
        argvec: &[Complex64],
        resultvec: &mut [Complex64],
        request: MatVecRequest,
    ) -> Result<Option<f64>, MatVecError>;

    /// Counters accumulated since construction.
    fn stats(&self) -> &MatVecStats;
}

/// Strategy used for the interaction operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    /// FFT convolution on the padded grid.
    #[default]
    Fft,
    /// Explicit pairwise sum.
    Direct,
}

/// Run-mode settings of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorOptions {
    /// Whether callers may request the inner product.
    #[serde(default = "default_true")]
    pub inner_product_supported: bool,
    /// Only estimate memory, without building anything.
    #[serde(default)]
    pub prognosis: bool,
}

fn default_true() -> bool {
    true
}

impl Default for OperatorOptions {
    fn default() -> Self {
        Self {
            inner_product_supported: true,
            prognosis: false,
        }
    }
}

/// Per-partition memory needed by an operator, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEstimate {
    /// Interaction kernel(s), kept for the lifetime of the operator.
    pub kernel: usize,
    /// Scratch buffers of every call.
    pub matvec_buffers: usize,
    /// Exchange buffers of the collectives.
    pub comm_buffers: usize,
    /// Transient buffers of the kernel build, released before the first call.
    pub build_transient: usize,
}

impl MemoryEstimate {
    /// Memory held between calls.
    pub fn steady(&self) -> usize {
        self.kernel + self.matvec_buffers + self.comm_buffers
    }

    /// Largest amount held at any time.
    pub fn peak(&self) -> usize {
        self.kernel + self.build_transient.max(self.matvec_buffers + self.comm_buffers)
    }
}

/// Result of an operator constructor: either the operator, or only its
/// memory estimate when a prognosis was requested.
#[derive(Debug)]
pub enum InitOutcome<T> {
    Prognosis(MemoryEstimate),
    Ready(T),
}

impl<T> InitOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> InitOutcome<U> {
        match self {
            InitOutcome::Prognosis(m) => InitOutcome::Prognosis(m),
            InitOutcome::Ready(op) => InitOutcome::Ready(f(op)),
        }
    }

    /// The operator, if one was built.
    pub fn ready(self) -> Option<T> {
        match self {
            InitOutcome::Ready(op) => Some(op),
            InitOutcome::Prognosis(_) => None,
        }
    }
}

/// Everything an operator is built from. Nothing here changes during a run.
#[derive(Debug, Clone)]
pub struct Problem<'a> {
    pub layout: &'a GridLayout,
    pub lattice: &'a DipoleLattice,
    pub coupling: &'a CouplingTable,
    pub params: &'a PhysicsParams,
    /// Near-field integrals of the second-order term.
    pub tables: Option<Arc<IntegralTables>>,
}

/// Build the operator selected by `kind`.
pub fn build_operator<C: Communicator + 'static>(
    kind: OperatorKind,
    comm: C,
    problem: &Problem<'_>,
    options: OperatorOptions,
) -> Result<InitOutcome<Box<dyn MatVec>>, MatVecError> {
    Ok(match kind {
        OperatorKind::Fft => DenseFftOperator::init(comm, problem, options)?
            .map(|op| Box::new(op) as Box<dyn MatVec>),
        OperatorKind::Direct => DirectOperator::init(comm, problem, options)?
            .map(|op| Box::new(op) as Box<dyn MatVec>),
    })
}

/// The dipoles in a range of z layers, with their coupling factors.
#[derive(Debug, Clone)]
pub(crate) struct LocalDipoles {
    pub positions: Vec<[usize; 3]>,
    pub cc_sqrt: Vec<[Complex64; 3]>,
}

impl LocalDipoles {
    /// Dipoles with `z` in `z_layers`.
    pub fn new(problem: &Problem<'_>, z_layers: Range<usize>) -> Result<Self, MatVecError> {
        let range = problem.lattice.z_range(z_layers.start, z_layers.end);
        let positions = problem.lattice.positions()[range.clone()].to_vec();
        let cc_sqrt = coupling_of(problem, range)?;
        Ok(Self {
            positions,
            cc_sqrt,
        })
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }
}

/// Coupling factors of the dipoles in `range`.
pub(crate) fn coupling_of(
    problem: &Problem<'_>,
    range: Range<usize>,
) -> Result<Vec<[Complex64; 3]>, MatVecError> {
    let materials = problem.lattice.materials();
    range
        .map(|index| {
            let material = materials[index];
            problem
                .coupling
                .get(material)
                .copied()
                .ok_or(MatVecError::UnknownMaterial {
                    index,
                    material,
                    available: problem.coupling.len(),
                })
        })
        .collect()
}

/// Checks shared by both operators: the communicator matches the layout, the
/// lattice fits the grid and every material has a coupling entry.
///
/// Only global data is inspected, so every partition returns the same result.
pub(crate) fn check_problem<C: Communicator>(
    comm: &C,
    problem: &Problem<'_>,
) -> Result<(), MatVecError> {
    let layout = problem.layout;
    if comm.size() != layout.nprocs() || comm.rank() != layout.rank() {
        return Err(MatVecError::Config(format!(
            "communicator is partition {} of {}, but the grid layout was built for partition {} of {}",
            comm.rank(),
            comm.size(),
            layout.rank(),
            layout.nprocs()
        )));
    }
    if problem.lattice.box_dims() != layout.box_dims() {
        return Err(MatVecError::BoxMismatch {
            lattice: problem.lattice.box_dims(),
            layout: layout.box_dims(),
        });
    }
    let available = problem.coupling.len();
    let materials = problem.lattice.materials();
    if let Some(index) = materials.iter().position(|&m| m >= available) {
        return Err(MatVecError::UnknownMaterial {
            index,
            material: materials[index],
            available,
        });
    }
    if problem.params.interaction == InteractionKind::SecondOrder {
        if !problem.coupling.is_isotropic() {
            return Err(InteractionError::Anisotropic.into());
        }
        if problem.coupling.len() != 1 {
            return Err(InteractionError::MultipleIndices(problem.coupling.len()).into());
        }
    }
    Ok(())
}

/// Agree on the outcome of a local computation before the next collective.
///
/// A partition whose own step succeeded returns
/// [`MatVecError::PartitionFailed`] when any other partition failed, so no
/// partition is left waiting in a later exchange.
pub(crate) fn agree<C: Communicator, T>(
    comm: &C,
    stage: &'static str,
    local: Result<T, MatVecError>,
) -> Result<T, MatVecError> {
    let flag = if local.is_err() { 1.0 } else { 0.0 };
    let failed = comm.all_reduce_sum(flag)?.round() as usize;
    match local {
        Ok(_) if failed > 0 => Err(MatVecError::PartitionFailed {
            stage,
            failed,
            partitions: comm.size(),
        }),
        other => other,
    }
}

/// Check the vector lengths of one call against the local dipole count.
pub(crate) fn check_lengths(
    local_len: usize,
    argvec: &[Complex64],
    resultvec: &[Complex64],
) -> Result<(), MatVecError> {
    for actual in [argvec.len(), resultvec.len()] {
        if actual != local_len {
            return Err(MatVecError::LengthMismatch {
                expected: local_len,
                actual,
            });
        }
    }
    Ok(())
}
