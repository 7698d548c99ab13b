//! Communicator trait and partition abstraction.
//!
//! The [`Communicator`] trait abstracts over the transport used between the
//! cooperating partitions of an SPMD run (single process, in-process threads,
//! MPI ranks) so that the numerical code in `dipolar-core` stays independent
//! of how data actually moves.
//!
//! Every method is a *collective*: all partitions must call the same sequence
//! of collectives in the same order, and each call blocks until the exchange
//! completes.

use num_complex::Complex64;
use thiserror::Error;

/// Errors originating from communication backends.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("Backend not available: {0}")]
    Unavailable(String),

    #[error("Buffer size mismatch in {op}: expected {expected} elements, got {actual}")]
    SizeMismatch {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Partition {rank} left the collective: {reason}")]
    Disconnected { rank: usize, reason: String },
}

/// The type of communication backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommKind {
    Serial,
    Threaded,
    Mpi,
}

/// Describes a communicator instance.
#[derive(Debug, Clone)]
pub struct CommInfo {
    pub name: String,
    pub kind: CommKind,
    pub rank: usize,
    pub size: usize,
}

/// Collective operations needed by the interaction operator.
///
/// Implementations must be usable from the thread that owns the partition;
/// they need not be shareable between partitions or even between threads.
pub trait Communicator {
    /// Return information about the communicator.
    fn info(&self) -> CommInfo;

    /// Index of the calling partition, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of cooperating partitions.
    fn size(&self) -> usize;

    /// Whether this partition is responsible for global reports.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Exchange equally sized blocks between all partitions.
    ///
    /// `send` is split into `size()` contiguous blocks of equal length; block
    /// `p` is delivered to partition `p`. The block received from partition
    /// `p` is written to block `p` of `recv`.
    fn all_to_all(&self, send: &[Complex64], recv: &mut [Complex64]) -> Result<(), CommError>;

    /// Sum a scalar over all partitions; every partition receives the total.
    fn all_reduce_sum(&self, value: f64) -> Result<f64, CommError>;

    /// Concatenate variable-length contributions from every partition.
    ///
    /// `counts[p]` is the length contributed by partition `p`; the
    /// contributions are placed back to back in rank order in `out`.
    fn all_gather_varcount(
        &self,
        local: &[Complex64],
        counts: &[usize],
        out: &mut [Complex64],
    ) -> Result<(), CommError>;
}

/// Validate the shape of an `all_to_all` call and return the block length.
pub(crate) fn block_len(
    send: &[Complex64],
    recv: &[Complex64],
    size: usize,
) -> Result<usize, CommError> {
    if send.len() != recv.len() {
        return Err(CommError::SizeMismatch {
            op: "all_to_all",
            expected: send.len(),
            actual: recv.len(),
        });
    }
    if send.len() % size != 0 {
        return Err(CommError::SizeMismatch {
            op: "all_to_all",
            expected: size * (send.len() / size + 1),
            actual: send.len(),
        });
    }
    Ok(send.len() / size)
}

/// Validate the shape of an `all_gather_varcount` call.
pub(crate) fn check_gather(
    local: &[Complex64],
    counts: &[usize],
    out: &[Complex64],
    rank: usize,
    size: usize,
) -> Result<(), CommError> {
    if counts.len() != size {
        return Err(CommError::SizeMismatch {
            op: "all_gather_varcount (counts)",
            expected: size,
            actual: counts.len(),
        });
    }
    if counts[rank] != local.len() {
        return Err(CommError::SizeMismatch {
            op: "all_gather_varcount (local)",
            expected: counts[rank],
            actual: local.len(),
        });
    }
    let total: usize = counts.iter().sum();
    if total != out.len() {
        return Err(CommError::SizeMismatch {
            op: "all_gather_varcount (out)",
            expected: total,
            actual: out.len(),
        });
    }
    Ok(())
}
