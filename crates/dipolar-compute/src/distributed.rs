//! Distributed (MPI) communicator for HPC clusters.
//!
//! Each MPI rank is one partition. Complex buffers are exchanged as pairs of
//! `f64` through `bytemuck` casts, so no derived MPI datatype is needed.
//!
//! Gated behind the `mpi` feature flag.

use mpi::collective::SystemOperation;
use mpi::datatype::PartitionMut;
use mpi::topology::SimpleCommunicator;
use mpi::traits::{Communicator as MpiCommunicator, CommunicatorCollectives};
use mpi::Count;
use num_complex::Complex64;

use crate::comm::{block_len, check_gather, CommError, CommInfo, CommKind, Communicator};

/// Communicator backed by an MPI communicator (usually `world`).
pub struct MpiComm {
    comm: SimpleCommunicator,
    rank: usize,
    size: usize,
}

impl MpiComm {
    /// Wrap an initialised MPI communicator.
    pub fn new(comm: SimpleCommunicator) -> Self {
        let rank = comm.rank() as usize;
        let size = comm.size() as usize;
        Self { comm, rank, size }
    }

    fn to_count(&self, n: usize) -> Result<Count, CommError> {
        Count::try_from(2 * n).map_err(|_| {
            CommError::Unavailable(format!(
                "buffer of {n} complex values exceeds the MPI count range"
            ))
        })
    }
}

impl Communicator for MpiComm {
    fn info(&self) -> CommInfo {
        CommInfo {
            name: format!("MPI ({} ranks)", self.size),
            kind: CommKind::Mpi,
            rank: self.rank,
            size: self.size,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_to_all(&self, send: &[Complex64], recv: &mut [Complex64]) -> Result<(), CommError> {
        block_len(send, recv, self.size)?;
        let send_f64: &[f64] = bytemuck::cast_slice(send);
        let recv_f64: &mut [f64] = bytemuck::cast_slice_mut(recv);
        self.comm.all_to_all_into(send_f64, recv_f64);
        Ok(())
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64, CommError> {
        let mut total = 0.0_f64;
        self.comm
            .all_reduce_into(&value, &mut total, SystemOperation::sum());
        Ok(total)
    }

    fn all_gather_varcount(
        &self,
        local: &[Complex64],
        counts: &[usize],
        out: &mut [Complex64],
    ) -> Result<(), CommError> {
        check_gather(local, counts, out, self.rank, self.size)?;

        let counts_f64 = counts
            .iter()
            .map(|&c| self.to_count(c))
            .collect::<Result<Vec<Count>, _>>()?;
        let displs: Vec<Count> = counts_f64
            .iter()
            .scan(0, |acc, &c| {
                let d = *acc;
                *acc += c;
                Some(d)
            })
            .collect();

        let local_f64: &[f64] = bytemuck::cast_slice(local);
        let out_f64: &mut [f64] = bytemuck::cast_slice_mut(out);
        let mut partition = PartitionMut::new(out_f64, &counts_f64[..], &displs[..]);
        self.comm.all_gather_varcount_into(local_f64, &mut partition);
        Ok(())
    }
}
