//! Single-partition communicator: every collective is a local copy.

use num_complex::Complex64;

use crate::comm::{block_len, check_gather, CommError, CommInfo, CommKind, Communicator};

/// Communicator for a run with exactly one partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl SerialComm {
    pub fn new() -> Self {
        Self
    }
}

impl Communicator for SerialComm {
    fn info(&self) -> CommInfo {
        CommInfo {
            name: "serial".into(),
            kind: CommKind::Serial,
            rank: 0,
            size: 1,
        }
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_to_all(&self, send: &[Complex64], recv: &mut [Complex64]) -> Result<(), CommError> {
        block_len(send, recv, 1)?;
        recv.copy_from_slice(send);
        Ok(())
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64, CommError> {
        Ok(value)
    }

    fn all_gather_varcount(
        &self,
        local: &[Complex64],
        counts: &[usize],
        out: &mut [Complex64],
    ) -> Result<(), CommError> {
        check_gather(local, counts, out, 0, 1)?;
        out.copy_from_slice(local);
        Ok(())
    }
}
