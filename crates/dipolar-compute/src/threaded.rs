//! In-process SPMD cluster: one partition per thread.
//!
//! [`ThreadComm::cluster`] returns one communicator per partition. Each one is
//! moved onto its own thread, and the collectives synchronise through a shared
//! barrier and per-partition mailboxes. This reproduces the blocking semantics
//! of a distributed run without an MPI installation, which is what the
//! multi-partition tests of the operator rely on.

use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use num_complex::Complex64;

use crate::comm::{block_len, check_gather, CommError, CommInfo, CommKind, Communicator};

struct Shared {
    size: usize,
    barrier: Barrier,
    mailboxes: Mutex<Vec<Vec<Complex64>>>,
    scalars: Mutex<Vec<f64>>,
}

/// Communicator for one partition of an in-process cluster.
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadComm {
    /// Create `size` connected communicators, indexed by rank.
    pub fn cluster(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "a cluster needs at least one partition");
        let shared = Arc::new(Shared {
            size,
            barrier: Barrier::new(size),
            mailboxes: Mutex::new(vec![Vec::new(); size]),
            scalars: Mutex::new(vec![0.0; size]),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn mailboxes(&self) -> Result<MutexGuard<'_, Vec<Vec<Complex64>>>, CommError> {
        self.shared
            .mailboxes
            .lock()
            .map_err(|e| self.disconnected(e.to_string()))
    }

    fn scalars(&self) -> Result<MutexGuard<'_, Vec<f64>>, CommError> {
        self.shared
            .scalars
            .lock()
            .map_err(|e| self.disconnected(e.to_string()))
    }

    fn disconnected(&self, reason: String) -> CommError {
        CommError::Disconnected {
            rank: self.rank,
            reason,
        }
    }

    /// Publish `data` in this partition's mailbox and wait for everybody else.
    fn post(&self, data: &[Complex64]) -> Result<(), CommError> {
        {
            let mut boxes = self.mailboxes()?;
            boxes[self.rank].clear();
            boxes[self.rank].extend_from_slice(data);
        }
        self.shared.barrier.wait();
        Ok(())
    }
}

impl Communicator for ThreadComm {
    fn info(&self) -> CommInfo {
        CommInfo {
            name: format!("threaded ({} partitions)", self.shared.size),
            kind: CommKind::Threaded,
            rank: self.rank,
            size: self.shared.size,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_to_all(&self, send: &[Complex64], recv: &mut [Complex64]) -> Result<(), CommError> {
        let block = block_len(send, recv, self.shared.size)?;
        self.post(send)?;

        let outcome = self.mailboxes().and_then(|boxes| {
            for (src, mailbox) in boxes.iter().enumerate() {
                if mailbox.len() != send.len() {
                    return Err(CommError::SizeMismatch {
                        op: "all_to_all",
                        expected: send.len(),
                        actual: mailbox.len(),
                    });
                }
                recv[src * block..(src + 1) * block]
                    .copy_from_slice(&mailbox[self.rank * block..(self.rank + 1) * block]);
            }
            Ok(())
        });

        // Nobody may overwrite a mailbox until every partition has read it.
        self.shared.barrier.wait();
        outcome
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64, CommError> {
        self.scalars()?[self.rank] = value;
        self.shared.barrier.wait();
        // Summed in rank order so every partition gets a bit-identical total.
        let total = self.scalars().map(|s| s.iter().sum());
        self.shared.barrier.wait();
        total
    }

    fn all_gather_varcount(
        &self,
        local: &[Complex64],
        counts: &[usize],
        out: &mut [Complex64],
    ) -> Result<(), CommError> {
        check_gather(local, counts, out, self.rank, self.shared.size)?;
        self.post(local)?;

        let outcome = self.mailboxes().and_then(|boxes| {
            let mut offset = 0;
            for (src, mailbox) in boxes.iter().enumerate() {
                if mailbox.len() != counts[src] {
                    return Err(CommError::SizeMismatch {
                        op: "all_gather_varcount",
                        expected: counts[src],
                        actual: mailbox.len(),
                    });
                }
                out[offset..offset + mailbox.len()].copy_from_slice(mailbox);
                offset += mailbox.len();
            }
            Ok(())
        });

        self.shared.barrier.wait();
        outcome
    }
}
