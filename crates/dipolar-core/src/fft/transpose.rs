//! Local and distributed transposes.

use std::time::{Duration, Instant};

use dipolar_compute::{CommError, Communicator};
use num_complex::Complex64;

/// Edge of the square tiles of the blocked transpose.
const BLOCK: usize = 64;

/// Transpose `lots` stacked `rows × cols` matrices from `src` into `dst`:
/// `dst[c * rows + r] = src[r * cols + c]` within each lot.
///
/// Works tile by tile so that both the reads and the writes stay within a
/// few cache lines on large slices.
pub fn transpose_blocked(
    src: &[Complex64],
    dst: &mut [Complex64],
    rows: usize,
    cols: usize,
    lots: usize,
) {
    let size = rows * cols;
    debug_assert!(src.len() >= lots * size && dst.len() >= lots * size);

    for lot in 0..lots {
        let s = &src[lot * size..(lot + 1) * size];
        let d = &mut dst[lot * size..(lot + 1) * size];
        for r0 in (0..rows).step_by(BLOCK) {
            let r1 = (r0 + BLOCK).min(rows);
            for c0 in (0..cols).step_by(BLOCK) {
                let c1 = (c0 + BLOCK).min(cols);
                for r in r0..r1 {
                    for c in c0..c1 {
                        d[c * rows + r] = s[r * cols + c];
                    }
                }
            }
        }
    }
}

/// Reusable exchange buffers for the block transpose across partitions.
///
/// The grid is stored as rows of `row_len` elements, each split into one
/// segment of `seg_len` per partition. The transpose sends segment `q` of
/// every row to partition `q` and stores what arrives from partition `p` in
/// segment `p`. Applying it twice restores the original layout.
#[derive(Debug, Default)]
pub struct BlockTranspose {
    send: Vec<Complex64>,
    recv: Vec<Complex64>,
}

impl BlockTranspose {
    /// Buffers for grids of `len` elements.
    pub fn new(len: usize) -> Self {
        Self {
            send: vec![Complex64::default(); len],
            recv: vec![Complex64::default(); len],
        }
    }

    /// Memory held by the buffers, in bytes.
    pub fn bytes(&self) -> usize {
        (self.send.capacity() + self.recv.capacity()) * std::mem::size_of::<Complex64>()
    }

    /// Exchange segments of `data` in place; returns the time spent in the
    /// collective itself.
    pub fn apply<C: Communicator>(
        &mut self,
        comm: &C,
        data: &mut [Complex64],
        row_len: usize,
        seg_len: usize,
    ) -> Result<Duration, CommError> {
        let nprocs = comm.size();
        if nprocs == 1 {
            return Ok(Duration::ZERO);
        }
        if data.len() != self.send.len() || row_len != nprocs * seg_len {
            return Err(CommError::SizeMismatch {
                op: "block transpose",
                expected: self.send.len(),
                actual: data.len(),
            });
        }

        let nrows = data.len() / row_len;
        let block = nrows * seg_len;
        for q in 0..nprocs {
            let out = &mut self.send[q * block..(q + 1) * block];
            for (r, dst) in out.chunks_exact_mut(seg_len).enumerate() {
                let start = r * row_len + q * seg_len;
                dst.copy_from_slice(&data[start..start + seg_len]);
            }
        }

        let started = Instant::now();
        comm.all_to_all(&self.send, &mut self.recv)?;
        let elapsed = started.elapsed();

        for p in 0..nprocs {
            let incoming = &self.recv[p * block..(p + 1) * block];
            for (r, src) in incoming.chunks_exact(seg_len).enumerate() {
                let start = r * row_len + p * seg_len;
                data[start..start + seg_len].copy_from_slice(src);
            }
        }
        Ok(elapsed)
    }
}
