//! Pairwise interaction operator.
//!
//! Every partition gathers the full argument vector and sums the interaction
//! of each of its dipoles with all others:
//!
//! $$y_i = x_i - \mathbf{S}_i \sum_{j \neq i} \mathbf{G}(\mathbf{r}_i - \mathbf{r}_j)\,
//!   \mathbf{S}_j x_j$$
//!
//! $O(N^2)$ per call and no grid, so it works for any layout.

use std::ops::Range;
use std::time::{Duration, Instant};

use dipolar_compute::Communicator;
use ndarray::Array2;
use num_complex::Complex64;
use rayon::prelude::*;

use super::{
    agree, check_lengths, check_problem, coupling_of, InitOutcome, MatVec, MatVecError, MatVecRequest,
    MatVecStats, MemoryEstimate, OperatorOptions, Problem,
};
use crate::interaction::InteractionTerm;
use crate::types::{sym_mat_vec, SymTensor, SYM_PAIRS};

/// Interaction operator evaluated by explicit summation over pairs.
pub struct DirectOperator<C: Communicator> {
    comm: C,
    term: InteractionTerm,
    positions: Vec<[usize; 3]>,
    cc_sqrt: Vec<[Complex64; 3]>,
    /// Dipoles owned by this partition.
    local: Range<usize>,
    /// Vector entries owned by each partition.
    counts: Vec<usize>,
    local_arg: Vec<Complex64>,
    full_arg: Vec<Complex64>,
    /// Result rows, copied out once every partition has succeeded.
    local_out: Vec<Complex64>,
    options: OperatorOptions,
    stats: MatVecStats,
}

impl<C: Communicator> DirectOperator<C> {
    /// Validate the problem and set up the gather of the argument vector.
    ///
    /// The dipoles are partitioned by z layer exactly as for the FFT
    /// operator, so both accept the same local vectors.
    pub fn init(
        comm: C,
        problem: &Problem<'_>,
        options: OperatorOptions,
    ) -> Result<InitOutcome<Self>, MatVecError> {
        check_problem(&comm, problem)?;
        let term = InteractionTerm::new(problem.params, problem.tables.clone())?;
        let layout = problem.layout;
        term.check_box(layout.box_dims())?;
        let lattice = problem.lattice;
        let n = lattice.len();
        let local_z = layout.local_z();
        let local = lattice.z_range(local_z.start, local_z.end);

        // gathered argument plus the local argument and result rows
        let memory = MemoryEstimate {
            matvec_buffers: (3 * n + 6 * local.len()) * std::mem::size_of::<Complex64>(),
            ..MemoryEstimate::default()
        };
        if comm.is_root() {
            log::info!(
                "Direct interaction operator for {} dipoles on {} partition(s)",
                n,
                layout.nprocs()
            );
        }
        if options.prognosis {
            return Ok(InitOutcome::Prognosis(memory));
        }

        let lnz = layout.local_nz();
        let counts = (0..layout.nprocs())
            .map(|p| 3 * lattice.z_range(p * lnz, (p + 1) * lnz).len())
            .collect();
        let cc_sqrt = coupling_of(problem, 0..n)?;

        Ok(InitOutcome::Ready(Self {
            comm,
            term,
            positions: lattice.positions().to_vec(),
            cc_sqrt,
            local_arg: vec![Complex64::default(); 3 * local.len()],
            full_arg: vec![Complex64::default(); 3 * n],
            local_out: vec![Complex64::default(); 3 * local.len()],
            local,
            counts,
            options,
            stats: MatVecStats::default(),
        }))
    }

    /// Rows of the interaction matrix owned by this partition.
    ///
    /// The block `(i, j)` is $\delta_{ij}\mathbf{I} - \mathbf{S}_i
    /// \mathbf{G}(\mathbf{r}_i - \mathbf{r}_j) \mathbf{S}_j$. Only sensible
    /// for small systems: the result holds $3N_{local} \times 3N$ entries.
    pub fn assemble_local(&self) -> Result<Array2<Complex64>, MatVecError> {
        let n = self.positions.len();
        let mut matrix = Array2::<Complex64>::zeros((3 * self.local.len(), 3 * n));
        for (row, i) in self.local.clone().enumerate() {
            for a in 0..3 {
                matrix[[3 * row + a, 3 * i + a]] = Complex64::new(1.0, 0.0);
            }
            for j in (0..n).filter(|&j| j != i) {
                let g = pair(&self.term, &self.positions, i, j, false)?;
                let (ci, cj) = (self.cc_sqrt[i], self.cc_sqrt[j]);
                for (c, &(mu, nu)) in SYM_PAIRS.iter().enumerate() {
                    matrix[[3 * row + mu, 3 * j + nu]] = -ci[mu] * g[c] * cj[nu];
                    if mu != nu {
                        matrix[[3 * row + nu, 3 * j + mu]] = -ci[nu] * g[c] * cj[mu];
                    }
                }
            }
        }
        Ok(matrix)
    }

    /// Drop the gathered vectors; returns the communicator and the counters.
    pub fn release(self) -> (C, MatVecStats) {
        (self.comm, self.stats)
    }
}

/// Tensor coupling dipole `j` into dipole `i`; `transposed` swaps the roles.
fn pair(
    term: &InteractionTerm,
    positions: &[[usize; 3]],
    i: usize,
    j: usize,
    transposed: bool,
) -> Result<SymTensor, MatVecError> {
    let (pi, pj) = (positions[i], positions[j]);
    let d = |a: usize| pi[a] as i64 - pj[a] as i64;
    let (x, y, z) = (d(0), d(1), d(2));
    Ok(if transposed {
        term.evaluate(-x, -y, -z)?
    } else {
        term.evaluate(x, y, z)?
    })
}

impl<C: Communicator> MatVec for DirectOperator<C> {
    fn name(&self) -> &str {
        "direct"
    }

    fn local_len(&self) -> usize {
        3 * self.local.len()
    }

    fn apply(
        &mut self,
        argvec: &[Complex64],
        resultvec: &mut [Complex64],
        request: MatVecRequest,
    ) -> Result<Option<f64>, MatVecError> {
        if request.inner_product && !self.options.inner_product_supported {
            return Err(MatVecError::InnerProductUnsupported);
        }
        check_lengths(self.local_len(), argvec, resultvec)?;
        let started = Instant::now();
        let hermitian = request.hermitian;

        for (dst, src) in self.local_arg.iter_mut().zip(argvec) {
            *dst = if hermitian { src.conj() } else { *src };
        }
        let gathered_at = Instant::now();
        self.comm
            .all_gather_varcount(&self.local_arg, &self.counts, &mut self.full_arg)?;
        let mut comm_time: Duration = gathered_at.elapsed();

        let (term, positions, cc_sqrt) = (&self.term, &self.positions, &self.cc_sqrt);
        let (full_arg, start) = (&self.full_arg, self.local.start);
        let summed = self
            .local_out
            .par_chunks_mut(3)
            .enumerate()
            .try_for_each(|(n, out)| -> Result<(), MatVecError> {
                let i = start + n;
                let mut acc = [Complex64::default(); 3];
                for j in (0..positions.len()).filter(|&j| j != i) {
                    let g = pair(term, positions, i, j, hermitian)?;
                    let cj = cc_sqrt[j];
                    let v = [
                        cj[0] * full_arg[3 * j],
                        cj[1] * full_arg[3 * j + 1],
                        cj[2] * full_arg[3 * j + 2],
                    ];
                    let f = sym_mat_vec(&g, &v);
                    for a in 0..3 {
                        acc[a] += f[a];
                    }
                }
                let ci = cc_sqrt[i];
                for a in 0..3 {
                    let r = full_arg[3 * i + a] - ci[a] * acc[a];
                    out[a] = if hermitian { r.conj() } else { r };
                }
                Ok(())
            });
        let agreed_at = Instant::now();
        let summed = agree(&self.comm, "summing pair interactions", summed);
        comm_time += agreed_at.elapsed();
        summed?;
        resultvec.copy_from_slice(&self.local_out);

        let inner = if request.inner_product {
            let norm: f64 = resultvec.iter().map(|v| v.norm_sqr()).sum();
            let reduced_at = Instant::now();
            let total = self.comm.all_reduce_sum(norm)?;
            comm_time += reduced_at.elapsed();
            Some(total)
        } else {
            None
        };
        self.stats.record(started.elapsed(), comm_time);
        Ok(inner)
    }

    fn stats(&self) -> &MatVecStats {
        &self.stats
    }
}
