//! FFT convolution operator.
//!
//! The coupled unknowns $\mathbf{S}\mathbf{x}$ are scattered onto the padded
//! grid, convolved with the interaction kernel in Fourier space and gathered
//! back. The transforms proceed axis by axis: X on the Z-split grid, a block
//! transpose to the X-split layout, then Z and Y one X slice at a time, with
//! the pointwise product in between.

use std::time::{Duration, Instant};

use dipolar_compute::Communicator;
use num_complex::Complex64;
use rayon::prelude::*;

use super::kernel::{build_kernel, estimate_memory, Kernel, KernelStats};
use super::{
    check_lengths, check_problem, InitOutcome, LocalDipoles, MatVec, MatVecError, MatVecRequest,
    MatVecStats, OperatorOptions, Problem,
};
use crate::fft::{transpose_blocked, Axis, AxisTransforms, BlockTranspose, Direction};
use crate::grid::GridLayout;
use crate::interaction::InteractionTerm;
use crate::params::InteractionKind;
use crate::types::sym_mat_vec;

/// Interaction operator evaluated by FFT convolution.
pub struct DenseFftOperator<C: Communicator> {
    comm: C,
    layout: GridLayout,
    transforms: AxisTransforms,
    kernel: Kernel,
    /// Kernel of the transposed operator, when it differs from `kernel`.
    kernel_tr: Option<Kernel>,
    kernel_stats: KernelStats,
    dipoles: LocalDipoles,
    options: OperatorOptions,
    xmatrix: Vec<Complex64>,
    slices: Vec<Complex64>,
    slices_tr: Vec<Complex64>,
    transpose: BlockTranspose,
    stats: MatVecStats,
}

impl<C: Communicator> DenseFftOperator<C> {
    /// Validate the problem, build the kernel and allocate the buffers.
    ///
    /// Collective over all partitions of `comm`. With `options.prognosis`
    /// only the memory estimate is returned and nothing is allocated.
    pub fn init(
        comm: C,
        problem: &Problem<'_>,
        options: OperatorOptions,
    ) -> Result<InitOutcome<Self>, MatVecError> {
        check_problem(&comm, problem)?;
        let layout = problem.layout.clone();
        let kind = problem.params.interaction;
        if layout.reduced_fft() && !kind.supports_reduced_fft() {
            return Err(MatVecError::Config(format!(
                "the {kind:?} interaction term is tabulated without axis reflection \
                 symmetry, the reduced kernel cannot be used"
            )));
        }
        let term = InteractionTerm::new(problem.params, problem.tables.clone())?;
        term.check_box(layout.box_dims())?;
        let dipoles = LocalDipoles::new(problem, layout.local_z())?;

        // On-axis second-order entries come from tables that need not be
        // symmetric under reflection, so the Hermitian product needs the
        // kernel of the mirrored displacements.
        let needs_transposed = kind == InteractionKind::SecondOrder;
        let memory = estimate_memory(&layout, needs_transposed)?;
        if comm.is_root() {
            log::info!(
                "FFT grid {:?} for box {:?} on {} partition(s){}",
                layout.grid(),
                layout.box_dims(),
                layout.nprocs(),
                if layout.reduced_fft() { ", reduced kernel" } else { "" }
            );
            log::info!(
                "Memory per partition: kernel {:.1} MB, buffers {:.1} MB, peak {:.1} MB",
                megabytes(memory.kernel),
                megabytes(memory.matvec_buffers + memory.comm_buffers),
                megabytes(memory.peak())
            );
        }
        if options.prognosis {
            return Ok(InitOutcome::Prognosis(memory));
        }

        let transforms = AxisTransforms::new(layout.grid());
        let (kernel, mut kernel_stats) = build_kernel(&comm, &layout, &term, &transforms, false)?;
        let kernel_tr = if needs_transposed {
            let (kernel_tr, stats) = build_kernel(&comm, &layout, &term, &transforms, true)?;
            kernel_stats.merge(&stats);
            Some(kernel_tr)
        } else {
            None
        };

        let nsmall = layout.local_nsmall();
        let gyz = layout.grid_yz();
        let transpose_len = if layout.nprocs() > 1 { 3 * nsmall } else { 0 };
        let transpose = BlockTranspose::new(transpose_len);
        if comm.is_root() {
            let kernel_bytes = kernel.bytes() + kernel_tr.as_ref().map_or(0, Kernel::bytes);
            log::debug!(
                "Allocated kernel {:.1} MB, exchange buffers {:.1} MB",
                megabytes(kernel_bytes),
                megabytes(transpose.bytes())
            );
        }
        Ok(InitOutcome::Ready(Self {
            comm,
            transforms,
            kernel,
            kernel_tr,
            kernel_stats,
            dipoles,
            options,
            xmatrix: vec![Complex64::default(); 3 * nsmall],
            slices: vec![Complex64::default(); 3 * gyz],
            slices_tr: vec![Complex64::default(); 3 * gyz],
            transpose,
            stats: MatVecStats::default(),
            layout,
        }))
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_stats(&self) -> &KernelStats {
        &self.kernel_stats
    }

    /// Free the kernel, buffers and plans; returns the communicator and the
    /// final counters.
    pub fn release(self) -> (C, MatVecStats) {
        if self.comm.is_root() {
            log::debug!(
                "Releasing FFT operator after {} call(s), {:.3} s in total",
                self.stats.invocations,
                self.stats.wall_time
            );
        }
        (self.comm, self.stats)
    }

    fn convolve(&mut self, hermitian: bool) -> Result<Duration, MatVecError> {
        let layout = &self.layout;
        let [gx, gy, gz] = layout.grid();
        let [_, by, bz] = layout.box_dims();
        let (small_y, lnx) = (layout.small_y(), layout.local_nx());
        let nsmall = layout.local_nsmall();
        let gyz = layout.grid_yz();
        let kernel = match (&self.kernel_tr, hermitian) {
            (Some(kernel_tr), true) => kernel_tr,
            _ => &self.kernel,
        };
        let mut comm_time = Duration::ZERO;

        let xmatrix = &mut self.xmatrix;
        self.transforms
            .leading_rows(Axis::X, Direction::Forward, xmatrix, small_y * gx, by);
        comm_time += self.transpose.apply(&self.comm, xmatrix, gx, lnx)?;

        let (slices, slices_tr) = (&mut self.slices, &mut self.slices_tr);
        for x in 0..lnx {
            slices.fill(Complex64::default());
            for a in 0..3 {
                for y in 0..by {
                    for z in 0..bz {
                        slices[a * gyz + layout.index_slice_yz(y, z)] =
                            xmatrix[a * nsmall + layout.index_garbled_x(x, y, z)];
                    }
                }
            }
            self.transforms
                .leading_rows(Axis::Z, Direction::Forward, slices, gyz, by);
            transpose_blocked(slices, slices_tr, gy, gz, 3);
            self.transforms.rows(Axis::Y, Direction::Forward, slices_tr);

            let (c0, rest) = slices_tr.split_at_mut(gyz);
            let (c1, c2) = rest.split_at_mut(gyz);
            c0.par_chunks_mut(gy)
                .zip(c1.par_chunks_mut(gy))
                .zip(c2.par_chunks_mut(gy))
                .enumerate()
                .for_each(|(z, ((r0, r1), r2))| {
                    for y in 0..gy {
                        let t = kernel.lookup(x, y, z);
                        let [v0, v1, v2] = sym_mat_vec(&t, &[r0[y], r1[y], r2[y]]);
                        r0[y] = v0;
                        r1[y] = v1;
                        r2[y] = v2;
                    }
                });

            self.transforms.rows(Axis::Y, Direction::Backward, slices_tr);
            transpose_blocked(slices_tr, slices, gz, gy, 3);
            self.transforms
                .leading_rows(Axis::Z, Direction::Backward, slices, gyz, by);
            for a in 0..3 {
                for y in 0..by {
                    for z in 0..bz {
                        xmatrix[a * nsmall + layout.index_garbled_x(x, y, z)] =
                            slices[a * gyz + layout.index_slice_yz(y, z)];
                    }
                }
            }
        }

        comm_time += self.transpose.apply(&self.comm, xmatrix, gx, lnx)?;
        self.transforms
            .leading_rows(Axis::X, Direction::Backward, xmatrix, small_y * gx, by);
        Ok(comm_time)
    }
}

impl<C: Communicator> MatVec for DenseFftOperator<C> {
    fn name(&self) -> &str {
        "fft"
    }

    fn local_len(&self) -> usize {
        3 * self.dipoles.len()
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
        let arg = |v: Complex64| if hermitian { v.conj() } else { v };

        let nsmall = self.layout.local_nsmall();
        let z0 = self.layout.local_z().start;
        self.xmatrix.fill(Complex64::default());
        for (n, (pos, cc)) in self.dipoles.positions.iter().zip(&self.dipoles.cc_sqrt).enumerate() {
            let cell = self.layout.index_xmatrix(pos[0], pos[1], pos[2] - z0);
            for a in 0..3 {
                self.xmatrix[a * nsmall + cell] = cc[a] * arg(argvec[3 * n + a]);
            }
        }

        let mut comm_time = self.convolve(hermitian)?;

        let mut norm = 0.0;
        for (n, (pos, cc)) in self.dipoles.positions.iter().zip(&self.dipoles.cc_sqrt).enumerate() {
            let cell = self.layout.index_xmatrix(pos[0], pos[1], pos[2] - z0);
            for a in 0..3 {
                let i = 3 * n + a;
                let r = arg(argvec[i]) + cc[a] * self.xmatrix[a * nsmall + cell];
                let r = if hermitian { r.conj() } else { r };
                norm += r.norm_sqr();
                resultvec[i] = r;
            }
        }

        let inner = if request.inner_product {
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

fn megabytes(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
