//! Fourier transform of the interaction tensor on the padded grid.
//!
//! The tensor is evaluated once for every lattice displacement the particle
//! can produce, transformed along X, redistributed between partitions,
//! transformed along Z and Y slice by slice, and stored scaled by $-1/N$
//! with $N$ the number of grid cells. The sign turns the convolution into
//! the $-\mathbf{S}\mathbf{G}\mathbf{S}$ part of the operator, the scale
//! undoes the unnormalised forward/backward transform pair.
//!
//! With the reduced kernel only non-negative Y and Z displacements are
//! evaluated; the rest is filled by reflection, and only the lower half of
//! the Y and Z frequencies is stored. A reflection in Y flips the sign of the
//! `xy` and `yz` components, one in Z that of `xz` and `yz`.

use std::time::{Duration, Instant};

use dipolar_compute::Communicator;
use num_complex::Complex64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{agree, MatVecError, MemoryEstimate};
use crate::fft::{transpose_blocked, Axis, AxisTransforms, BlockTranspose, Direction};
use crate::grid::{GridLayout, KernelShape};
use crate::interaction::InteractionTerm;
use crate::types::{SymTensor, NDCOMP};

const ELEM: usize = std::mem::size_of::<Complex64>();

/// Sign of each component under a reflection of the Y axis.
const FLIP_Y: [f64; NDCOMP] = [1.0, -1.0, 1.0, 1.0, -1.0, 1.0];
/// Sign of each component under a reflection of the Z axis.
const FLIP_Z: [f64; NDCOMP] = [1.0, 1.0, -1.0, 1.0, -1.0, 1.0];

/// Timings of one kernel build, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelStats {
    /// Evaluation of the interaction term.
    pub evaluation_time: f64,
    /// Transforms and local rearrangement.
    pub transform_time: f64,
    /// Block transposes between partitions.
    pub comm_time: f64,
}

impl KernelStats {
    /// Add the timings of another build (the mirrored kernel).
    pub fn merge(&mut self, other: &KernelStats) {
        self.evaluation_time += other.evaluation_time;
        self.transform_time += other.transform_time;
        self.comm_time += other.comm_time;
    }
}

/// Transformed interaction tensor for the X range owned by one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    data: Vec<Complex64>,
    shape: KernelShape,
    reduced: bool,
    small_y: usize,
    small_z: usize,
}

impl Kernel {
    /// Tensor at local X frequency `x_local` and grid frequencies `(y, z)`,
    /// with the reflection signs applied past the stored half.
    #[inline]
    pub fn lookup(&self, x_local: usize, y: usize, z: usize) -> SymTensor {
        let base = NDCOMP * self.shape.index_kernel(x_local, y, z);
        let mut t = [Complex64::default(); NDCOMP];
        t.copy_from_slice(&self.data[base..base + NDCOMP]);
        if self.reduced {
            let (fy, fz) = (y > self.small_y, z > self.small_z);
            if fy {
                t[1] = -t[1];
                if fz {
                    t[2] = -t[2];
                } else {
                    t[4] = -t[4];
                }
            } else if fz {
                t[2] = -t[2];
                t[4] = -t[4];
            }
        }
        t
    }

    /// Stored values, six components per cell.
    pub fn as_slice(&self) -> &[Complex64] {
        &self.data
    }

    pub fn shape(&self) -> &KernelShape {
        &self.shape
    }

    pub fn is_reduced(&self) -> bool {
        self.reduced
    }

    pub fn bytes(&self) -> usize {
        self.data.len() * ELEM
    }
}

fn overflow(what: &'static str, factors: &[usize]) -> MatVecError {
    MatVecError::SizeOverflow {
        what,
        factors: factors.to_vec(),
    }
}

fn checked_product(what: &'static str, factors: &[usize]) -> Result<usize, MatVecError> {
    factors
        .iter()
        .try_fold(1usize, |acc, &f| acc.checked_mul(f))
        .ok_or_else(|| overflow(what, factors))
}

/// Memory needed by the dense operator on one partition.
///
/// `transposed` adds a second kernel for the Hermitian product of a
/// non-reciprocal interaction term.
pub fn estimate_memory(layout: &GridLayout, transposed: bool) -> Result<MemoryEstimate, MatVecError> {
    let shape = KernelShape::new(layout);
    let [gx, gy, gz] = layout.grid();
    let nkernels = if transposed { 2 } else { 1 };
    let distributed = layout.nprocs() > 1;

    let kernel = checked_product(
        "interaction kernel",
        &[nkernels, NDCOMP, layout.local_nx(), shape.dsize_y, shape.dsize_z, ELEM],
    )?;
    let xmatrix = checked_product(
        "padded grid",
        &[3, gx, layout.small_y(), layout.local_nz(), ELEM],
    )?;
    let slices = checked_product("Y/Z slices", &[2, 3, gy, gz, ELEM])?;
    let comm_buffers = if distributed { 2 * xmatrix } else { 0 };

    let d2 = checked_product(
        "displacement buffer",
        &[NDCOMP, gx, shape.d2size_y, shape.len_n, ELEM],
    )?;
    let component = d2 / NDCOMP;
    let build_slices = checked_product("kernel slices", &[2, gy, gz, ELEM])?;
    let build_comm = if distributed { 2 * component } else { 0 };

    Ok(MemoryEstimate {
        kernel,
        matvec_buffers: xmatrix + slices,
        comm_buffers,
        build_transient: d2 + component + build_comm + build_slices * rayon::current_num_threads(),
    })
}

/// Build the kernel for the X range owned by the calling partition.
///
/// With `mirrored` the tensor is evaluated at the negated displacement,
/// which gives the kernel of the transposed operator. This is a collective
/// call when the layout has more than one partition.
pub fn build_kernel<C: Communicator>(
    comm: &C,
    layout: &GridLayout,
    term: &InteractionTerm,
    transforms: &AxisTransforms,
    mirrored: bool,
) -> Result<(Kernel, KernelStats), MatVecError> {
    let shape = KernelShape::new(layout);
    let [gx, gy, gz] = layout.grid();
    let [bx, by, bz] = layout.box_dims().map(|b| b as i64);
    let small_z = layout.small_z();
    let lnx = layout.local_nx();
    let reduced = layout.reduced_fft();
    let mut stats = KernelStats::default();

    let d2_cells = shape
        .d2_cells()
        .ok_or_else(|| overflow("displacement buffer", &[gx, shape.d2size_y, shape.len_n]))?;
    let kernel_len = shape
        .kernel_cells()
        .and_then(|c| c.checked_mul(NDCOMP))
        .ok_or_else(|| {
            overflow(
                "interaction kernel",
                &[NDCOMP, lnx, shape.dsize_y, shape.dsize_z],
            )
        })?;
    let grid_cells = layout
        .grid_cells()
        .ok_or_else(|| overflow("grid", &[gx, gy, gz]))?;

    // Tensor at every displacement, one z row of the buffer at a time
    let started = Instant::now();
    let plane = gx * shape.d2size_y;
    let mut d2 = vec![[Complex64::default(); NDCOMP]; d2_cells];
    let evaluated = d2
        .par_chunks_mut(plane)
        .enumerate()
        .try_for_each(|(k_row, cells)| -> Result<(), MatVecError> {
            let k = shape.k0 + k_row;
            let kcor = if k > small_z { k as i64 - gz as i64 } else { k as i64 };
            if kcor.abs() >= bz {
                return Ok(());
            }
            for j in shape.jstart..by {
                for i in 1 - bx..bx {
                    let g = if mirrored {
                        term.evaluate(-i, -j, -kcor)?
                    } else {
                        term.evaluate(i, j, kcor)?
                    };
                    cells[shape.index_d2(i, j, 0)] = g;
                }
            }
            Ok(())
        });
    stats.evaluation_time = started.elapsed().as_secs_f64();
    // every partition must reach the transposes, or none does
    let agreed_at = Instant::now();
    agree(comm, "evaluating the interaction term", evaluated)?;
    let mut comm_time = agreed_at.elapsed();

    let norm = Complex64::new(-1.0 / grid_cells as f64, 0.0);
    let cell_len = shape.dsize_y * shape.dsize_z;
    let mut data = vec![Complex64::default(); kernel_len];
    let mut component = vec![Complex64::default(); d2_cells];
    let mut transpose = BlockTranspose::new(if layout.nprocs() > 1 { d2_cells } else { 0 });
    let mut transform_time = Duration::ZERO;

    for comp in 0..NDCOMP {
        let started = Instant::now();
        for (dst, cell) in component.iter_mut().zip(&d2) {
            *dst = cell[comp];
        }
        transforms.rows(Axis::X, Direction::Forward, &mut component);
        transform_time += started.elapsed();

        comm_time += transpose.apply(comm, &mut component, gx, lnx)?;

        let started = Instant::now();
        let component = &component;
        data.par_chunks_mut(NDCOMP * cell_len)
            .enumerate()
            .for_each_init(
                || {
                    (
                        vec![Complex64::default(); gy * gz],
                        vec![Complex64::default(); gy * gz],
                    )
                },
                |(slice, slice_tr), (x_local, out)| {
                    slice.fill(Complex64::default());
                    for j in shape.jstart..by {
                        for k in shape.kstart..bz {
                            slice[shape.index_slice(j, k)] =
                                component[shape.index_garbled_d(x_local, j, k)];
                        }
                    }
                    if reduced {
                        for j in 1..by {
                            for k in 0..bz {
                                slice[shape.index_slice(-j, k)] =
                                    slice[shape.index_slice(j, k)] * FLIP_Y[comp];
                            }
                        }
                        for j in 1 - by..by {
                            for k in 1..bz {
                                slice[shape.index_slice(j, -k)] =
                                    slice[shape.index_slice(j, k)] * FLIP_Z[comp];
                            }
                        }
                    }
                    transforms.rows(Axis::Z, Direction::Forward, slice);
                    transpose_blocked(slice, slice_tr, gy, gz, 1);
                    transforms.rows(Axis::Y, Direction::Forward, slice_tr);

                    for z in 0..shape.dsize_z {
                        for y in 0..shape.dsize_y {
                            out[NDCOMP * (z * shape.dsize_y + y) + comp] = slice_tr[z * gy + y] * norm;
                        }
                    }
                },
            );
        transform_time += started.elapsed();
    }
    stats.transform_time = transform_time.as_secs_f64();
    stats.comm_time = comm_time.as_secs_f64();

    if comm.is_root() {
        log::debug!(
            "Kernel{} built: evaluation {:.3} s, transforms {:.3} s, communication {:.3} s",
            if mirrored { " (mirrored)" } else { "" },
            stats.evaluation_time,
            stats.transform_time,
            stats.comm_time
        );
    }

    Ok((
        Kernel {
            data,
            shape,
            reduced,
            small_y: layout.small_y(),
            small_z: layout.small_z(),
        },
        stats,
    ))
}
