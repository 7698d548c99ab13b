//! Padded FFT grid, domain decomposition and index maps.
//!
//! The particle occupies a bounding box of `box_dims` cells. Convolution with
//! the interaction kernel is carried out on a zero-padded grid at least twice
//! as large on every axis, with sizes chosen so the transforms stay efficient.
//!
//! The grid is split between partitions along X (for the Y/Z stage of the
//! transforms) and along Z (for the dipoles and the X stage). The two block
//! transposes of [`crate::fft::transpose`] move data between these two
//! decompositions. After the forward transpose the X-split buffers are
//! *garbled*: each partition holds its own X range for every Z layer, but the
//! Z layers received from partition `p` are stored in the X segment that used
//! to belong to `p`. The `index_garbled_*` maps below encode this layout.

use thiserror::Error;

/// Errors in the grid shape or the partition count.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("At least one partition is required")]
    NoPartitions,

    #[error("Partition {rank} does not exist in a run of {nprocs}")]
    RankOutOfRange { rank: usize, nprocs: usize },

    #[error("Bounding box {0:?} has a zero extent")]
    EmptyBox([usize; 3]),

    #[error(
        "Specified number of partitions ({0}) is weird (has prime divisors larger than 13 or \
         more than one divisor of either 11 or 13); this is not supported without reduced FFT"
    )]
    WeirdPartitionCount(usize),

    #[error("Grid size {size} along {axis} is invalid: {reason}")]
    BadGridSize {
        axis: char,
        size: usize,
        reason: &'static str,
    },
}

const AXES: [char; 3] = ['X', 'Y', 'Z'];

/// Strip the prime factors the transform backend handles efficiently: any
/// power of 2, 3, 5 and 7, and a single factor of either 11 or 13.
fn strip_small_primes(mut y: usize) -> usize {
    if y == 0 {
        return 0;
    }
    for p in [2, 3, 5, 7] {
        while y % p == 0 {
            y /= p;
        }
    }
    if y % 11 == 0 {
        y /= 11;
    } else if y % 13 == 0 {
        y /= 13;
    }
    y
}

/// Whether `n` factorises into the allowed small primes.
pub fn is_fft_friendly(n: usize) -> bool {
    strip_small_primes(n) == 1
}

/// Smallest value `>= x` that is even, divisible by `divis` and factorises
/// into the allowed small primes.
pub fn fft_fit(x: usize, divis: usize) -> usize {
    let divis = divis.max(1);
    let mut x = x.max(2);
    loop {
        if x % 2 == 0 && x % divis == 0 && is_fft_friendly(x) {
            return x;
        }
        x += 1;
    }
}

/// Variant of [`fft_fit`] for weird partition counts: only evenness and
/// divisibility are enforced.
pub fn fft_fit_weird(x: usize, divis: usize) -> usize {
    let mut divis = divis.max(1);
    if divis % 2 != 0 {
        divis *= 2;
    }
    divis * x.max(1).div_ceil(divis)
}

/// Check the partition count against the allowed prime set.
///
/// Returns whether the count is weird. A weird count is an error for the
/// full kernel and only a loss of efficiency for the reduced one.
pub fn check_nprocs(nprocs: usize, reduced_fft: bool) -> Result<bool, GridError> {
    if nprocs == 0 {
        return Err(GridError::NoPartitions);
    }
    if is_fft_friendly(nprocs) {
        return Ok(false);
    }
    if !reduced_fft {
        return Err(GridError::WeirdPartitionCount(nprocs));
    }
    Ok(true)
}

/// Padded grid and the slice of it owned by one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridLayout {
    box_dims: [usize; 3],
    grid: [usize; 3],
    small_y: usize,
    small_z: usize,
    nprocs: usize,
    rank: usize,
    local_nx: usize,
    local_x0: usize,
    local_nz: usize,
    local_z0: usize,
    reduced_fft: bool,
    weird_nprocs: bool,
}

impl GridLayout {
    /// Choose the smallest admissible grid for a bounding box.
    pub fn new(
        box_dims: [usize; 3],
        nprocs: usize,
        rank: usize,
        reduced_fft: bool,
    ) -> Result<Self, GridError> {
        let weird = check_nprocs(nprocs, reduced_fft)?;
        let fit = if weird { fft_fit_weird } else { fft_fit };
        let grid = [
            fit(2 * box_dims[0], nprocs),
            fit(2 * box_dims[1], 1),
            fit(2 * box_dims[2], 2 * nprocs),
        ];
        Self::build(box_dims, grid, nprocs, rank, reduced_fft, weird)
    }

    /// Use an explicit grid, validated against the box and partition count.
    pub fn with_grid(
        box_dims: [usize; 3],
        grid: [usize; 3],
        nprocs: usize,
        rank: usize,
        reduced_fft: bool,
    ) -> Result<Self, GridError> {
        let weird = check_nprocs(nprocs, reduced_fft)?;
        let divisors = [nprocs, 1, 2 * nprocs];
        for a in 0..3 {
            let (axis, size) = (AXES[a], grid[a]);
            let bad = |reason| GridError::BadGridSize { axis, size, reason };
            if size < 2 * box_dims[a] {
                return Err(bad("smaller than twice the bounding box"));
            }
            if size % 2 != 0 {
                return Err(bad("not even"));
            }
            if size % divisors[a] != 0 {
                return Err(bad("not divisible by the partition count"));
            }
            if !weird && !is_fft_friendly(size) {
                return Err(bad("has prime factors outside 2, 3, 5, 7 and one of 11 or 13"));
            }
        }
        Self::build(box_dims, grid, nprocs, rank, reduced_fft, weird)
    }

    fn build(
        box_dims: [usize; 3],
        grid: [usize; 3],
        nprocs: usize,
        rank: usize,
        reduced_fft: bool,
        weird_nprocs: bool,
    ) -> Result<Self, GridError> {
        if box_dims.contains(&0) {
            return Err(GridError::EmptyBox(box_dims));
        }
        if rank >= nprocs {
            return Err(GridError::RankOutOfRange { rank, nprocs });
        }
        if weird_nprocs && rank == 0 {
            log::warn!(
                "Specified number of partitions ({}) is weird; transforms will be less efficient",
                nprocs
            );
        }

        let small_y = grid[1] / 2;
        let small_z = grid[2] / 2;
        let local_nx = grid[0] / nprocs;
        let local_nz = small_z / nprocs;
        Ok(Self {
            box_dims,
            grid,
            small_y,
            small_z,
            nprocs,
            rank,
            local_nx,
            local_x0: rank * local_nx,
            local_nz,
            local_z0: rank * local_nz,
            reduced_fft,
            weird_nprocs,
        })
    }

    pub fn box_dims(&self) -> [usize; 3] {
        self.box_dims
    }

    pub fn grid(&self) -> [usize; 3] {
        self.grid
    }

    pub fn small_y(&self) -> usize {
        self.small_y
    }

    pub fn small_z(&self) -> usize {
        self.small_z
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn reduced_fft(&self) -> bool {
        self.reduced_fft
    }

    pub fn weird_nprocs(&self) -> bool {
        self.weird_nprocs
    }

    /// Owned X range `[local_x0, local_x1)` of the Y/Z stage.
    pub fn local_x(&self) -> std::ops::Range<usize> {
        self.local_x0..self.local_x0 + self.local_nx
    }

    /// Owned Z range `[local_z0, local_z1)` of the dipoles and X stage.
    pub fn local_z(&self) -> std::ops::Range<usize> {
        self.local_z0..self.local_z0 + self.local_nz
    }

    pub fn local_nx(&self) -> usize {
        self.local_nx
    }

    pub fn local_nz(&self) -> usize {
        self.local_nz
    }

    pub fn grid_yz(&self) -> usize {
        self.grid[1] * self.grid[2]
    }

    /// Total number of grid cells, `None` on overflow.
    pub fn grid_cells(&self) -> Option<usize> {
        self.grid[0].checked_mul(self.grid[1])?.checked_mul(self.grid[2])
    }

    /// Length of one component of the local padded grid.
    pub fn local_nsmall(&self) -> usize {
        self.grid[0] * self.small_y * self.local_nz
    }

    /// Padded grid: rows along X for each (local z, y).
    #[inline]
    pub fn index_xmatrix(&self, x: usize, y: usize, z_local: usize) -> usize {
        (z_local * self.small_y + y) * self.grid[0] + x
    }

    /// Padded grid after the forward block transpose, addressed by local X
    /// and global Z.
    #[inline]
    pub fn index_garbled_x(&self, x_local: usize, y: usize, z: usize) -> usize {
        ((z % self.local_nz) * self.small_y + y) * self.grid[0]
            + (z / self.local_nz) * self.local_nx
            + x_local
    }

    /// Y/Z slice with rows along Z.
    #[inline]
    pub fn index_slice_yz(&self, y: usize, z: usize) -> usize {
        y * self.grid[2] + z
    }

    /// Y/Z slice with rows along Y (after the local transpose).
    #[inline]
    pub fn index_slice_zy(&self, y: usize, z: usize) -> usize {
        z * self.grid[1] + y
    }
}

/// Extents and index maps of the kernel build.
///
/// Displacements are evaluated over `[1 - box, box)` per axis. With the
/// reduced kernel only non-negative Y and Z displacements are evaluated and
/// stored; the rest follows by reflection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelShape {
    grid: [usize; 3],
    local_nx: usize,
    /// Stored half-extents of the final kernel.
    pub dsize_y: usize,
    pub dsize_z: usize,
    /// Extents of the displacement buffer before the transforms.
    pub d2size_y: usize,
    pub d2size_z: usize,
    /// Z layers of the displacement buffer per owned layer of the grid.
    pub nnn: usize,
    /// Z rows of the displacement buffer held by each partition.
    pub len_n: usize,
    /// First Y and Z displacement evaluated.
    pub jstart: i64,
    pub kstart: i64,
    /// First Z row of the displacement buffer held by this partition.
    pub k0: usize,
}

impl KernelShape {
    pub fn new(layout: &GridLayout) -> Self {
        let [_, by, bz] = layout.box_dims;
        let grid = layout.grid;
        let (d2size_y, d2size_z, dsize_y, dsize_z, nnn, jstart, kstart) = if layout.reduced_fft {
            (
                layout.small_y,
                layout.small_z,
                layout.small_y + 1,
                layout.small_z + 1,
                1,
                0,
                0,
            )
        } else {
            (
                grid[1],
                grid[2],
                grid[1],
                grid[2],
                2,
                1 - by as i64,
                1 - bz as i64,
            )
        };
        Self {
            grid,
            local_nx: layout.local_nx,
            dsize_y,
            dsize_z,
            d2size_y,
            d2size_z,
            nnn,
            len_n: nnn * layout.local_nz,
            jstart,
            kstart,
            k0: nnn * layout.local_z0,
        }
    }

    /// Cells of the stored kernel owned by this partition.
    pub fn kernel_cells(&self) -> Option<usize> {
        self.local_nx
            .checked_mul(self.dsize_y)?
            .checked_mul(self.dsize_z)
    }

    /// Cells of the local displacement buffer.
    pub fn d2_cells(&self) -> Option<usize> {
        self.grid[0]
            .checked_mul(self.d2size_y)?
            .checked_mul(self.len_n)
    }

    /// Stored kernel, with frequencies past the stored half folded back.
    #[inline]
    pub fn index_kernel(&self, x_local: usize, y: usize, z: usize) -> usize {
        let y = if y >= self.dsize_y { self.grid[1] - y } else { y };
        let z = if z >= self.dsize_z { self.grid[2] - z } else { z };
        (x_local * self.dsize_z + z) * self.dsize_y + y
    }

    /// Displacement buffer, rows along X; `k_row` counts from [`Self::k0`].
    #[inline]
    pub fn index_d2(&self, i: i64, j: i64, k_row: usize) -> usize {
        let i = wrap(i, self.grid[0]);
        let j = wrap(j, self.d2size_y);
        (k_row * self.d2size_y + j) * self.grid[0] + i
    }

    /// Displacement buffer after the forward block transpose.
    #[inline]
    pub fn index_garbled_d(&self, x_local: usize, j: i64, k: i64) -> usize {
        let j = wrap(j, self.d2size_y);
        let k = wrap(k, self.d2size_z);
        ((k % self.len_n) * self.d2size_y + j) * self.grid[0]
            + (k / self.len_n) * self.local_nx
            + x_local
    }

    /// Full Y/Z slice, rows along Z, negative displacements wrapped.
    #[inline]
    pub fn index_slice(&self, y: i64, z: i64) -> usize {
        wrap(y, self.grid[1]) * self.grid[2] + wrap(z, self.grid[2])
    }
}

/// Map a displacement in `(-n, n)` to its periodic image in `[0, n)`.
#[inline]
fn wrap(v: i64, n: usize) -> usize {
    if v < 0 {
        (v + n as i64) as usize
    } else {
        v as usize
    }
}
