//! Core types shared by the kernel build and both operators.
//!
//! The interaction tensor between two dipoles is symmetric, so only its six
//! independent entries are stored, in the order `xx, xy, xz, yy, yz, zz`.

use std::ops::Range;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of independent components of a symmetric 3×3 tensor.
pub const NDCOMP: usize = 6;

/// Packed symmetric 3×3 complex tensor.
pub type SymTensor = [Complex64; NDCOMP];

/// Axis pair `(mu, nu)` of each packed component.
pub const SYM_PAIRS: [(usize, usize); NDCOMP] = [(0, 0), (0, 1), (0, 2), (1, 1), (1, 2), (2, 2)];

/// Kronecker delta of each packed component.
pub const SYM_DELTA: [f64; NDCOMP] = [1.0, 0.0, 0.0, 1.0, 0.0, 1.0];

/// Multiply a packed symmetric tensor by a 3-vector.
#[inline]
pub fn sym_mat_vec(t: &SymTensor, v: &[Complex64; 3]) -> [Complex64; 3] {
    [
        t[0] * v[0] + t[1] * v[1] + t[2] * v[2],
        t[1] * v[0] + t[3] * v[1] + t[4] * v[2],
        t[2] * v[0] + t[4] * v[1] + t[5] * v[2],
    ]
}

/// Errors in the description of the dipole set.
#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("{positions} positions but {materials} material indices")]
    LengthMismatch { positions: usize, materials: usize },

    #[error("Dipole {index} at {position:?} lies outside the bounding box {box_dims:?}")]
    OutsideBox {
        index: usize,
        position: [usize; 3],
        box_dims: [usize; 3],
    },

    #[error("Dipole {index} breaks the ordering by z layer (z = {z} after z = {previous})")]
    Unsorted { index: usize, z: usize, previous: usize },

    #[error("Bounding box {0:?} has a zero extent")]
    EmptyBox([usize; 3]),
}

/// The occupied (non-void) cells of the particle.
///
/// Positions are integer lattice coordinates inside the bounding box. The
/// order of the dipoles defines the order of the unknown vector: dipole `n`
/// owns entries `3n..3n+3`. Dipoles must be ordered by z layer, so that the
/// subset owned by each partition is a contiguous run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DipoleLattice {
    box_dims: [usize; 3],
    positions: Vec<[usize; 3]>,
    materials: Vec<usize>,
}

impl DipoleLattice {
    /// Validate and wrap an explicit dipole set.
    pub fn new(
        box_dims: [usize; 3],
        positions: Vec<[usize; 3]>,
        materials: Vec<usize>,
    ) -> Result<Self, LatticeError> {
        if box_dims.contains(&0) {
            return Err(LatticeError::EmptyBox(box_dims));
        }
        if positions.len() != materials.len() {
            return Err(LatticeError::LengthMismatch {
                positions: positions.len(),
                materials: materials.len(),
            });
        }

        let mut previous = 0;
        for (index, p) in positions.iter().enumerate() {
            if (0..3).any(|a| p[a] >= box_dims[a]) {
                return Err(LatticeError::OutsideBox {
                    index,
                    position: *p,
                    box_dims,
                });
            }
            if p[2] < previous {
                return Err(LatticeError::Unsorted {
                    index,
                    z: p[2],
                    previous,
                });
            }
            previous = p[2];
        }

        Ok(Self {
            box_dims,
            positions,
            materials,
        })
    }

    /// Every cell of the bounding box, made of material 0, in z-major order.
    pub fn filled_box(box_dims: [usize; 3]) -> Result<Self, LatticeError> {
        let [bx, by, bz] = box_dims;
        let positions: Vec<[usize; 3]> = (0..bz)
            .flat_map(|z| (0..by).flat_map(move |y| (0..bx).map(move |x| [x, y, z])))
            .collect();
        let materials = vec![0; positions.len()];
        Self::new(box_dims, positions, materials)
    }

    pub fn box_dims(&self) -> [usize; 3] {
        self.box_dims
    }

    pub fn positions(&self) -> &[[usize; 3]] {
        &self.positions
    }

    pub fn materials(&self) -> &[usize] {
        &self.materials
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Indices of the dipoles whose z layer lies in `[z0, z1)`.
    pub fn z_range(&self, z0: usize, z1: usize) -> Range<usize> {
        let start = self.positions.partition_point(|p| p[2] < z0);
        let end = self.positions.partition_point(|p| p[2] < z1);
        start..end.max(start)
    }
}

/// Square roots of the per-axis coupling constants, one entry per material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouplingTable {
    cc_sqrt: Vec<[Complex64; 3]>,
}

impl CouplingTable {
    pub fn new(cc_sqrt: Vec<[Complex64; 3]>) -> Self {
        Self { cc_sqrt }
    }

    /// Isotropic materials: the same value on all three axes.
    pub fn isotropic(values: &[Complex64]) -> Self {
        Self {
            cc_sqrt: values.iter().map(|&v| [v, v, v]).collect(),
        }
    }

    pub fn get(&self, material: usize) -> Option<&[Complex64; 3]> {
        self.cc_sqrt.get(material)
    }

    pub fn len(&self) -> usize {
        self.cc_sqrt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cc_sqrt.is_empty()
    }

    /// True when every material couples the same way on all three axes.
    pub fn is_isotropic(&self) -> bool {
        self.cc_sqrt.iter().all(|[x, y, z]| x == y && y == z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sym_mat_vec_matches_full_matrix() {
        let t: SymTensor = std::array::from_fn(|c| Complex64::new(c as f64 + 1.0, 0.5 * c as f64));
        let v = [
            Complex64::new(1.0, -1.0),
            Complex64::new(0.0, 2.0),
            Complex64::new(-3.0, 0.5),
        ];
        let full = |mu: usize, nu: usize| {
            let c = SYM_PAIRS
                .iter()
                .position(|&(a, b)| (a, b) == (mu.min(nu), mu.max(nu)))
                .unwrap();
            t[c]
        };
        let out = sym_mat_vec(&t, &v);
        for mu in 0..3 {
            let expected: Complex64 = (0..3).map(|nu| full(mu, nu) * v[nu]).sum();
            assert_eq!(out[mu], expected);
        }
    }

    #[test]
    fn test_filled_box_is_z_major() {
        let lattice = DipoleLattice::filled_box([2, 3, 4]).unwrap();
        assert_eq!(lattice.len(), 24);
        assert_eq!(lattice.positions()[0], [0, 0, 0]);
        assert_eq!(lattice.positions()[1], [1, 0, 0]);
        assert_eq!(lattice.positions()[6], [0, 0, 1]);
        assert_eq!(lattice.z_range(1, 3), 6..18);
        assert_eq!(lattice.z_range(4, 8), 24..24);
    }

    #[test]
    fn test_new_rejects_bad_input() {
        assert!(matches!(
            DipoleLattice::new([2, 2, 2], vec![[0, 0, 2]], vec![0]),
            Err(LatticeError::OutsideBox { index: 0, .. })
        ));
        assert!(matches!(
            DipoleLattice::new([2, 2, 2], vec![[0, 0, 1], [0, 0, 0]], vec![0, 0]),
            Err(LatticeError::Unsorted { index: 1, .. })
        ));
        assert!(matches!(
            DipoleLattice::new([2, 2, 2], vec![[0, 0, 0]], vec![]),
            Err(LatticeError::LengthMismatch { .. })
        ));
        assert!(matches!(
            DipoleLattice::new([2, 0, 2], vec![], vec![]),
            Err(LatticeError::EmptyBox(_))
        ));
    }

    #[test]
    fn test_coupling_isotropy() {
        let a = Complex64::new(0.3, 0.1);
        assert!(CouplingTable::isotropic(&[a, 2.0 * a]).is_isotropic());
        assert!(!CouplingTable::new(vec![[a, a, a], [a, a, 2.0 * a]]).is_isotropic());
    }
}
