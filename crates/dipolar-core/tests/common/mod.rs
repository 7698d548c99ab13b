//! Shared fixtures of the operator tests.

#![allow(dead_code)]

use std::sync::Arc;

use dipolar_compute::{Communicator, SerialComm};
use dipolar_core::interaction::RawTables;
use dipolar_core::operator::{
    DenseFftOperator, DirectOperator, MatVec, MatVecRequest, OperatorOptions, Problem,
};
use dipolar_core::{
    CouplingTable, DipoleLattice, GridLayout, IntegralTables, InteractionKind, PhysicsParams,
};
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Random subset of the box cells, in z-major order, with two materials.
pub fn sparse_lattice(box_dims: [usize; 3], fill: f64, seed: u64) -> DipoleLattice {
    let mut rng = StdRng::seed_from_u64(seed);
    let [bx, by, bz] = box_dims;
    let mut positions = Vec::new();
    let mut materials = Vec::new();
    for z in 0..bz {
        for y in 0..by {
            for x in 0..bx {
                if rng.gen_bool(fill) {
                    positions.push([x, y, z]);
                    materials.push(rng.gen_range(0..2));
                }
            }
        }
    }
    DipoleLattice::new(box_dims, positions, materials).unwrap()
}

/// Coupling factors of two materials, one of them anisotropic.
pub fn coupling() -> CouplingTable {
    CouplingTable::new(vec![
        [Complex64::new(0.31, 0.04); 3],
        [
            Complex64::new(0.22, -0.07),
            Complex64::new(0.27, 0.02),
            Complex64::new(0.18, 0.11),
        ],
    ])
}

pub fn physics(kind: InteractionKind) -> PhysicsParams {
    PhysicsParams {
        wavenumber: 1.0,
        lattice_spacing: 0.4,
        interaction: kind,
        ..PhysicsParams::default()
    }
}

/// Deterministic second-order tables covering `rmax`.
pub fn second_order_tables(rmax: usize) -> Arc<IntegralTables> {
    let lengths = IntegralTables::table_lengths(rmax);
    let fill = |t: usize| -> Vec<f64> {
        (0..lengths[t])
            .map(|n| 0.2 * ((t + 1) as f64 * 0.53 + n as f64 * 0.017).cos())
            .collect()
    };
    let raw = RawTables {
        rmax,
        tab1: fill(0),
        tab2: fill(1),
        tab3: fill(2),
        tab4: fill(3),
        tab5: fill(4),
        tab6: fill(5),
        tab7: fill(6),
        tab8: fill(7),
        tab9: fill(8),
        tab10: fill(9),
    };
    Arc::new(IntegralTables::from_raw(raw).unwrap())
}

pub fn random_vector(len: usize, seed: u64) -> Vec<Complex64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| Complex64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
        .collect()
}

/// $\lVert a - b \rVert / \lVert b \rVert$.
pub fn rel_err(a: &[Complex64], b: &[Complex64]) -> f64 {
    assert_eq!(a.len(), b.len());
    let diff: f64 = a.iter().zip(b).map(|(x, y)| (x - y).norm_sqr()).sum();
    let norm: f64 = b.iter().map(|y| y.norm_sqr()).sum();
    (diff / norm).sqrt()
}

/// $\langle a, b \rangle = \sum_i \bar a_i b_i$.
pub fn inner(a: &[Complex64], b: &[Complex64]) -> Complex64 {
    a.iter().zip(b).map(|(x, y)| x.conj() * y).sum()
}

/// Everything needed to build an operator on one partition.
pub struct Setup {
    pub layout: GridLayout,
    pub lattice: DipoleLattice,
    pub coupling: CouplingTable,
    pub params: PhysicsParams,
    pub tables: Option<Arc<IntegralTables>>,
}

impl Setup {
    pub fn serial(lattice: DipoleLattice, params: PhysicsParams, reduced: bool) -> Self {
        Self::partition(lattice, params, reduced, 1, 0)
    }

    pub fn partition(
        lattice: DipoleLattice,
        params: PhysicsParams,
        reduced: bool,
        nprocs: usize,
        rank: usize,
    ) -> Self {
        let layout = GridLayout::new(lattice.box_dims(), nprocs, rank, reduced).unwrap();
        if params.interaction != InteractionKind::SecondOrder {
            return Self {
                layout,
                lattice,
                coupling: coupling(),
                params,
                tables: None,
            };
        }
        // the second-order term needs one isotropic material
        let lattice = DipoleLattice::new(
            lattice.box_dims(),
            lattice.positions().to_vec(),
            vec![0; lattice.len()],
        )
        .unwrap();
        Self {
            layout,
            lattice,
            coupling: CouplingTable::isotropic(&[Complex64::new(0.31, 0.04)]),
            params,
            tables: Some(second_order_tables(4)),
        }
    }

    pub fn problem(&self) -> Problem<'_> {
        Problem {
            layout: &self.layout,
            lattice: &self.lattice,
            coupling: &self.coupling,
            params: &self.params,
            tables: self.tables.clone(),
        }
    }

    /// Entries of the global vector owned by this partition.
    pub fn local_entries(&self) -> std::ops::Range<usize> {
        let z = self.layout.local_z();
        let dipoles = self.lattice.z_range(z.start, z.end);
        3 * dipoles.start..3 * dipoles.end
    }

    pub fn dense<C: Communicator>(&self, comm: C) -> DenseFftOperator<C> {
        DenseFftOperator::init(comm, &self.problem(), OperatorOptions::default())
            .unwrap()
            .ready()
            .unwrap()
    }

    pub fn direct<C: Communicator>(&self, comm: C) -> DirectOperator<C> {
        DirectOperator::init(comm, &self.problem(), OperatorOptions::default())
            .unwrap()
            .ready()
            .unwrap()
    }

    pub fn serial_dense(&self) -> DenseFftOperator<SerialComm> {
        self.dense(SerialComm::new())
    }

    pub fn serial_direct(&self) -> DirectOperator<SerialComm> {
        self.direct(SerialComm::new())
    }
}

/// Apply `op` to `x` and return the result.
pub fn apply(op: &mut dyn MatVec, x: &[Complex64], hermitian: bool) -> Vec<Complex64> {
    let mut y = vec![Complex64::default(); x.len()];
    let request = MatVecRequest {
        hermitian,
        inner_product: false,
    };
    op.apply(x, &mut y, request).unwrap();
    y
}
