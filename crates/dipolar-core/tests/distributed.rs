//! Multi-partition runs on an in-process cluster give the same product as a
//! single partition.

mod common;

use std::thread;

use common::*;
use dipolar_compute::ThreadComm;
use dipolar_core::interaction::InteractionError;
use dipolar_core::operator::{build_operator, MatVec, MatVecError, MatVecRequest, OperatorOptions};
use dipolar_core::{DipoleLattice, InteractionKind, OperatorKind, PhysicsParams};
use num_complex::Complex64;

/// Run one product on `nprocs` partitions and reassemble the global result
/// and inner product.
fn run_cluster(
    kind: OperatorKind,
    lattice: &DipoleLattice,
    params: &PhysicsParams,
    reduced: bool,
    nprocs: usize,
    x: &[Complex64],
    hermitian: bool,
) -> (Vec<Complex64>, f64) {
    let handles: Vec<_> = ThreadComm::cluster(nprocs)
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| {
            let lattice = lattice.clone();
            let params = params.clone();
            let x = x.to_vec();
            thread::spawn(move || {
                let setup = Setup::partition(lattice, params, reduced, nprocs, rank);
                let mut op: Box<dyn MatVec> = match kind {
                    OperatorKind::Fft => Box::new(setup.dense(comm)),
                    OperatorKind::Direct => Box::new(setup.direct(comm)),
                };
                let entries = setup.local_entries();
                assert_eq!(op.local_len(), entries.len());
                let mut y = vec![Complex64::default(); entries.len()];
                let request = MatVecRequest {
                    hermitian,
                    inner_product: true,
                };
                let norm = op.apply(&x[entries.clone()], &mut y, request).unwrap();
                (entries, y, norm.unwrap())
            })
        })
        .collect();

    let mut result = vec![Complex64::default(); x.len()];
    let mut norms = Vec::new();
    for h in handles {
        let (entries, y, norm) = h.join().unwrap();
        result[entries].copy_from_slice(&y);
        norms.push(norm);
    }
    // every partition received the same global value
    assert!(norms.windows(2).all(|w| w[0] == w[1]));
    (result, norms[0])
}

fn serial_result(
    lattice: &DipoleLattice,
    params: &PhysicsParams,
    reduced: bool,
    x: &[Complex64],
    hermitian: bool,
) -> Vec<Complex64> {
    let setup = Setup::serial(lattice.clone(), params.clone(), reduced);
    let mut op = setup.serial_dense();
    apply(&mut op, x, hermitian)
}

#[test]
fn test_partitioned_fft_matches_serial() {
    let lattice = sparse_lattice([3, 4, 5], 0.6, 31);
    let x = random_vector(3 * lattice.len(), 32);
    for (params, reduced) in [
        (physics(InteractionKind::PointDipole), true),
        (physics(InteractionKind::Fcd), false),
        (physics(InteractionKind::SecondOrder), false),
    ] {
        for nprocs in [2, 3] {
            for hermitian in [false, true] {
                let expected = serial_result(&lattice, &params, reduced, &x, hermitian);
                let (got, norm) =
                    run_cluster(OperatorKind::Fft, &lattice, &params, reduced, nprocs, &x, hermitian);
                let err = rel_err(&got, &expected);
                assert!(
                    err < 1e-12,
                    "{:?} on {nprocs} partitions, hermitian={hermitian}: relative error {err:e}",
                    params.interaction
                );
                let total: f64 = got.iter().map(|v| v.norm_sqr()).sum();
                assert!((norm - total).abs() < 1e-10 * total);
            }
        }
    }
}

#[test]
fn test_partitioned_direct_matches_serial_fft() {
    let lattice = sparse_lattice([4, 3, 4], 0.6, 33);
    let params = physics(InteractionKind::FcdStatic);
    let x = random_vector(3 * lattice.len(), 34);
    for hermitian in [false, true] {
        let expected = serial_result(&lattice, &params, true, &x, hermitian);
        let (got, _) = run_cluster(OperatorKind::Direct, &lattice, &params, true, 2, &x, hermitian);
        assert!(rel_err(&got, &expected) < 1e-10);
    }
}

#[test]
fn test_partitions_without_dipoles() {
    // all dipoles in the lowest layer: the upper partitions own nothing
    let positions = vec![[0, 0, 0], [1, 0, 0], [1, 1, 0], [0, 2, 0]];
    let lattice = DipoleLattice::new([2, 3, 4], positions, vec![0, 1, 0, 1]).unwrap();
    let params = physics(InteractionKind::PointDipole);
    let x = random_vector(3 * lattice.len(), 35);
    let expected = serial_result(&lattice, &params, true, &x, false);
    for kind in [OperatorKind::Fft, OperatorKind::Direct] {
        let (got, _) = run_cluster(kind, &lattice, &params, true, 4, &x, false);
        assert!(rel_err(&got, &expected) < 1e-10);
    }
}

#[test]
fn test_table_error_on_one_partition_fails_every_partition() {
    // kd = 0.2: (2, 0, 0) is close range but beyond a table of R/d = 1, and
    // only the partition owning the z = 0 row of the kernel evaluates it
    let mut params = physics(InteractionKind::SecondOrder);
    params.lattice_spacing = 0.2;
    let lattice = DipoleLattice::new([3, 1, 1], vec![[0, 0, 0], [2, 0, 0]], vec![0, 0]).unwrap();

    for kind in [OperatorKind::Fft, OperatorKind::Direct] {
        let handles: Vec<_> = ThreadComm::cluster(2)
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                let lattice = lattice.clone();
                let params = params.clone();
                thread::spawn(move || {
                    let mut setup = Setup::partition(lattice, params, false, 2, rank);
                    setup.tables = Some(second_order_tables(1));
                    build_operator(kind, comm, &setup.problem(), OperatorOptions::default()).err()
                })
            })
            .collect();
        for (rank, h) in handles.into_iter().enumerate() {
            match h.join().unwrap() {
                Some(MatVecError::Interaction(InteractionError::TableTooSmall {
                    rmax,
                    displacement,
                })) => {
                    assert_eq!(rmax, 1);
                    assert_eq!(displacement, [2, 0, 0]);
                }
                other => panic!("{kind:?} partition {rank}: unexpected outcome {other:?}"),
            }
        }
    }
}
