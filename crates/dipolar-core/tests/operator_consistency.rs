//! Cross-checks of the FFT operator against the pairwise operator and
//! against the algebraic properties of the interaction matrix.

mod common;

use approx::assert_abs_diff_eq;
use common::*;
use dipolar_compute::SerialComm;
use dipolar_core::operator::{build_operator, MatVec, MatVecRequest, OperatorKind, OperatorOptions};
use dipolar_core::{CouplingTable, DipoleLattice, InteractionKind, PhysicsParams};
use ndarray::Array1;
use num_complex::Complex64;

fn kinds() -> Vec<PhysicsParams> {
    let mut igt = physics(InteractionKind::Igt);
    igt.igt.limit = Some(1.5);
    vec![
        physics(InteractionKind::PointDipole),
        physics(InteractionKind::FcdStatic),
        physics(InteractionKind::Fcd),
        igt,
        physics(InteractionKind::SecondOrder),
    ]
}

#[test]
fn test_zero_coupling_is_identity() {
    let lattice = sparse_lattice([4, 3, 3], 0.7, 1);
    let mut setup = Setup::serial(lattice, physics(InteractionKind::PointDipole), true);
    setup.coupling = CouplingTable::isotropic(&[Complex64::new(0.0, 0.0); 2]);
    let mut op = setup.serial_dense();
    let x = random_vector(op.local_len(), 2);
    for hermitian in [false, true] {
        assert_eq!(apply(&mut op, &x, hermitian), x);
    }
}

#[test]
fn test_isolated_dipole_sees_no_interaction() {
    let lattice = DipoleLattice::filled_box([1, 1, 1]).unwrap();
    let setup = Setup::serial(lattice, physics(InteractionKind::Fcd), false);
    let mut op = setup.serial_dense();
    let x = random_vector(3, 3);
    let y = apply(&mut op, &x, false);
    for (a, b) in y.iter().zip(&x) {
        assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-13);
        assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-13);
    }
}

#[test]
fn test_fft_matches_direct_for_every_kind() {
    for (n, params) in kinds().into_iter().enumerate() {
        let lattice = sparse_lattice([4, 3, 5], 0.5, 10 + n as u64);
        assert!(lattice.len() <= 50);
        let reduced_options: &[bool] = if params.interaction.supports_reduced_fft() {
            &[true, false]
        } else {
            &[false]
        };
        for &reduced in reduced_options {
            let setup = Setup::serial(lattice.clone(), params.clone(), reduced);
            let mut dense = setup.serial_dense();
            let mut direct = setup.serial_direct();
            let x = random_vector(dense.local_len(), 20 + n as u64);
            for hermitian in [false, true] {
                let a = apply(&mut dense, &x, hermitian);
                let b = apply(&mut direct, &x, hermitian);
                let err = rel_err(&a, &b);
                assert!(
                    err < 1e-10,
                    "{:?} reduced={reduced} hermitian={hermitian}: relative error {err:e}",
                    params.interaction
                );
            }
        }
    }
}

#[test]
fn test_hermitian_product_is_the_adjoint() {
    for params in [
        physics(InteractionKind::PointDipole),
        physics(InteractionKind::SecondOrder),
    ] {
        let lattice = sparse_lattice([3, 4, 4], 0.7, 5);
        let setup = Setup::serial(lattice, params, false);
        let mut op = setup.serial_dense();
        let x = random_vector(op.local_len(), 6);
        let y = random_vector(op.local_len(), 7);

        let ah_x = apply(&mut op, &x, true);
        let a_y = apply(&mut op, &y, false);
        let lhs = inner(&y, &ah_x);
        let rhs = inner(&x, &a_y).conj();
        let scale = lhs.norm().max(1.0);
        assert!((lhs - rhs).norm() < 1e-10 * scale, "{lhs} vs {rhs}");
    }
}

#[test]
fn test_second_order_operator_is_not_symmetric() {
    // on-axis entries come from tables with no reflection symmetry, so A^H
    // differs from the plain conjugate of A
    let lattice = sparse_lattice([3, 3, 3], 0.8, 8);
    let setup = Setup::serial(lattice, physics(InteractionKind::SecondOrder), false);
    let mut op = setup.serial_dense();
    let x = random_vector(op.local_len(), 9);
    let x_conj: Vec<Complex64> = x.iter().map(|v| v.conj()).collect();
    let ah_x = apply(&mut op, &x, true);
    let conj_a_conj_x: Vec<Complex64> = apply(&mut op, &x_conj, false)
        .iter()
        .map(|v| v.conj())
        .collect();
    assert!(rel_err(&ah_x, &conj_a_conj_x) > 1e-6);
}

#[test]
fn test_inner_product_is_squared_norm() {
    let lattice = sparse_lattice([4, 4, 3], 0.6, 11);
    let setup = Setup::serial(lattice, physics(InteractionKind::FcdStatic), true);
    let x = random_vector(3 * setup.lattice.len(), 12);
    let mut dense = setup.serial_dense();
    let mut direct = setup.serial_direct();
    let operators: [&mut dyn MatVec; 2] = [&mut dense, &mut direct];
    for op in operators {
        let mut y = vec![Complex64::default(); x.len()];
        let request = MatVecRequest {
            hermitian: true,
            inner_product: true,
        };
        let norm = op.apply(&x, &mut y, request).unwrap().unwrap();
        let expected: f64 = y.iter().map(|v| v.norm_sqr()).sum();
        assert_abs_diff_eq!(norm, expected, epsilon = 1e-12 * expected);

        let plain = MatVecRequest::default();
        assert!(op.apply(&x, &mut y, plain).unwrap().is_none());
    }
}

#[test]
fn test_reduced_and_full_kernels_give_same_product() {
    let lattice = sparse_lattice([5, 3, 4], 0.5, 13);
    let params = physics(InteractionKind::Fcd);
    let mut full = Setup::serial(lattice.clone(), params.clone(), false).serial_dense();
    let mut reduced = Setup::serial(lattice, params, true).serial_dense();
    assert!(reduced.kernel().as_slice().len() < full.kernel().as_slice().len());

    let x = random_vector(full.local_len(), 14);
    for hermitian in [false, true] {
        let a = apply(&mut full, &x, hermitian);
        let b = apply(&mut reduced, &x, hermitian);
        assert!(rel_err(&b, &a) < 1e-12);
    }
}

#[test]
fn test_direct_matches_assembled_matrix() {
    let lattice = sparse_lattice([3, 3, 3], 0.7, 15);
    let setup = Setup::serial(lattice, physics(InteractionKind::PointDipole), false);
    let mut direct = setup.serial_direct();
    let matrix = direct.assemble_local().unwrap();
    let x = random_vector(direct.local_len(), 16);
    let expected = matrix.dot(&Array1::from(x.clone()));
    let got = apply(&mut direct, &x, false);
    assert!(rel_err(&got, expected.as_slice().unwrap()) < 1e-13);

    // the Hermitian product is the conjugate transpose of the same matrix
    let adjoint = matrix.t().mapv(|v| v.conj());
    let expected = adjoint.dot(&Array1::from(x.clone()));
    let got = apply(&mut direct, &x, true);
    assert!(rel_err(&got, expected.as_slice().unwrap()) < 1e-13);
}

#[test]
fn test_rebuilding_the_kernel_is_deterministic() {
    let lattice = sparse_lattice([4, 3, 3], 0.5, 17);
    let setup = Setup::serial(lattice, physics(InteractionKind::Fcd), true);
    let a = setup.serial_dense();
    let b = setup.serial_dense();
    assert_eq!(a.kernel(), b.kernel());
}

#[test]
fn test_stats_count_calls() {
    let lattice = sparse_lattice([3, 3, 3], 0.5, 18);
    let setup = Setup::serial(lattice, physics(InteractionKind::PointDipole), true);
    let mut op = setup.serial_dense();
    let x = random_vector(op.local_len(), 19);
    for _ in 0..3 {
        apply(&mut op, &x, false);
    }
    assert_eq!(op.stats().invocations, 3);
    assert!(op.stats().wall_time >= op.stats().comm_time);
    let (_, stats) = op.release();
    assert_eq!(stats.invocations, 3);
}

#[test]
fn test_build_operator_selects_strategy() {
    let lattice = sparse_lattice([3, 3, 2], 0.8, 21);
    let setup = Setup::serial(lattice, physics(InteractionKind::PointDipole), true);
    let x = random_vector(3 * setup.lattice.len(), 22);

    let mut results = Vec::new();
    for kind in [OperatorKind::Fft, OperatorKind::Direct] {
        let options = OperatorOptions::default();
        let mut op = build_operator(kind, SerialComm::new(), &setup.problem(), options)
            .unwrap()
            .ready()
            .unwrap();
        assert_eq!(op.name(), if kind == OperatorKind::Fft { "fft" } else { "direct" });
        results.push(apply(op.as_mut(), &x, false));
    }
    assert!(rel_err(&results[0], &results[1]) < 1e-10);
}
