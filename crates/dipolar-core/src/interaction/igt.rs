//! Integrated Green's tensor.
//!
//! Near the source the point-dipole tensor varies strongly over a single cell.
//! The integrated Green's tensor (Yurkin & Hoekstra, JQSRT 2007) replaces it
//! by its average over the cubic source cell:
//!
//! $$
//! G^{\mathrm{IGT}}(\mathbf{r}) = \frac{1}{d^3}\int_{V_d} G^p(\mathbf{r} - \mathbf{r}')\,d\mathbf{r}'
//! $$
//!
//! The average is computed with tensor-product Gauss-Legendre quadrature; the
//! order is raised until two successive estimates agree to the requested
//! relative tolerance.

use std::f64::consts::PI;

use num_complex::Complex64;

use super::greens::greens_tensor;
use super::InteractionError;
use crate::types::{SymTensor, NDCOMP};

const FIRST_ORDER: usize = 4;
const ORDER_STEP: usize = 4;
const MAX_ORDER: usize = 64;

/// Nodes and weights of the `n`-point Gauss-Legendre rule on `[-1, 1]`.
pub fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut nodes = vec![0.0; n];
    let mut weights = vec![0.0; n];
    let nf = n as f64;

    for i in 0..n.div_ceil(2) {
        // Newton iteration on P_n from the Chebyshev-like initial guess
        let mut z = (PI * (i as f64 + 0.75) / (nf + 0.5)).cos();
        let mut dp = 1.0;
        for _ in 0..100 {
            let (mut p1, mut p2) = (1.0, 0.0);
            for j in 0..n {
                let p3 = p2;
                p2 = p1;
                let jf = j as f64;
                p1 = ((2.0 * jf + 1.0) * z * p2 - jf * p3) / (jf + 1.0);
            }
            dp = nf * (z * p1 - p2) / (z * z - 1.0);
            let step = p1 / dp;
            z -= step;
            if step.abs() <= 1e-15 {
                break;
            }
        }
        nodes[i] = -z;
        nodes[n - 1 - i] = z;
        weights[i] = 2.0 / ((1.0 - z * z) * dp * dp);
        weights[n - 1 - i] = weights[i];
    }
    (nodes, weights)
}

/// Average of the point-dipole tensor over one cubic cell of the given order.
fn cell_average(r: [f64; 3], wavenumber: f64, spacing: f64, order: usize) -> SymTensor {
    let (nodes, weights) = gauss_legendre(order);
    let half = 0.5 * spacing;
    let mut acc = [Complex64::new(0.0, 0.0); NDCOMP];

    for (a, wa) in nodes.iter().zip(&weights) {
        for (b, wb) in nodes.iter().zip(&weights) {
            for (c, wc) in nodes.iter().zip(&weights) {
                let rp = [r[0] - half * a, r[1] - half * b, r[2] - half * c];
                let g = greens_tensor(rp, wavenumber);
                let w = wa * wb * wc;
                for (s, v) in acc.iter_mut().zip(g) {
                    *s += v * w;
                }
            }
        }
    }
    // Weights sum to 2 per axis
    for s in acc.iter_mut() {
        *s /= 8.0;
    }
    acc
}

fn max_norm(t: &SymTensor) -> f64 {
    t.iter().map(|v| v.norm()).fold(0.0, f64::max)
}

/// Integrated Green's tensor for displacement `r` (physical units).
///
/// The observation point must lie outside the source cell, which holds for
/// every non-zero lattice displacement.
pub fn integrated_tensor(
    r: [f64; 3],
    wavenumber: f64,
    spacing: f64,
    eps: f64,
) -> Result<SymTensor, InteractionError> {
    let mut order = FIRST_ORDER;
    let mut previous = cell_average(r, wavenumber, spacing, order);

    while order < MAX_ORDER {
        order += ORDER_STEP;
        let current = cell_average(r, wavenumber, spacing, order);
        let diff: SymTensor = std::array::from_fn(|c| current[c] - previous[c]);
        if max_norm(&diff) <= eps * max_norm(&current) {
            return Ok(current);
        }
        previous = current;
    }

    Err(InteractionError::IgtNotConverged {
        r,
        order: MAX_ORDER,
        eps,
    })
}
