//! Batched 1D transforms along the grid axes.
//!
//! Plans are created once per grid and reused for every call. Transforms are
//! unnormalised in both directions: a forward/backward pair scales the data by
//! the transform length, which the kernel normalisation accounts for.

use std::sync::Arc;

use num_complex::Complex64;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

/// Grid axis of a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Direction of a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Forward and backward plans for the three axes of one grid.
pub struct AxisTransforms {
    forward: [Arc<dyn Fft<f64>>; 3],
    backward: [Arc<dyn Fft<f64>>; 3],
}

impl AxisTransforms {
    pub fn new(grid: [usize; 3]) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let forward = grid.map(|n| planner.plan_fft_forward(n));
        let backward = grid.map(|n| planner.plan_fft_inverse(n));
        Self { forward, backward }
    }

    fn plan(&self, axis: Axis, dir: Direction) -> &Arc<dyn Fft<f64>> {
        let a = match axis {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        };
        match dir {
            Direction::Forward => &self.forward[a],
            Direction::Backward => &self.backward[a],
        }
    }

    /// Transform length along `axis`.
    pub fn len(&self, axis: Axis) -> usize {
        self.plan(axis, Direction::Forward).len()
    }

    /// Transform every contiguous row of `data` along `axis`.
    pub fn rows(&self, axis: Axis, dir: Direction, data: &mut [Complex64]) {
        let fft = self.plan(axis, dir);
        let n = fft.len();
        data.par_chunks_exact_mut(n).for_each_init(
            || vec![Complex64::default(); fft.get_inplace_scratch_len()],
            |scratch, row| fft.process_with_scratch(row, scratch),
        );
    }

    /// Transform the first `rows` rows of every block of `block_len` elements.
    ///
    /// Used where only part of each block can hold non-zero data (the rows
    /// covering the bounding box of the particle).
    pub fn leading_rows(
        &self,
        axis: Axis,
        dir: Direction,
        data: &mut [Complex64],
        block_len: usize,
        rows: usize,
    ) {
        let fft = self.plan(axis, dir);
        let n = fft.len();
        debug_assert!(rows * n <= block_len);
        data.par_chunks_exact_mut(block_len).for_each_init(
            || vec![Complex64::default(); fft.get_inplace_scratch_len()],
            |scratch, block| {
                for row in block[..rows * n].chunks_exact_mut(n) {
                    fft.process_with_scratch(row, scratch);
                }
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    fn naive_dft(x: &[Complex64], sign: f64) -> Vec<Complex64> {
        let n = x.len();
        (0..n)
            .map(|k| {
                x.iter()
                    .enumerate()
                    .map(|(j, v)| {
                        let phase = sign * 2.0 * PI * (j * k) as f64 / n as f64;
                        v * Complex64::new(phase.cos(), phase.sin())
                    })
                    .sum()
            })
            .collect()
    }

    #[test]
    fn test_rows_match_naive_dft() {
        let t = AxisTransforms::new([6, 10, 14]);
        let n = t.len(Axis::Y);
        let mut data: Vec<Complex64> = (0..3 * n)
            .map(|i| Complex64::new((i as f64 * 0.7).sin(), (i as f64 * 0.3).cos()))
            .collect();
        let original = data.clone();
        t.rows(Axis::Y, Direction::Forward, &mut data);

        for (row, out) in original.chunks(n).zip(data.chunks(n)) {
            let expected = naive_dft(row, -1.0);
            for (a, b) in out.iter().zip(&expected) {
                assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-12);
                assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_round_trip_scales_by_length() {
        let t = AxisTransforms::new([12, 4, 4]);
        let mut data: Vec<Complex64> = (0..24).map(|i| Complex64::new(i as f64, -1.0)).collect();
        let original = data.clone();
        t.rows(Axis::X, Direction::Forward, &mut data);
        t.rows(Axis::X, Direction::Backward, &mut data);
        for (a, b) in data.iter().zip(&original) {
            assert_abs_diff_eq!(a.re, 12.0 * b.re, epsilon = 1e-11);
            assert_abs_diff_eq!(a.im, 12.0 * b.im, epsilon = 1e-11);
        }
    }

    #[test]
    fn test_leading_rows_leave_tail_untouched() {
        let t = AxisTransforms::new([4, 4, 4]);
        // two blocks of three rows, only the first row of each transformed
        let mut data = vec![Complex64::new(1.0, 0.0); 24];
        t.leading_rows(Axis::X, Direction::Forward, &mut data, 12, 1);
        for block in data.chunks(12) {
            assert_abs_diff_eq!(block[0].re, 4.0, epsilon = 1e-14);
            assert!(block[1..4].iter().all(|v| v.norm() < 1e-14));
            assert!(block[4..].iter().all(|v| *v == Complex64::new(1.0, 0.0)));
        }
    }
}
