//! Second-order corrected interaction term, orientation averaged.
//!
//! Close to the source ($kr \cdot r/d < 1$) the tensor is assembled from ten
//! tabulated cell integrals. The tables are only stored for sorted
//! coordinates $i \ge j \ge k \ge 0$; any other displacement is reflected and
//! permuted into that sector, and the signs and axis order are carried back to
//! the tensor components. Further away the point-dipole tensor is scaled by
//! $1 - (1 + m^2)(kd)^2/24$, plus a "median" term while $kr < 1$.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::greens::Separation;
use super::InteractionError;
use crate::types::{SymTensor, NDCOMP, SYM_DELTA, SYM_PAIRS};

/// Bound on $kr \cdot r/d$ below which the tabulated form is used.
const BOUND_CLOSE: f64 = 1.0;
/// Bound on $kr$ below which the median term is added.
const BOUND_MEDIAN: f64 = 1.0;

/// Raw table set as stored on disk: ten flat arrays and the radius they
/// cover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTables {
    pub rmax: usize,
    pub tab1: Vec<f64>,
    pub tab2: Vec<f64>,
    pub tab3: Vec<f64>,
    pub tab4: Vec<f64>,
    pub tab5: Vec<f64>,
    pub tab6: Vec<f64>,
    pub tab7: Vec<f64>,
    pub tab8: Vec<f64>,
    pub tab9: Vec<f64>,
    pub tab10: Vec<f64>,
}

/// Values per sorted cell stored by each of the ten tables.
pub const TABLE_WIDTHS: [usize; 10] = [1, 6, 3, 18, 6, 36, 1, 6, 1, 6];

/// Tabulated near-field integrals of the second-order formulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawTables", into = "RawTables")]
pub struct IntegralTables {
    raw: RawTables,
    /// `index[i][j] + k` is the cell number of sorted coordinates `(i, j, k)`.
    index: Vec<Vec<usize>>,
}

impl IntegralTables {
    /// Number of sorted cells `i >= j >= k >= 0` with `i <= rmax`.
    pub fn cells(rmax: usize) -> usize {
        (0..=rmax).map(|i| (i + 1) * (i + 2) / 2).sum()
    }

    /// Required length of each table for the given radius.
    pub fn table_lengths(rmax: usize) -> [usize; 10] {
        let n0 = Self::cells(rmax);
        TABLE_WIDTHS.map(|w| w * n0)
    }

    pub fn from_raw(raw: RawTables) -> Result<Self, InteractionError> {
        let expected = Self::table_lengths(raw.rmax);
        let actual = [
            raw.tab1.len(),
            raw.tab2.len(),
            raw.tab3.len(),
            raw.tab4.len(),
            raw.tab5.len(),
            raw.tab6.len(),
            raw.tab7.len(),
            raw.tab8.len(),
            raw.tab9.len(),
            raw.tab10.len(),
        ];
        for (t, (&e, &a)) in expected.iter().zip(&actual).enumerate() {
            if e != a {
                return Err(InteractionError::TableLength {
                    table: t + 1,
                    expected: e,
                    actual: a,
                });
            }
        }

        let mut index = Vec::with_capacity(raw.rmax + 1);
        let mut offset = 0;
        for i in 0..=raw.rmax {
            let row: Vec<usize> = (0..=i)
                .map(|j| {
                    let start = offset;
                    offset += j + 1;
                    start
                })
                .collect();
            index.push(row);
        }

        Ok(Self { raw, index })
    }

    pub fn rmax(&self) -> usize {
        self.raw.rmax
    }

    /// Cell number of sorted coordinates `i >= j >= k >= 0`.
    fn cell(&self, i: usize, j: usize, k: usize) -> usize {
        self.index[i][j] + k
    }
}

impl TryFrom<RawTables> for IntegralTables {
    type Error = InteractionError;

    fn try_from(raw: RawTables) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

impl From<IntegralTables> for RawTables {
    fn from(tables: IntegralTables) -> Self {
        tables.raw
    }
}

/// Trace of a symmetric matrix packed as `{{0,1,3},{1,2,4},{3,4,5}}`.
fn trace_sym(a: &[f64]) -> f64 {
    a[0] + a[2] + a[5]
}

fn dot3(a: &[f64; 3], b: &[f64]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Whether the tabulated form applies to this separation.
pub(crate) fn is_close(sep: &Separation) -> bool {
    sep.kr * sep.rn < BOUND_CLOSE
}

/// Tabulated close-range tensor for lattice displacement `ivec`.
pub(crate) fn close(
    sep: &Separation,
    ivec: [i64; 3],
    kd: f64,
    m2: Complex64,
    tables: &IntegralTables,
) -> Result<SymTensor, InteractionError> {
    let rmax = tables.rmax() as i64;
    let r2 = ivec.iter().map(|v| v * v).sum::<i64>();
    if r2 > rmax * rmax {
        return Err(InteractionError::TableTooSmall {
            rmax: tables.rmax(),
            displacement: ivec,
        });
    }

    // Reflect into the positive octant
    let mut q = sep.q;
    let mut sig_v = [1.0_f64; 3];
    let mut abs = [0_usize; 3];
    for a in 0..3 {
        if ivec[a] < 0 {
            sig_v[a] = -1.0;
            q[a] = -q[a];
        }
        abs[a] = ivec[a].unsigned_abs() as usize;
    }

    // ord[x] is the x-th largest coordinate; ties keep the axis order
    let mut ord = [0_usize, 1, 2];
    ord.sort_by(|&a, &b| abs[b].cmp(&abs[a]));
    let q = ord.map(|a| q[a]);
    let [i, j, k] = ord.map(|a| abs[a]);
    let mut invord = [0_usize; 3];
    for (x, &o) in ord.iter().enumerate() {
        invord[o] = x;
    }

    let raw = &tables.raw;
    let kr = sep.kr;
    let kr2 = kr * kr;
    let kd2 = kd * kd;
    let temp = kr / 24.0;
    let ind0 = tables.cell(i, j, k);
    let ind1 = 3 * ind0;
    let ind2m = 6 * ind0;

    let t3q = dot3(&q, &raw.tab3[ind1..ind1 + 3]);
    let t5tr = trace_sym(&raw.tab5[ind2m..ind2m + 6]);
    let t5aa = t5tr / 3.0;

    let mut result = [Complex64::new(0.0, 0.0); NDCOMP];
    for (c, out) in result.iter_mut().enumerate() {
        let (mu, nu) = SYM_PAIRS[c];
        let diag = SYM_DELTA[c] != 0.0;
        let qmunu = sep.qmunu[c];
        let sig = sig_v[mu] * sig_v[nu];

        // Packed index of the permuted pair in {{0,1,3},{1,2,4},{3,4,5}}
        let (mu1, nu1) = (invord[mu], invord[nu]);
        let mut indmunu = mu1 + nu1;
        if mu1 == 2 || nu1 == 2 {
            indmunu += 1;
        }
        let ind2 = ind2m + indmunu;
        let ind3 = 3 * ind2;
        let ind4 = 6 * ind2;

        let t4q = dot3(&q, &raw.tab4[ind3..ind3 + 3]);
        let t6tr = trace_sym(&raw.tab6[ind4..ind4 + 6]);
        let t6aa = t6tr / 3.0;

        // Gc0
        let mut br = Complex64::new(
            sig * (3.0 * (raw.tab10[ind2] / 2.0 + raw.tab8[ind2]) - 2.0 * t4q - t6tr)
                + temp * qmunu * kr,
            3.0 * temp * qmunu,
        );
        if diag {
            br.re += 2.0 * t3q + t5tr - temp * kr - raw.tab9[ind0] / 2.0 - raw.tab7[ind0];
            br.im -= temp;
        }
        br *= kd2;
        br.re += sig * raw.tab2[ind2] * (3.0 - kr2);
        br.im -= sig * raw.tab2[ind2] * 3.0 * kr;
        if diag {
            br.re += raw.tab1[ind0] * (kr2 - 1.0);
            br.im += raw.tab1[ind0] * kr;
        }
        let gc0 = sep.expval * br;

        // Gc2
        let mut br = Complex64::new(-kr * qmunu, -3.0 * qmunu);
        if diag {
            br += Complex64::new(kr, 1.0);
        }
        br *= -2.0 * temp;
        br.re -= 3.0 * sig * t6aa;
        if diag {
            br.re += t5aa;
        }
        let gc2 = m2 * br * (kd2 / 2.0) * sep.expval;

        *out = gc0 + gc2;
    }
    Ok(result)
}

/// Far-range correction applied to the point-dipole tensor `g` in place.
pub(crate) fn apply_far(sep: &Separation, g: &mut SymTensor, kd: f64, m2: Complex64) {
    let temp = kd * kd / 24.0;
    let scale = Complex64::new(1.0 - (1.0 + m2.re) * temp, -m2.im * temp);
    for v in g.iter_mut() {
        *v *= scale;
    }

    if sep.kr < BOUND_MEDIAN {
        let q2 = sep.q.map(|v| v * v);
        let q4 = q2.iter().map(|v| v * v).sum::<f64>();
        let invrn2 = 1.0 / (sep.rn * sep.rn);
        let invrn4 = invrn2 * invrn2;
        for (c, v) in g.iter_mut().enumerate() {
            let (mu, nu) = SYM_PAIRS[c];
            let mut t = sep.qmunu[c] * (33.0 * q4 - 7.0 - 12.0 * (q2[mu] + q2[nu]));
            if mu == nu {
                t += 1.0 - 3.0 * q4 + 4.0 * q2[mu];
            }
            t *= 7.0 * invrn4 / 64.0;
            *v += Complex64::new(-1.0, sep.kr) * t * sep.expval;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Deterministic tables whose entries depend on table number and offset.
    pub(crate) fn synthetic_tables(rmax: usize) -> IntegralTables {
        let lengths = IntegralTables::table_lengths(rmax);
        let fill = |t: usize| -> Vec<f64> {
            (0..lengths[t])
                .map(|n| ((t + 1) as f64 * 0.37 + n as f64 * 0.011).sin())
                .collect()
        };
        IntegralTables::from_raw(RawTables {
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
        })
        .unwrap()
    }

    #[test]
    fn test_cell_count_and_index() {
        assert_eq!(IntegralTables::cells(0), 1);
        assert_eq!(IntegralTables::cells(1), 4);
        assert_eq!(IntegralTables::cells(2), 10);
        let t = synthetic_tables(3);
        // cells are numbered consecutively in (i, j, k) order
        let mut expected = 0;
        for i in 0..=3 {
            for j in 0..=i {
                for k in 0..=j {
                    assert_eq!(t.cell(i, j, k), expected);
                    expected += 1;
                }
            }
        }
        assert_eq!(expected, IntegralTables::cells(3));
    }

    #[test]
    fn test_rejects_wrong_table_length() {
        let mut raw: RawTables = synthetic_tables(2).into();
        raw.tab6.pop();
        assert!(matches!(
            IntegralTables::from_raw(raw),
            Err(InteractionError::TableLength { table: 6, .. })
        ));
    }

    #[test]
    fn test_close_requires_table_radius() {
        let tables = synthetic_tables(2);
        let sep = Separation::new([2.0, 2.0, 0.0], 0.01, 1.0);
        let err = close(&sep, [2, 2, 0], 0.01, Complex64::new(1.5, 0.0), &tables).unwrap_err();
        assert!(matches!(err, InteractionError::TableTooSmall { rmax: 2, .. }));
    }

    #[test]
    fn test_close_is_even_in_displacement() {
        let tables = synthetic_tables(3);
        let (k, d) = (0.05, 1.0);
        let m2 = Complex64::new(2.25, 0.1);
        // off-axis only: on-axis cells rely on the symmetry of real tables
        for ivec in [[2_i64, -1, 1], [1, 1, 1], [-1, 2, -2], [1, -2, 2]] {
            let r = ivec.map(|v| v as f64 * d);
            let minus = ivec.map(|v| -v);
            let a = close(&Separation::new(r, k, d), ivec, k * d, m2, &tables).unwrap();
            let b = close(
                &Separation::new(minus.map(|v| v as f64 * d), k, d),
                minus,
                k * d,
                m2,
                &tables,
            )
            .unwrap();
            for c in 0..NDCOMP {
                assert!((a[c] - b[c]).norm() <= 1e-12 * (1.0 + a[c].norm()));
            }
        }
    }

    #[test]
    fn test_far_scaling_without_median() {
        // kr > 1: only the scalar factor applies
        let sep = Separation::new([30.0, 0.0, 0.0], 0.1, 1.0);
        let mut g: SymTensor = std::array::from_fn(|c| Complex64::new(c as f64, 1.0));
        let before = g;
        let m2 = Complex64::new(4.0, 0.0);
        apply_far(&sep, &mut g, 0.1, m2);
        let factor = 1.0 - 5.0 * 0.01 / 24.0;
        for c in 0..NDCOMP {
            assert!((g[c] - before[c] * factor).norm() < 1e-14);
        }
    }
}
