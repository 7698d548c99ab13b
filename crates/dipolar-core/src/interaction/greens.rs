//! Point-dipole Green's tensor and the filtered coupled dipole corrections.
//!
//! For a displacement $\mathbf{r} = r\hat{\mathbf{q}}$ the interaction term is
//!
//! $$
//! G^p_{\mu\nu} = \frac{e^{ikr}}{r^3}\left[\delta_{\mu\nu}(k^2r^2 - 1 + ikr)
//! + \hat q_\mu \hat q_\nu (3 - k^2r^2 - 3ikr)\right]
//! $$
//!
//! which is the dyadic Green's tensor without the $1/4\pi$ factor; the
//! coupling constants absorb it.
//!
//! The filtered forms follow Gay-Balmaz & Martin, Comp. Phys. Comm. 144
//! (2002) and Piller, IEEE Trans. Ant. Propag. 46 (1998), with the filter
//! cut at $k_F = \pi/d$.

use std::f64::consts::{FRAC_1_PI, PI};

use num_complex::Complex64;

use crate::special::{cisi, CisiError};
use crate::types::{SymTensor, NDCOMP, SYM_DELTA, SYM_PAIRS};

/// Quantities of a displacement shared by every branch of the interaction.
#[derive(Debug, Clone)]
pub(crate) struct Separation {
    /// Displacement in units of the lattice spacing.
    pub rn: f64,
    /// Unit displacement vector.
    pub q: [f64; 3],
    /// $\hat q_\mu \hat q_\nu$ per packed component.
    pub qmunu: [f64; NDCOMP],
    pub kr: f64,
    pub cos_kr: f64,
    pub sin_kr: f64,
    /// $e^{ikr}/r^3$.
    pub expval: Complex64,
    pub invr3: f64,
}

impl Separation {
    /// `r` must be non-zero.
    pub fn new(r: [f64; 3], wavenumber: f64, spacing: f64) -> Self {
        let rr = (r[0] * r[0] + r[1] * r[1] + r[2] * r[2]).sqrt();
        let invr = 1.0 / rr;
        let invr3 = invr * invr * invr;
        let q = [r[0] * invr, r[1] * invr, r[2] * invr];
        let qmunu = std::array::from_fn(|c| {
            let (mu, nu) = SYM_PAIRS[c];
            q[mu] * q[nu]
        });
        let kr = wavenumber * rr;
        let (sin_kr, cos_kr) = kr.sin_cos();
        Self {
            rn: rr / spacing,
            q,
            qmunu,
            kr,
            cos_kr,
            sin_kr,
            expval: Complex64::new(cos_kr, sin_kr) * invr3,
            invr3,
        }
    }
}

/// Point-dipole tensor for a precomputed separation.
pub(crate) fn point_dipole(sep: &Separation) -> SymTensor {
    let kr = sep.kr;
    let kr2 = kr * kr;
    std::array::from_fn(|c| {
        let qq = sep.qmunu[c];
        let mut br = Complex64::new((3.0 - kr2) * qq, -3.0 * kr * qq);
        if SYM_DELTA[c] != 0.0 {
            br += Complex64::new(kr2 - 1.0, kr);
        }
        sep.expval * br
    })
}

/// Point-dipole tensor for an arbitrary non-zero displacement `r`.
pub fn greens_tensor(r: [f64; 3], wavenumber: f64) -> SymTensor {
    point_dipole(&Separation::new(r, wavenumber, 1.0))
}

/// Quasi-static filtered coupled dipoles: scale the point-dipole tensor by
/// $\frac{2}{3\pi}\left[3\,\mathrm{Si}(k_F r) + k_F r\cos(k_F r) - 4\sin(k_F r)\right]$.
pub(crate) fn apply_fcd_static(sep: &Separation, g: &mut SymTensor) -> Result<(), CisiError> {
    let kfr = PI * sep.rn;
    let (_, si) = cisi(kfr)?;
    let brd = 2.0 * FRAC_1_PI / 3.0 * (3.0 * si + kfr * kfr.cos() - 4.0 * kfr.sin());
    for v in g.iter_mut() {
        *v *= brd;
    }
    Ok(())
}

/// Full filtered coupled dipoles: add the real correction built from the
/// sine and cosine integrals at $(k_F \pm k)r$.
pub(crate) fn apply_fcd(sep: &Separation, g: &mut SymTensor) -> Result<(), CisiError> {
    let kfr = PI * sep.rn;
    let kr = sep.kr;
    let (ci1, si1) = cisi(kfr + kr)?;
    let (ci2, si2) = cisi(kfr - kr)?;
    let ci = ci1 - ci2;
    let si = PI - si1 - si2;

    let g0 = FRAC_1_PI * (sep.sin_kr * ci + sep.cos_kr * si);
    let g2 = FRAC_1_PI
        * (kr * (sep.cos_kr * ci - sep.sin_kr * si)
            + 2.0 / 3.0 * (kfr * kfr.cos() - 4.0 * kfr.sin()))
        - g0;
    let temp = g0 * kr * kr;

    for (c, v) in g.iter_mut().enumerate() {
        let mut brd = sep.qmunu[c] * (temp + 3.0 * g2);
        if SYM_DELTA[c] != 0.0 {
            brd -= temp + g2;
        }
        v.re += brd * sep.invr3;
    }
    Ok(())
}
