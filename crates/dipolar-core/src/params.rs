//! Physical parameters of the interaction kernel.
//!
//! Built once by the driver and passed by reference to the kernel build and
//! to both operators; nothing here changes during a run.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Formulation used for the interaction term between two dipoles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// Exact point-dipole Green's tensor.
    #[default]
    PointDipole,
    /// Filtered coupled dipoles, quasi-static filter.
    FcdStatic,
    /// Filtered coupled dipoles, full filter.
    Fcd,
    /// Green's tensor integrated over the source cell.
    Igt,
    /// Second-order corrected tensor (orientation averaged).
    SecondOrder,
}

impl InteractionKind {
    /// Whether the tensor satisfies the reflection symmetries the reduced
    /// kernel relies on.
    pub fn supports_reduced_fft(&self) -> bool {
        !matches!(self, InteractionKind::SecondOrder)
    }
}

/// Settings of the integrated Green's tensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IgtParams {
    /// Largest separation (in lattice spacings) where the integrated tensor
    /// is used. `None` applies it everywhere.
    #[serde(default)]
    pub limit: Option<f64>,
    /// Relative tolerance of the cell quadrature.
    #[serde(default = "default_igt_eps")]
    pub eps: f64,
}

fn default_igt_eps() -> f64 {
    1e-5
}

impl Default for IgtParams {
    fn default() -> Self {
        Self {
            limit: None,
            eps: default_igt_eps(),
        }
    }
}

/// Physics configuration seen by the interaction term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicsParams {
    /// Wavenumber in the host medium ($k = 2\pi/\lambda$).
    pub wavenumber: f64,
    /// Lattice spacing $d$, in the same length unit as $1/k$.
    pub lattice_spacing: f64,
    /// Refractive index of each material, relative to the host medium.
    #[serde(default = "default_refractive_indices")]
    pub refractive_indices: Vec<Complex64>,
    /// Whether any material has an anisotropic (diagonal) polarisability.
    #[serde(default)]
    pub anisotropic: bool,
    #[serde(default)]
    pub interaction: InteractionKind,
    #[serde(default)]
    pub igt: IgtParams,
}

fn default_refractive_indices() -> Vec<Complex64> {
    vec![Complex64::new(1.5, 0.0)]
}

impl Default for PhysicsParams {
    fn default() -> Self {
        Self {
            wavenumber: 2.0 * std::f64::consts::PI,
            lattice_spacing: 0.1,
            refractive_indices: default_refractive_indices(),
            anisotropic: false,
            interaction: InteractionKind::default(),
            igt: IgtParams::default(),
        }
    }
}

impl PhysicsParams {
    /// Dimensionless lattice parameter $kd$.
    pub fn kd(&self) -> f64 {
        self.wavenumber * self.lattice_spacing
    }
}
