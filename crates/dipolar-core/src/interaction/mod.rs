//! Interaction term between two dipoles.
//!
//! [`InteractionTerm`] evaluates the symmetric 3×3 tensor coupling two cells
//! of the lattice separated by an integer displacement `(i, j, k)`, under the
//! formulation selected by [`InteractionKind`]:
//!
//! | Kind | Near field | Far field |
//! |------|-----------|-----------|
//! | `PointDipole` | $G^p$ | $G^p$ |
//! | `FcdStatic` | $G^p$ scaled by a Si-based filter | same |
//! | `Fcd` | $G^p$ plus a Ci/Si-based real correction | same |
//! | `Igt` | cell-averaged $G^p$ within the limit | $G^p$ |
//! | `SecondOrder` | tabulated integrals | scaled $G^p$ plus median term |
//!
//! The self term `(0, 0, 0)` is always zero; it is handled by the caller.

pub mod greens;
pub mod igt;
pub mod second_order;

use std::sync::Arc;

use num_complex::Complex64;
use thiserror::Error;

use crate::params::{IgtParams, InteractionKind, PhysicsParams};
use crate::special::CisiError;
use crate::types::{SymTensor, NDCOMP};

pub use greens::greens_tensor;
pub use second_order::{IntegralTables, RawTables};

use greens::Separation;

/// Errors raised while configuring or evaluating the interaction term.
#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("Invalid physics parameters: {0}")]
    InvalidParams(String),

    #[error("The second-order interaction term requires isotropic materials")]
    Anisotropic,

    #[error(
        "The second-order interaction term supports only one refractive index ({0} given)"
    )]
    MultipleIndices(usize),

    #[error("The second-order interaction term requires tabulated integrals")]
    MissingTables,

    #[error("Not enough table size (available only up to R/d={rmax}), needed for {displacement:?}")]
    TableTooSmall { rmax: usize, displacement: [i64; 3] },

    #[error("Table {table} has {actual} entries, expected {expected}")]
    TableLength {
        table: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Integrated Green's tensor at {r:?} did not reach relative accuracy {eps:e} with order {order}")]
    IgtNotConverged { r: [f64; 3], order: usize, eps: f64 },

    #[error(transparent)]
    Cisi(#[from] CisiError),
}

/// Interaction term for one physics configuration.
#[derive(Debug, Clone)]
pub struct InteractionTerm {
    kind: InteractionKind,
    wavenumber: f64,
    spacing: f64,
    igt: IgtParams,
    /// Square of the refractive index (second-order term only).
    m2: Complex64,
    tables: Option<Arc<IntegralTables>>,
}

impl InteractionTerm {
    /// Validate the physics configuration against the requested formulation.
    pub fn new(
        params: &PhysicsParams,
        tables: Option<Arc<IntegralTables>>,
    ) -> Result<Self, InteractionError> {
        if !(params.lattice_spacing > 0.0) || !params.lattice_spacing.is_finite() {
            return Err(InteractionError::InvalidParams(format!(
                "lattice spacing must be positive, got {}",
                params.lattice_spacing
            )));
        }
        if !(params.wavenumber >= 0.0) || !params.wavenumber.is_finite() {
            return Err(InteractionError::InvalidParams(format!(
                "wavenumber must be non-negative, got {}",
                params.wavenumber
            )));
        }

        let mut m2 = Complex64::new(1.0, 0.0);
        if params.interaction == InteractionKind::SecondOrder {
            if params.anisotropic {
                return Err(InteractionError::Anisotropic);
            }
            let m = match params.refractive_indices.as_slice() {
                [m] => *m,
                other => return Err(InteractionError::MultipleIndices(other.len())),
            };
            if tables.is_none() {
                return Err(InteractionError::MissingTables);
            }
            m2 = m * m;
        }
        if params.interaction == InteractionKind::Igt && !(params.igt.eps > 0.0) {
            return Err(InteractionError::InvalidParams(format!(
                "IGT tolerance must be positive, got {}",
                params.igt.eps
            )));
        }

        Ok(Self {
            kind: params.interaction,
            wavenumber: params.wavenumber,
            spacing: params.lattice_spacing,
            igt: params.igt,
            m2,
            tables,
        })
    }

    pub fn kind(&self) -> InteractionKind {
        self.kind
    }

    /// Check that every displacement inside a box of `box_dims` cells can be
    /// evaluated from the tabulated integrals.
    ///
    /// Only depends on the box and the physics, so all partitions reach the
    /// same verdict without communicating. Displacements are reported in the
    /// positive octant.
    pub fn check_box(&self, box_dims: [usize; 3]) -> Result<(), InteractionError> {
        let tables = match (&self.kind, &self.tables) {
            (InteractionKind::SecondOrder, Some(tables)) => tables,
            _ => return Ok(()),
        };
        let rmax2 = (tables.rmax() * tables.rmax()) as u64;
        // close range needs kd * rn^2 < 1
        let kd = self.wavenumber * self.spacing;
        if kd * rmax2 as f64 >= 1.0 {
            return Ok(());
        }
        let reach = if kd > 0.0 {
            (1.0 / kd).sqrt().floor() as usize + 1
        } else {
            usize::MAX
        };
        let [bx, by, bz] = box_dims.map(|b| b.min(reach.saturating_add(1)));
        let d = self.spacing;
        for i in 0..bx {
            for j in 0..by {
                for k in 0..bz {
                    let r2 = (i * i + j * j + k * k) as u64;
                    if r2 <= rmax2 {
                        continue;
                    }
                    let r = [i as f64 * d, j as f64 * d, k as f64 * d];
                    if second_order::is_close(&Separation::new(r, self.wavenumber, d)) {
                        return Err(InteractionError::TableTooSmall {
                            rmax: tables.rmax(),
                            displacement: [i as i64, j as i64, k as i64],
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Tensor for the lattice displacement `(i, j, k)`, in units of the
    /// lattice spacing.
    pub fn evaluate(&self, i: i64, j: i64, k: i64) -> Result<SymTensor, InteractionError> {
        if i == 0 && j == 0 && k == 0 {
            return Ok([Complex64::new(0.0, 0.0); NDCOMP]);
        }
        let d = self.spacing;
        let r = [i as f64 * d, j as f64 * d, k as f64 * d];
        let sep = Separation::new(r, self.wavenumber, d);

        match self.kind {
            InteractionKind::PointDipole => Ok(greens::point_dipole(&sep)),
            InteractionKind::FcdStatic => {
                let mut g = greens::point_dipole(&sep);
                greens::apply_fcd_static(&sep, &mut g)?;
                Ok(g)
            }
            InteractionKind::Fcd => {
                let mut g = greens::point_dipole(&sep);
                greens::apply_fcd(&sep, &mut g)?;
                Ok(g)
            }
            InteractionKind::Igt => match self.igt.limit {
                Some(limit) if sep.rn > limit => Ok(greens::point_dipole(&sep)),
                _ => igt::integrated_tensor(r, self.wavenumber, d, self.igt.eps),
            },
            InteractionKind::SecondOrder => {
                let kd = self.wavenumber * d;
                if second_order::is_close(&sep) {
                    let tables = self.tables.as_deref().ok_or(InteractionError::MissingTables)?;
                    second_order::close(&sep, [i, j, k], kd, self.m2, tables)
                } else {
                    let mut g = greens::point_dipole(&sep);
                    second_order::apply_far(&sep, &mut g, kd, self.m2);
                    Ok(g)
                }
            }
        }
    }
}
