//! TOML configuration deserialisation for operator jobs.

use std::path::{Path, PathBuf};

use dipolar_core::{OperatorKind, PhysicsParams};
use serde::Deserialize;

/// Top-level job configuration.
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub geometry: GeometryConfig,
    pub physics: PhysicsParams,
    #[serde(default)]
    pub operator: OperatorConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Shape of the dipole set inside the bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    /// Every cell of the box.
    #[default]
    Cuboid,
    /// Ellipsoid inscribed in the box.
    Ellipsoid,
    /// Random subset of the cells, with random materials.
    Random,
}

/// Geometry configuration from TOML.
#[derive(Debug, Deserialize)]
pub struct GeometryConfig {
    /// Bounding box in lattice cells.
    #[serde(rename = "box")]
    pub box_dims: [usize; 3],
    #[serde(default)]
    pub shape: ShapeKind,
    /// Explicit padded grid; chosen automatically when absent.
    #[serde(default)]
    pub grid: Option<[usize; 3]>,
    /// Fraction of occupied cells for the random shape.
    #[serde(default = "default_fill")]
    pub fill: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_fill() -> f64 {
    0.5
}
fn default_seed() -> u64 {
    1
}

/// Transport between partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// One thread per partition inside this process.
    #[default]
    Threads,
    /// One MPI rank per partition (requires the `mpi` feature).
    Mpi,
}

/// Operator configuration from TOML.
#[derive(Debug, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub kind: OperatorKind,
    #[serde(default)]
    pub backend: BackendKind,
    /// Partitions of a threaded run.
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    #[serde(default = "default_true")]
    pub reduced_fft: bool,
    /// Number of products to time.
    #[serde(default = "default_matvecs")]
    pub matvecs: usize,
    #[serde(default)]
    pub hermitian: bool,
    #[serde(default = "default_true")]
    pub inner_product: bool,
    /// Compare the FFT product with the pairwise sum.
    #[serde(default)]
    pub cross_check: bool,
    /// JSON file with the second-order integral tables.
    #[serde(default)]
    pub tables: Option<PathBuf>,
}

fn default_partitions() -> usize {
    1
}
fn default_matvecs() -> usize {
    10
}
fn default_true() -> bool {
    true
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            kind: OperatorKind::default(),
            backend: BackendKind::default(),
            partitions: default_partitions(),
            reduced_fft: true,
            matvecs: default_matvecs(),
            hermitian: false,
            inner_product: true,
            cross_check: false,
            tables: None,
        }
    }
}

/// Output configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Output directory (default: "./output").
    #[serde(default = "default_output_dir")]
    pub directory: String,
    /// Whether to write the JSON run report (default: true).
    #[serde(default = "default_true")]
    pub save_report: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            save_report: true,
        }
    }
}

fn default_output_dir() -> String {
    "./output".into()
}

/// Load and parse a TOML job configuration file.
pub fn load_config(path: &Path) -> anyhow::Result<JobConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: JobConfig = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

/// Reject settings no run can use.
pub fn validate(job: &JobConfig) -> anyhow::Result<()> {
    let physics = &job.physics;
    if !(physics.wavenumber > 0.0) || !(physics.lattice_spacing > 0.0) {
        anyhow::bail!("wavenumber and lattice_spacing must be positive");
    }
    if physics.refractive_indices.is_empty() {
        anyhow::bail!("at least one refractive index is required");
    }
    if job.geometry.box_dims.contains(&0) {
        anyhow::bail!("bounding box {:?} has an empty axis", job.geometry.box_dims);
    }
    if !(job.geometry.fill > 0.0 && job.geometry.fill <= 1.0) {
        anyhow::bail!("fill must lie in (0, 1], got {}", job.geometry.fill);
    }
    if job.operator.partitions == 0 {
        anyhow::bail!("partitions must be at least 1");
    }
    if job.operator.matvecs == 0 {
        anyhow::bail!("matvecs must be at least 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dipolar_core::InteractionKind;

    #[test]
    fn test_minimal_job_takes_defaults() {
        let job: JobConfig = toml::from_str(
            r#"
            [geometry]
            box = [4, 5, 6]

            [physics]
            wavenumber = 6.283
            lattice_spacing = 0.05
            "#,
        )
        .unwrap();
        assert_eq!(job.geometry.shape, ShapeKind::Cuboid);
        assert!(job.geometry.grid.is_none());
        assert_eq!(job.operator.kind, OperatorKind::Fft);
        assert_eq!(job.operator.partitions, 1);
        assert!(job.operator.reduced_fft);
        assert!(job.output.save_report);
    }

    #[test]
    fn test_full_job() {
        let job: JobConfig = toml::from_str(
            r#"
            [geometry]
            box = [8, 8, 8]
            shape = "random"
            grid = [16, 16, 32]
            fill = 0.3
            seed = 7

            [physics]
            wavenumber = 1.0
            lattice_spacing = 0.2
            refractive_indices = [[1.5, 0.01], [2.0, 0.0]]
            interaction = "igt"
            igt = { limit = 3.0 }

            [operator]
            kind = "direct"
            partitions = 4
            reduced_fft = false
            matvecs = 2
            hermitian = true
            cross_check = true
            tables = "tables.json"

            [output]
            directory = "/tmp/out"
            "#,
        )
        .unwrap();
        assert_eq!(job.geometry.shape, ShapeKind::Random);
        assert_eq!(job.geometry.grid, Some([16, 16, 32]));
        assert_eq!(job.physics.interaction, InteractionKind::Igt);
        assert_eq!(job.physics.igt.limit, Some(3.0));
        assert_eq!(job.physics.refractive_indices.len(), 2);
        assert_eq!(job.operator.kind, OperatorKind::Direct);
        assert_eq!(job.operator.tables, Some(PathBuf::from("tables.json")));
        assert_eq!(job.output.directory, "/tmp/out");
    }

    #[test]
    fn test_validate_rejects_zero_partitions() {
        let mut job: JobConfig = toml::from_str(
            r#"
            [geometry]
            box = [2, 2, 2]

            [physics]
            wavenumber = 1.0
            lattice_spacing = 0.2
            "#,
        )
        .unwrap();
        assert!(validate(&job).is_ok());
        job.operator.partitions = 0;
        assert!(validate(&job).is_err());
        job.operator.partitions = 2;
        job.geometry.fill = 0.0;
        assert!(validate(&job).is_err());
    }

    #[test]
    fn test_unknown_shape_is_rejected() {
        let result: Result<JobConfig, _> = toml::from_str(
            r#"
            [geometry]
            box = [2, 2, 2]
            shape = "torus"

            [physics]
            wavenumber = 1.0
            lattice_spacing = 0.2
            "#,
        );
        assert!(result.is_err());
    }
}
