//! Job runner: builds the dipole set, spreads it over partitions and times
//! the interaction operator.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use dipolar_compute::{Communicator, SerialComm, ThreadComm};
use dipolar_core::operator::{
    build_operator, estimate_memory, KernelStats, MatVecError, MemoryEstimate,
};
use dipolar_core::{
    CouplingTable, DenseFftOperator, DipoleLattice, DirectOperator, GridLayout, InitOutcome,
    IntegralTables, InteractionKind, InteractionTerm, MatVec, MatVecRequest, MatVecStats, OperatorKind,
    OperatorOptions, Problem,
};

use crate::config::{BackendKind, GeometryConfig, JobConfig, ShapeKind};

/// Summary of a run, produced by the root partition.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub operator: OperatorKind,
    pub interaction: InteractionKind,
    pub box_dims: [usize; 3],
    pub grid: [usize; 3],
    pub partitions: usize,
    pub reduced_fft: bool,
    pub dipoles: usize,
    /// Per-partition memory of the FFT operator, or of any operator in a
    /// prognosis.
    pub memory: Option<MemoryEstimate>,
    pub kernel: Option<KernelStats>,
    pub matvec: Option<MatVecStats>,
    /// Squared norm of the last product.
    pub norm_sqr: Option<f64>,
    /// Relative difference between the FFT and pairwise products.
    pub cross_check_error: Option<f64>,
}

/// Inputs shared by every partition.
pub struct Prepared {
    pub lattice: DipoleLattice,
    pub coupling: CouplingTable,
    pub tables: Option<Arc<IntegralTables>>,
}

/// Clausius-Mossotti polarisability of a cubic cell of side `d`, Gaussian
/// units:
///
/// $\alpha_{CM} = \frac{3 d^3}{4\pi} \frac{m^2 - 1}{m^2 + 2}$
pub fn clausius_mossotti(d: f64, m: Complex64) -> Complex64 {
    let eps = m * m;
    3.0 * d.powi(3) / (4.0 * std::f64::consts::PI) * (eps - 1.0) / (eps + 2.0)
}

/// Radiative reaction correction, $\alpha / (1 - \tfrac{2}{3} i k^3 \alpha)$.
pub fn radiative_correction(alpha: Complex64, k: f64) -> Complex64 {
    let correction = Complex64::new(0.0, 2.0 * k.powi(3) / 3.0);
    alpha / (Complex64::from(1.0) - correction * alpha)
}

/// Coupling square roots of every material from its refractive index.
pub fn coupling_from_indices(indices: &[Complex64], k: f64, d: f64) -> CouplingTable {
    let values: Vec<Complex64> = indices
        .iter()
        .map(|&m| radiative_correction(clausius_mossotti(d, m), k).sqrt())
        .collect();
    CouplingTable::isotropic(&values)
}

/// Dipole positions of the configured shape, in z-major order.
pub fn build_lattice(geometry: &GeometryConfig, materials: usize) -> Result<DipoleLattice> {
    let [bx, by, bz] = geometry.box_dims;
    let mut rng = StdRng::seed_from_u64(geometry.seed);
    let mut positions = Vec::new();
    let mut material = Vec::new();
    for z in 0..bz {
        for y in 0..by {
            for x in 0..bx {
                let keep = match geometry.shape {
                    ShapeKind::Cuboid => true,
                    ShapeKind::Ellipsoid => {
                        let r2: f64 = [(x, bx), (y, by), (z, bz)]
                            .iter()
                            .map(|&(i, n)| {
                                let u = (i as f64 + 0.5) / n as f64 * 2.0 - 1.0;
                                u * u
                            })
                            .sum();
                        r2 <= 1.0
                    }
                    ShapeKind::Random => rng.gen_bool(geometry.fill),
                };
                if keep {
                    positions.push([x, y, z]);
                    material.push(match geometry.shape {
                        ShapeKind::Random => rng.gen_range(0..materials),
                        _ => 0,
                    });
                }
            }
        }
    }
    if positions.is_empty() {
        anyhow::bail!("No dipoles generated; check the geometry configuration");
    }
    Ok(DipoleLattice::new(geometry.box_dims, positions, material)?)
}

/// Build the lattice and coupling table, and load the integral tables.
pub fn prepare(job: &JobConfig) -> Result<Prepared> {
    let physics = &job.physics;
    let lattice = build_lattice(&job.geometry, physics.refractive_indices.len())?;
    let coupling = coupling_from_indices(
        &physics.refractive_indices,
        physics.wavenumber,
        physics.lattice_spacing,
    );
    let tables = match (&job.operator.tables, physics.interaction) {
        (Some(path), _) => Some(Arc::new(load_tables(path)?)),
        (None, InteractionKind::SecondOrder) => {
            anyhow::bail!("The second-order interaction requires `operator.tables`")
        }
        (None, _) => None,
    };
    Ok(Prepared {
        lattice,
        coupling,
        tables,
    })
}

/// Grid layout of one partition, from the explicit grid when one is given.
fn layout_for(job: &JobConfig, nprocs: usize, rank: usize) -> Result<GridLayout> {
    let box_dims = job.geometry.box_dims;
    let reduced = job.operator.reduced_fft;
    Ok(match job.geometry.grid {
        Some(grid) => GridLayout::with_grid(box_dims, grid, nprocs, rank, reduced)?,
        None => GridLayout::new(box_dims, nprocs, rank, reduced)?,
    })
}

/// Everything that can be checked without building the operator: the
/// geometry, the tables, the grid for the configured partition count and the
/// interaction term over the whole box.
pub fn validate_job(job: &JobConfig) -> Result<GridLayout> {
    let prepared = prepare(job)?;
    let layout = layout_for(job, job.operator.partitions, 0)?;
    if layout.reduced_fft() && !job.physics.interaction.supports_reduced_fft() {
        anyhow::bail!(
            "The {:?} interaction cannot use the reduced kernel; set `operator.reduced_fft = false`",
            job.physics.interaction
        );
    }
    let term = InteractionTerm::new(&job.physics, prepared.tables)?;
    term.check_box(layout.box_dims())?;
    Ok(layout)
}

fn load_tables(path: &Path) -> Result<IntegralTables> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Reading integral tables from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Parsing integral tables from {}", path.display()))
}

/// Run the job on the configured backend. Returns the report on the root
/// partition and `None` elsewhere.
pub fn run_job(job: &JobConfig, prognosis: bool) -> Result<Option<RunReport>> {
    let prepared = prepare(job)?;
    println!(
        "Dipoles: {} in box {:?} ({:?})",
        prepared.lattice.len(),
        prepared.lattice.box_dims(),
        job.geometry.shape
    );
    match job.operator.backend {
        BackendKind::Threads => run_threaded(job, &prepared, prognosis).map(Some),
        BackendKind::Mpi => run_mpi(job, &prepared, prognosis),
    }
}

fn run_threaded(job: &JobConfig, prepared: &Prepared, prognosis: bool) -> Result<RunReport> {
    let nprocs = job.operator.partitions;
    if nprocs == 1 {
        return run_partition(SerialComm::new(), job, prepared, prognosis)?
            .context("Serial run produced no report");
    }
    thread::scope(|s| {
        let handles: Vec<_> = ThreadComm::cluster(nprocs)
            .into_iter()
            .map(|comm| s.spawn(move || run_partition(comm, job, prepared, prognosis)))
            .collect();
        // join every partition before reporting a failure
        let results: Vec<Result<Option<RunReport>>> = handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("Partition {} panicked", rank)))
            })
            .collect();
        let mut report = None;
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(r) => report = report.or(r),
                Err(e) => failures.push(e),
            }
        }
        // report the partition that failed, not those that followed it
        if let Some(first) = failures.iter().position(|e| !is_follower(e)) {
            return Err(failures.swap_remove(first));
        }
        if let Some(e) = failures.pop() {
            return Err(e);
        }
        report.context("Root partition produced no report")
    })
}

fn is_follower(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<MatVecError>(),
        Some(MatVecError::PartitionFailed { .. })
    )
}

#[cfg(feature = "mpi")]
fn run_mpi(job: &JobConfig, prepared: &Prepared, prognosis: bool) -> Result<Option<RunReport>> {
    use dipolar_compute::MpiComm;

    let universe = mpi::initialize().context("MPI initialisation failed")?;
    run_partition(MpiComm::new(universe.world()), job, prepared, prognosis)
}

#[cfg(not(feature = "mpi"))]
fn run_mpi(_job: &JobConfig, _prepared: &Prepared, _prognosis: bool) -> Result<Option<RunReport>> {
    anyhow::bail!("This binary was built without the `mpi` feature")
}

/// Everything one partition does: build its operator, time the products and
/// optionally compare with the pairwise sum. Collective over `comm`.
fn run_partition<C: Communicator + 'static>(
    comm: C,
    job: &JobConfig,
    prepared: &Prepared,
    prognosis: bool,
) -> Result<Option<RunReport>> {
    let cfg = &job.operator;
    let is_root = comm.is_root();
    let (nprocs, rank) = (comm.size(), comm.rank());
    let lattice = &prepared.lattice;
    let box_dims = lattice.box_dims();
    let layout = layout_for(job, nprocs, rank)?;
    let problem = Problem {
        layout: &layout,
        lattice,
        coupling: &prepared.coupling,
        params: &job.physics,
        tables: prepared.tables.clone(),
    };
    let mut report = RunReport {
        operator: cfg.kind,
        interaction: job.physics.interaction,
        box_dims,
        grid: layout.grid(),
        partitions: nprocs,
        reduced_fft: layout.reduced_fft(),
        dipoles: lattice.len(),
        memory: None,
        kernel: None,
        matvec: None,
        norm_sqr: None,
        cross_check_error: None,
    };

    if prognosis {
        let options = OperatorOptions {
            prognosis: true,
            ..OperatorOptions::default()
        };
        if let InitOutcome::Prognosis(memory) = build_operator(cfg.kind, comm, &problem, options)? {
            report.memory = Some(memory);
        }
        return Ok(is_root.then_some(report));
    }

    // Every partition draws the same global vector and keeps its own slice.
    let local_z = layout.local_z();
    let local = lattice.z_range(local_z.start, local_z.end);
    let global = random_vector(3 * lattice.len(), job.geometry.seed.wrapping_add(1));
    let x = &global[3 * local.start..3 * local.end];
    let request = MatVecRequest {
        hermitian: cfg.hermitian,
        inner_product: cfg.inner_product,
    };

    match cfg.kind {
        OperatorKind::Fft => {
            let needs_transposed = job.physics.interaction == InteractionKind::SecondOrder;
            report.memory = Some(estimate_memory(&layout, needs_transposed)?);
            let mut op = DenseFftOperator::init(comm, &problem, OperatorOptions::default())?
                .ready()
                .context("FFT operator was not built")?;
            report.kernel = Some(*op.kernel_stats());
            let (y, norm) = run_products(&mut op, x, request, cfg.matvecs, is_root)?;
            report.norm_sqr = norm;
            let (comm, stats) = op.release();
            report.matvec = Some(stats);
            if cfg.cross_check {
                let error = cross_check(comm, &problem, x, &y, cfg.hermitian)?;
                if is_root {
                    println!("Cross-check against the pairwise sum: relative error {:.3e}", error);
                }
                report.cross_check_error = Some(error);
            }
        }
        OperatorKind::Direct => {
            let mut op = DirectOperator::init(comm, &problem, OperatorOptions::default())?
                .ready()
                .context("Direct operator was not built")?;
            let (_, norm) = run_products(&mut op, x, request, cfg.matvecs, is_root)?;
            report.norm_sqr = norm;
            report.matvec = Some(op.stats().clone());
            if cfg.cross_check && is_root {
                log::warn!("cross_check only applies to the FFT operator; skipped");
            }
        }
    }
    Ok(is_root.then_some(report))
}

/// Apply `op` to `x` `count` times; returns the last result and inner
/// product.
fn run_products(
    op: &mut dyn MatVec,
    x: &[Complex64],
    request: MatVecRequest,
    count: usize,
    is_root: bool,
) -> Result<(Vec<Complex64>, Option<f64>)> {
    let mut y = vec![Complex64::default(); x.len()];
    let mut norm = None;
    for i in 0..count {
        norm = op.apply(x, &mut y, request)?;
        if is_root && ((i + 1) % 10 == 0 || i == 0 || i + 1 == count) {
            println!(
                "  [{}/{}] {} product: {:.3e} s mean",
                i + 1,
                count,
                op.name(),
                op.stats().mean_time()
            );
        }
    }
    Ok((y, norm))
}

/// Relative difference between `y_fft` and the pairwise product of the same
/// argument, over all partitions.
fn cross_check<C: Communicator>(
    comm: C,
    problem: &Problem<'_>,
    x: &[Complex64],
    y_fft: &[Complex64],
    hermitian: bool,
) -> Result<f64> {
    let mut direct = DirectOperator::init(comm, problem, OperatorOptions::default())?
        .ready()
        .context("Direct operator was not built")?;
    let mut y = vec![Complex64::default(); x.len()];
    let request = MatVecRequest {
        hermitian,
        inner_product: false,
    };
    direct.apply(x, &mut y, request)?;
    let (comm, _) = direct.release();

    let diff: f64 = y.iter().zip(y_fft).map(|(a, b)| (a - b).norm_sqr()).sum();
    let norm: f64 = y.iter().map(|v| v.norm_sqr()).sum();
    let diff = comm.all_reduce_sum(diff)?;
    let norm = comm.all_reduce_sum(norm)?;
    Ok(if norm > 0.0 { (diff / norm).sqrt() } else { diff.sqrt() })
}

fn random_vector(len: usize, seed: u64) -> Vec<Complex64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| Complex64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
        .collect()
}

/// Write the run report to a JSON file.
pub fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(report)
        .map_err(|e| anyhow::anyhow!("JSON serialisation error: {}", e))?;
    std::fs::write(path, json)?;

    println!("Report written to: {}", path.display());
    Ok(())
}
