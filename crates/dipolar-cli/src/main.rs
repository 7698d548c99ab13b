//! Dipolar command-line interface.
//!
//! Build and time the interaction operator from TOML job files:
//! ```sh
//! dipolar run job.toml
//! dipolar prognosis job.toml
//! dipolar validate job.toml
//! ```

mod config;
mod runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dipolar")]
#[command(about = "Dipolar: FFT-accelerated coupled dipole interaction operator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the operator and time its products.
    Run {
        /// Path to the job configuration file.
        config: PathBuf,
        /// Output directory (overrides config file setting).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Estimate the memory of the operator without building it.
    Prognosis {
        /// Path to the job configuration file.
        config: PathBuf,
    },
    /// Check the configuration, the grid and the interaction term without
    /// building the operator.
    Validate {
        /// Path to the job configuration file.
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, output } => {
            let job = config::load_config(&config)?;
            let Some(report) = runner::run_job(&job, false)? else {
                return Ok(());
            };
            println!("Configuration: {}", config.display());
            println!(
                "Grid {:?} on {} partition(s), {} dipoles",
                report.grid, report.partitions, report.dipoles
            );

            let out_dir = output.unwrap_or_else(|| PathBuf::from(&job.output.directory));
            if job.output.save_report {
                runner::write_report(&report, &out_dir.join("report.json"))?;
            }
            println!("Run complete.");
            Ok(())
        }
        Commands::Prognosis { config } => {
            let job = config::load_config(&config)?;
            let Some(report) = runner::run_job(&job, true)? else {
                return Ok(());
            };
            if let Some(memory) = report.memory {
                let mb = |bytes: usize| bytes as f64 / (1024.0 * 1024.0);
                println!("Memory per partition (MB):");
                println!("  kernel          {:10.1}", mb(memory.kernel));
                println!("  product buffers {:10.1}", mb(memory.matvec_buffers));
                println!("  comm buffers    {:10.1}", mb(memory.comm_buffers));
                println!("  peak            {:10.1}", mb(memory.peak()));
            }
            Ok(())
        }
        Commands::Validate { config } => {
            let job = config::load_config(&config)?;
            let layout = runner::validate_job(&job)?;
            println!("Configuration is valid: {}", config.display());
            println!(
                "Grid {:?} for box {:?} on {} partition(s)",
                layout.grid(),
                layout.box_dims(),
                layout.nprocs()
            );
            Ok(())
        }
    }
}
