//! Generate emulator training samples or calibrate a simulator.
//!
//! Usage: `epi-calibrate generate <config>` or `epi-calibrate infer <config>`

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use epi_calibrate::config::GenerationConfig;
use epi_calibrate::generator::generate;
use epi_calibrate::inference::{InferenceEngine, InferenceOutcome};

#[derive(Parser, Debug)]
#[command(name = "epi-calibrate")]
#[command(about = "Calibrate a stochastic epidemic simulator against observed data")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run Latin Hypercube parameter sweeps and save replica means and stds
    Generate {
        /// Path to the generation YAML file
        config: PathBuf,
    },
    /// Fit simulator parameters with nested sampling or MCMC
    Infer {
        /// Path to the inference YAML file
        config: PathBuf,
    },
}

fn run(args: Args) -> epi_calibrate::Result<()> {
    match args.command {
        Command::Generate { config } => {
            let config = GenerationConfig::from_file(&config)?;
            let dataset = generate(&config)?;
            info!(
                samples = dataset.n_samples(),
                timesteps = dataset.means.ncols(),
                "generation done"
            );
        }
        Command::Infer { config } => match InferenceEngine::from_file(&config)?.run()? {
            InferenceOutcome::NestedSampling(table) => {
                info!(rows = table.rows(), "nested sampling done");
            }
            InferenceOutcome::Mcmc(results) => {
                info!(chains = results.chains.len(), "mcmc done");
            }
        },
    }
    Ok(())
}

fn main() {
    epi_calibrate::init_logging();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("{e}");
        process::exit(1);
    }
}
