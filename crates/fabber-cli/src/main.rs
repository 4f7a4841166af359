//! Fabber CLI - parallel Bayesian model fitting over imaging volumes.

mod models;
mod run;
mod volume_io;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fabber_core::LogPolicy;

#[derive(Parser)]
#[command(name = "fabber")]
#[command(about = "Parallel Bayesian model fitting over imaging volumes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model to every masked voxel, one worker per slice
    Run {
        /// Data volume (JSON). Repeat to stack several volumes along time
        #[arg(long, required = true)]
        data: Vec<PathBuf>,

        /// Name for each data volume, in order (default: file stem)
        #[arg(long)]
        data_name: Vec<String>,

        /// Mask volume (JSON); voxels > 0 are fitted
        #[arg(long)]
        mask: Option<PathBuf>,

        /// Run options as a JSON object
        #[arg(long)]
        options: Option<PathBuf>,

        /// Run option as key=value, or a bare key for a flag
        #[arg(short = 'o', long = "option")]
        option: Vec<String>,

        /// Rename an output as key=name
        #[arg(long)]
        rename: Vec<String>,

        /// Path to the engine core library
        #[arg(long)]
        core_lib: Option<PathBuf>,

        /// Directory containing model group libraries
        #[arg(long)]
        model_path: Vec<PathBuf>,

        /// Worker threads (0 = one per CPU)
        #[arg(long, default_value = "0")]
        threads: usize,

        /// Which worker logs to keep: first or concatenate
        #[arg(long, default_value = "first", value_parser = run::parse_log_policy)]
        log_policy: LogPolicy,

        /// Output directory
        #[arg(long)]
        output: PathBuf,
    },

    /// List available model groups
    Models {
        /// Directory containing model group libraries
        #[arg(long)]
        model_path: Vec<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            data,
            data_name,
            mask,
            options,
            option,
            rename,
            core_lib,
            model_path,
            threads,
            log_policy,
            output,
        } => {
            let args = run::RunArgs {
                data,
                data_names: data_name,
                mask,
                options,
                assignments: option,
                renames: rename,
                core_lib,
                model_path,
                threads,
                log_policy,
                output,
            };
            run::execute(&args)?;
        }

        Commands::Models { model_path } => {
            models::execute(&model_path)?;
        }
    }

    Ok(())
}
