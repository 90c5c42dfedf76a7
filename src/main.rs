use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{info, warn};

use quake_regression::{Result, config::RunConfig, export::format_float, pipeline};

/// Predicts earthquake magnitude, depth or epicenter from imagery.
#[derive(Debug, Parser)]
#[command(name = "quake", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train a model, keep the best validation checkpoint and test it.
    Train {
        /// The JSON run file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Test a trained model and export its predictions.
    Test {
        /// The JSON run file.
        #[arg(short, long)]
        config: PathBuf,
        /// A checkpoint written by `train`.
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

impl Command {
    fn config(&self) -> &PathBuf {
        match self {
            Self::Train { config } | Self::Test { config, .. } => config,
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = RunConfig::from_path(cli.command.config())?;
    if let Some(threads) = config.training.threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
            warn!("couldn't size the thread pool: {e}");
        }
    }

    let report = match &cli.command {
        Command::Train { .. } => {
            let fit = pipeline::fit(&config)?;
            info!(
                epoch = fit.best_epoch;
                "best checkpoint saved to {}",
                fit.checkpoint.display()
            );

            match fit.test {
                Some(report) => report,
                None => return Ok(()),
            }
        }
        Command::Test { checkpoint, .. } => pipeline::evaluate(&config, checkpoint)?,
    };

    println!("Predictions saved, with MAE = {}", format_float(report.mae));
    Ok(())
}
