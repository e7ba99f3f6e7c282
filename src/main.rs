mod config;
mod data;
mod engine;
mod error;
mod nn;
mod summary;

use anyhow::Result;
use clap::Parser;

use config::Options;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut options = Options::parse();
    options.validate()?;

    let output_dir = config::prepare_output_dir(&mut options)?;
    let hparams = config::write_hparams(&options, &output_dir)?;
    tracing::info!("Hyperparameters written to {}", hparams.display());

    let seed = config::resolve_seed(options.seed);
    nn::training::train(options, seed)
}
