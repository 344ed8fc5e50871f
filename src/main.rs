mod clarify;
mod cli;
mod commands;
mod constraints;
mod corrector;
mod error;
mod external;
mod generator;
mod model;
mod objectives;
mod orchestrator;
mod policy;
mod predictor;
mod ranker;
mod registry;
mod reward;
mod semantic;
mod space;
mod store;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Space(args) => commands::space::run(args),
        Commands::Corpus(args) => commands::corpus::run(args),
        Commands::Train(args) => commands::train::run(args),
        Commands::Recommend(args) => commands::recommend::run(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
