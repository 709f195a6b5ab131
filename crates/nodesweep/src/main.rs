mod agent;
mod batch;
mod cli;
mod collect;
mod config;
mod poll;
mod repo;

use clap::Parser;
use cli::{Cli, Commands};
use std::io;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Batch(args) => batch::run(args.into_options()).await,
        Commands::AgentReset(args) => agent::run(args.into_options()).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);
    tracing_subscriber::registry().with(filter).with(layer).init();
}
