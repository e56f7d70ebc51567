//! Fieldsmith CLI — batch-mode LLM enrichment for product records.
//!
//! Segments field-mapped records into token-budgeted batch jobs, carries
//! context between batches, and reconciles validated results.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
