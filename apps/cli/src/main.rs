//! cardpipe CLI: batch flashcard enrichment through a generation service.
//!
//! Splits a note collection into chunks, sends each chunk with an
//! instruction document, validates the replies, and applies the results
//! back to the flashcard store.

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
