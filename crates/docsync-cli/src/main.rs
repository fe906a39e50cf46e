//! docsync: the task list and note from the command line.
//!
//! Uses the same docsync-core as the browser panels, with a directory-backed
//! local store and a directory standing in for the remote API.

use anyhow::Result;
use clap::Parser;
use docsync_cli::{Cli, execute};
use docsync_core::SyncConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging - respects RUST_LOG env var, defaults to warn (or debug with --verbose)
    let default_filter = if cli.verbose {
        "info,docsync_core=debug,docsync_cli=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = SyncConfig::from_env()?;
    let output = execute(&cli, config).await?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
