//! `toolstage`: resolve, stage and run bundled per-platform tools.

mod cli;
mod commands;
mod tracing;

use clap::Parser;
use std::process::ExitCode;

use crate::tracing::TracingConfig;

#[tokio::main]
async fn main() -> miette::Result<ExitCode> {
    let cli = cli::Cli::parse();

    crate::tracing::init_tracing(TracingConfig {
        format: cli.log_format,
        level: cli.level.into(),
        ..TracingConfig::default()
    })?;

    commands::execute(cli).await
}
