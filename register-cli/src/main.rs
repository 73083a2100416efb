//! Register Binary Entry Point

use anyhow::Context;
use clap::Parser;
use flow_engine::StopSignal;
use register_cli::{execute, init_logging, load_config, Cli, CliError};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(ExitCode::from(e.exit_code()));
        }
    };
    let _guard = init_logging(&config.logging).context("failed to initialise logging")?;

    let stop = StopSignal::new();
    let run = execute(&cli.command, &config, stop.clone());
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupt received, stopping after the current step (Ctrl-C again to abort)");
            stop.stop();
            tokio::select! {
                result = &mut run => result,
                _ = tokio::signal::ctrl_c() => Err(CliError::Interrupted),
            }
        }
    };

    let code = match result {
        Ok(()) if stop.is_stopped() => CliError::Interrupted.exit_code(),
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{}", e);
            if stop.is_stopped() {
                CliError::Interrupted.exit_code()
            } else {
                e.exit_code()
            }
        }
    };
    Ok(ExitCode::from(code))
}
