//! Result export
//!
//! Writes one batch's outcomes to a timestamped CSV or JSON file.

use crate::config::{ExportConfig, ExportFormat};
use crate::error::CliResult;
use chrono::Local;
use flow_engine::{AccountOutcome, BatchResult};
use registration_common::Account;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Serialize)]
struct JsonReport<'a> {
    total: usize,
    success: usize,
    failed: usize,
    elapsed_s: f64,
    results: Vec<&'a AccountOutcome>,
    accounts: Vec<&'a Account>,
}

/// Write `result` under the configured directory and return the file path.
///
/// Failed outcomes, and their accounts in JSON output, are left out unless
/// `include_failed` is set.
pub fn export_results(result: &BatchResult, accounts: &[Account], config: &ExportConfig) -> CliResult<PathBuf> {
    let dir = Path::new(&config.path);
    std::fs::create_dir_all(dir)?;
    let file = dir.join(format!(
        "registration_results_{}.{}",
        Local::now().format("%Y%m%d_%H%M%S"),
        config.format.extension()
    ));

    let rows: Vec<&AccountOutcome> = result
        .results
        .iter()
        .filter(|outcome| outcome.success || config.include_failed)
        .collect();

    match config.format {
        ExportFormat::Csv => write_csv(&file, &rows)?,
        ExportFormat::Json => {
            let exported: Vec<&Account> = accounts
                .iter()
                .filter(|account| rows.iter().any(|row| row.account == account.email))
                .collect();
            let report = JsonReport {
                total: result.total,
                success: result.success,
                failed: result.failed,
                elapsed_s: result.elapsed_s,
                results: rows.clone(),
                accounts: exported,
            };
            std::fs::write(&file, serde_json::to_string_pretty(&report)?)?;
        }
    }

    info!("Exported {} result(s) to {}", rows.len(), file.display());
    Ok(file)
}

fn write_csv(path: &Path, rows: &[&AccountOutcome]) -> CliResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["account", "success", "error", "elapsed_ms"])?;
    for row in rows {
        let elapsed = row.elapsed_ms.to_string();
        writer.write_record([
            row.account.as_str(),
            if row.success { "true" } else { "false" },
            row.error.as_deref().unwrap_or(""),
            elapsed.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
