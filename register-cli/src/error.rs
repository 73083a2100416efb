//! CLI Error Types

use flow_engine::FlowEngineError;
use thiserror::Error;

/// Errors surfaced by the `register` command
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error(transparent)]
    Engine(#[from] FlowEngineError),

    #[error("Interrupted by user")]
    Interrupted,
}

impl CliError {
    pub fn config(message: impl Into<String>) -> Self {
        CliError::Config(message.into())
    }

    /// Process exit code for this failure.
    ///
    /// 1 for configuration, file and flow validation problems, 130 for an
    /// interrupt and 2 for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Config(_) | CliError::Io(_) | CliError::Json(_) => 1,
            CliError::Engine(
                FlowEngineError::NotFound { .. } | FlowEngineError::Parse(_) | FlowEngineError::Validation(_),
            ) => 1,
            CliError::Interrupted => 130,
            _ => 2,
        }
    }
}

/// Result type alias for CLI operations
pub type CliResult<T> = Result<T, CliError>;
