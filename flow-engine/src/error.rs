//! Flow Engine Error Types

use thiserror::Error;

/// Main error type for the flow engine
#[derive(Debug, Error)]
pub enum FlowEngineError {
    #[error("Flow document not found: {path}")]
    NotFound { path: String },

    #[error("Flow document parse error: {0}")]
    Parse(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Timeout waiting for {condition}: {details}")]
    Timeout { condition: String, details: String },

    #[error("Stale element reference: {locator}")]
    StaleElement { locator: String },

    #[error("Element not found: {selector}")]
    ElementNotFound { selector: String },

    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("Page navigation failed: {0}")]
    Navigation(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Mailbox error: {0}")]
    Mailbox(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowEngineError {
    /// Shorthand for a validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        FlowEngineError::Validation(message.into())
    }

    /// Shorthand for an element wait that ran out of time
    pub fn timeout(condition: impl Into<String>, details: impl Into<String>) -> Self {
        FlowEngineError::Timeout {
            condition: condition.into(),
            details: details.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, FlowEngineError::Validation(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FlowEngineError::Timeout { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, FlowEngineError::StaleElement { .. })
    }
}

/// Result type alias for flow engine operations
pub type FlowResult<T> = Result<T, FlowEngineError>;
