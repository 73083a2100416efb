//! Flow Engine - Declarative Browser Flows for Account Registration
//!
//! This crate interprets flow scripts written in TOML: a list of steps
//! (navigate, type, click, wait, ...) over named element selectors, with
//! `{namespace.path}` placeholders filled in per account.
//!
//! ## Core Concepts
//!
//! - **Flow**: a parsed, validated script of selectors and ordered steps
//! - **VariableContext**: the `config`, `account` and `flow` namespaces a
//!   placeholder resolves against (`env` reads the process environment)
//! - **ExecutionControls**: manual-continue and stop signals, the
//!   verification-code slot and callbacks consulted by specific actions
//! - **Driver**: the browser boundary; [`ChromeDriver`] implements it
//!
//! ## Example
//!
//! ```rust,ignore
//! use flow_engine::{run_batch, BatchOptions, ChromeProvider, ExecutionControls, FlowLoader, VariableContext};
//!
//! let flow = FlowLoader::load("flows/register.toml")?;
//! let accounts = vec![serde_json::json!({"email": "someone@example.com"})];
//! let result = run_batch(
//!     &flow,
//!     &accounts,
//!     &BatchOptions::default(),
//!     &ChromeProvider::default(),
//!     &VariableContext::new(),
//!     &ExecutionControls::new(),
//! )
//! .await;
//! println!("{} succeeded, {} failed", result.success, result.failed);
//! ```

pub mod error;
pub mod flow;

// Re-exports
pub use error::{FlowEngineError, FlowResult};
pub use flow::actions::Driver;
pub use flow::batch::{run_batch, AccountOutcome, BatchObserver, BatchOptions, BatchResult, DriverProvider};
pub use flow::browser::{BrowserOptions, ChromeProvider};
pub use flow::control::{
    ExecutionControls, ManualSignal, OnboardingTarget, OperatorPrompt, StdinPrompt, StopSignal,
    VerificationState,
};
pub use flow::loader::FlowLoader;
pub use flow::model::{ActionKind, Flow, Locator, Selector, SelectorBy, Step, WaitState};
pub use flow::imap::ImapSource;
pub use flow::otp::{
    extract_otp_from_subject, CodeSink, FirstCodeWatcher, MailMessage, MailSource, MailboxConfig, MailboxWatcher,
    OtpRequest, PollingWatcher,
};
pub use flow::page::ChromeDriver;
pub use flow::resolver::{VariableContext, VariableResolver};
pub use flow::runner::FlowRunner;
pub use secrecy::SecretString;
