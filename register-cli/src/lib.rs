//! Register CLI
//!
//! Loads the configuration and a flow script, generates a batch of accounts
//! and registers each one in its own Chromium instance.

use clap::{Args, Parser, Subcommand};
use flow_engine::{
    run_batch, AccountOutcome, BatchObserver, BatchOptions, BatchResult, BrowserOptions, ChromeProvider,
    ExecutionControls, FirstCodeWatcher, Flow, FlowEngineError, FlowLoader, ImapSource, MailboxConfig,
    MailboxWatcher, ManualSignal, PollingWatcher, StopSignal, VariableContext, VariableResolver,
    VerificationState,
};
use registration_common::{Account, BatchStatistics};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub mod accounts;
pub mod config;
pub mod console;
pub mod credentials;
pub mod error;
pub mod export;
pub mod logging;

pub use config::{load_config, resolve_flow_path, save_config, AppConfig, DEFAULT_CONFIG_FILE};
pub use error::{CliError, CliResult};
pub use logging::{init_logging, LoggingConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "register", author, version, about = "Batch account registration driven by flow scripts", long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Generate accounts and run the flow for each of them
    Run(RunArgs),
    /// Load a flow and check that every placeholder resolves
    Validate(ValidateArgs),
    /// Print the encrypted form of a mailbox address or password
    EncryptSecret(EncryptArgs),
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct RunArgs {
    /// Flow script (overrides flow.file)
    #[arg(long)]
    pub flow: Option<PathBuf>,

    /// Number of accounts (overrides registration.default_count)
    #[arg(long)]
    pub count: Option<u32>,

    /// Seconds between two accounts (overrides registration.interval_seconds)
    #[arg(long)]
    pub interval: Option<f64>,

    /// Run the browser without a window
    #[arg(long)]
    pub headless: bool,

    /// Skip manual checkpoints and wait for codes and onboarding automatically
    #[arg(long)]
    pub auto: bool,
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct ValidateArgs {
    /// Flow script (overrides flow.file)
    #[arg(long)]
    pub flow: Option<PathBuf>,

    /// Sample account as a JSON object
    #[arg(long)]
    pub account: Option<String>,
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct EncryptArgs {
    /// Plain-text value; the key is read from REGISTER_EMAIL_SECRET_KEY
    pub value: String,
}

/// Run one parsed command to completion
pub async fn execute(command: &Command, config: &AppConfig, stop: StopSignal) -> CliResult<()> {
    match command {
        Command::Run(args) => {
            let report = run_register(args, config, stop).await?;
            if let Some(path) = &report.export {
                info!("Results written to {}", path.display());
            }
            Ok(())
        }
        Command::Validate(args) => {
            let report = validate_flow(args, config)?;
            info!(
                "Flow '{}': {} selector(s), {} step(s)",
                report.name, report.selectors, report.steps
            );
            if report.unresolved.is_empty() {
                info!("Flow is valid");
                Ok(())
            } else {
                for problem in &report.unresolved {
                    error!("{}", problem);
                }
                Err(FlowEngineError::validation(format!(
                    "{} placeholder problem(s) in {}",
                    report.unresolved.len(),
                    report.name
                ))
                .into())
            }
        }
        Command::EncryptSecret(args) => {
            let key = credentials::secret_key_from_env().ok_or_else(|| {
                CliError::config(format!("{} must be set to encrypt credentials", credentials::SECRET_KEY_ENV))
            })?;
            println!("{}", credentials::encrypt_secret(&args.value, &key));
            Ok(())
        }
    }
}

/// Everything a finished `run` produced
#[derive(Debug)]
pub struct RunReport {
    pub result: BatchResult,
    pub accounts: Vec<Account>,
    pub statistics: BatchStatistics,
    pub export: Option<PathBuf>,
}

/// Generate accounts and run the configured flow for each of them.
///
/// Per-account failures are part of the report, not an error.
pub async fn run_register(args: &RunArgs, config: &AppConfig, stop: StopSignal) -> CliResult<RunReport> {
    let registration = &config.registration;
    let count = args.count.unwrap_or(registration.default_count);
    let interval_secs = args.interval.unwrap_or(registration.interval_seconds);
    let interval = Duration::try_from_secs_f64(interval_secs)
        .map_err(|_| CliError::config(format!("interval must be >= 0 seconds, got {}", interval_secs)))?;
    let headless = args.headless || registration.headless;
    let auto_mode = args.auto || registration.auto_mode;

    let flow_path = resolve_flow_path(config, args.flow.as_deref());
    info!("Using flow: {}", flow_path.display());
    let flow = FlowLoader::load(&flow_path)?;

    let accounts = accounts::generate_accounts(count, &registration.domain, &registration.password)?;
    let account_vars: Vec<Value> = accounts.iter().map(Account::variables).collect();
    let vars = VariableContext::with_config(config.to_value()?);

    let mailbox = if auto_mode {
        let mailbox = credentials::decrypt_mailbox(&config.email, credentials::secret_key_from_env().as_deref())?;
        if !mailbox.is_complete() {
            warn!("Auto mode without email.address/email.password: wait_otp steps will fail");
        }
        Some(mailbox)
    } else {
        None
    };
    let controls = console_controls(mailbox, auto_mode, stop)?;

    let provider = ChromeProvider::new(
        BrowserOptions::default()
            .headless(headless)
            .with_request_timeout(Duration::from_secs(registration.timeout_seconds)),
    );
    let observer = Arc::new(ProgressObserver::new(accounts));
    let options = BatchOptions::new(interval).with_observer(observer.clone());

    let result = run_batch(&flow, &account_vars, &options, &provider, &vars, &controls).await;

    let accounts = observer.accounts();
    let statistics = BatchStatistics::from_accounts(&accounts);
    info!(
        "Statistics: total={}, success={}, failed={}, elapsed={:.2}s, success rate {:.1}%",
        result.total,
        result.success,
        result.failed,
        result.elapsed_s,
        statistics.success_rate()
    );

    let export = if result.results.is_empty() {
        None
    } else {
        Some(export::export_results(&result, &accounts, &config.export)?)
    };

    Ok(RunReport {
        result,
        accounts,
        statistics,
        export,
    })
}

/// Controls wired to the operator console: Enter continues a manual
/// checkpoint. In auto mode `wait_otp` takes the first code from either the
/// mailbox over IMAP or a six-digit code typed on the console.
fn console_controls(
    mailbox: Option<MailboxConfig>,
    auto_mode: bool,
    stop: StopSignal,
) -> CliResult<ExecutionControls> {
    let manual = ManualSignal::new();
    let (codes_tx, codes_rx) = mpsc::unbounded_channel();

    let mut controls = ExecutionControls::new()
        .auto_mode(auto_mode)
        .with_stop(stop)
        .with_manual_continue(manual.clone())
        .with_verification(VerificationState::new())
        .on_reached_manual(move || {
            if !auto_mode {
                info!("Press Enter to continue");
            }
            Ok(())
        })
        .on_verification_code(|code| {
            info!("Verification code received ({} digits)", code.len());
            Ok(())
        });
    if let Some(mailbox) = mailbox {
        let console: Arc<dyn MailboxWatcher> = Arc::new(console::ConsoleCodeWatcher::new(codes_rx));
        let watcher: Arc<dyn MailboxWatcher> = if mailbox.is_complete() {
            info!(
                "Verification codes are read from {}:{} for {}",
                mailbox.imap_server, mailbox.imap_port, mailbox.address
            );
            let imap: Arc<dyn MailboxWatcher> = Arc::new(PollingWatcher::new(ImapSource::new()?));
            Arc::new(FirstCodeWatcher::new(vec![imap, console]))
        } else {
            console
        };
        controls = controls.with_mailbox(mailbox, watcher);
    }

    console::spawn_stdin_reader(auto_mode, manual, codes_tx);
    Ok(controls)
}

/// Tracks account status and progress as the batch runs
struct ProgressObserver {
    accounts: Mutex<Vec<Account>>,
    stats: Mutex<BatchStatistics>,
}

impl ProgressObserver {
    fn new(accounts: Vec<Account>) -> Self {
        let stats = BatchStatistics::new(accounts.len());
        Self {
            accounts: Mutex::new(accounts),
            stats: Mutex::new(stats),
        }
    }

    fn accounts(&self) -> Vec<Account> {
        match self.accounts.lock() {
            Ok(accounts) => accounts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl BatchObserver for ProgressObserver {
    fn account_started(&self, position: usize, _account: &str) {
        if let Ok(mut accounts) = self.accounts.lock() {
            if let Some(account) = accounts.get_mut(position - 1) {
                account.mark_started();
            }
        }
    }

    fn account_finished(&self, position: usize, outcome: &AccountOutcome) {
        if let Ok(mut accounts) = self.accounts.lock() {
            if let Some(account) = accounts.get_mut(position - 1) {
                match &outcome.error {
                    None => account.mark_succeeded(),
                    Some(e) => account.mark_failed(e.clone()),
                }
            }
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(outcome.success);
            info!(
                "Progress: {}/{} ({:.0}%), {} succeeded, {} failed",
                stats.completed,
                stats.total,
                stats.progress_percentage(),
                stats.success,
                stats.failed
            );
        }
    }
}

/// What `validate` found in a flow
#[derive(Debug, Clone, PartialEq)]
pub struct FlowReport {
    pub name: String,
    pub selectors: usize,
    pub steps: usize,
    /// One entry per step field whose placeholders do not resolve
    pub unresolved: Vec<String>,
}

/// Load a flow and resolve every step's text against a sample context
pub fn validate_flow(args: &ValidateArgs, config: &AppConfig) -> CliResult<FlowReport> {
    let flow_path = resolve_flow_path(config, args.flow.as_deref());
    info!("Validating flow: {}", flow_path.display());
    let flow = FlowLoader::load(&flow_path)?;

    let account = match &args.account {
        Some(text) => serde_json::from_str::<Value>(text)?,
        None => sample_account(config).variables(),
    };
    if !account.is_object() {
        return Err(CliError::config("--account must be a JSON object"));
    }

    let base = VariableContext::with_config(config.to_value()?);
    Ok(check_placeholders(&flow, &base, &account))
}

fn sample_account(config: &AppConfig) -> Account {
    let domain = config.registration.domain.trim().trim_start_matches('@');
    Account::new(1, format!("sample@{}", domain), "sample")
        .with_password("Sample-password-1")
        .with_name("Sam", "Ple")
}

fn check_placeholders(flow: &Flow, base: &VariableContext, account: &Value) -> FlowReport {
    let mut ctx = VariableContext::for_execution(base, flow, Some(account));
    // Filled in by wait_otp at run time
    ctx.set("verification", json!({ "code": "000000" }));

    let mut unresolved = Vec::new();
    if let Some(start_url) = &flow.start_url {
        if let Err(e) = VariableResolver::resolve(start_url, &ctx) {
            unresolved.push(format!("start_url: {}", e));
        }
    }
    for (index, step) in flow.steps.iter().enumerate() {
        for (field, text) in [("value", &step.value), ("message", &step.message)] {
            if let Some(text) = text {
                if let Err(e) = VariableResolver::resolve(text, &ctx) {
                    unresolved.push(format!("step {} ({}) {}: {}", index, step.action.as_str(), field, e));
                }
            }
        }
    }

    FlowReport {
        name: flow.name.clone(),
        selectors: flow.selectors.len(),
        steps: flow.step_count(),
        unresolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOW: &str = r#"
[flow]
name = "signup"
start_url = "{config.registration.url}"

[selectors.email]
by = "id"
value = "email"

[selectors.code]
by = "css"
value = "input[name=code]"

[[steps]]
action = "navigate"

[[steps]]
action = "type"
target = "email"
value = "{account.email}"

[[steps]]
action = "type"
target = "code"
value = "{verification.code}"
"#;

    fn write_flow(dir: &std::path::Path, text: &str) -> PathBuf {
        let path = dir.join("signup.toml");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_validate_clean_flow() {
        let dir = tempfile::tempdir().unwrap();
        let args = ValidateArgs {
            flow: Some(write_flow(dir.path(), FLOW)),
            account: None,
        };

        let report = validate_flow(&args, &AppConfig::default()).unwrap();
        assert_eq!(report.name, "signup");
        assert_eq!(report.selectors, 2);
        assert_eq!(report.steps, 3);
        assert!(report.unresolved.is_empty(), "{:?}", report.unresolved);
    }

    #[test]
    fn test_validate_reports_unresolved_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let text = FLOW.replace("{account.email}", "{account.nickname}");
        let args = ValidateArgs {
            flow: Some(write_flow(dir.path(), &text)),
            account: None,
        };

        let report = validate_flow(&args, &AppConfig::default()).unwrap();
        assert_eq!(report.unresolved.len(), 1);
        assert!(report.unresolved[0].starts_with("step 1 (type) value"));
        assert!(report.unresolved[0].contains("account.nickname"));
    }

    #[test]
    fn test_validate_uses_given_account() {
        let dir = tempfile::tempdir().unwrap();
        let text = FLOW.replace("{account.email}", "{account.nickname}");
        let args = ValidateArgs {
            flow: Some(write_flow(dir.path(), &text)),
            account: Some(r#"{"nickname": "neo"}"#.to_string()),
        };

        let report = validate_flow(&args, &AppConfig::default()).unwrap();
        assert!(report.unresolved.is_empty());

        let args = ValidateArgs {
            account: Some("[1, 2]".to_string()),
            ..args
        };
        assert!(matches!(validate_flow(&args, &AppConfig::default()), Err(CliError::Config(_))));
    }

    #[test]
    fn test_validate_missing_flow_exits_with_config_code() {
        let dir = tempfile::tempdir().unwrap();
        let args = ValidateArgs {
            flow: Some(dir.path().join("absent.toml")),
            account: None,
        };
        let err = validate_flow(&args, &AppConfig::default()).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_run_rejects_out_of_range_count_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let args = RunArgs {
            flow: Some(write_flow(dir.path(), FLOW)),
            count: Some(0),
            ..Default::default()
        };
        let err = run_register(&args, &AppConfig::default(), StopSignal::new()).await.unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[tokio::test]
    async fn test_run_rejects_negative_interval() {
        let args = RunArgs {
            interval: Some(-2.0),
            ..Default::default()
        };
        let err = run_register(&args, &AppConfig::default(), StopSignal::new()).await.unwrap_err();
        assert!(err.to_string().contains("interval"));
    }

    #[tokio::test]
    async fn test_run_rejects_encrypted_mailbox_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.email.address = credentials::encrypt_secret("inbox@example.com", "key");
        config.email.password = flow_engine::SecretString::from("app-code".to_string());
        let args = RunArgs {
            flow: Some(write_flow(dir.path(), FLOW)),
            count: Some(1),
            auto: true,
            ..Default::default()
        };

        let err = run_register(&args, &config, StopSignal::new()).await.unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
        assert!(err.to_string().contains(credentials::SECRET_KEY_ENV));
    }

    #[test]
    fn test_auto_controls_get_a_mailbox_watcher() {
        let mailbox = MailboxConfig::new("inbox@example.com", "app-code");
        let controls = console_controls(Some(mailbox), true, StopSignal::new()).unwrap();
        assert!(controls.auto_mode);
        assert!(controls.mailbox.is_some());
        assert_eq!(controls.email.map(|m| m.address).as_deref(), Some("inbox@example.com"));

        let controls = console_controls(None, false, StopSignal::new()).unwrap();
        assert!(controls.mailbox.is_none());
        assert!(controls.email.is_none());
    }

    #[test]
    fn test_progress_observer_tracks_status() {
        let observer = ProgressObserver::new(vec![
            Account::new(1, "a@example.org", "a"),
            Account::new(2, "b@example.org", "b"),
        ]);
        observer.account_started(1, "a@example.org");
        observer.account_finished(
            1,
            &AccountOutcome {
                account: "a@example.org".to_string(),
                success: false,
                error: Some("boom".to_string()),
                elapsed_ms: 5,
            },
        );

        let accounts = observer.accounts();
        assert_eq!(accounts[0].status, registration_common::AccountStatus::Failed);
        assert_eq!(accounts[0].error_message.as_deref(), Some("boom"));
        assert_eq!(accounts[1].status, registration_common::AccountStatus::Pending);
        assert_eq!(observer.stats.lock().unwrap().failed, 1);
    }
}
