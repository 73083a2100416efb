//! Application Configuration
//!
//! `config.json` holds the mailbox, registration defaults, flow location,
//! export settings and logging. A missing file is replaced by the defaults;
//! a few `REGISTER_*` environment variables override file values.

use crate::credentials;
use crate::error::{CliError, CliResult};
use crate::logging::{levels, LoggingConfig};
use flow_engine::MailboxConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Flow used when neither the command line nor the config names one
pub const DEFAULT_FLOW_FILE: &str = "flows/register.toml";

/// Upper bound on accounts per batch
pub const MAX_ACCOUNTS: u32 = 100;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_mailbox")]
    pub email: MailboxConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Batch defaults and the target site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub default_count: u32,
    pub interval_seconds: f64,
    pub headless: bool,
    /// CDP request timeout for the browser
    pub timeout_seconds: u64,
    /// Kept for compatibility with existing config files; nothing retries
    pub max_retries: u32,
    /// Domain of generated account addresses
    pub domain: String,
    pub url: String,
    /// Password given to every generated account; random when empty
    pub password: String,
    pub auto_mode: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            default_count: 5,
            interval_seconds: 5.0,
            headless: false,
            timeout_seconds: 30,
            max_retries: 3,
            domain: "example.com".to_string(),
            url: "https://windsurf.com/account/register".to_string(),
            password: String::new(),
            auto_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub file: String,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            file: DEFAULT_FLOW_FILE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

/// Where and how batch results are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub format: ExportFormat,
    pub include_failed: bool,
    /// Output directory
    pub path: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format: ExportFormat::Csv,
            include_failed: false,
            path: "output".to_string(),
        }
    }
}

fn default_mailbox() -> MailboxConfig {
    MailboxConfig::new("", "").with_subject_keywords(vec!["windsurf".to_string(), "verify".to_string()])
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            email: default_mailbox(),
            registration: RegistrationConfig::default(),
            flow: FlowConfig::default(),
            export: ExportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Check every field and report all violations at once
    pub fn validate(&self) -> CliResult<()> {
        let mut errors = Vec::new();

        let address = &self.email.address;
        if !address.is_empty() && !credentials::is_encrypted(address) && !address.contains('@') {
            errors.push(format!("email.address is not a valid address: {}", address));
        }
        let count = self.registration.default_count;
        if !(1..=MAX_ACCOUNTS).contains(&count) {
            errors.push(format!(
                "registration.default_count must be between 1 and {}, got {}",
                MAX_ACCOUNTS, count
            ));
        }
        let interval = self.registration.interval_seconds;
        if !interval.is_finite() || interval < 0.0 {
            errors.push(format!("registration.interval_seconds must be >= 0, got {}", interval));
        }
        if self.flow.file.trim().is_empty() {
            errors.push("flow.file must not be empty".to_string());
        }
        if !levels::is_valid_level(&self.logging.level) {
            errors.push(format!("logging.level is not a valid level: {}", self.logging.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CliError::Config(errors.join("; ")))
        }
    }

    /// Apply `REGISTER_COUNT`, `REGISTER_INTERVAL`, `REGISTER_HEADLESS` and
    /// `REGISTER_FLOW` on top of the file values
    pub fn apply_env_overrides(&mut self) -> CliResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> CliResult<()> {
        if let Some(count) = lookup("REGISTER_COUNT") {
            self.registration.default_count = count
                .trim()
                .parse()
                .map_err(|_| CliError::config(format!("REGISTER_COUNT is not a number: {}", count)))?;
        }
        if let Some(interval) = lookup("REGISTER_INTERVAL") {
            self.registration.interval_seconds = interval
                .trim()
                .parse()
                .map_err(|_| CliError::config(format!("REGISTER_INTERVAL is not a number: {}", interval)))?;
        }
        if let Some(headless) = lookup("REGISTER_HEADLESS") {
            self.registration.headless = parse_bool(&headless)
                .ok_or_else(|| CliError::config(format!("REGISTER_HEADLESS is not a boolean: {}", headless)))?;
        }
        if let Some(flow) = lookup("REGISTER_FLOW") {
            if !flow.trim().is_empty() {
                self.flow.file = flow;
            }
        }
        Ok(())
    }

    /// The whole configuration as the `config` placeholder namespace
    pub fn to_value(&self) -> CliResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Load the configuration file, then environment overrides, then validate.
///
/// A missing file yields the defaults and a best-effort attempt to write
/// them out for the operator to edit.
pub fn load_config(path: impl AsRef<Path>) -> CliResult<AppConfig> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str::<AppConfig>(&text)
            .map_err(|e| CliError::config(format!("malformed config file {}: {}", path.display(), e)))?
    } else {
        let config = AppConfig::default();
        match write_atomically(&config, path) {
            Ok(()) => info!("Created default config file: {}", path.display()),
            Err(e) => warn!("Could not write default config file {}: {}", path.display(), e),
        }
        config
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Validate and write the configuration, replacing the file atomically
pub fn save_config(config: &AppConfig, path: impl AsRef<Path>) -> CliResult<()> {
    config.validate()?;
    write_atomically(config, path.as_ref())
}

fn write_atomically(config: &AppConfig, path: &Path) -> CliResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(&tmp, text)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Pick the flow file: command line, then `flow.file`, then the default.
///
/// Relative paths are tried as given, under `flows/` and by bare file name;
/// the first that exists wins, otherwise the path as given is returned.
pub fn resolve_flow_path(config: &AppConfig, cli_flow: Option<&Path>) -> PathBuf {
    let requested = match cli_flow {
        Some(path) => path.to_path_buf(),
        None if !config.flow.file.trim().is_empty() => PathBuf::from(&config.flow.file),
        None => PathBuf::from(DEFAULT_FLOW_FILE),
    };
    resolve_under(Path::new("."), &requested)
}

fn resolve_under(base: &Path, requested: &Path) -> PathBuf {
    if requested.is_absolute() {
        return requested.to_path_buf();
    }
    let mut candidates = vec![requested.to_path_buf()];
    if let Some(name) = requested.file_name() {
        candidates.push(Path::new("flows").join(name));
        candidates.push(PathBuf::from(name));
    }
    candidates
        .into_iter()
        .find(|candidate| base.join(candidate).exists())
        .map(|candidate| base.join(candidate))
        .unwrap_or_else(|| base.join(requested))
}
