//! Browser Management Module
//!
//! Launches one Chromium instance per account, each with a throwaway
//! profile directory, and hands it out as a [`ChromeDriver`].

use crate::error::{FlowEngineError, FlowResult};
use crate::flow::batch::DriverProvider;
use crate::flow::page::ChromeDriver;
use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Browser launch options
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Run without a visible window. Manual checkpoints need a headed browser.
    pub headless: bool,
    pub window_size: Option<(u32, u32)>,
    /// Additional Chrome arguments
    pub extra_args: Vec<String>,
    /// Parent directory for per-launch profiles (system temp dir if unset)
    pub profile_root: Option<PathBuf>,
    /// Bound on a single CDP request
    pub request_timeout: Option<Duration>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: false,
            window_size: Some((1920, 1080)),
            extra_args: Vec::new(),
            profile_root: None,
            request_timeout: None,
        }
    }
}

impl BrowserOptions {
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn with_profile_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.profile_root = Some(root.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    fn profile_dir(&self) -> PathBuf {
        let root = self.profile_root.clone().unwrap_or_else(std::env::temp_dir);
        root.join(format!("register_browser_{}", Uuid::new_v4()))
    }

    fn to_config(&self, profile_dir: &Path) -> FlowResult<BrowserConfig> {
        let mut builder = BrowserConfig::builder().user_data_dir(profile_dir);

        // chromiumoxide is headless unless asked for a head
        if !self.headless {
            builder = builder.with_head();
        }
        if let Some((width, height)) = self.window_size {
            builder = builder.arg(format!("--window-size={},{}", width, height));
        }
        if let Some(timeout) = self.request_timeout {
            builder = builder.request_timeout(timeout);
        }
        for arg in &self.extra_args {
            builder = builder.arg(arg);
        }

        builder = builder
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-default-apps")
            .arg("--disable-infobars");

        builder.build().map_err(FlowEngineError::BrowserLaunch)
    }
}

/// Provider that launches a fresh Chromium for every account
#[derive(Debug, Clone, Default)]
pub struct ChromeProvider {
    options: BrowserOptions,
}

impl ChromeProvider {
    pub fn new(options: BrowserOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BrowserOptions {
        &self.options
    }

    /// Launch a browser and open a blank page on it
    pub async fn launch(&self) -> FlowResult<ChromeDriver> {
        if self.options.headless {
            warn!("Headless mode lowers the pass rate of human verification");
        }

        let profile_dir = self.options.profile_dir();
        let config = self.options.to_config(&profile_dir)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| FlowEngineError::BrowserLaunch(format!("Failed to launch browser: {}", e)))?;

        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("Browser event error: {:?}", e);
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                events.abort();
                remove_profile(&profile_dir);
                return Err(FlowEngineError::BrowserLaunch(format!("Failed to create page: {}", e)));
            }
        };

        info!("Browser launched (headless: {}, profile: {:?})", self.options.headless, profile_dir);
        Ok(ChromeDriver::new(browser, page, events, Some(profile_dir)))
    }
}

#[async_trait]
impl DriverProvider for ChromeProvider {
    type Driver = ChromeDriver;

    async fn acquire(&self) -> FlowResult<ChromeDriver> {
        self.launch().await
    }
}

pub(crate) fn remove_profile(path: &Path) {
    if path.exists() {
        info!("Cleaning up browser profile: {:?}", path);
        if let Err(e) = std::fs::remove_dir_all(path) {
            warn!("Failed to remove browser profile dir: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_options() {
        let opts = BrowserOptions::default();
        assert!(!opts.headless);
        assert_eq!(opts.window_size, Some((1920, 1080)));

        let opts = BrowserOptions::default()
            .headless(true)
            .with_arg("--lang=en-US")
            .with_request_timeout(Duration::from_secs(30));
        assert!(opts.headless);
        assert_eq!(opts.request_timeout, Some(Duration::from_secs(30)));
        assert_eq!(opts.extra_args, vec!["--lang=en-US".to_string()]);
    }

    #[test]
    fn test_profile_dirs_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let opts = BrowserOptions::default().with_profile_root(root.path());
        let a = opts.profile_dir();
        let b = opts.profile_dir();
        assert_ne!(a, b);
        assert!(a.starts_with(root.path()));
    }

    #[test]
    fn test_remove_profile_tolerates_missing_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("profile");
        std::fs::create_dir_all(dir.join("Default")).unwrap();
        remove_profile(&dir);
        assert!(!dir.exists());
        remove_profile(&dir);
    }
}
