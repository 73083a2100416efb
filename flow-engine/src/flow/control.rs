//! Execution Controls Module
//!
//! Everything a running flow consults besides placeholder variables: the
//! manual-continue and stop signals, the verification-code holder shared with
//! the OTP watcher, caller callbacks and mode flags.

use crate::error::{FlowEngineError, FlowResult};
use crate::flow::otp::{MailboxConfig, MailboxWatcher};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Upper bound between stop-signal checks in every blocking wait
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Error type callbacks may return; the runner logs and ignores it
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked when a flow reaches a manual checkpoint
pub type ManualCallback = Arc<dyn Fn() -> Result<(), CallbackError> + Send + Sync>;

/// Invoked with each verification code received for the account
pub type CodeCallback = Arc<dyn Fn(&str) -> Result<(), CallbackError> + Send + Sync>;

/// Cooperative abort shared by the batch, the runner and background watchers
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once `stop` has been called
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    /// Signal that stops with this one but can also be stopped on its own
    pub fn child(&self) -> StopSignal {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Stops this signal when the returned guard is dropped
    pub fn stop_on_drop(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }
}

struct ManualInner {
    set: AtomicBool,
    notify: Notify,
}

/// Set/wait/reset signal released by an operator action outside the runner
#[derive(Clone)]
pub struct ManualSignal {
    inner: Arc<ManualInner>,
}

impl ManualSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManualInner {
                set: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Release whoever waits (or the next waiter)
    pub fn trigger(&self) {
        self.inner.set.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.inner.set.store(false, Ordering::SeqCst);
    }

    /// Wait until triggered. The stop signal is checked at least every
    /// [`POLL_INTERVAL`]; stopping ends the wait with a validation error.
    pub async fn wait(&self, stop: &StopSignal) -> FlowResult<()> {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_set() {
                return Ok(());
            }
            if stop.is_stopped() {
                return Err(FlowEngineError::validation(
                    "stopped by user while waiting for manual continue",
                ));
            }
            tokio::select! {
                _ = notified => {}
                _ = stop.stopped() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

impl Default for ManualSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualSignal")
            .field("set", &self.is_set())
            .finish()
    }
}

#[derive(Debug, Default)]
struct VerificationSlot {
    code: Option<String>,
    /// Bumped by every `clear`; writers holding an older ticket are ignored
    generation: u64,
}

/// Verification code slot written by the OTP watcher and read by the runner
#[derive(Debug, Clone, Default)]
pub struct VerificationState {
    slot: Arc<Mutex<VerificationSlot>>,
}

impl VerificationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code(&self) -> Option<String> {
        self.slot.lock().map(|guard| guard.code.clone()).unwrap_or(None)
    }

    pub fn has_code(&self) -> bool {
        self.code().is_some()
    }

    pub fn set_code(&self, code: impl Into<String>) {
        if let Ok(mut guard) = self.slot.lock() {
            guard.code = Some(code.into());
        }
    }

    /// Ticket identifying the current contents; see [`set_code_if_current`]
    ///
    /// [`set_code_if_current`]: VerificationState::set_code_if_current
    pub fn ticket(&self) -> u64 {
        self.slot.lock().map(|guard| guard.generation).unwrap_or(0)
    }

    /// Store `code` only if nothing cleared the slot since `ticket` was taken.
    /// Returns whether the code was stored.
    pub fn set_code_if_current(&self, ticket: u64, code: impl Into<String>) -> bool {
        match self.slot.lock() {
            Ok(mut guard) if guard.generation == ticket => {
                guard.code = Some(code.into());
                true
            }
            _ => false,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.slot.lock() {
            guard.code = None;
            guard.generation = guard.generation.wrapping_add(1);
        }
    }
}

/// Page the browser must reach for `wait_onboarding_source` to succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnboardingTarget {
    pub url_prefix: String,
    pub query_marker: String,
}

impl Default for OnboardingTarget {
    fn default() -> Self {
        Self {
            url_prefix: "https://windsurf.com/account/onboarding".to_string(),
            query_marker: "page=source".to_string(),
        }
    }
}

impl OnboardingTarget {
    pub fn matches(&self, url: &str) -> bool {
        url.starts_with(&self.url_prefix) && url.contains(&self.query_marker)
    }
}

/// Direct operator confirmation used when no manual signal is wired up
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    async fn confirm(&self, message: &str) -> FlowResult<()>;
}

/// Prompts on stdout and waits for Enter on stdin
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm(&self, message: &str) -> FlowResult<()> {
        let message = message.to_string();
        tokio::task::spawn_blocking(move || {
            use std::io::{BufRead, Write};
            let mut stdout = std::io::stdout();
            write!(stdout, "{} [press Enter to continue] ", message)?;
            stdout.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|e| FlowEngineError::Driver(format!("operator prompt task failed: {}", e)))??;
        Ok(())
    }
}

/// Non-variable state consulted by specific actions
#[derive(Clone, Default)]
pub struct ExecutionControls {
    /// Fully automatic mode: skip manual pauses, run OTP/onboarding waits
    pub auto_mode: bool,
    pub manual_continue: Option<ManualSignal>,
    pub stop: StopSignal,
    pub verification: Option<VerificationState>,
    pub on_reached_manual: Option<ManualCallback>,
    pub on_verification_code: Option<CodeCallback>,
    /// Mailbox polled for one-time codes
    pub email: Option<MailboxConfig>,
    pub mailbox: Option<Arc<dyn MailboxWatcher>>,
    pub onboarding: OnboardingTarget,
    /// Fallback confirmation when `manual_continue` is absent
    pub operator_prompt: Option<Arc<dyn OperatorPrompt>>,
}

impl ExecutionControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_mode(mut self, auto_mode: bool) -> Self {
        self.auto_mode = auto_mode;
        self
    }

    pub fn with_manual_continue(mut self, signal: ManualSignal) -> Self {
        self.manual_continue = Some(signal);
        self
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_verification(mut self, state: VerificationState) -> Self {
        self.verification = Some(state);
        self
    }

    pub fn on_reached_manual<F>(mut self, callback: F) -> Self
    where
        F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.on_reached_manual = Some(Arc::new(callback));
        self
    }

    pub fn on_verification_code<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.on_verification_code = Some(Arc::new(callback));
        self
    }

    pub fn with_mailbox(mut self, config: MailboxConfig, watcher: Arc<dyn MailboxWatcher>) -> Self {
        self.email = Some(config);
        self.mailbox = Some(watcher);
        self
    }

    pub fn with_onboarding(mut self, target: OnboardingTarget) -> Self {
        self.onboarding = target;
        self
    }

    pub fn with_operator_prompt(mut self, prompt: Arc<dyn OperatorPrompt>) -> Self {
        self.operator_prompt = Some(prompt);
        self
    }
}

impl fmt::Debug for ExecutionControls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionControls")
            .field("auto_mode", &self.auto_mode)
            .field("manual_continue", &self.manual_continue)
            .field("stopped", &self.stop.is_stopped())
            .field("verification", &self.verification)
            .field("email", &self.email)
            .field("onboarding", &self.onboarding)
            .finish_non_exhaustive()
    }
}
