//! Flow Runner Module
//!
//! Walks a flow's steps in document order, resolves placeholders per step
//! and dispatches to the action primitives. Failures of optional steps are
//! logged and skipped; any other failure ends the run.

use crate::error::{FlowEngineError, FlowResult};
use crate::flow::actions::{self, Driver};
use crate::flow::control::{ExecutionControls, OperatorPrompt, StdinPrompt, POLL_INTERVAL};
use crate::flow::model::{ActionKind, Flow, Locator, Step, WaitState};
use crate::flow::otp::OtpRequest;
use crate::flow::resolver::{VariableContext, VariableResolver};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Absolute ceiling for `wait_otp`
pub const OTP_DEADLINE: Duration = Duration::from_secs(180);

/// Absolute ceiling for `wait_onboarding_source`
pub const ONBOARDING_DEADLINE: Duration = Duration::from_secs(120);

/// Consecutive failed URL reads that abort `wait_onboarding_source`
pub const MAX_URL_READ_FAILURES: u32 = 5;

const DEFAULT_MANUAL_PROMPT: &str =
    "Complete the human verification in the browser, then continue";

/// Step-execution state machine
#[derive(Debug, Clone)]
pub struct FlowRunner {
    otp_deadline: Duration,
    onboarding_deadline: Duration,
}

impl Default for FlowRunner {
    fn default() -> Self {
        Self {
            otp_deadline: OTP_DEADLINE,
            onboarding_deadline: ONBOARDING_DEADLINE,
        }
    }
}

impl FlowRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the `wait_otp` ceiling
    pub fn with_otp_deadline(mut self, deadline: Duration) -> Self {
        self.otp_deadline = deadline;
        self
    }

    /// Override the `wait_onboarding_source` ceiling
    pub fn with_onboarding_deadline(mut self, deadline: Duration) -> Self {
        self.onboarding_deadline = deadline;
        self
    }

    /// Execute `flow` once against `driver`.
    ///
    /// `vars` is the caller's base context; `account` replaces its `account`
    /// namespace when given.
    pub async fn execute<D: Driver + ?Sized>(
        &self,
        flow: &Flow,
        driver: &D,
        account: Option<&Value>,
        vars: &VariableContext,
        controls: &ExecutionControls,
    ) -> FlowResult<()> {
        info!("Starting flow: {} ({} steps)", flow.name, flow.step_count());

        let mut ctx = VariableContext::for_execution(vars, flow, account);
        let total = flow.step_count();

        for (idx, step) in flow.steps.iter().enumerate() {
            debug!("Executing step {}/{}: {}", idx + 1, total, step.action);

            if let Err(e) = self.execute_step(flow, driver, step, &mut ctx, controls).await {
                if step.optional {
                    warn!("Optional step {} ({}) failed, skipping: {}", idx + 1, step.action, e);
                    continue;
                }
                warn!("Step {} ({}) failed: {}", idx + 1, step.action, e);
                return Err(e);
            }
        }

        info!("Flow completed: {}", flow.name);
        Ok(())
    }

    async fn execute_step<D: Driver + ?Sized>(
        &self,
        flow: &Flow,
        driver: &D,
        step: &Step,
        ctx: &mut VariableContext,
        controls: &ExecutionControls,
    ) -> FlowResult<()> {
        let value = VariableResolver::resolve_opt(step.value.as_deref(), ctx)?;
        let message = VariableResolver::resolve_opt(step.message.as_deref(), ctx)?;
        let timeout_ms = step.timeout_ms.filter(|ms| *ms > 0).unwrap_or(flow.timeout_ms);

        match step.action {
            ActionKind::Navigate => {
                let url = match value.filter(|v| !v.is_empty()) {
                    Some(url) => url,
                    None => VariableResolver::resolve(flow.start_url.as_deref().unwrap_or(""), ctx)?,
                };
                if url.is_empty() {
                    return Err(FlowEngineError::validation(
                        "navigate step requires a value or flow.start_url",
                    ));
                }
                info!("Navigate -> {}", url);
                actions::navigate(driver, &url).await
            }

            ActionKind::Sleep => {
                let delay = parse_delay(value.as_deref())?;
                debug!("Sleep {} ms", delay);
                tokio::select! {
                    _ = actions::sleep(delay) => Ok(()),
                    _ = controls.stop.stopped() => Err(FlowEngineError::validation("stopped by user during sleep")),
                }
            }

            ActionKind::Wait => {
                let locator = target_locator(flow, step)?;
                let state = step.state.unwrap_or(WaitState::Present);
                actions::wait(driver, &locator, state, timeout_ms).await
            }

            ActionKind::Click => {
                let locator = target_locator(flow, step)?;
                actions::click(driver, &locator).await
            }

            ActionKind::Type => {
                let locator = target_locator(flow, step)?;
                actions::type_text(driver, &locator, value.as_deref().unwrap_or("")).await
            }

            ActionKind::Expect => {
                let locator = target_locator(flow, step)?;
                let condition = step.state.unwrap_or(WaitState::Visible);
                actions::expect(driver, &locator, condition).await
            }

            ActionKind::PauseForManual => self.pause_for_manual(message.as_deref(), controls).await,

            ActionKind::WaitOtp => {
                if !controls.auto_mode {
                    debug!("wait_otp skipped outside auto mode");
                    return Ok(());
                }
                let code = self.wait_otp(ctx, controls).await?;
                ctx.set("verification", json!({ "code": code }));
                Ok(())
            }

            ActionKind::WaitOnboardingSource => {
                if !controls.auto_mode {
                    debug!("wait_onboarding_source skipped outside auto mode");
                    return Ok(());
                }
                self.wait_onboarding_source(driver, controls).await
            }
        }
    }

    async fn pause_for_manual(&self, message: Option<&str>, controls: &ExecutionControls) -> FlowResult<()> {
        let prompt = message.filter(|m| !m.is_empty()).unwrap_or(DEFAULT_MANUAL_PROMPT);
        info!("{}", prompt);

        if let Some(callback) = &controls.on_reached_manual {
            if let Err(e) = callback() {
                debug!("on_reached_manual callback failed: {}", e);
            }
        }

        if controls.auto_mode {
            debug!("Auto mode, not waiting at manual checkpoint");
            return Ok(());
        }

        match (&controls.manual_continue, &controls.operator_prompt) {
            (Some(signal), _) => {
                signal.wait(&controls.stop).await?;
                signal.reset();
                Ok(())
            }
            (None, Some(prompt_handler)) => prompt_handler.confirm(prompt).await,
            (None, None) => StdinPrompt.confirm(prompt).await,
        }
    }

    async fn wait_otp(&self, ctx: &VariableContext, controls: &ExecutionControls) -> FlowResult<String> {
        let mailbox = controls
            .email
            .as_ref()
            .filter(|m| m.is_complete())
            .ok_or_else(|| FlowEngineError::validation("wait_otp requires email address and password"))?;
        let account_email = ctx
            .lookup("account", "email")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| FlowEngineError::validation("wait_otp requires account.email"))?
            .to_string();
        let verification = controls
            .verification
            .as_ref()
            .ok_or_else(|| FlowEngineError::validation("wait_otp requires a verification state"))?;
        let on_code = controls
            .on_verification_code
            .clone()
            .ok_or_else(|| FlowEngineError::validation("wait_otp requires an on_verification_code callback"))?;
        let watcher = controls
            .mailbox
            .clone()
            .ok_or_else(|| FlowEngineError::validation("wait_otp requires a mailbox watcher"))?;

        // Scoped to this call: the watcher is cancelled however the wait ends,
        // and a late delivery cannot land in a slot cleared for another account.
        let watch_stop = controls.stop.child();
        let _cancel_watcher = watch_stop.stop_on_drop();

        if !verification.has_code() {
            let request = OtpRequest {
                mailbox: mailbox.clone(),
                account_email: account_email.clone(),
            };
            let state = verification.clone();
            let ticket = verification.ticket();
            let sink_stop = watch_stop.clone();
            let sink = Arc::new(move |code: String| {
                if sink_stop.is_stopped() || !state.set_code_if_current(ticket, code.clone()) {
                    debug!("[OTP] discarding code delivered after its wait ended");
                    return;
                }
                if let Err(e) = on_code(&code) {
                    warn!("on_verification_code callback failed: {}", e);
                }
            });
            let stop = watch_stop.clone();
            tokio::spawn(async move {
                watcher.watch(request, sink, stop).await;
            });
            info!("[OTP] waiting for verification code for {}", account_email);
        }

        let deadline = tokio::time::Instant::now() + self.otp_deadline;
        loop {
            if let Some(code) = verification.code() {
                info!("[OTP] verification code received for {}", account_email);
                return Ok(code);
            }
            if controls.stop.is_stopped() {
                return Err(FlowEngineError::validation("stopped by user while waiting for verification code"));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(FlowEngineError::validation(format!(
                    "verification code not received within {}s",
                    self.otp_deadline.as_secs()
                )));
            }
            tokio::select! {
                _ = controls.stop.stopped() => {}
                _ = tokio::time::sleep_until(deadline.min(now + POLL_INTERVAL)) => {}
            }
        }
    }

    async fn wait_onboarding_source<D: Driver + ?Sized>(
        &self,
        driver: &D,
        controls: &ExecutionControls,
    ) -> FlowResult<()> {
        let target = &controls.onboarding;
        info!("Waiting for onboarding page {}?{}", target.url_prefix, target.query_marker);

        let deadline = tokio::time::Instant::now() + self.onboarding_deadline;
        let mut read_failures = 0;
        let mut last_url = String::new();

        loop {
            if controls.stop.is_stopped() {
                return Err(FlowEngineError::validation("stopped by user while waiting for onboarding page"));
            }
            match driver.current_url().await {
                Ok(url) if target.matches(&url) => {
                    info!("Reached onboarding page: {}", url);
                    return Ok(());
                }
                Ok(url) => {
                    read_failures = 0;
                    last_url = url;
                }
                Err(e) => {
                    read_failures += 1;
                    if read_failures >= MAX_URL_READ_FAILURES {
                        return Err(FlowEngineError::validation(format!(
                            "cannot read current URL while waiting for onboarding page: {}",
                            e
                        )));
                    }
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(FlowEngineError::validation(format!(
                    "onboarding page not reached within {}s (last url: {})",
                    self.onboarding_deadline.as_secs(),
                    last_url
                )));
            }
            tokio::select! {
                _ = controls.stop.stopped() => {}
                _ = tokio::time::sleep_until(deadline.min(now + POLL_INTERVAL)) => {}
            }
        }
    }
}

fn target_locator(flow: &Flow, step: &Step) -> FlowResult<Locator> {
    let target = step
        .target_name()
        .ok_or_else(|| FlowEngineError::validation(format!("{} step requires a target", step.action)))?;
    flow.locator(target)
}

fn parse_delay(value: Option<&str>) -> FlowResult<i64> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(0),
        Some(v) => v
            .parse::<i64>()
            .map_err(|_| FlowEngineError::validation(format!("sleep value is not an integer: {}", v))),
    }
}
