//! Batch Executor Module
//!
//! Runs a flow once per account, strictly in list order, with a fresh driver
//! for every account. One account's failure (or panic) is recorded and the
//! batch moves on; the driver is released on every exit path.

use crate::error::FlowResult;
use crate::flow::actions::Driver;
use crate::flow::control::ExecutionControls;
use crate::flow::model::Flow;
use crate::flow::resolver::VariableContext;
use crate::flow::runner::FlowRunner;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Source of per-account drivers
#[async_trait]
pub trait DriverProvider: Send + Sync {
    type Driver: Driver;

    /// Create a fresh driver for one account
    async fn acquire(&self) -> FlowResult<Self::Driver>;

    /// Dispose of a driver after its account finished, however it finished.
    /// The default quits the driver and ignores errors.
    async fn release(&self, driver: Self::Driver) {
        if let Err(e) = driver.quit().await {
            debug!("Driver quit failed: {}", e);
        }
    }
}

/// Progress hooks invoked by the batch executor
pub trait BatchObserver: Send + Sync {
    fn account_started(&self, _position: usize, _account: &str) {}

    fn account_finished(&self, _position: usize, _outcome: &AccountOutcome) {}
}

/// Outcome of one account's execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountOutcome {
    /// Account email, else `#<position>`
    pub account: String,
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Aggregate result of a batch run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: Vec<AccountOutcome>,
    pub success: usize,
    pub failed: usize,
    pub total: usize,
    pub elapsed_s: f64,
}

impl BatchResult {
    fn record(&mut self, outcome: AccountOutcome) {
        if outcome.success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        self.total += 1;
        self.results.push(outcome);
    }
}

/// Batch settings
#[derive(Clone, Default)]
pub struct BatchOptions {
    /// Pause between two accounts
    pub interval: Duration,
    pub runner: FlowRunner,
    pub observer: Option<Arc<dyn BatchObserver>>,
}

impl BatchOptions {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    pub fn with_runner(mut self, runner: FlowRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// Run `flow` for every account in order and aggregate the outcomes.
///
/// Accounts not started because the stop signal fired are absent from the
/// result.
pub async fn run_batch<P: DriverProvider>(
    flow: &Flow,
    accounts: &[Value],
    options: &BatchOptions,
    provider: &P,
    vars: &VariableContext,
    controls: &ExecutionControls,
) -> BatchResult {
    let started = Instant::now();
    let count = accounts.len();
    let mut result = BatchResult::default();

    info!("Starting batch: {} ({} accounts)", flow.name, count);

    for (idx, account) in accounts.iter().enumerate() {
        let position = idx + 1;
        if controls.stop.is_stopped() {
            warn!("Stop requested, {} account(s) not started", count - idx);
            break;
        }

        let account_id = account_identifier(account, position);
        info!("Starting account: {} ({}/{})", account_id, position, count);
        if let Some(observer) = &options.observer {
            observer.account_started(position, &account_id);
        }
        if let Some(verification) = &controls.verification {
            verification.clear();
        }

        let account_started = Instant::now();
        let error = run_account(flow, account, options, provider, vars, controls).await.err();
        let outcome = AccountOutcome {
            account: account_id,
            success: error.is_none(),
            error,
            elapsed_ms: account_started.elapsed().as_millis() as u64,
        };

        match &outcome.error {
            None => info!("Account succeeded: {} in {}ms", outcome.account, outcome.elapsed_ms),
            Some(e) => error!("Account failed: {}: {}", outcome.account, e),
        }
        if let Some(observer) = &options.observer {
            observer.account_finished(position, &outcome);
        }
        result.record(outcome);

        if position < count && !options.interval.is_zero() {
            debug!("Waiting {:?} before next account", options.interval);
            tokio::select! {
                _ = tokio::time::sleep(options.interval) => {}
                _ = controls.stop.stopped() => {}
            }
        }
    }

    result.elapsed_s = started.elapsed().as_secs_f64();
    info!(
        "Batch finished: {} succeeded, {} failed, {} total in {:.1}s",
        result.success, result.failed, result.total, result.elapsed_s
    );
    result
}

async fn run_account<P: DriverProvider>(
    flow: &Flow,
    account: &Value,
    options: &BatchOptions,
    provider: &P,
    vars: &VariableContext,
    controls: &ExecutionControls,
) -> Result<(), String> {
    let driver = match AssertUnwindSafe(provider.acquire()).catch_unwind().await {
        Ok(Ok(driver)) => driver,
        Ok(Err(e)) => return Err(e.to_string()),
        Err(panic) => return Err(panic_message(panic)),
    };

    let run = AssertUnwindSafe(options.runner.execute(flow, &driver, Some(account), vars, controls))
        .catch_unwind()
        .await;

    provider.release(driver).await;

    match run {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic_message(panic)),
    }
}

fn account_identifier(account: &Value, position: usize) -> String {
    account
        .get("email")
        .and_then(Value::as_str)
        .filter(|email| !email.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("#{}", position))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic during execution: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic during execution: {}", msg)
    } else {
        "panic during execution".to_string()
    }
}
