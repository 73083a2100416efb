//! Action Primitives Module
//!
//! The [`Driver`] trait is the boundary to the browser backend. The free
//! functions here are the primitives the runner dispatches to; they add the
//! fixed element timeouts, stale-element retries and the script fallback
//! for typing on top of whatever the driver does.

use crate::error::{FlowEngineError, FlowResult};
use crate::flow::model::{Locator, WaitState, DEFAULT_TIMEOUT_MS};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout used by type/click/expect when locating their element
pub const ELEMENT_TIMEOUT: Duration = Duration::from_millis(DEFAULT_TIMEOUT_MS);

/// Attempts made when an element goes stale between lookup and use
pub const STALE_RETRIES: usize = 3;

/// Pause between stale-element attempts
pub const STALE_BACKOFF: Duration = Duration::from_millis(500);

/// Browser capability consumed by the flow runner.
///
/// Implementations report a wait that ran out of time as
/// [`FlowEngineError::Timeout`] and an element invalidated by a re-render as
/// [`FlowEngineError::StaleElement`].
#[async_trait]
pub trait Driver: Send + Sync {
    /// Handle to a located element
    type Element: Send + Sync;

    /// Load a URL in the current page
    async fn navigate(&self, url: &str) -> FlowResult<()>;

    /// Block until the located element reaches `state`
    async fn wait_for(&self, locator: &Locator, state: WaitState, timeout: Duration)
        -> FlowResult<()>;

    /// Block until the located element reaches `state` and return it
    async fn find_element(
        &self,
        locator: &Locator,
        state: WaitState,
        timeout: Duration,
    ) -> FlowResult<Self::Element>;

    /// Clear an input field
    async fn clear(&self, element: &Self::Element) -> FlowResult<()>;

    /// Enter text through synthetic key events
    async fn send_keys(&self, element: &Self::Element, text: &str) -> FlowResult<()>;

    /// Assign the field's value directly through script injection
    async fn set_value(&self, element: &Self::Element, text: &str) -> FlowResult<()>;

    /// Click an element
    async fn click_element(&self, element: &Self::Element) -> FlowResult<()>;

    /// URL of the current page
    async fn current_url(&self) -> FlowResult<String>;

    /// Shut the browser down; called once per driver
    async fn quit(&self) -> FlowResult<()>;
}

/// Load a URL
pub async fn navigate<D: Driver + ?Sized>(driver: &D, url: &str) -> FlowResult<()> {
    driver.navigate(url).await
}

/// Wait for an element state; a zero timeout falls back to the default
pub async fn wait<D: Driver + ?Sized>(
    driver: &D,
    locator: &Locator,
    state: WaitState,
    timeout_ms: u64,
) -> FlowResult<()> {
    let timeout_ms = if timeout_ms == 0 { DEFAULT_TIMEOUT_MS } else { timeout_ms };
    driver
        .wait_for(locator, state, Duration::from_millis(timeout_ms))
        .await
}

/// Clear the field and type `text`, falling back to a direct value
/// assignment when key input fails
pub async fn type_text<D: Driver + ?Sized>(driver: &D, locator: &Locator, text: &str) -> FlowResult<()> {
    retry_on_stale(locator, move || async move {
        let element = driver
            .find_element(locator, WaitState::Visible, ELEMENT_TIMEOUT)
            .await?;
        if let Err(e) = driver.clear(&element).await {
            debug!("Clear failed on {}: {}", locator, e);
        }
        if let Err(e) = driver.send_keys(&element, text).await {
            debug!("Key input failed on {}, assigning value by script: {}", locator, e);
            driver.set_value(&element, text).await?;
        }
        Ok(())
    })
    .await
}

/// Wait for the element to be clickable, then click it
pub async fn click<D: Driver + ?Sized>(driver: &D, locator: &Locator) -> FlowResult<()> {
    retry_on_stale(locator, move || async move {
        let element = driver
            .find_element(locator, WaitState::Clickable, ELEMENT_TIMEOUT)
            .await?;
        driver.click_element(&element).await
    })
    .await
}

/// Assert an element condition; a timeout becomes a validation failure
pub async fn expect<D: Driver + ?Sized>(
    driver: &D,
    locator: &Locator,
    condition: WaitState,
) -> FlowResult<()> {
    match driver.wait_for(locator, condition, ELEMENT_TIMEOUT).await {
        Err(FlowEngineError::Timeout { .. }) => Err(FlowEngineError::validation(format!(
            "expectation not met: locator={} condition={}",
            locator, condition
        ))),
        other => other,
    }
}

/// Suspend for `ms` milliseconds; negative values do not wait
pub async fn sleep(ms: i64) {
    let ms = ms.max(0) as u64;
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

async fn retry_on_stale<F, Fut>(locator: &Locator, mut op: F) -> FlowResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FlowResult<()>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_stale() && attempt < STALE_RETRIES => {
                warn!(
                    "Stale element {} (attempt {}/{}), retrying",
                    locator, attempt, STALE_RETRIES
                );
                tokio::time::sleep(STALE_BACKOFF).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
