//! Chromium Driver Module
//!
//! [`Driver`] implementation over a chromiumoxide page. Element waits poll
//! the DOM until the element exists and satisfies the requested state.

use crate::error::{FlowEngineError, FlowResult};
use crate::flow::actions::Driver;
use crate::flow::browser::remove_profile;
use crate::flow::model::{Locator, SelectorBy, WaitState};
use async_trait::async_trait;
use chromiumoxide::{Browser, Element, Page};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay between DOM polls while waiting for an element
const ELEMENT_POLL: Duration = Duration::from_millis(250);

const IS_VISIBLE_JS: &str = r#"function() {
    const r = this.getBoundingClientRect();
    const s = window.getComputedStyle(this);
    return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
}"#;

const IS_CLICKABLE_JS: &str = r#"function() {
    const r = this.getBoundingClientRect();
    const s = window.getComputedStyle(this);
    const visible = r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
    return visible && !this.disabled && s.pointerEvents !== 'none';
}"#;

const CLEAR_JS: &str = r#"function() {
    this.value = '';
    this.dispatchEvent(new Event('input', { bubbles: true }));
}"#;

/// One browser with one page, owned by a single account's execution
pub struct ChromeDriver {
    browser: Mutex<Option<Browser>>,
    page: Page,
    events: JoinHandle<()>,
    profile_dir: Option<PathBuf>,
}

impl ChromeDriver {
    pub fn new(browser: Browser, page: Page, events: JoinHandle<()>, profile_dir: Option<PathBuf>) -> Self {
        Self {
            browser: Mutex::new(Some(browser)),
            page,
            events,
            profile_dir,
        }
    }

    /// Get the underlying page
    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn lookup(&self, locator: &Locator) -> Option<Element> {
        let found = match locator.by {
            SelectorBy::Css => self.page.find_element(locator.value.as_str()).await,
            SelectorBy::Id => self.page.find_element(id_selector(&locator.value)).await,
            SelectorBy::XPath => self.page.find_xpath(locator.value.as_str()).await,
        };
        found.ok()
    }

    async fn satisfies(&self, element: &Element, state: WaitState) -> bool {
        let check = match state {
            WaitState::Present | WaitState::Absent => return true,
            WaitState::Visible => IS_VISIBLE_JS,
            WaitState::Clickable => IS_CLICKABLE_JS,
        };
        match element.call_js_fn(check, false).await {
            Ok(ret) => ret.result.value.and_then(|v| v.as_bool()).unwrap_or(false),
            Err(e) => {
                debug!("State check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl Driver for ChromeDriver {
    type Element = Element;

    async fn navigate(&self, url: &str) -> FlowResult<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| FlowEngineError::Navigation(format!("Failed to navigate to {}: {}", url, e)))?;
        Ok(())
    }

    async fn wait_for(&self, locator: &Locator, state: WaitState, timeout: Duration) -> FlowResult<()> {
        if state != WaitState::Absent {
            return self.find_element(locator, state, timeout).await.map(|_| ());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.lookup(locator).await.is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FlowEngineError::timeout(
                    state.as_str(),
                    format!("{} still present after {}ms", locator, timeout.as_millis()),
                ));
            }
            tokio::time::sleep(ELEMENT_POLL).await;
        }
    }

    async fn find_element(&self, locator: &Locator, state: WaitState, timeout: Duration) -> FlowResult<Element> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(element) = self.lookup(locator).await {
                if self.satisfies(&element, state).await {
                    return Ok(element);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FlowEngineError::timeout(
                    state.as_str(),
                    format!("{} after {}ms", locator, timeout.as_millis()),
                ));
            }
            tokio::time::sleep(ELEMENT_POLL).await;
        }
    }

    async fn clear(&self, element: &Element) -> FlowResult<()> {
        element
            .call_js_fn(CLEAR_JS, false)
            .await
            .map_err(|e| element_error("clear", e))?;
        Ok(())
    }

    async fn send_keys(&self, element: &Element, text: &str) -> FlowResult<()> {
        element.click().await.map_err(|e| element_error("focus", e))?;
        element.type_str(text).await.map_err(|e| element_error("type", e))?;
        Ok(())
    }

    async fn set_value(&self, element: &Element, text: &str) -> FlowResult<()> {
        let literal = serde_json::to_string(text)
            .map_err(|e| FlowEngineError::Driver(format!("Cannot encode value: {}", e)))?;
        let script = format!(
            "function() {{ this.value = {}; \
             this.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             this.dispatchEvent(new Event('change', {{ bubbles: true }})); }}",
            literal
        );
        element
            .call_js_fn(script, false)
            .await
            .map_err(|e| element_error("set value", e))?;
        Ok(())
    }

    async fn click_element(&self, element: &Element) -> FlowResult<()> {
        element
            .scroll_into_view()
            .await
            .map_err(|e| element_error("scroll", e))?;
        element.click().await.map_err(|e| element_error("click", e))?;
        Ok(())
    }

    async fn current_url(&self) -> FlowResult<String> {
        self.page
            .url()
            .await
            .map_err(|e| FlowEngineError::Navigation(format!("Failed to get URL: {}", e)))?
            .ok_or_else(|| FlowEngineError::Navigation("Page has no URL".to_string()))
    }

    async fn quit(&self) -> FlowResult<()> {
        let browser = self.browser.lock().await.take();
        if let Some(mut browser) = browser {
            if let Err(e) = browser.close().await {
                warn!("Browser close failed: {}", e);
            }
            if let Err(e) = browser.wait().await {
                warn!("Browser process wait failed: {}", e);
            }
            info!("Browser closed");
        }
        self.events.abort();
        if let Some(dir) = &self.profile_dir {
            remove_profile(dir);
        }
        Ok(())
    }
}

/// CSS selector matching an element id verbatim
fn id_selector(id: &str) -> String {
    format!("[id=\"{}\"]", id.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Map a CDP failure on an element, treating detached nodes as stale
fn element_error(operation: &str, err: impl std::fmt::Display) -> FlowEngineError {
    let msg = err.to_string();
    if is_stale_message(&msg) {
        FlowEngineError::StaleElement {
            locator: format!("{} target ({})", operation, msg),
        }
    } else {
        FlowEngineError::Driver(format!("{} failed: {}", operation, msg))
    }
}

fn is_stale_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    ["could not find node", "does not belong to the document", "node is detached", "no node with given id"]
        .iter()
        .any(|needle| msg.contains(needle))
}
