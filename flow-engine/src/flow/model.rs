//! Flow Data Models
//!
//! Typed representation of a declarative registration flow: named element
//! selectors, flow-level variables and the ordered list of steps. A `Flow`
//! is built once by the loader and shared read-only across every account of
//! a batch.

use crate::error::{FlowEngineError, FlowResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Default element wait timeout when the flow does not declare one
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// How a selector locates its element
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SelectorBy {
    Id,
    Css,
    #[serde(rename = "xpath")]
    XPath,
}

impl SelectorBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorBy::Id => "id",
            SelectorBy::Css => "css",
            SelectorBy::XPath => "xpath",
        }
    }
}

impl FromStr for SelectorBy {
    type Err = FlowEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(SelectorBy::Id),
            "css" => Ok(SelectorBy::Css),
            "xpath" => Ok(SelectorBy::XPath),
            other => Err(FlowEngineError::validation(format!(
                "unsupported selector.by: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for SelectorBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named element locator declared in the `selectors` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selector {
    /// Locator strategy
    pub by: SelectorBy,
    /// Locator expression (element id, CSS selector or XPath)
    pub value: String,
    /// Parsed and kept, never consulted while running
    #[serde(default)]
    pub optional: bool,
}

impl Selector {
    pub fn new(by: SelectorBy, value: impl Into<String>) -> FlowResult<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(FlowEngineError::validation("selector.value must not be empty"));
        }
        Ok(Self {
            by,
            value,
            optional: false,
        })
    }

    pub fn id(value: impl Into<String>) -> FlowResult<Self> {
        Self::new(SelectorBy::Id, value)
    }

    pub fn css(value: impl Into<String>) -> FlowResult<Self> {
        Self::new(SelectorBy::Css, value)
    }

    pub fn xpath(value: impl Into<String>) -> FlowResult<Self> {
        Self::new(SelectorBy::XPath, value)
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn locator(&self) -> Locator {
        Locator {
            by: self.by,
            value: self.value.clone(),
        }
    }
}

/// Resolved element locator handed to the driver
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    pub by: SelectorBy,
    pub value: String,
}

impl Locator {
    pub fn new(by: SelectorBy, value: impl Into<String>) -> Self {
        Self {
            by,
            value: value.into(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.by, self.value)
    }
}

/// Element condition a wait/expect step blocks on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WaitState {
    /// No matching element in the DOM
    Absent,
    /// Rendered with a non-empty box and not hidden
    Visible,
    /// Attached to the DOM
    #[default]
    Present,
    /// Visible and enabled
    Clickable,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Absent => "absent",
            WaitState::Visible => "visible",
            WaitState::Present => "present",
            WaitState::Clickable => "clickable",
        }
    }
}

impl FromStr for WaitState {
    type Err = FlowEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(WaitState::Absent),
            "visible" => Ok(WaitState::Visible),
            "present" => Ok(WaitState::Present),
            "clickable" => Ok(WaitState::Clickable),
            other => Err(FlowEngineError::validation(format!(
                "unsupported state: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for WaitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of step actions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Load a URL (step value, else the flow start URL)
    Navigate,
    /// Block until the target element reaches a state
    Wait,
    /// Clear the target field and enter text
    Type,
    /// Click the target element
    Click,
    /// Suspend for the number of milliseconds in the step value
    Sleep,
    /// Like wait, but a timeout is a business-rule failure
    Expect,
    /// Human checkpoint (CAPTCHA and similar)
    PauseForManual,
    /// Wait for a one-time code delivered by email
    WaitOtp,
    /// Wait for the browser to land on the onboarding source page
    WaitOnboardingSource,
}

impl ActionKind {
    pub const ALL: [ActionKind; 9] = [
        ActionKind::Navigate,
        ActionKind::Wait,
        ActionKind::Type,
        ActionKind::Click,
        ActionKind::Sleep,
        ActionKind::Expect,
        ActionKind::PauseForManual,
        ActionKind::WaitOtp,
        ActionKind::WaitOnboardingSource,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Wait => "wait",
            ActionKind::Type => "type",
            ActionKind::Click => "click",
            ActionKind::Sleep => "sleep",
            ActionKind::Expect => "expect",
            ActionKind::PauseForManual => "pause_for_manual",
            ActionKind::WaitOtp => "wait_otp",
            ActionKind::WaitOnboardingSource => "wait_onboarding_source",
        }
    }

    /// Actions that operate on an element and therefore need a target
    pub fn requires_target(&self) -> bool {
        matches!(
            self,
            ActionKind::Wait | ActionKind::Type | ActionKind::Click | ActionKind::Expect
        )
    }
}

impl FromStr for ActionKind {
    type Err = FlowEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| FlowEngineError::validation(format!("unsupported action: {}", s)))
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instruction of a flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub action: ActionKind,
    /// Name of a selector in the flow's `selectors` table
    pub target: Option<String>,
    /// Free text, may contain `{namespace.path}` placeholders
    pub value: Option<String>,
    pub state: Option<WaitState>,
    /// Per-step wait timeout, falls back to the flow default
    pub timeout_ms: Option<u64>,
    /// Failures of an optional step are logged and skipped
    #[serde(default)]
    pub optional: bool,
    /// Text shown by pause/log style actions, may contain placeholders
    pub message: Option<String>,
}

impl Step {
    pub fn new(action: ActionKind) -> Self {
        Self {
            action,
            target: None,
            value: None,
            state: None,
            timeout_ms: None,
            optional: false,
            message: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_state(mut self, state: WaitState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Target name when present and non-empty
    pub fn target_name(&self) -> Option<&str> {
        self.target.as_deref().filter(|t| !t.is_empty())
    }

    pub fn validate(&self) -> FlowResult<()> {
        if self.action.requires_target() && self.target_name().is_none() {
            return Err(FlowEngineError::validation(format!(
                "{} step requires a valid target",
                self.action
            )));
        }
        Ok(())
    }
}

/// A parsed, validated flow script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    pub start_url: Option<String>,
    /// Default element wait timeout
    pub timeout_ms: u64,
    /// Exposed to placeholders under the `flow` namespace
    pub variables: Map<String, Value>,
    pub selectors: BTreeMap<String, Selector>,
    pub steps: Vec<Step>,
}

impl Flow {
    /// Create a flow and check its structural invariants
    pub fn new(
        name: impl Into<String>,
        start_url: Option<String>,
        selectors: BTreeMap<String, Selector>,
        steps: Vec<Step>,
    ) -> FlowResult<Self> {
        let flow = Self {
            name: name.into(),
            start_url,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            variables: Map::new(),
            selectors,
            steps,
        };
        flow.check_structure()?;
        Ok(flow)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Invariants every flow holds regardless of where it came from
    pub fn check_structure(&self) -> FlowResult<()> {
        if self.name.is_empty() {
            return Err(FlowEngineError::validation("flow.name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(FlowEngineError::validation("flow.steps must not be empty"));
        }
        for selector in self.selectors.values() {
            if selector.value.is_empty() {
                return Err(FlowEngineError::validation("selector.value must not be empty"));
            }
        }
        for (idx, step) in self.steps.iter().enumerate() {
            step.validate().map_err(|e| match e {
                FlowEngineError::Validation(msg) => {
                    FlowEngineError::validation(format!("{} (index={})", msg, idx))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Resolve a step target to the locator of its selector
    pub fn locator(&self, target: &str) -> FlowResult<Locator> {
        self.selectors
            .get(target)
            .map(Selector::locator)
            .ok_or_else(|| FlowEngineError::validation(format!("undefined selector: {}", target)))
    }

    /// The `flow` placeholder namespace: `start_url` merged with the variables
    pub fn namespace(&self) -> Value {
        let mut ns = Map::new();
        ns.insert(
            "start_url".to_string(),
            self.start_url.clone().map(Value::String).unwrap_or(Value::Null),
        );
        for (key, value) in &self.variables {
            ns.insert(key.clone(), value.clone());
        }
        Value::Object(ns)
    }
}
