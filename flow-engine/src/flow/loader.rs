//! Flow Loader Module
//!
//! Parses a TOML flow document into a [`Flow`] and runs static validation
//! before anything is executed.
//!
//! ```toml
//! [flow]
//! name = "register"
//! start_url = "https://example.com/register"
//! timeout_ms = 10000
//!
//! [variables]
//! plan = "free"
//!
//! [selectors.email]
//! by = "id"
//! value = "email"
//!
//! [[steps]]
//! action = "navigate"
//!
//! [[steps]]
//! action = "type"
//! target = "email"
//! value = "{account.email}"
//! ```

use crate::error::{FlowEngineError, FlowResult};
use crate::flow::model::{
    ActionKind, Flow, Selector, SelectorBy, Step, WaitState, DEFAULT_TIMEOUT_MS,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use toml::Table;
use tracing::{debug, info};

/// Accepted spellings of the steps array
const STEP_KEYS: [&str; 3] = ["steps", "Steps", "STEPS"];

/// Flow Loader - turns flow documents into validated flows
pub struct FlowLoader;

impl FlowLoader {
    /// Load and validate a flow document from disk
    pub fn load(path: impl AsRef<Path>) -> FlowResult<Flow> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(FlowEngineError::NotFound {
                path: path.display().to_string(),
            });
        }

        let text = std::fs::read_to_string(path)?;
        let flow = Self::from_toml_str(&text)?;
        info!(
            "Loaded flow '{}' from {} ({} steps, {} selectors)",
            flow.name,
            path.display(),
            flow.steps.len(),
            flow.selectors.len()
        );
        Ok(flow)
    }

    /// Parse and validate a flow document held in memory
    pub fn from_toml_str(text: &str) -> FlowResult<Flow> {
        let document: Table =
            toml::from_str(text).map_err(|e| FlowEngineError::Parse(e.to_string()))?;
        Self::from_table(&document)
    }

    /// Build a flow from an already parsed document tree
    pub fn from_table(document: &Table) -> FlowResult<Flow> {
        let raw = parse_document(document)?;
        validate_document(document, raw)
    }
}

/// Selector entry as it appears in the document
#[derive(Debug)]
struct RawSelector {
    by: String,
    value: String,
    optional: bool,
}

/// Step entry as it appears in the document, before enum checks
#[derive(Debug, Default)]
struct RawStep {
    action: Option<String>,
    target: Option<String>,
    value: Option<String>,
    state: Option<String>,
    timeout_ms: Option<i64>,
    optional: bool,
    message: Option<String>,
}

#[derive(Debug)]
struct RawFlow {
    name: String,
    start_url: Option<String>,
    timeout_ms: i64,
    variables: Map<String, Value>,
    selectors: BTreeMap<String, RawSelector>,
    steps: Vec<RawStep>,
}

fn parse_document(document: &Table) -> FlowResult<RawFlow> {
    let empty = Table::new();
    let flow_info = document
        .get("flow")
        .and_then(toml::Value::as_table)
        .unwrap_or(&empty);

    let variables = document
        .get("variables")
        .and_then(toml::Value::as_table)
        .map(|table| {
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect::<Map<String, Value>>()
        })
        .unwrap_or_default();

    let mut selectors = BTreeMap::new();
    if let Some(table) = document.get("selectors").and_then(toml::Value::as_table) {
        for (name, entry) in table {
            let Some(entry) = entry.as_table() else {
                continue;
            };
            let by = entry.get("by").and_then(toml::Value::as_str).unwrap_or_default();
            let value = entry.get("value").and_then(toml::Value::as_str).unwrap_or_default();
            if by.is_empty() || value.is_empty() {
                debug!("Skipping malformed selector entry: {}", name);
                continue;
            }
            selectors.insert(
                name.clone(),
                RawSelector {
                    by: by.to_string(),
                    value: value.to_string(),
                    optional: entry
                        .get("optional")
                        .and_then(toml::Value::as_bool)
                        .unwrap_or(false),
                },
            );
        }
    }

    let mut steps = Vec::new();
    if let Some(toml::Value::Array(items)) = steps_entry(document) {
        for item in items {
            if let Some(entry) = item.as_table() {
                steps.push(parse_step(entry)?);
            }
        }
    }

    let timeout_ms = match flow_info.get("timeout_ms").and_then(toml::Value::as_integer) {
        Some(0) | None => DEFAULT_TIMEOUT_MS as i64,
        Some(ms) => ms,
    };

    Ok(RawFlow {
        name: flow_info
            .get("name")
            .and_then(toml::Value::as_str)
            .unwrap_or("UnnamedFlow")
            .to_string(),
        start_url: flow_info
            .get("start_url")
            .and_then(toml::Value::as_str)
            .map(str::to_string),
        timeout_ms,
        variables,
        selectors,
        steps,
    })
}

fn parse_step(entry: &Table) -> FlowResult<RawStep> {
    let text = |key: &str| entry.get(key).and_then(scalar_text);

    // A non-zero `timeout` takes precedence over `timeout_ms`
    let timeout = entry.get("timeout").filter(|v| v.as_integer() != Some(0));
    let timeout_ms = match timeout.or_else(|| entry.get("timeout_ms")) {
        None => None,
        Some(v) => Some(v.as_integer().ok_or_else(|| {
            FlowEngineError::validation("timeout_ms must be a non-negative integer")
        })?),
    };

    Ok(RawStep {
        action: text("action"),
        target: text("target"),
        value: text("value"),
        state: text("state"),
        timeout_ms,
        optional: entry
            .get("optional")
            .and_then(toml::Value::as_bool)
            .unwrap_or(false),
        message: text("message"),
    })
}

/// First spelling of the steps key that carries something
fn steps_entry(document: &Table) -> Option<&toml::Value> {
    let mut first_present = None;
    for key in STEP_KEYS {
        if let Some(value) = document.get(key) {
            let non_empty = match value {
                toml::Value::Array(items) => !items.is_empty(),
                _ => true,
            };
            if non_empty {
                return Some(value);
            }
            first_present.get_or_insert(value);
        }
    }
    first_present
}

fn validate_document(document: &Table, raw: RawFlow) -> FlowResult<Flow> {
    if !matches!(document.get("flow"), Some(toml::Value::Table(_))) {
        return Err(FlowEngineError::validation("missing [flow] section"));
    }
    if !matches!(steps_entry(document), Some(toml::Value::Array(_))) {
        return Err(FlowEngineError::validation(
            "missing steps section or wrong format, expected an array of tables",
        ));
    }
    if raw.steps.is_empty() {
        return Err(FlowEngineError::validation("flow.steps must not be empty"));
    }
    if raw.timeout_ms < 0 {
        return Err(FlowEngineError::validation(
            "flow.timeout_ms must be a non-negative integer",
        ));
    }

    let needs_selectors = raw
        .steps
        .iter()
        .any(|s| s.target.as_deref().is_some_and(|t| !t.is_empty()));
    if needs_selectors && !matches!(document.get("selectors"), Some(toml::Value::Table(_))) {
        return Err(FlowEngineError::validation(
            "missing [selectors] section (required when steps use a target)",
        ));
    }

    let mut errors = Vec::new();
    let mut steps = Vec::with_capacity(raw.steps.len());

    for (idx, raw_step) in raw.steps.into_iter().enumerate() {
        let action = match raw_step.action.as_deref() {
            Some(name) => match name.parse::<ActionKind>() {
                Ok(action) => Some(action),
                Err(_) => {
                    errors.push(format!("unsupported action: {} (index={})", name, idx));
                    None
                }
            },
            None => {
                errors.push(format!("step is missing an action (index={})", idx));
                None
            }
        };

        let state = match raw_step.state.as_deref() {
            Some(name) => match name.parse::<WaitState>() {
                Ok(state) => Some(state),
                Err(_) => {
                    errors.push(format!("unsupported state: {} (index={})", name, idx));
                    None
                }
            },
            None => None,
        };

        let timeout_ms = match raw_step.timeout_ms {
            Some(ms) if ms < 0 => {
                errors.push(format!(
                    "timeout_ms must be a non-negative integer (index={})",
                    idx
                ));
                None
            }
            // zero means "use the flow default"
            Some(0) | None => None,
            Some(ms) => Some(ms as u64),
        };

        if let Some(target) = raw_step.target.as_deref().filter(|t| !t.is_empty()) {
            if !raw.selectors.contains_key(target) {
                errors.push(format!(
                    "step references undefined selector: {} (index={})",
                    target, idx
                ));
            }
        }

        let Some(action) = action else {
            continue;
        };
        let step = Step {
            action,
            target: raw_step.target,
            value: raw_step.value,
            state,
            timeout_ms,
            optional: raw_step.optional,
            message: raw_step.message,
        };
        if let Err(e) = step.validate() {
            errors.push(format!("{} (index={})", strip_prefix(&e), idx));
        }
        steps.push(step);
    }

    let mut selectors = BTreeMap::new();
    for (name, raw_selector) in raw.selectors {
        match raw_selector.by.parse::<SelectorBy>() {
            Ok(by) => {
                let selector = Selector::new(by, raw_selector.value)?.optional(raw_selector.optional);
                selectors.insert(name, selector);
            }
            Err(_) => errors.push(format!(
                "selector '{}' has invalid by value: {}",
                name, raw_selector.by
            )),
        }
    }

    if !errors.is_empty() {
        return Err(FlowEngineError::validation(errors.join("; ")));
    }

    let flow = Flow {
        name: raw.name,
        start_url: raw.start_url,
        timeout_ms: raw.timeout_ms as u64,
        variables: raw.variables,
        selectors,
        steps,
    };
    flow.check_structure()?;
    Ok(flow)
}

fn strip_prefix(err: &FlowEngineError) -> String {
    match err {
        FlowEngineError::Validation(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// Text form of a scalar step field; tables and arrays are not text
fn scalar_text(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

pub(crate) fn toml_to_json(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::from(*i),
        toml::Value::Float(f) => Value::from(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::Array(items.iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const REGISTER_FLOW: &str = r#"
[flow]
name = "register"
start_url = "https://example.com/register"
timeout_ms = 8000

[variables]
plan = "free"
seats = 3

[selectors.email]
by = "id"
value = "email"

[selectors.submit]
by = "css"
value = "button[type=submit]"
optional = true

[[steps]]
action = "navigate"

[[steps]]
action = "type"
target = "email"
value = "{account.email}"
timeout = 5000

[[steps]]
action = "sleep"
value = 250

[[steps]]
action = "click"
target = "submit"
optional = true
"#;

    #[test]
    fn test_parse_full_document() {
        let flow = FlowLoader::from_toml_str(REGISTER_FLOW).unwrap();

        assert_eq!(flow.name, "register");
        assert_eq!(flow.start_url.as_deref(), Some("https://example.com/register"));
        assert_eq!(flow.timeout_ms, 8000);
        assert_eq!(flow.variables["seats"], 3);
        assert_eq!(flow.selectors.len(), 2);
        assert!(flow.selectors["submit"].optional);

        assert_eq!(flow.steps.len(), 4);
        assert_eq!(flow.steps[1].action, ActionKind::Type);
        assert_eq!(flow.steps[1].timeout_ms, Some(5000));
        assert_eq!(flow.steps[2].value.as_deref(), Some("250"));
        assert!(flow.steps[3].optional);
    }

    #[test]
    fn test_zero_step_timeout_is_unset() {
        let flow = FlowLoader::from_toml_str(
            r#"
[flow]
name = "zeros"
timeout_ms = 6000

[selectors.form]
by = "css"
value = "form"

[[steps]]
action = "wait"
target = "form"
timeout_ms = 0

[[steps]]
action = "wait"
target = "form"
timeout = 0
timeout_ms = 1500

[[steps]]
action = "wait"
target = "form"
timeout = 900
timeout_ms = 1500
"#,
        )
        .unwrap();

        assert_eq!(flow.steps[0].timeout_ms, None);
        assert_eq!(flow.steps[1].timeout_ms, Some(1500));
        assert_eq!(flow.steps[2].timeout_ms, Some(900));
    }

    #[test]
    fn test_load_missing_file() {
        let err = FlowLoader::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, FlowEngineError::NotFound { .. }));
    }

    #[test]
    fn test_load_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(REGISTER_FLOW.as_bytes()).unwrap();
        let flow = FlowLoader::load(file.path()).unwrap();
        assert_eq!(flow.step_count(), 4);
    }

    #[test]
    fn test_malformed_document_is_parse_error() {
        let err = FlowLoader::from_toml_str("[flow\nname = ").unwrap_err();
        assert!(matches!(err, FlowEngineError::Parse(_)));
    }

    #[test]
    fn test_missing_flow_section() {
        let err = FlowLoader::from_toml_str("[[steps]]\naction = \"navigate\"\n").unwrap_err();
        assert!(err.to_string().contains("missing [flow] section"));
    }

    #[test]
    fn test_missing_steps() {
        let err = FlowLoader::from_toml_str("[flow]\nname = \"x\"\n").unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("steps"));
    }

    #[test]
    fn test_case_variant_steps_key() {
        let doc = "[flow]\nname = \"x\"\n[[Steps]]\naction = \"navigate\"\n";
        let flow = FlowLoader::from_toml_str(doc).unwrap();
        assert_eq!(flow.steps[0].action, ActionKind::Navigate);
        assert_eq!(flow.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn test_target_without_selectors_section() {
        let doc = "[flow]\nname = \"x\"\n[[steps]]\naction = \"click\"\ntarget = \"btn\"\n";
        let err = FlowLoader::from_toml_str(doc).unwrap_err();
        assert!(err.to_string().contains("missing [selectors] section"));
    }

    #[test]
    fn test_undefined_selector_reference() {
        let doc = r#"
[flow]
name = "x"
[selectors.email]
by = "id"
value = "email"
[[steps]]
action = "click"
target = "password"
"#;
        let err = FlowLoader::from_toml_str(doc).unwrap_err();
        assert!(err.to_string().contains("undefined selector: password (index=0)"));
    }

    #[test]
    fn test_unknown_action_and_state_are_aggregated() {
        let doc = r#"
[flow]
name = "x"
[selectors.email]
by = "id"
value = "email"
[[steps]]
action = "scroll"
[[steps]]
action = "wait"
target = "email"
state = "hidden"
"#;
        let err = FlowLoader::from_toml_str(doc).unwrap_err().to_string();
        assert!(err.contains("unsupported action: scroll (index=0)"));
        assert!(err.contains("unsupported state: hidden (index=1)"));
    }

    #[test]
    fn test_invalid_selector_kind() {
        let doc = r#"
[flow]
name = "x"
[selectors.email]
by = "name"
value = "email"
[[steps]]
action = "navigate"
"#;
        let err = FlowLoader::from_toml_str(doc).unwrap_err();
        assert!(err.to_string().contains("selector 'email' has invalid by value: name"));
    }

    #[test]
    fn test_malformed_selector_entries_are_skipped() {
        let doc = r#"
[flow]
name = "x"
[selectors.broken]
by = "id"
[selectors.email]
by = "id"
value = "email"
[[steps]]
action = "navigate"
"#;
        let flow = FlowLoader::from_toml_str(doc).unwrap();
        assert_eq!(flow.selectors.len(), 1);
        assert!(flow.selectors.contains_key("email"));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let doc = "[flow]\nname = \"x\"\n[[steps]]\naction = \"navigate\"\ntimeout_ms = -1\n";
        let err = FlowLoader::from_toml_str(doc).unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn test_absent_state_is_accepted() {
        let doc = r#"
[flow]
name = "x"
[selectors.spinner]
by = "css"
value = ".spinner"
[[steps]]
action = "wait"
target = "spinner"
state = "absent"
"#;
        let flow = FlowLoader::from_toml_str(doc).unwrap();
        assert_eq!(flow.steps[0].state, Some(WaitState::Absent));
    }
}
