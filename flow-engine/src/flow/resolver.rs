//! Variable Resolution Module
//!
//! Substitutes `{namespace.key.path}` placeholders in step text against a
//! layered [`VariableContext`]. The `env` namespace reads the process
//! environment; every other namespace is looked up in the context.

use crate::error::{FlowEngineError, FlowResult};
use crate::flow::model::Flow;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{([a-zA-Z_]+)\.([^{}]+)\}").expect("placeholder pattern is valid");
}

/// Namespace backed by the process environment instead of the context
pub const ENV_NAMESPACE: &str = "env";

/// Namespaced variables visible to placeholders
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableContext {
    namespaces: Map<String, Value>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with only the `config` namespace populated
    pub fn with_config(config: Value) -> Self {
        let mut ctx = Self::new();
        ctx.set("config", config);
        ctx
    }

    /// Build the context for one flow execution.
    ///
    /// `config` defaults to an empty object, `account` is replaced when
    /// given and `flow` is always rebuilt from the flow itself.
    pub fn for_execution(base: &VariableContext, flow: &Flow, account: Option<&Value>) -> Self {
        let mut ctx = base.clone();
        if !ctx.contains("config") {
            ctx.set("config", Value::Object(Map::new()));
        }
        if let Some(account) = account {
            ctx.set("account", account.clone());
        }
        ctx.set("flow", flow.namespace());
        ctx
    }

    pub fn set(&mut self, namespace: impl Into<String>, value: Value) {
        self.namespaces.insert(namespace.into(), value);
    }

    pub fn get(&self, namespace: &str) -> Option<&Value> {
        self.namespaces.get(namespace)
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Look up a dotted key path inside a namespace
    pub fn lookup(&self, namespace: &str, keypath: &str) -> Option<&Value> {
        let mut current = self.namespaces.get(namespace)?;
        for part in keypath.split('.') {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Placeholder substitution over text and nested JSON values
pub struct VariableResolver;

impl VariableResolver {
    /// Replace every placeholder in `text`; any unknown variable is an error
    /// naming the full placeholder token.
    pub fn resolve(text: &str, ctx: &VariableContext) -> FlowResult<String> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let namespace = &caps[1];
            let keypath = &caps[2];

            out.push_str(&text[last..whole.start()]);
            out.push_str(&Self::lookup_token(namespace, keypath, ctx)?);
            last = whole.end();
        }

        out.push_str(&text[last..]);
        Ok(out)
    }

    /// `resolve` for optional fields; absent stays absent
    pub fn resolve_opt(text: Option<&str>, ctx: &VariableContext) -> FlowResult<Option<String>> {
        text.map(|t| Self::resolve(t, ctx)).transpose()
    }

    /// Recursively resolve strings inside arrays and objects, leaving other
    /// values untouched
    pub fn resolve_value(value: &Value, ctx: &VariableContext) -> FlowResult<Value> {
        match value {
            Value::String(s) => Ok(Value::String(Self::resolve(s, ctx)?)),
            Value::Array(items) => items
                .iter()
                .map(|v| Self::resolve_value(v, ctx))
                .collect::<FlowResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), Self::resolve_value(v, ctx)?)))
                .collect::<FlowResult<Map<_, _>>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Placeholder tokens still present in `text`
    pub fn placeholders(text: &str) -> Vec<String> {
        PLACEHOLDER
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    fn lookup_token(namespace: &str, keypath: &str, ctx: &VariableContext) -> FlowResult<String> {
        let missing = || {
            FlowEngineError::validation(format!("variable not found: {{{}.{}}}", namespace, keypath))
        };

        if namespace == ENV_NAMESPACE {
            return std::env::var(keypath).map_err(|_| missing());
        }

        ctx.lookup(namespace, keypath)
            .map(render)
            .ok_or_else(missing)
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn ctx() -> VariableContext {
        let mut ctx = VariableContext::new();
        ctx.set("account", json!({"email": "a@b", "profile": {"first": "Ada"}, "nick": null}));
        ctx.set("config", json!({"registration": {"url": "https://example.com", "count": 5}}));
        ctx
    }

    #[test]
    fn test_resolve_account_and_nested_config() {
        let out = VariableResolver::resolve(
            "{account.email} -> {config.registration.url} x{config.registration.count}",
            &ctx(),
        )
        .unwrap();
        assert_eq!(out, "a@b -> https://example.com x5");
    }

    #[test]
    fn test_null_renders_empty() {
        assert_eq!(VariableResolver::resolve("[{account.nick}]", &ctx()).unwrap(), "[]");
    }

    #[test]
    fn test_missing_variable_names_token() {
        let err = VariableResolver::resolve("hi {account.phone}", &ctx()).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("{account.phone}"));

        let err = VariableResolver::resolve("{nope.key}", &ctx()).unwrap_err();
        assert!(err.to_string().contains("{nope.key}"));
    }

    #[test]
    fn test_env_namespace() {
        std::env::set_var("FLOW_ENGINE_RESOLVER_TEST", "from-env");
        let out = VariableResolver::resolve("{env.FLOW_ENGINE_RESOLVER_TEST}", &ctx()).unwrap();
        assert_eq!(out, "from-env");

        let err = VariableResolver::resolve("{env.FLOW_ENGINE_RESOLVER_UNSET}", &ctx()).unwrap_err();
        assert!(err.to_string().contains("{env.FLOW_ENGINE_RESOLVER_UNSET}"));
    }

    #[test]
    fn test_non_placeholder_braces_pass_through() {
        let text = "json {\"a\": 1} and {plain}";
        assert_eq!(VariableResolver::resolve(text, &ctx()).unwrap(), text);
    }

    #[test]
    fn test_resolve_value_recurses() {
        let mut ctx = VariableContext::new();
        ctx.set("x", json!({"y": 3}));
        let obj = json!({"a": "{x.y}", "b": ["{x.y}", {"z": "{x.y}"}], "n": 7});
        let out = VariableResolver::resolve_value(&obj, &ctx).unwrap();
        assert_eq!(out, json!({"a": "3", "b": ["3", {"z": "3"}], "n": 7}));
    }

    #[test]
    fn test_resolve_opt_keeps_absent() {
        assert_eq!(VariableResolver::resolve_opt(None, &ctx()).unwrap(), None);
    }

    #[test]
    fn test_placeholders_lists_tokens() {
        let found = VariableResolver::placeholders("{a.b} and {c.d.e}");
        assert_eq!(found, vec!["{a.b}".to_string(), "{c.d.e}".to_string()]);
    }

    proptest! {
        #[test]
        fn prop_resolution_is_idempotent(text in "[a-zA-Z0-9 @._:/-]{0,64}") {
            let once = VariableResolver::resolve(&text, &ctx()).unwrap();
            let twice = VariableResolver::resolve(&once, &ctx()).unwrap();
            prop_assert_eq!(&once, &text);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_undefined_key_names_exact_token(key in "[a-z]{1,12}") {
            prop_assume!(key != "email" && key != "profile" && key != "nick");
            let token = format!("{{account.{}}}", key);
            let err = VariableResolver::resolve(&format!("x {} y", token), &ctx()).unwrap_err();
            prop_assert!(err.to_string().contains(&token));
        }
    }
}
