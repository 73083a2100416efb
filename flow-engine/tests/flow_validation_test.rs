//! Property tests for flow document validation

use flow_engine::{ActionKind, FlowLoader};
use proptest::prelude::*;

const SELECTORS: [&str; 3] = ["email", "password", "submit"];

fn document(steps: &[(String, String, Option<String>)]) -> String {
    let mut doc = String::from("[flow]\nname = \"generated\"\nstart_url = \"https://example.com\"\n\n");
    for name in SELECTORS {
        doc.push_str(&format!("[selectors.{}]\nby = \"id\"\nvalue = \"{}\"\n\n", name, name));
    }
    for (action, target, state) in steps {
        doc.push_str(&format!("[[steps]]\naction = \"{}\"\ntarget = \"{}\"\n", action, target));
        if let Some(state) = state {
            doc.push_str(&format!("state = \"{}\"\n", state));
        }
        doc.push('\n');
    }
    doc
}

fn action() -> impl Strategy<Value = String> {
    prop_oneof![
        4 => prop::sample::select(vec!["wait", "type", "click", "expect"]).prop_map(String::from),
        1 => "[a-z]{3,8}".prop_map(String::from),
    ]
}

fn target() -> impl Strategy<Value = String> {
    prop_oneof![
        4 => prop::sample::select(SELECTORS.to_vec()).prop_map(String::from),
        1 => "[a-z]{3,8}".prop_map(String::from),
    ]
}

fn state() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        2 => Just(None),
        3 => prop::sample::select(vec!["absent", "visible", "present", "clickable"]).prop_map(|s| Some(s.to_string())),
        1 => "[a-z]{4,9}".prop_map(Some),
    ]
}

fn is_known_action(action: &str) -> bool {
    ActionKind::ALL.iter().any(|a| a.as_str() == action)
}

fn is_known_state(state: &Option<String>) -> bool {
    match state {
        None => true,
        Some(s) => ["absent", "visible", "present", "clickable"].contains(&s.as_str()),
    }
}

proptest! {
    #[test]
    fn prop_validation_succeeds_iff_references_and_enums_are_valid(
        steps in prop::collection::vec((action(), target(), state()), 1..6)
    ) {
        let expected_ok = steps.iter().all(|(action, target, state)| {
            is_known_action(action) && SELECTORS.contains(&target.as_str()) && is_known_state(state)
        });

        let result = FlowLoader::from_toml_str(&document(&steps));
        prop_assert_eq!(result.is_ok(), expected_ok, "{:?}", result.err());
    }
}

#[test]
fn test_error_names_step_index() {
    let doc = document(&[
        ("click".to_string(), "submit".to_string(), None),
        ("click".to_string(), "captcha".to_string(), None),
    ]);
    let err = FlowLoader::from_toml_str(&doc).unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("undefined selector: captcha (index=1)"));
}
