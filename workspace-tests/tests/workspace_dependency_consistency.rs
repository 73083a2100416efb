use proptest::prelude::*;
use std::fs;
use std::path::Path;
use toml::{Table, Value};

/// Property test for workspace dependency consistency
///
/// For any member crate that uses a dependency declared in the root
/// `[workspace.dependencies]` table, the crate must inherit it with
/// `workspace = true` instead of pinning its own version.
#[cfg(test)]
mod workspace_dependency_tests {
    use super::*;

    const MEMBERS: [&str; 4] = ["flow-engine", "registration-common", "register-cli", "workspace-tests"];
    const DEPENDENCY_TABLES: [&str; 3] = ["dependencies", "dev-dependencies", "build-dependencies"];

    fn read_manifest(path: &str) -> Table {
        let content = fs::read_to_string(path).unwrap_or_else(|e| panic!("Failed to read {}: {}", path, e));
        content
            .parse::<Table>()
            .unwrap_or_else(|e| panic!("Failed to parse {}: {}", path, e))
    }

    fn workspace_dependencies() -> Table {
        read_manifest("../Cargo.toml")
            .get("workspace")
            .and_then(|w| w.get("dependencies"))
            .and_then(Value::as_table)
            .cloned()
            .expect("root manifest has [workspace.dependencies]")
    }

    /// `(name, inherits_from_workspace)` for every dependency of a manifest
    fn crate_dependencies(manifest: &Table) -> Vec<(String, bool)> {
        DEPENDENCY_TABLES
            .iter()
            .filter_map(|section| manifest.get(*section).and_then(Value::as_table))
            .flat_map(|table| table.iter())
            .map(|(name, spec)| {
                let inherits = spec
                    .get("workspace")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                (name.clone(), inherits)
            })
            .collect()
    }

    proptest! {
        #[test]
        fn test_workspace_dependency_consistency(crate_name in prop::sample::select(MEMBERS.to_vec())) {
            let cargo_toml_path = format!("../{}/Cargo.toml", crate_name);
            prop_assert!(Path::new(&cargo_toml_path).exists(), "missing manifest for {}", crate_name);

            let shared = workspace_dependencies();
            let manifest = read_manifest(&cargo_toml_path);

            for (dep_name, inherits) in crate_dependencies(&manifest) {
                if shared.contains_key(&dep_name) {
                    prop_assert!(
                        inherits,
                        "Crate '{}' uses dependency '{}' but does not inherit from workspace (missing 'workspace = true')",
                        crate_name,
                        dep_name
                    );
                }
            }
        }
    }

    #[test]
    fn test_dotted_and_inline_inheritance_are_recognised() {
        let manifest: Table = r#"
[dependencies]
tokio.workspace = true
serde = { workspace = true, features = ["derive"] }
lazy_static = "1.4"
"#
        .parse()
        .unwrap();

        let mut deps = crate_dependencies(&manifest);
        deps.sort();
        assert_eq!(
            deps,
            vec![
                ("lazy_static".to_string(), false),
                ("serde".to_string(), true),
                ("tokio".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_shared_stack_is_declared_once() {
        let shared = workspace_dependencies();
        for dep in [
            "tokio",
            "chromiumoxide",
            "serde",
            "serde_json",
            "toml",
            "thiserror",
            "tracing",
            "tracing-subscriber",
            "tracing-appender",
            "clap",
            "proptest",
            "tempfile",
        ] {
            assert!(shared.contains_key(dep), "workspace should declare {}", dep);
        }
    }
}
