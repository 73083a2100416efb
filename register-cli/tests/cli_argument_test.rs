use clap::Parser;
use proptest::prelude::*;
use register_cli::{Cli, Command, EncryptArgs, RunArgs, ValidateArgs};
use std::path::PathBuf;

// Flow paths made of safe path characters; never starting with '-'
fn arb_flow_path() -> impl Strategy<Value = String> {
    "[a-z0-9_]{1,20}(/[a-z0-9_]{1,20}){0,2}\\.toml"
}

fn parse_run(args: &[&str]) -> RunArgs {
    match Cli::try_parse_from(args).unwrap().command {
        Command::Run(run) => run,
        other => panic!("expected run, got {:?}", other),
    }
}

proptest! {
    /// Any count and interval given on the command line is carried verbatim
    #[test]
    fn prop_run_overrides_are_parsed(
        count in 1u32..=100,
        interval in 0u32..=600,
        flow in arb_flow_path(),
    ) {
        let count_arg = count.to_string();
        let interval_arg = interval.to_string();
        let parsed = Cli::try_parse_from([
            "register", "run",
            "--flow", flow.as_str(),
            "--count", count_arg.as_str(),
            "--interval", interval_arg.as_str(),
        ]);
        prop_assert!(parsed.is_ok(), "failed to parse run arguments: {:?}", parsed.err());

        let cli = parsed.unwrap();
        prop_assert_eq!(cli.config, PathBuf::from("config.json"));
        match cli.command {
            Command::Run(run) => {
                prop_assert_eq!(run.flow, Some(PathBuf::from(&flow)));
                prop_assert_eq!(run.count, Some(count));
                prop_assert_eq!(run.interval, Some(interval as f64));
                prop_assert!(!run.headless);
                prop_assert!(!run.auto);
            }
            other => prop_assert!(false, "expected run, got {:?}", other),
        }
    }

    /// `--config` is accepted before or after the subcommand
    #[test]
    fn prop_config_is_global(path in arb_flow_path(), before in any::<bool>()) {
        let args: Vec<&str> = if before {
            vec!["register", "--config", path.as_str(), "validate"]
        } else {
            vec!["register", "validate", "--config", path.as_str()]
        };
        let cli = Cli::try_parse_from(args).unwrap();
        prop_assert_eq!(cli.config, PathBuf::from(&path));
        prop_assert_eq!(cli.command.clone(), Command::Validate(ValidateArgs::default()));
    }

    /// Counts that do not fit the argument type are rejected by the parser
    #[test]
    fn prop_negative_count_rejected(count in 1i64..1000) {
        let arg = format!("-{}", count);
        let parsed = Cli::try_parse_from(["register", "run", "--count", arg.as_str()]);
        prop_assert!(parsed.is_err());
    }
}

#[test]
fn test_run_defaults() {
    let run = parse_run(&["register", "run"]);
    assert_eq!(run, RunArgs::default());
}

#[test]
fn test_run_flags() {
    let run = parse_run(&["register", "run", "--headless", "--auto"]);
    assert!(run.headless);
    assert!(run.auto);
}

#[test]
fn test_validate_account_json() {
    let cli = Cli::try_parse_from([
        "register",
        "validate",
        "--flow",
        "flows/register.toml",
        "--account",
        r#"{"email":"a@b.c"}"#,
    ])
    .unwrap();
    match cli.command {
        Command::Validate(args) => {
            assert_eq!(args.flow, Some(PathBuf::from("flows/register.toml")));
            assert_eq!(args.account.as_deref(), Some(r#"{"email":"a@b.c"}"#));
        }
        other => panic!("expected validate, got {:?}", other),
    }
}

#[test]
fn test_encrypt_secret_takes_the_value() {
    let cli = Cli::try_parse_from(["register", "encrypt-secret", "app-code"]).unwrap();
    assert_eq!(
        cli.command,
        Command::EncryptSecret(EncryptArgs {
            value: "app-code".to_string()
        })
    );
    assert!(Cli::try_parse_from(["register", "encrypt-secret"]).is_err());
}

#[test]
fn test_subcommand_required() {
    assert!(Cli::try_parse_from(["register"]).is_err());
    assert!(Cli::try_parse_from(["register", "deploy"]).is_err());
}
