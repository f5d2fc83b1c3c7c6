use std::io::Write;

use clap::Parser;
use federa::{Cli, Commands, run};
use federa_error::ConnectorError;
use tempfile::NamedTempFile;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn validate(file: &NamedTempFile, json: bool) -> (Result<(), ConnectorError>, String) {
    let command = Commands::Validate {
        config: file.path().to_path_buf(),
        json,
    };
    let mut out = Vec::new();
    let result = run(&command, &mut out);
    (result, String::from_utf8(out).unwrap())
}

const VALID: &str = r#"{
    "connectors": [
        {
            "name": "people",
            "backend-type": "debug",
            "identity": "per-principal",
            "pool": { "max-pool-size": 4, "wait-time-for-resource": 250 },
            "capabilities": { "supports_select_distinct": "true" }
        },
        {
            "name": "sheet",
            "backend-type": "debug-sheet",
            "properties": { "columns": "A,B" }
        }
    ]
}"#;

#[test]
fn prints_resolved_connectors() {
    logutil::init_test();
    let file = config_file(VALID);
    let (result, out) = validate(&file, false);
    result.unwrap();

    assert!(out.contains("connector people (debug)"), "{out}");
    assert!(out.contains("identity: per-principal"), "{out}");
    assert!(out.contains("max-pool-size: 4"), "{out}");
    assert!(out.contains("wait-time-for-resource: 250ms"), "{out}");
    assert!(out.contains("supports_select_distinct: true"), "{out}");
    assert!(out.contains("connector sheet (debug-sheet)"), "{out}");
}

#[test]
fn json_report() {
    let file = config_file(VALID);
    let (result, out) = validate(&file, true);
    result.unwrap();

    let reports: serde_json::Value = serde_json::from_str(&out).unwrap();
    let reports = reports.as_array().unwrap();
    assert_eq!(2, reports.len());
    assert_eq!("people", reports[0]["name"]);
    assert_eq!("per-principal", reports[0]["identity"]);
    assert_eq!(250, reports[0]["pool"]["wait-time-for-resource"]);
    assert_eq!("true", reports[0]["capabilities"]["supports_select_distinct"]);
}

#[test]
fn bad_override_is_configuration_error() {
    let file = config_file(
        r#"{"connectors": [{"name": "a", "backend-type": "debug", "capabilities": {"supports_order_by": "maybe"}}]}"#,
    );
    let (result, _) = validate(&file, false);
    assert!(matches!(result, Err(ConnectorError::Configuration(_))));
}

#[test]
fn unknown_backend_and_bad_pool_are_configuration_errors() {
    for contents in [
        r#"{"connectors": [{"name": "a", "backend-type": "oracle"}]}"#,
        r#"{"connectors": [{"name": "a", "backend-type": "debug", "pool": {"max-pool-size": 0}}]}"#,
        r#"{"connectors": [{"name": "a", "backend-type": "debug", "colour": "blue"}]}"#,
    ] {
        let file = config_file(contents);
        let (result, _) = validate(&file, false);
        assert!(
            matches!(result, Err(ConnectorError::Configuration(_))),
            "{contents}: {result:?}"
        );
    }
}

#[test]
fn missing_file_is_not_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let command = Commands::Validate {
        config: dir.path().join("missing.json"),
        json: false,
    };
    let err = run(&command, &mut Vec::new()).unwrap_err();
    assert!(matches!(err, ConnectorError::SourceOperation { .. }), "{err}");
}

#[test]
fn parses_arguments() {
    let cli = Cli::try_parse_from(["federa", "-vv", "--log-format", "json", "validate", "conf.json"]).unwrap();
    assert_eq!(tracing::Level::DEBUG, cli.log_level());
    assert!(matches!(cli.command, Commands::Validate { json: false, .. }));

    let mut out = Vec::new();
    run(&Commands::Backends, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert_eq!(vec!["debug", "debug-feed", "debug-sheet"], out.lines().collect::<Vec<_>>());
}
