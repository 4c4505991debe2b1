// Engine configuration loaded from disk
// Covers: whitelist from TOML, fatal configuration errors, deadline setting

use sandscript::config::EngineConfig;
use sandscript::engine::{BatchRequest, ScriptEngine, ScriptUnit};
use sandscript::interpreter::Value;
use sandscript::outcome::ExecutionOutcome;
use sandscript::whitelist::ConfigurationError;
use std::fs;
use tempfile::tempdir;

const CONFIG: &str = r#"
[pool]
core_workers = 1
max_workers = 4

[limits]
timeout_ms = 150
max_total_operations = 50

[security]
admins = ["ops"]

[[whitelist]]
type = "String"
member = "upper"

[[whitelist]]
type = "Array"
member = "length"
kind = "property"
cap = 2
"#;

#[test]
fn engine_runs_with_whitelist_from_file() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("engine.toml");
    fs::write(&path, CONFIG).expect("write config");

    let engine = ScriptEngine::from_config(EngineConfig::load(&path).expect("load"))
        .expect("engine");
    assert_eq!(engine.whitelist().len(), 2);

    let outcome = engine.evaluate(
        "let xs = [1, 2, 3]\nxs.length",
        Default::default(),
        "user",
        sandscript::TrustLevel::Sandboxed,
        None,
    );
    assert_eq!(outcome, ExecutionOutcome::Success(Value::Int(3)));

    let outcome = engine.submit_script_batch(
        BatchRequest::sandboxed("user").unit(ScriptUnit::new("loop", "while true { }")),
    );
    assert_eq!(outcome.kind(), "timeout");
}

#[test]
fn unknown_member_in_file_is_fatal() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[[whitelist]]\ntype = \"String\"\nmember = \"explode\"\n").expect("write");

    let config = EngineConfig::load(&path).expect("syntax is fine");
    assert!(matches!(
        ScriptEngine::from_config(config),
        Err(ConfigurationError::UnknownMember { .. })
    ));
}

#[test]
fn malformed_file_reports_its_path() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[pool\nmax_workers = 1").expect("write");

    let err = EngineConfig::load(&path).expect_err("malformed");
    assert!(format!("{err:#}").contains("broken.toml"));
}
