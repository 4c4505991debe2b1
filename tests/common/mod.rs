// Shared fixtures for the engine integration tests
// Covers: a counting host object, engine construction helpers

#![allow(dead_code)]

use sandscript::config::EngineConfig;
use sandscript::engine::{ScriptEngine, StaticAuthorizer};
use sandscript::interpreter::{HostObject, RuntimeError, Value};
use sandscript::whitelist::{HostType, TypeCatalog, WhitelistEntry};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const ADMIN: &str = "admin";

/// Host object whose `record()` calls are observable from the test.
#[derive(Debug, Default)]
pub struct Ledger {
    records: AtomicU64,
}

impl Ledger {
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::SeqCst)
    }
}

impl HostObject for Ledger {
    fn type_name(&self) -> &str {
        "Ledger"
    }

    fn get_property(&self, name: &str) -> Result<Value, RuntimeError> {
        match name {
            "total" => Ok(Value::Int(self.records() as i64)),
            other => Err(RuntimeError::TypeError(format!("Ledger has no property '{other}'"))),
        }
    }

    fn call_method(&self, name: &str, _args: Vec<Value>) -> Result<Value, RuntimeError> {
        match name {
            "record" => Ok(Value::Int(
                self.records.fetch_add(1, Ordering::SeqCst) as i64 + 1,
            )),
            "secret" => Ok(Value::from("classified")),
            other => Err(RuntimeError::TypeError(format!("Ledger has no method '{other}'"))),
        }
    }
}

pub fn ledger_type() -> HostType {
    HostType::new("Ledger")
        .method("record", Some("Int"))
        .method("secret", Some("String"))
        .property("total", Some("Int"))
}

pub fn ledger() -> (Arc<Ledger>, Value) {
    let ledger = Arc::new(Ledger::default());
    let value = Value::Host(ledger.clone());
    (ledger, value)
}

/// Entries most tests need: the ledger, `range` and a few string methods.
pub fn default_entries() -> Vec<WhitelistEntry> {
    vec![
        WhitelistEntry::method("Ledger", "record").with_cap(5),
        WhitelistEntry::property("Ledger", "total"),
        WhitelistEntry::method("Global", "range"),
        WhitelistEntry::method("Global", "len"),
        WhitelistEntry::method("String", "upper"),
        WhitelistEntry::method("Array", "push"),
    ]
}

pub fn config(entries: Vec<WhitelistEntry>) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.pool.core_workers = 1;
    config.pool.max_workers = 8;
    config.limits.timeout_ms = 2_000;
    config.whitelist = entries;
    config
}

pub fn engine_with(config: EngineConfig) -> ScriptEngine {
    let catalog = TypeCatalog::builtin()
        .with_type(ledger_type())
        .expect("ledger type");
    ScriptEngine::new(config, catalog, Arc::new(StaticAuthorizer::new([ADMIN])))
        .expect("engine")
}

pub fn engine() -> ScriptEngine {
    engine_with(config(default_entries()))
}
