// Whitelist enforcement through the public engine API
// Covers: permitted scripts, static rejection, runtime fallback, per-entry caps

mod common;

use common::{config, default_entries, engine, engine_with, ledger};
use sandscript::engine::{BatchRequest, ScriptUnit};
use sandscript::interpreter::Value;
use std::collections::BTreeMap;
use sandscript::outcome::{ExecutionOutcome, ViolationRule};
use sandscript::whitelist::MemberKind;

fn run(source: &str, binding: Value) -> ExecutionOutcome {
    engine().submit_script_batch(
        BatchRequest::sandboxed("user")
            .bind("ledger", binding)
            .unit(ScriptUnit::new("script", source)),
    )
}

#[test]
fn whitelisted_scripts_within_caps_succeed() {
    let scripts = [
        ("ledger.record()", Value::Int(1)),
        ("let xs = range(3)\nlen(xs)", Value::Int(3)),
        ("let mut total = 0\nfor i in range(4) { total = total + i }\ntotal", Value::Int(6)),
        ("let name = \"ada\"\nname.upper()", Value::from("ADA")),
        ("let mut xs = []\nxs.push(1)\nxs.push(2)\nxs", Value::Array(vec![Value::Int(1), Value::Int(2)])),
        ("fn twice(f) { f()\nreturn f() }\ntwice(lambda || -> ledger.record())", Value::Int(2)),
        ("let m = { hits: 2 }\nm.hits * 10", Value::Int(20)),
    ];

    for (source, expected) in scripts {
        let (_, binding) = ledger();
        let outcome = run(source, binding);
        assert_eq!(outcome, ExecutionOutcome::Success(expected), "script: {source}");
    }
}

#[test]
fn undeclared_member_is_rejected_before_anything_runs() {
    let (ledger, binding) = ledger();
    let outcome = run("ledger.record()\nledger.record()\nledger.secret()", binding);

    assert_eq!(
        outcome,
        ExecutionOutcome::violation(
            ViolationRule::UndeclaredOperation {
                owner: "Ledger".into(),
                member: "secret".into(),
                kind: MemberKind::Method,
            },
            Some("script"),
        )
    );
    assert_eq!(ledger.records(), 0);
}

#[test]
fn undeclared_intrinsics_are_rejected_too() {
    let (_, binding) = ledger();
    let outcome = run("let s = \"x\"\ns.lower()", binding);
    assert!(matches!(
        outcome,
        ExecutionOutcome::SecurityViolation(ref v) if v.message == "undeclared operation String.lower"
    ));
}

#[test]
fn dynamic_receivers_are_checked_at_the_call_site() {
    let (ledger, binding) = ledger();
    let outcome = run(
        "fn peek(target) {\n  target.record()\n  return target.secret()\n}\npeek(ledger)",
        binding,
    );

    let ExecutionOutcome::SecurityViolation(violation) = outcome else {
        panic!("expected violation, got {outcome:?}");
    };
    assert_eq!(
        violation.rule,
        ViolationRule::UndeclaredOperation {
            owner: "Ledger".into(),
            member: "secret".into(),
            kind: MemberKind::Method,
        }
    );
    // The permitted call before the refused one already ran.
    assert_eq!(ledger.records(), 1);
}

#[test]
fn cap_stops_the_call_that_would_exceed_it() {
    let (ledger, binding) = ledger();
    let outcome = run("for i in range(6) {\n  ledger.record()\n}", binding);

    assert_eq!(
        outcome,
        ExecutionOutcome::violation(
            ViolationRule::CapExceeded {
                owner: "Ledger".into(),
                member: "record".into(),
                cap: 5,
            },
            Some("script"),
        )
    );
    assert_eq!(ledger.records(), 5);
}

#[test]
fn cap_also_applies_through_dynamic_dispatch() {
    let (ledger, binding) = ledger();
    let outcome = run(
        "let mut target = ledger\nlet mut i = 0\nwhile i < 10 {\n  target.record()\n  i = i + 1\n}",
        binding,
    );
    assert!(matches!(
        outcome,
        ExecutionOutcome::SecurityViolation(ref v) if matches!(v.rule, ViolationRule::CapExceeded { cap: 5, .. })
    ));
    assert_eq!(ledger.records(), 5);
}

#[test]
fn security_and_runtime_failures_stay_distinct() {
    let (_, binding) = ledger();
    let failure = run("let x = 1 / 0", binding.clone());
    assert_eq!(failure.kind(), "runtime_failure");

    let violation = run("ledger.secret()", binding);
    assert_eq!(violation.kind(), "security_violation");
    assert!(violation.describe().starts_with("Script rejected:"));
}

fn without_ledger_total() -> sandscript::ScriptEngine {
    let entries = default_entries()
        .into_iter()
        .filter(|entry| entry.member != "total")
        .collect();
    engine_with(config(entries))
}

fn is_undeclared_total(outcome: &ExecutionOutcome) -> bool {
    matches!(
        outcome,
        ExecutionOutcome::SecurityViolation(v) if v.rule == ViolationRule::UndeclaredOperation {
            owner: "Ledger".into(),
            member: "total".into(),
            kind: MemberKind::Property,
        }
    )
}

#[test]
fn redeclared_map_name_cannot_read_host_properties() {
    let (_, binding) = ledger();
    let outcome = without_ledger_total().submit_script_batch(
        BatchRequest::sandboxed("user")
            .bind("ledger", binding)
            .unit(ScriptUnit::new(
                "script",
                "let m = { total: 0 }\nfn peek() { return m.total }\nlet m = ledger\npeek()",
            )),
    );
    assert!(is_undeclared_total(&outcome), "got {outcome:?}");
}

#[test]
fn rebinding_a_map_global_in_a_later_unit_is_still_checked() {
    let (_, binding) = ledger();
    let mut fields = BTreeMap::new();
    fields.insert("total".to_string(), Value::Int(0));

    let outcome = without_ledger_total().submit_script_batch(
        BatchRequest::sandboxed("user")
            .unit(
                ScriptUnit::new("a", "fn peek() { return current.total }\npeek()")
                    .with_binding("current", Value::Map(fields)),
            )
            .unit(ScriptUnit::new("b", "peek()").with_binding("current", binding)),
    );
    assert!(is_undeclared_total(&outcome), "got {outcome:?}");
    let ExecutionOutcome::SecurityViolation(violation) = outcome else {
        unreachable!();
    };
    assert_eq!(violation.unit.as_deref(), Some("b"));
}
