// Multi-unit batches and privileged sessions
// Covers: in-order shared state, stop on first failure, privileged bypass,
//         unauthorized privilege requests, operator abort

mod common;

use common::{ADMIN, engine, ledger};
use sandscript::engine::{BatchRequest, ScriptUnit};
use sandscript::interpreter::Value;
use sandscript::outcome::{ExecutionOutcome, ViolationRule};
use sandscript::session::TrustLevel;
use std::time::Duration;

#[test]
fn later_unit_sees_earlier_unit_state() {
    let (ledger, binding) = ledger();
    let outcome = engine().submit_script_batch(
        BatchRequest::sandboxed("user")
            .bind("ledger", binding)
            .unit(ScriptUnit::new("first", "let base = 40"))
            .unit(ScriptUnit::new("second", "ledger.record()\nbase + 2")),
    );
    assert_eq!(outcome, ExecutionOutcome::Success(Value::Int(42)));
    assert_eq!(ledger.records(), 1);
}

#[test]
fn failing_unit_stops_the_batch() {
    let (ledger, binding) = ledger();
    let outcome = engine().submit_script_batch(
        BatchRequest::sandboxed("user")
            .bind("ledger", binding)
            .unit(ScriptUnit::new("first", "let base = missing + 1"))
            .unit(ScriptUnit::new("second", "ledger.record()")),
    );

    let ExecutionOutcome::RuntimeFailure(failure) = outcome else {
        panic!("expected runtime failure, got {outcome:?}");
    };
    assert_eq!(failure.unit.as_deref(), Some("first"));
    assert_eq!(ledger.records(), 0);
}

#[test]
fn rejected_unit_rejects_the_whole_batch_up_front() {
    let (ledger, binding) = ledger();
    let outcome = engine().submit_script_batch(
        BatchRequest::sandboxed("user")
            .bind("ledger", binding)
            .unit(ScriptUnit::new("first", "ledger.record()"))
            .unit(ScriptUnit::new("second", "ledger.secret()")),
    );
    assert!(matches!(
        outcome,
        ExecutionOutcome::SecurityViolation(ref v) if v.unit.as_deref() == Some("second")
    ));
    assert_eq!(ledger.records(), 0);
}

#[test]
fn units_share_one_cap_budget() {
    let (ledger, binding) = ledger();
    let outcome = engine().submit_script_batch(
        BatchRequest::sandboxed("user")
            .bind("ledger", binding)
            .unit(ScriptUnit::new("a", "for i in range(3) { ledger.record() }"))
            .unit(ScriptUnit::new("b", "for i in range(3) { ledger.record() }")),
    );
    assert!(matches!(
        outcome,
        ExecutionOutcome::SecurityViolation(ref v) if v.unit.as_deref() == Some("b")
    ));
    assert_eq!(ledger.records(), 5);
}

#[test]
fn privileged_session_may_call_anything() {
    let (_, binding) = ledger();
    let outcome = engine().submit_script_batch(
        BatchRequest::new(ADMIN, TrustLevel::Privileged)
            .bind("ledger", binding)
            .unit(ScriptUnit::privileged("ops", "let s = \"x\"\ns.lower() + ledger.secret()")),
    );
    assert_eq!(outcome, ExecutionOutcome::Success(Value::from("xclassified")));
}

#[test]
fn unauthorized_privileged_request_is_refused_before_parsing() {
    let (ledger, binding) = ledger();
    let outcome = engine().submit_script_batch(
        BatchRequest::new("mallory", TrustLevel::Privileged)
            .bind("ledger", binding)
            .unit(ScriptUnit::privileged("ops", "ledger.record(\nthis does not parse")),
    );
    assert_eq!(
        outcome,
        ExecutionOutcome::violation(
            ViolationRule::UnauthorizedPrivilegedSession {
                identity: "mallory".into()
            },
            None,
        )
    );
    assert_eq!(ledger.records(), 0);
}

#[test]
fn sandboxed_unit_downgrades_a_privileged_request() {
    let (_, binding) = ledger();
    let outcome = engine().submit_script_batch(
        BatchRequest::new(ADMIN, TrustLevel::Privileged)
            .bind("ledger", binding)
            .unit(ScriptUnit::new("user-supplied", "ledger.secret()")),
    );
    assert_eq!(outcome.kind(), "security_violation");
}

#[test]
fn operator_can_abort_a_privileged_run() {
    let engine = engine();
    let handle = engine
        .submit(
            BatchRequest::new(ADMIN, TrustLevel::Privileged)
                .unit(ScriptUnit::privileged("forever", "while true { }")),
        )
        .expect("submitted");

    assert!(handle.wait_timeout(Duration::from_millis(100)).is_none());
    assert_eq!(engine.running().len(), 1);
    assert!(engine.abort(handle.id()));

    let report = handle.wait();
    assert_eq!(report.outcome, ExecutionOutcome::timeout(Some("forever"), true));
    assert!(engine.running().is_empty());
    assert!(!engine.abort(report.id));
}
