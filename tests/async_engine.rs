// Async submission through the tokio facade
// Covers: async success, async deadline expiry, concurrent batches

mod common;

use common::{engine, ledger};
use sandscript::engine::{BatchRequest, ScriptUnit};
use sandscript::interpreter::Value;
use sandscript::outcome::ExecutionOutcome;
use std::time::{Duration, Instant};

#[tokio::test]
async fn async_batch_returns_the_value() {
    let (ledger, binding) = ledger();
    let outcome = engine()
        .submit_script_batch_async(
            BatchRequest::sandboxed("user")
                .bind("ledger", binding)
                .unit(ScriptUnit::new("a", "ledger.record()\nledger.record()")),
        )
        .await;
    assert_eq!(outcome, ExecutionOutcome::Success(Value::Int(2)));
    assert_eq!(ledger.records(), 2);
}

#[tokio::test]
async fn async_batch_times_out() {
    let engine = engine();
    let started = Instant::now();
    let outcome = engine
        .submit_script_batch_async(
            BatchRequest::sandboxed("user")
                .with_deadline(Duration::from_millis(100))
                .unit(ScriptUnit::new("spin", "while true { }")),
        )
        .await;
    assert_eq!(outcome, ExecutionOutcome::timeout(Some("spin"), false));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_batches_keep_separate_sessions() {
    let engine = engine();
    let (first, first_binding) = ledger();
    let (second, second_binding) = ledger();

    let a = engine.submit_script_batch_async(
        BatchRequest::sandboxed("a")
            .bind("ledger", first_binding)
            .unit(ScriptUnit::new("a", "for i in range(4) { ledger.record() }\nledger.total")),
    );
    let b = engine.submit_script_batch_async(
        BatchRequest::sandboxed("b")
            .bind("ledger", second_binding)
            .unit(ScriptUnit::new("b", "for i in range(5) { ledger.record() }\nledger.total")),
    );
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a, ExecutionOutcome::Success(Value::Int(4)));
    assert_eq!(b, ExecutionOutcome::Success(Value::Int(5)));
    assert_eq!(first.records(), 4);
    assert_eq!(second.records(), 5);
}
