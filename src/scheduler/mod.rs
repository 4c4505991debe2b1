//=====================================================
// File: scheduler/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Run prepared batches on the worker pool
// Objective: Execute the units of a batch in order on one worker, race the
//            run against its deadline and deliver exactly one report
//=====================================================

pub mod pool;
pub mod registry;

pub use pool::{DEFAULT_THREAD_PREFIX, Job, PoolConfig, PoolError, WorkerPool};
pub use registry::{ExecutionRegistry, RunningExecution};

use crate::instrument::PreparedScript;
use crate::interpreter::{DEFAULT_MAX_CALL_DEPTH, Interpreter, Value};
use crate::outcome::{ExecutionOutcome, ExecutionReport, FailureCause};
use crate::session::{ExecutionSession, SessionProbe, UsageSnapshot};
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Unit currently executing inside a batch, for timeout reports.
type Progress = Arc<Mutex<Option<String>>>;

/// Runs prepared batches as cancellable tasks.
pub struct ScriptScheduler {
    pool: WorkerPool,
    registry: ExecutionRegistry,
    max_call_depth: usize,
}

impl ScriptScheduler {
    pub fn new(pool: WorkerPool) -> Self {
        Self::with_call_depth(pool, DEFAULT_MAX_CALL_DEPTH)
    }

    pub fn with_call_depth(pool: WorkerPool, max_call_depth: usize) -> Self {
        Self {
            pool,
            registry: ExecutionRegistry::new(),
            max_call_depth,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    /// Start a batch without waiting for it.
    ///
    /// `deadline` is measured from submission. `None` means the batch only
    /// stops by finishing or through [`ExecutionHandle::abort`].
    pub fn submit(
        &self,
        units: Vec<PreparedScript>,
        session: ExecutionSession,
        deadline: Option<Duration>,
    ) -> ExecutionHandle {
        let id = self.registry.next_id();
        let probe = session.probe();
        let progress: Progress = Arc::new(Mutex::new(None));
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let submitted = Instant::now();

        self.registry
            .register(id, probe.clone(), session.trust(), deadline);

        let task = BatchTask {
            id,
            units,
            session,
            registry: self.registry.clone(),
            progress: Arc::clone(&progress),
            max_call_depth: self.max_call_depth,
            submitted,
        };
        let job_sender = sender.clone();

        if let Err(err) = self.pool.execute(Box::new(move || task.run(job_sender))) {
            tracing::warn!(id, error = %err, "batch rejected by the worker pool");
            self.registry.complete(id);
            let report = ExecutionReport {
                id,
                outcome: ExecutionOutcome::failure(FailureCause::PoolSaturated, None),
                usage: UsageSnapshot::default(),
                elapsed: submitted.elapsed(),
                finished_at: Utc::now(),
            };
            let _ = sender.try_send(report);
        }

        ExecutionHandle {
            id,
            probe,
            receiver,
            registry: self.registry.clone(),
            progress,
            deadline,
            submitted,
        }
    }

    /// Run a batch and block until it finishes or its deadline passes.
    pub fn run_batch(
        &self,
        units: Vec<PreparedScript>,
        session: ExecutionSession,
        deadline: Option<Duration>,
    ) -> ExecutionReport {
        self.submit(units, session, deadline).wait()
    }

    /// One-unit batch. A successful report carries the unit's own value.
    pub fn evaluate_single(
        &self,
        unit: PreparedScript,
        session: ExecutionSession,
        deadline: Option<Duration>,
    ) -> ExecutionReport {
        self.run_batch(vec![unit], session, deadline)
    }

    /// Operator abort of a running batch.
    pub fn abort(&self, id: u64) -> bool {
        let aborted = self.registry.cancel(id);
        if aborted {
            tracing::info!(id, "batch abort requested");
        }
        aborted
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

struct BatchTask {
    id: u64,
    units: Vec<PreparedScript>,
    session: ExecutionSession,
    registry: ExecutionRegistry,
    progress: Progress,
    max_call_depth: usize,
    submitted: Instant,
}

impl BatchTask {
    fn run(self, sender: Sender<ExecutionReport>) {
        let id = self.id;
        let result = catch_unwind(AssertUnwindSafe(|| self.execute()));

        let (outcome, usage) = match result {
            Ok(finished) => finished,
            Err(payload) => {
                let message = pool::panic_message(payload.as_ref());
                tracing::error!(id, panic = %message, "script batch panicked");
                let unit = self.progress.lock().clone();
                (
                    ExecutionOutcome::failure(
                        FailureCause::WorkerPanicked { message },
                        unit.as_deref(),
                    ),
                    UsageSnapshot::default(),
                )
            }
        };

        self.registry.complete(id);
        tracing::debug!(id, outcome = outcome.kind(), "batch finished");

        let report = ExecutionReport {
            id,
            outcome,
            usage,
            elapsed: self.submitted.elapsed(),
            finished_at: Utc::now(),
        };
        // The waiter may already have reported a timeout and gone away.
        let _ = sender.try_send(report);
    }

    fn execute(&self) -> (ExecutionOutcome, UsageSnapshot) {
        let session = &self.session;
        let guard = session.begin();
        // Stop requests made before the worker picked the batch up were
        // cleared by `begin`.
        if self.registry.is_cancelled(self.id) {
            session.state().request_abort();
        } else if self.registry.is_expired(self.id) {
            session.state().request_interrupt();
        }

        let mut interpreter =
            Interpreter::with_monitor(Arc::new(session.monitor()), self.max_call_depth);
        for (name, value) in session.bindings() {
            interpreter.define_global(name.clone(), value.clone());
        }

        let mut last = Value::Null;
        for unit in &self.units {
            *self.progress.lock() = Some(unit.owner.clone());
            for (name, value) in &unit.bindings {
                interpreter.define_global(name.clone(), value.clone());
            }

            match interpreter.execute(&unit.program) {
                Ok(value) => last = value,
                Err(err) => {
                    let aborted = session.state().was_aborted();
                    let outcome =
                        ExecutionOutcome::from_run(Err(err), Some(&unit.owner), aborted);
                    let usage = session.usage();
                    drop(guard);
                    return (outcome, usage);
                }
            }
        }

        let usage = session.usage();
        drop(guard);
        (ExecutionOutcome::Success(last), usage)
    }
}

/// Caller side of a submitted batch.
pub struct ExecutionHandle {
    id: u64,
    probe: SessionProbe,
    receiver: Receiver<ExecutionReport>,
    registry: ExecutionRegistry,
    progress: Progress,
    deadline: Option<Duration>,
    submitted: Instant,
}

impl ExecutionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn probe(&self) -> &SessionProbe {
        &self.probe
    }

    /// Abort the batch; it ends with an aborted `Timeout`.
    pub fn abort(&self) -> bool {
        self.registry.cancel(self.id)
    }

    /// Block for the report, enforcing the deadline if there is one.
    pub fn wait(self) -> ExecutionReport {
        match self.deadline {
            Some(_) => {
                let remaining = self.remaining().unwrap_or_default();
                match self.receiver.recv_timeout(remaining) {
                    Ok(report) => report,
                    Err(RecvTimeoutError::Timeout) => self.expire(),
                    Err(RecvTimeoutError::Disconnected) => self.lost(),
                }
            }
            None => match self.receiver.recv() {
                Ok(report) => report,
                Err(_) => self.lost(),
            },
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Time left before the deadline, if there is one.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|limit| limit.saturating_sub(self.submitted.elapsed()))
    }

    pub(crate) fn receiver(&self) -> Receiver<ExecutionReport> {
        self.receiver.clone()
    }

    /// Poll for the report without touching the batch.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExecutionReport> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Deadline won the race: interrupt the task and report the timeout now.
    pub(crate) fn expire(self) -> ExecutionReport {
        if !self.registry.expire(self.id) {
            self.probe.request_interrupt();
        }
        let usage = self.probe.usage();
        let unit = self.progress.lock().clone();
        tracing::warn!(
            id = self.id,
            unit = unit.as_deref().unwrap_or("-"),
            "batch exceeded its deadline"
        );

        ExecutionReport {
            id: self.id,
            outcome: ExecutionOutcome::timeout(unit.as_deref(), false),
            usage,
            elapsed: self.submitted.elapsed(),
            finished_at: Utc::now(),
        }
    }

    pub(crate) fn lost(self) -> ExecutionReport {
        tracing::error!(id = self.id, "batch ended without a report");
        ExecutionReport {
            id: self.id,
            outcome: ExecutionOutcome::failure(
                FailureCause::WorkerPanicked {
                    message: "worker dropped the batch".to_string(),
                },
                None,
            ),
            usage: UsageSnapshot::default(),
            elapsed: self.submitted.elapsed(),
            finished_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Instrumenter;
    use crate::session::TrustLevel;
    use crate::whitelist::{Cap, InvocationPolicy, TypeCatalog, WhitelistEntry, WhitelistPolicy};
    use std::collections::HashMap;

    struct Fixture {
        whitelist: Arc<WhitelistPolicy>,
        policy: Arc<InvocationPolicy>,
        catalog: TypeCatalog,
    }

    impl Fixture {
        fn new() -> Self {
            let catalog = TypeCatalog::builtin();
            let whitelist = WhitelistPolicy::new(
                vec![
                    WhitelistEntry::method("String", "upper").with_cap(3),
                    WhitelistEntry::method("Global", "range"),
                ],
                &catalog,
            )
            .expect("whitelist");
            let policy = InvocationPolicy::sandboxed(
                &whitelist,
                Cap::Limited(1_000),
                Cap::Limited(1_000_000),
            )
            .expect("policy");
            Self {
                whitelist: Arc::new(whitelist),
                policy: Arc::new(policy),
                catalog,
            }
        }

        fn session(&self, trust: TrustLevel) -> ExecutionSession {
            let policy = match trust {
                TrustLevel::Sandboxed => Arc::clone(&self.policy),
                TrustLevel::Privileged => Arc::new(InvocationPolicy::privileged()),
            };
            ExecutionSession::new(trust, Arc::clone(&self.whitelist), policy)
        }

        fn prepare(&self, trust: TrustLevel, units: &[(&str, &str)]) -> Vec<PreparedScript> {
            let mut instrumenter =
                Instrumenter::new(&self.whitelist, &self.catalog, trust, HashMap::new());
            units
                .iter()
                .map(|(owner, source)| instrumenter.prepare(source, owner).expect("prepare"))
                .collect()
        }
    }

    fn scheduler() -> ScriptScheduler {
        ScriptScheduler::new(WorkerPool::new(PoolConfig {
            core_workers: 1,
            max_workers: 2,
            keep_alive: Duration::from_secs(5),
            stack_size: 8 * 1024 * 1024,
            thread_prefix: "test-scheduler".to_string(),
        }))
    }

    #[test]
    fn units_share_state_in_order() {
        let fixture = Fixture::new();
        let units = fixture.prepare(
            TrustLevel::Sandboxed,
            &[("a", "let greeting = \"hi\""), ("b", "greeting.upper()")],
        );
        let report = scheduler().run_batch(
            units,
            fixture.session(TrustLevel::Sandboxed),
            Some(Duration::from_secs(5)),
        );
        assert_eq!(report.outcome, ExecutionOutcome::Success(Value::from("HI")));
        assert_eq!(report.usage.per_entry.get("String.upper"), Some(&1));
    }

    #[test]
    fn stops_at_first_failing_unit() {
        let fixture = Fixture::new();
        let units = fixture.prepare(
            TrustLevel::Sandboxed,
            &[("a", "1 / 0"), ("b", "\"x\".upper()")],
        );
        let report = scheduler().run_batch(
            units,
            fixture.session(TrustLevel::Sandboxed),
            Some(Duration::from_secs(5)),
        );
        let ExecutionOutcome::RuntimeFailure(failure) = report.outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.unit.as_deref(), Some("a"));
        assert!(report.usage.per_entry.is_empty());
    }

    #[test]
    fn deadline_interrupts_runaway_loop() {
        let fixture = Fixture::new();
        let units = fixture.prepare(TrustLevel::Sandboxed, &[("spin", "while true { }")]);
        let session = fixture.session(TrustLevel::Sandboxed);
        let probe = session.probe();

        let started = Instant::now();
        let report = scheduler().run_batch(units, session, Some(Duration::from_millis(100)));
        assert_eq!(report.outcome, ExecutionOutcome::timeout(Some("spin"), false));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(probe.wait_idle(Duration::from_secs(5)));
        assert_eq!(probe.usage(), UsageSnapshot::default());
    }

    #[test]
    fn deadline_passed_before_start_still_interrupts() {
        let fixture = Fixture::new();
        let registry = ExecutionRegistry::new();
        let session = fixture.session(TrustLevel::Sandboxed);
        let id = registry.next_id();
        registry.register(id, session.probe(), TrustLevel::Sandboxed, Some(Duration::ZERO));

        // The waiter times out while the batch is still waiting for a worker.
        assert!(registry.expire(id));

        let task = BatchTask {
            id,
            units: fixture.prepare(
                TrustLevel::Sandboxed,
                &[("late", "fn f(n) { return n }\nf(1)")],
            ),
            session,
            registry: registry.clone(),
            progress: Arc::new(Mutex::new(None)),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            submitted: Instant::now(),
        };
        let (outcome, _) = task.execute();
        assert_eq!(outcome, ExecutionOutcome::timeout(Some("late"), false));
    }

    #[test]
    fn privileged_batch_runs_until_aborted() {
        let fixture = Fixture::new();
        let units = fixture.prepare(TrustLevel::Privileged, &[("admin", "while true { }")]);
        let scheduler = scheduler();
        let handle = scheduler.submit(units, fixture.session(TrustLevel::Privileged), None);

        assert!(handle.wait_timeout(Duration::from_millis(50)).is_none());
        assert!(scheduler.abort(handle.id()));
        let report = handle.wait();
        assert_eq!(report.outcome, ExecutionOutcome::timeout(Some("admin"), true));
        assert!(!scheduler.registry().contains(report.id));
    }

    #[test]
    fn saturated_pool_fails_the_batch() {
        let fixture = Fixture::new();
        let scheduler = ScriptScheduler::new(WorkerPool::new(PoolConfig {
            core_workers: 0,
            max_workers: 1,
            keep_alive: Duration::from_secs(5),
            stack_size: 8 * 1024 * 1024,
            thread_prefix: "test-saturated".to_string(),
        }));

        let busy = scheduler.submit(
            fixture.prepare(TrustLevel::Privileged, &[("admin", "while true { }")]),
            fixture.session(TrustLevel::Privileged),
            None,
        );
        let rejected = scheduler.run_batch(
            fixture.prepare(TrustLevel::Sandboxed, &[("late", "1")]),
            fixture.session(TrustLevel::Sandboxed),
            Some(Duration::from_secs(1)),
        );
        assert_eq!(
            rejected.outcome,
            ExecutionOutcome::failure(FailureCause::PoolSaturated, None)
        );

        busy.abort();
        assert!(busy.wait().outcome.kind() == "timeout");
    }
}

//=====================================================
// End of file
//=====================================================
