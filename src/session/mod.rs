//=====================================================
// File: session/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Per-batch execution state
// Objective: Bindings, live counters and the interrupt flag of one batch,
//            plus the monitor that enforces caps at instrumented hooks
//=====================================================

use crate::interpreter::{ExecutionMonitor, RuntimeError, Value};
use crate::outcome::ViolationRule;
use crate::whitelist::{EntryId, InvocationPolicy, MemberKind, WhitelistPolicy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How much a batch is trusted. `Sandboxed < Privileged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Sandboxed,
    Privileged,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustLevel::Sandboxed => f.write_str("sandboxed"),
            TrustLevel::Privileged => f.write_str("privileged"),
        }
    }
}

/// Counters of one batch, readable while it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    /// Non-zero per-entry counts keyed by `Type.member`.
    pub per_entry: BTreeMap<String, u64>,
    pub total_ops: u64,
    pub total_loops: u64,
}

/// Live state shared between the running task and its observers.
#[derive(Debug)]
pub struct SessionState {
    counters: Vec<AtomicU64>,
    total_ops: AtomicU64,
    total_loops: AtomicU64,
    interrupt: AtomicBool,
    aborted: AtomicBool,
    running: AtomicBool,
}

impl SessionState {
    fn new(entries: usize) -> Self {
        Self {
            counters: (0..entries).map(|_| AtomicU64::new(0)).collect(),
            total_ops: AtomicU64::new(0),
            total_loops: AtomicU64::new(0),
            interrupt: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::SeqCst);
        }
        self.total_ops.store(0, Ordering::SeqCst);
        self.total_loops.store(0, Ordering::SeqCst);
        self.interrupt.store(false, Ordering::SeqCst);
        self.aborted.store(false, Ordering::SeqCst);
    }

    fn snapshot(&self, whitelist: &WhitelistPolicy) -> UsageSnapshot {
        let per_entry = whitelist
            .entries()
            .iter()
            .zip(&self.counters)
            .filter_map(|(entry, counter)| {
                let count = counter.load(Ordering::SeqCst);
                (count > 0).then(|| (entry.qualified_name(), count))
            })
            .collect();

        UsageSnapshot {
            per_entry,
            total_ops: self.total_ops.load(Ordering::SeqCst),
            total_loops: self.total_loops.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub(crate) fn request_abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.request_interrupt();
    }

    pub(crate) fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// State of one batch run. Not `Clone`: a session belongs to exactly one task.
#[derive(Debug)]
pub struct ExecutionSession {
    trust: TrustLevel,
    bindings: HashMap<String, Value>,
    whitelist: Arc<WhitelistPolicy>,
    policy: Arc<InvocationPolicy>,
    state: Arc<SessionState>,
}

impl ExecutionSession {
    pub fn new(
        trust: TrustLevel,
        whitelist: Arc<WhitelistPolicy>,
        policy: Arc<InvocationPolicy>,
    ) -> Self {
        let state = Arc::new(SessionState::new(whitelist.len()));
        Self {
            trust,
            bindings: HashMap::new(),
            whitelist,
            policy,
            state,
        }
    }

    pub fn trust(&self) -> TrustLevel {
        self.trust
    }

    /// Bind a free variable, replacing any earlier value of the same name.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn bindings(&self) -> &HashMap<String, Value> {
        &self.bindings
    }

    /// Runtime type of each binding, for static resolution.
    pub fn binding_types(&self) -> HashMap<String, String> {
        self.bindings
            .iter()
            .map(|(name, value)| (name.clone(), value.type_name().to_string()))
            .collect()
    }

    /// Zero every counter and clear the interrupt flag.
    pub fn reset(&self) {
        self.state.reset();
    }

    pub fn usage(&self) -> UsageSnapshot {
        self.state.snapshot(&self.whitelist)
    }

    pub fn probe(&self) -> SessionProbe {
        SessionProbe {
            state: Arc::clone(&self.state),
            whitelist: Arc::clone(&self.whitelist),
        }
    }

    pub fn monitor(&self) -> SessionMonitor {
        SessionMonitor {
            trust: self.trust,
            whitelist: Arc::clone(&self.whitelist),
            policy: Arc::clone(&self.policy),
            state: Arc::clone(&self.state),
        }
    }

    /// Mark the batch as running; the guard resets the session when dropped.
    pub(crate) fn begin(&self) -> ResetGuard {
        self.state.reset();
        self.state.running.store(true, Ordering::SeqCst);
        ResetGuard {
            state: Arc::clone(&self.state),
        }
    }

    pub(crate) fn state(&self) -> &Arc<SessionState> {
        &self.state
    }
}

/// Resets counters and flags on every exit path, unwinding included.
pub(crate) struct ResetGuard {
    state: Arc<SessionState>,
}

impl Drop for ResetGuard {
    fn drop(&mut self) {
        self.state.reset();
        self.state.running.store(false, Ordering::SeqCst);
    }
}

/// Read-only view of a session that may also request an interrupt.
#[derive(Debug, Clone)]
pub struct SessionProbe {
    state: Arc<SessionState>,
    whitelist: Arc<WhitelistPolicy>,
}

impl SessionProbe {
    pub fn usage(&self) -> UsageSnapshot {
        self.state.snapshot(&self.whitelist)
    }

    pub fn request_interrupt(&self) {
        self.state.request_interrupt();
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Poll until the task has released the session or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub(crate) fn state(&self) -> &Arc<SessionState> {
        &self.state
    }
}

/// Enforces the session's caps at the interpreter's hooks.
pub struct SessionMonitor {
    trust: TrustLevel,
    whitelist: Arc<WhitelistPolicy>,
    policy: Arc<InvocationPolicy>,
    state: Arc<SessionState>,
}

impl SessionMonitor {
    fn count(&self, entry: EntryId) -> Result<(), RuntimeError> {
        let counter = self.state.counters.get(entry.index()).ok_or_else(|| {
            RuntimeError::InvalidOperation(format!("unknown whitelist entry {}", entry.index()))
        })?;

        let cap = self.policy.entry_cap(entry);
        if cap.is_reached(counter.load(Ordering::SeqCst)) {
            let (owner, member) = self
                .whitelist
                .entry(entry)
                .map(|e| (e.owner_type.clone(), e.member.clone()))
                .unwrap_or_default();
            return Err(RuntimeError::Security(ViolationRule::CapExceeded {
                owner,
                member,
                cap: cap.limit().unwrap_or_default(),
            }));
        }

        let total_cap = self.policy.total_op_cap();
        if total_cap.is_reached(self.state.total_ops.load(Ordering::SeqCst)) {
            return Err(RuntimeError::Security(ViolationRule::TotalOperationCap {
                cap: total_cap.limit().unwrap_or_default(),
            }));
        }

        counter.fetch_add(1, Ordering::SeqCst);
        self.state.total_ops.fetch_add(1, Ordering::SeqCst);
        self.check_interrupt()
    }
}

impl ExecutionMonitor for SessionMonitor {
    fn on_operation(&self, entry: EntryId, owner: &str) -> Result<(), RuntimeError> {
        if self.trust == TrustLevel::Privileged {
            return self.check_interrupt();
        }

        match self.whitelist.entry(entry) {
            Some(declared) if declared.owner_type == owner => self.count(entry),
            Some(declared) => {
                // The receiver is not the statically inferred type.
                let (member, kind) = (declared.member.clone(), declared.kind);
                self.on_dynamic(owner, &member, kind)
            }
            None => Err(RuntimeError::InvalidOperation(format!(
                "unknown whitelist entry {}",
                entry.index()
            ))),
        }
    }

    fn on_dynamic(
        &self,
        owner: &str,
        member: &str,
        kind: MemberKind,
    ) -> Result<(), RuntimeError> {
        if self.trust == TrustLevel::Privileged {
            return self.check_interrupt();
        }

        match self.whitelist.lookup(owner, member, kind) {
            Some(entry) => self.count(entry),
            None => {
                tracing::debug!(owner, member, %kind, "runtime whitelist check refused");
                Err(RuntimeError::Security(ViolationRule::UndeclaredOperation {
                    owner: owner.to_string(),
                    member: member.to_string(),
                    kind,
                }))
            }
        }
    }

    fn on_loop(&self) -> Result<(), RuntimeError> {
        if self.trust == TrustLevel::Sandboxed {
            let cap = self.policy.loop_cap();
            if cap.is_reached(self.state.total_loops.load(Ordering::SeqCst)) {
                return Err(RuntimeError::Security(ViolationRule::LoopCap {
                    cap: cap.limit().unwrap_or_default(),
                }));
            }
            self.state.total_loops.fetch_add(1, Ordering::SeqCst);
        }
        self.check_interrupt()
    }

    fn check_interrupt(&self) -> Result<(), RuntimeError> {
        if self.state.interrupt.load(Ordering::SeqCst) {
            return Err(RuntimeError::Interrupted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whitelist::{Cap, TypeCatalog, WhitelistEntry};

    fn sandboxed_session() -> ExecutionSession {
        let whitelist = Arc::new(
            WhitelistPolicy::new(
                vec![
                    WhitelistEntry::method("String", "upper").with_cap(2),
                    WhitelistEntry::method("String", "lower"),
                ],
                &TypeCatalog::builtin(),
            )
            .expect("whitelist"),
        );
        let policy = Arc::new(
            InvocationPolicy::sandboxed(&whitelist, Cap::Limited(3), Cap::Limited(2))
                .expect("policy"),
        );
        ExecutionSession::new(TrustLevel::Sandboxed, whitelist, policy)
    }

    #[test]
    fn entry_cap_stops_before_the_extra_call() {
        let session = sandboxed_session();
        let monitor = session.monitor();
        let upper = EntryId(0);

        assert!(monitor.on_operation(upper, "String").is_ok());
        assert!(monitor.on_operation(upper, "String").is_ok());
        assert!(matches!(
            monitor.on_operation(upper, "String"),
            Err(RuntimeError::Security(ViolationRule::CapExceeded { cap: 2, .. }))
        ));
        assert_eq!(session.usage().per_entry.get("String.upper"), Some(&2));
        assert_eq!(session.usage().total_ops, 2);
    }

    #[test]
    fn total_cap_spans_entries() {
        let session = sandboxed_session();
        let monitor = session.monitor();
        for _ in 0..3 {
            monitor.on_operation(EntryId(1), "String").expect("within cap");
        }
        assert!(matches!(
            monitor.on_dynamic("String", "lower", MemberKind::Method),
            Err(RuntimeError::Security(ViolationRule::TotalOperationCap { cap: 3 }))
        ));
    }

    #[test]
    fn mismatched_receiver_falls_back_to_runtime_lookup() {
        let session = sandboxed_session();
        let monitor = session.monitor();
        assert!(matches!(
            monitor.on_operation(EntryId(0), "Int"),
            Err(RuntimeError::Security(ViolationRule::UndeclaredOperation { .. }))
        ));
    }

    #[test]
    fn loop_cap_and_interrupt() {
        let session = sandboxed_session();
        let monitor = session.monitor();
        monitor.on_loop().expect("first");
        monitor.on_loop().expect("second");
        assert!(matches!(
            monitor.on_loop(),
            Err(RuntimeError::Security(ViolationRule::LoopCap { cap: 2 }))
        ));

        session.reset();
        session.probe().request_interrupt();
        assert!(matches!(monitor.on_loop(), Err(RuntimeError::Interrupted)));
    }

    #[test]
    fn guard_resets_to_fresh_state() {
        let session = sandboxed_session();
        let fresh = session.usage();
        {
            let _guard = session.begin();
            let monitor = session.monitor();
            monitor.on_operation(EntryId(0), "String").expect("count");
            monitor.on_loop().expect("loop");
            assert!(session.probe().is_running());
            assert_ne!(session.usage(), fresh);
        }
        assert_eq!(session.usage(), fresh);
        assert!(!session.probe().is_running());
    }

    #[test]
    fn privileged_sessions_only_check_interrupts() {
        let whitelist = Arc::new(WhitelistPolicy::default());
        let session = ExecutionSession::new(
            TrustLevel::Privileged,
            whitelist,
            Arc::new(InvocationPolicy::privileged()),
        );
        let monitor = session.monitor();
        assert!(monitor.on_dynamic("Thread", "sleep", MemberKind::Method).is_ok());
        for _ in 0..10 {
            monitor.on_loop().expect("unbounded");
        }
        session.probe().request_interrupt();
        assert!(matches!(
            monitor.on_dynamic("Thread", "sleep", MemberKind::Method),
            Err(RuntimeError::Interrupted)
        ));
    }
}

//=====================================================
// End of file
//=====================================================
