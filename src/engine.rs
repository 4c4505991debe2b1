//=====================================================
// File: engine.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Entry point for callers submitting scripts
// Objective: Authorize, prepare and schedule script batches and hand back
//            exactly one normalized outcome per batch
//=====================================================

use crate::config::EngineConfig;
use crate::instrument::{Instrumenter, PreparedScript};
use crate::interpreter::Value;
use crate::outcome::{ExecutionOutcome, ExecutionReport, FailureCause, ViolationRule};
use crate::scheduler::{ExecutionHandle, RunningExecution, ScriptScheduler, WorkerPool};
use crate::session::{ExecutionSession, TrustLevel, UsageSnapshot};
use crate::whitelist::{ConfigurationError, InvocationPolicy, TypeCatalog, WhitelistPolicy};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Who is asking to run a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CallerIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Decides who may open a privileged session.
pub trait Authorizer: Send + Sync {
    fn is_privileged_caller(&self, identity: &CallerIdentity) -> bool;
}

/// Fixed set of administrator identities.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    admins: HashSet<String>,
}

impl StaticAuthorizer {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for StaticAuthorizer {
    fn is_privileged_caller(&self, identity: &CallerIdentity) -> bool {
        self.admins.contains(identity.as_str())
    }
}

/// Nobody is privileged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn is_privileged_caller(&self, _identity: &CallerIdentity) -> bool {
        false
    }
}

/// One script of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptUnit {
    pub source: String,
    /// Reported with outcomes so callers can tell which script failed.
    pub owner: String,
    pub trust: TrustLevel,
    /// Globals rebound right before this unit runs.
    pub bindings: Vec<(String, Value)>,
}

impl ScriptUnit {
    pub fn new(owner: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            owner: owner.into(),
            trust: TrustLevel::Sandboxed,
            bindings: Vec::new(),
        }
    }

    pub fn privileged(owner: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(owner, source).with_trust(TrustLevel::Privileged)
    }

    pub fn with_trust(mut self, trust: TrustLevel) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_binding(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.push((name.into(), value.into()));
        self
    }
}

/// Everything needed to run one batch.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub units: Vec<ScriptUnit>,
    pub bindings: HashMap<String, Value>,
    /// Requested trust; the batch runs at the lowest trust of this and
    /// every unit.
    pub trust: TrustLevel,
    pub identity: CallerIdentity,
    /// Sandboxed deadline; the configured timeout when `None`.
    pub deadline: Option<Duration>,
}

impl BatchRequest {
    pub fn new(identity: impl Into<CallerIdentity>, trust: TrustLevel) -> Self {
        Self {
            units: Vec::new(),
            bindings: HashMap::new(),
            trust,
            identity: identity.into(),
            deadline: None,
        }
    }

    pub fn sandboxed(identity: impl Into<CallerIdentity>) -> Self {
        Self::new(identity, TrustLevel::Sandboxed)
    }

    pub fn unit(mut self, unit: ScriptUnit) -> Self {
        self.units.push(unit);
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Lowest trust among the request and its units.
    pub fn effective_trust(&self) -> TrustLevel {
        self.units
            .iter()
            .map(|unit| unit.trust)
            .fold(self.trust, Ord::min)
    }
}

/// A batch that passed authorization and validation.
struct PreparedBatch {
    units: Vec<PreparedScript>,
    session: ExecutionSession,
    deadline: Option<Duration>,
}

/// Sandboxed script execution engine.
pub struct ScriptEngine {
    config: EngineConfig,
    catalog: Arc<TypeCatalog>,
    whitelist: Arc<WhitelistPolicy>,
    sandboxed: Arc<InvocationPolicy>,
    privileged: Arc<InvocationPolicy>,
    authorizer: Arc<dyn Authorizer>,
    scheduler: ScriptScheduler,
}

impl ScriptEngine {
    /// Validate the configuration and start the worker pool.
    pub fn new(
        config: EngineConfig,
        catalog: TypeCatalog,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let whitelist = WhitelistPolicy::new(config.whitelist.clone(), &catalog)?;
        let sandboxed = config.sandboxed_policy(&whitelist)?;
        let scheduler = ScriptScheduler::with_call_depth(
            WorkerPool::new(config.pool_config()),
            config.limits.max_call_depth,
        );

        tracing::info!(
            entries = whitelist.len(),
            max_workers = config.pool.max_workers,
            "script engine ready"
        );

        Ok(Self {
            config,
            catalog: Arc::new(catalog),
            whitelist: Arc::new(whitelist),
            sandboxed: Arc::new(sandboxed),
            privileged: Arc::new(InvocationPolicy::privileged()),
            authorizer,
            scheduler,
        })
    }

    /// Built-in types only; admins come from `[security]`.
    pub fn from_config(config: EngineConfig) -> Result<Self, ConfigurationError> {
        let authorizer = Arc::new(StaticAuthorizer::new(config.security.admins.clone()));
        Self::new(config, TypeCatalog::builtin(), authorizer)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn whitelist(&self) -> &WhitelistPolicy {
        &self.whitelist
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    /// Run a batch and block for its outcome.
    pub fn submit_script_batch(&self, request: BatchRequest) -> ExecutionOutcome {
        self.submit_script_batch_report(request).outcome
    }

    /// Like [`ScriptEngine::submit_script_batch`] but with usage and timing.
    pub fn submit_script_batch_report(&self, request: BatchRequest) -> ExecutionReport {
        let report = match self.prepare(&request) {
            Ok(batch) => self
                .scheduler
                .run_batch(batch.units, batch.session, batch.deadline),
            Err(outcome) => self.rejected(outcome),
        };
        log_report(&request, &report);
        report
    }

    /// Start a batch and return at once. Validation failures come back as
    /// the outcome the batch would have produced.
    pub fn submit(&self, request: BatchRequest) -> Result<ExecutionHandle, ExecutionOutcome> {
        let batch = self.prepare(&request)?;
        let handle = self
            .scheduler
            .submit(batch.units, batch.session, batch.deadline);
        tracing::debug!(id = handle.id(), identity = %request.identity, "batch submitted");
        Ok(handle)
    }

    /// Async form of [`ScriptEngine::submit_script_batch`]. The worker
    /// still runs on the engine's own pool.
    pub async fn submit_script_batch_async(&self, request: BatchRequest) -> ExecutionOutcome {
        let handle = match self.submit(request) {
            Ok(handle) => handle,
            Err(outcome) => return outcome,
        };

        let (sender, receiver) = oneshot::channel();
        let reports = handle.receiver();
        tokio::task::spawn_blocking(move || {
            if let Ok(report) = reports.recv() {
                let _ = sender.send(report);
            }
        });

        let report = match handle.remaining() {
            Some(remaining) => match tokio::time::timeout(remaining, receiver).await {
                Ok(Ok(report)) => report,
                Ok(Err(_)) => handle.lost(),
                Err(_) => handle.expire(),
            },
            None => match receiver.await {
                Ok(report) => report,
                Err(_) => handle.lost(),
            },
        };
        report.outcome
    }

    /// Single-unit batch returning the script's value.
    pub fn evaluate(
        &self,
        source: &str,
        bindings: HashMap<String, Value>,
        identity: impl Into<CallerIdentity>,
        trust: TrustLevel,
        deadline: Option<Duration>,
    ) -> ExecutionOutcome {
        let request = BatchRequest {
            units: vec![ScriptUnit::new("eval", source).with_trust(trust)],
            bindings,
            trust,
            identity: identity.into(),
            deadline,
        };

        let report = match self.prepare(&request) {
            Ok(mut batch) => match batch.units.pop() {
                Some(unit) => self
                    .scheduler
                    .evaluate_single(unit, batch.session, batch.deadline),
                None => self.rejected(ExecutionOutcome::Success(Value::Null)),
            },
            Err(outcome) => self.rejected(outcome),
        };
        log_report(&request, &report);
        report.outcome
    }

    /// Sandboxed rule check: the script must produce a `Bool`.
    pub fn check_condition(
        &self,
        source: &str,
        bindings: HashMap<String, Value>,
        identity: impl Into<CallerIdentity>,
    ) -> ExecutionOutcome {
        match self.evaluate(source, bindings, identity, TrustLevel::Sandboxed, None) {
            ExecutionOutcome::Success(Value::Bool(result)) => {
                ExecutionOutcome::Success(Value::Bool(result))
            }
            ExecutionOutcome::Success(other) => ExecutionOutcome::failure(
                FailureCause::NotBoolean {
                    type_name: other.type_name().to_string(),
                },
                Some("eval"),
            ),
            outcome => outcome,
        }
    }

    /// Operator abort; true when the batch was still running.
    pub fn abort(&self, id: u64) -> bool {
        self.scheduler.abort(id)
    }

    pub fn running(&self) -> Vec<RunningExecution> {
        self.scheduler.registry().running()
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    fn prepare(&self, request: &BatchRequest) -> Result<PreparedBatch, ExecutionOutcome> {
        let trust = request.effective_trust();

        if trust == TrustLevel::Privileged
            && !self.authorizer.is_privileged_caller(&request.identity)
        {
            return Err(ExecutionOutcome::violation(
                ViolationRule::UnauthorizedPrivilegedSession {
                    identity: request.identity.to_string(),
                },
                None,
            ));
        }

        let (policy, deadline) = match trust {
            TrustLevel::Sandboxed => (
                Arc::clone(&self.sandboxed),
                Some(request.deadline.unwrap_or_else(|| self.config.default_deadline())),
            ),
            TrustLevel::Privileged => (Arc::clone(&self.privileged), None),
        };

        let mut session = ExecutionSession::new(trust, Arc::clone(&self.whitelist), policy);
        for (name, value) in &request.bindings {
            session.bind(name.clone(), value.clone());
        }

        let mut instrumenter =
            Instrumenter::new(&self.whitelist, &self.catalog, trust, session.binding_types());
        let mut units = Vec::with_capacity(request.units.len());
        for unit in &request.units {
            for (name, value) in &unit.bindings {
                instrumenter.bind_global(name, Some(value.type_name().to_string()));
            }
            let mut prepared = instrumenter
                .prepare(&unit.source, &unit.owner)
                .map_err(|rejection| rejection.into_outcome(Some(&unit.owner)))?;
            prepared.bindings = unit.bindings.clone();
            units.push(prepared);
        }

        Ok(PreparedBatch {
            units,
            session,
            deadline,
        })
    }

    /// Report for a batch that never reached a worker.
    fn rejected(&self, outcome: ExecutionOutcome) -> ExecutionReport {
        ExecutionReport {
            id: self.scheduler.registry().next_id(),
            outcome,
            usage: UsageSnapshot::default(),
            elapsed: Duration::ZERO,
            finished_at: Utc::now(),
        }
    }
}

impl fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("whitelist_entries", &self.whitelist.len())
            .field("pool", self.scheduler.pool().config())
            .finish()
    }
}

fn log_report(request: &BatchRequest, report: &ExecutionReport) {
    let identity = request.identity.as_str();
    match &report.outcome {
        ExecutionOutcome::Success(_) => tracing::info!(
            id = report.id,
            identity,
            units = request.units.len(),
            ops = report.usage.total_ops,
            "batch succeeded"
        ),
        ExecutionOutcome::SecurityViolation(violation) => tracing::warn!(
            id = report.id,
            identity,
            rule = %violation.rule,
            "batch stopped by security policy"
        ),
        ExecutionOutcome::Timeout(notice) => tracing::warn!(
            id = report.id,
            identity,
            aborted = notice.aborted,
            "batch timed out"
        ),
        ExecutionOutcome::RuntimeFailure(failure) => tracing::info!(
            id = report.id,
            identity,
            cause = %failure.cause,
            "batch failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whitelist::WhitelistEntry;

    fn engine() -> ScriptEngine {
        let mut config = EngineConfig::default();
        config.pool.core_workers = 1;
        config.pool.max_workers = 4;
        config.security.admins = vec!["root".to_string()];
        config.whitelist = vec![
            WhitelistEntry::method("String", "upper"),
            WhitelistEntry::method("Global", "len"),
        ];
        ScriptEngine::from_config(config).expect("engine")
    }

    #[test]
    fn effective_trust_is_the_minimum() {
        let request = BatchRequest::new("root", TrustLevel::Privileged)
            .unit(ScriptUnit::privileged("a", "1"))
            .unit(ScriptUnit::new("b", "2"));
        assert_eq!(request.effective_trust(), TrustLevel::Sandboxed);
    }

    #[test]
    fn unauthorized_privileged_request_never_parses() {
        let outcome = engine().submit_script_batch(
            BatchRequest::new("guest", TrustLevel::Privileged)
                .unit(ScriptUnit::privileged("a", "this is not a script (")),
        );
        assert_eq!(
            outcome,
            ExecutionOutcome::violation(
                ViolationRule::UnauthorizedPrivilegedSession {
                    identity: "guest".to_string()
                },
                None
            )
        );
    }

    #[test]
    fn unit_bindings_are_rebound_between_units() {
        let outcome = engine().submit_script_batch(
            BatchRequest::sandboxed("user")
                .unit(ScriptUnit::new("a", "let first = current").with_binding("current", "a"))
                .unit(ScriptUnit::new("b", "first + current").with_binding("current", "b")),
        );
        assert_eq!(outcome, ExecutionOutcome::Success(Value::from("ab")));
    }

    #[test]
    fn check_condition_requires_bool() {
        let engine = engine();
        let mut bindings = HashMap::new();
        bindings.insert("name".to_string(), Value::from("ada"));

        assert_eq!(
            engine.check_condition("len(name) == 3", bindings.clone(), "user"),
            ExecutionOutcome::Success(Value::Bool(true))
        );
        assert_eq!(
            engine.check_condition("name.upper()", bindings, "user"),
            ExecutionOutcome::failure(
                FailureCause::NotBoolean {
                    type_name: "String".to_string()
                },
                Some("eval")
            )
        );
    }

    #[test]
    fn bad_whitelist_refuses_to_start() {
        let mut config = EngineConfig::default();
        config.whitelist = vec![WhitelistEntry::method("Socket", "open")];
        assert!(matches!(
            ScriptEngine::from_config(config),
            Err(ConfigurationError::UnknownType { .. })
        ));
    }
}

//=====================================================
// End of file
//=====================================================
