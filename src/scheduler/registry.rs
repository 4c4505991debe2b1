//=====================================================
// File: scheduler/registry.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Track running batches
// Objective: Let an operator abort a batch by id while it is in flight
//=====================================================

use crate::session::{SessionProbe, TrustLevel, UsageSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
pub struct ExecutionRegistry {
    state: Arc<Mutex<HashMap<u64, TaskState>>>,
    next_id: Arc<AtomicU64>,
}

struct TaskState {
    probe: SessionProbe,
    trust: TrustLevel,
    cancelled: bool,
    expired: bool,
    started: Instant,
    deadline: Option<Instant>,
}

/// What an operator sees about one running batch.
#[derive(Debug, Clone)]
pub struct RunningExecution {
    pub id: u64,
    pub trust: TrustLevel,
    pub elapsed: Duration,
    pub deadline: Option<Instant>,
    pub usage: UsageSnapshot,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn register(
        &self,
        task_id: u64,
        probe: SessionProbe,
        trust: TrustLevel,
        deadline: Option<Duration>,
    ) {
        let now = Instant::now();
        self.state.lock().insert(
            task_id,
            TaskState {
                probe,
                trust,
                cancelled: false,
                expired: false,
                started: now,
                deadline: deadline.map(|limit| now + limit),
            },
        );
    }

    /// Request an abort. Returns false for unknown or finished ids.
    pub fn cancel(&self, task_id: u64) -> bool {
        let mut state = self.state.lock();
        match state.get_mut(&task_id) {
            Some(entry) => {
                entry.cancelled = true;
                entry.probe.state().request_abort();
                true
            }
            None => false,
        }
    }

    /// Record that the waiter gave up on the batch and interrupt it.
    /// Returns false for unknown or finished ids.
    pub fn expire(&self, task_id: u64) -> bool {
        let mut state = self.state.lock();
        match state.get_mut(&task_id) {
            Some(entry) => {
                entry.expired = true;
                entry.probe.state().request_interrupt();
                true
            }
            None => false,
        }
    }

    pub fn is_expired(&self, task_id: u64) -> bool {
        self.state
            .lock()
            .get(&task_id)
            .map(|entry| entry.expired)
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self, task_id: u64) -> bool {
        self.state
            .lock()
            .get(&task_id)
            .map(|entry| entry.cancelled)
            .unwrap_or(false)
    }

    pub fn deadline(&self, task_id: u64) -> Option<Instant> {
        self.state
            .lock()
            .get(&task_id)
            .and_then(|entry| entry.deadline)
    }

    pub fn contains(&self, task_id: u64) -> bool {
        self.state.lock().contains_key(&task_id)
    }

    pub fn running(&self) -> Vec<RunningExecution> {
        let mut running: Vec<_> = self
            .state
            .lock()
            .iter()
            .map(|(id, entry)| RunningExecution {
                id: *id,
                trust: entry.trust,
                elapsed: entry.started.elapsed(),
                deadline: entry.deadline,
                usage: entry.probe.usage(),
            })
            .collect();
        running.sort_by_key(|execution| execution.id);
        running
    }

    pub fn complete(&self, task_id: u64) {
        self.state.lock().remove(&task_id);
    }
}


//=====================================================
// End of file
//=====================================================
