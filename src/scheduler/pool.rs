//=====================================================
// File: scheduler/pool.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Bounded worker pool for script batches
// Objective: Hand jobs to idle workers without queueing, grow up to a hard
//            maximum, and retire surplus workers after a keep-alive period
//=====================================================

use crossbeam_channel::{Receiver, Sender, TrySendError, select};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub const DEFAULT_THREAD_PREFIX: &str = "script-execution-pool";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Workers that never retire once spawned.
    pub core_workers: usize,
    pub max_workers: usize,
    pub keep_alive: Duration,
    pub stack_size: usize,
    pub thread_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_workers: 3,
            max_workers: 64,
            keep_alive: Duration::from_secs(60),
            stack_size: 16 * 1024 * 1024,
            thread_prefix: DEFAULT_THREAD_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("all {max} script workers are busy")]
    Saturated { max: usize },
    #[error("worker pool has been shut down")]
    ShutDown,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

struct WorkerSlot {
    name: String,
    busy: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

struct Shared {
    config: PoolConfig,
    live: AtomicUsize,
    next_id: AtomicUsize,
}

/// Synchronous hand-off pool: a job either goes straight to an idle worker
/// or to a freshly spawned one, never into a queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    jobs: Sender<Job>,
    job_source: Receiver<Job>,
    stop: Mutex<Option<Sender<()>>>,
    stop_signal: Receiver<()>,
    workers: Mutex<Vec<WorkerSlot>>,
    shutdown: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let (jobs, job_source) = crossbeam_channel::bounded(0);
        let (stop, stop_signal) = crossbeam_channel::bounded(0);
        Self {
            shared: Arc::new(Shared {
                config,
                live: AtomicUsize::new(0),
                next_id: AtomicUsize::new(1),
            }),
            jobs,
            job_source,
            stop: Mutex::new(Some(stop)),
            stop_signal,
            workers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Threads currently alive, busy or idle.
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn busy_workers(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|slot| !slot.handle.is_finished() && slot.busy.load(Ordering::SeqCst))
            .count()
    }

    pub fn execute(&self, job: Job) -> Result<(), PoolError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }

        match self.jobs.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => self.spawn_worker(job),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::ShutDown),
        }
    }

    fn spawn_worker(&self, job: Job) -> Result<(), PoolError> {
        let max = self.shared.config.max_workers;
        let reserved = self
            .shared
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < max).then_some(live + 1)
            });
        if reserved.is_err() {
            tracing::warn!(max, "script worker pool saturated");
            return Err(PoolError::Saturated { max });
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{}", self.shared.config.thread_prefix, id);
        let busy = Arc::new(AtomicBool::new(true));
        let worker = Worker {
            name: name.clone(),
            shared: Arc::clone(&self.shared),
            jobs: self.job_source.clone(),
            stop: self.stop_signal.clone(),
            busy: Arc::clone(&busy),
        };

        let spawned = thread::Builder::new()
            .name(name.clone())
            .stack_size(self.shared.config.stack_size)
            .spawn(move || worker.run(job));

        match spawned {
            Ok(handle) => {
                tracing::debug!(worker = %name, "spawned script worker");
                let mut workers = self.workers.lock();
                workers.retain(|slot| !slot.handle.is_finished());
                workers.push(WorkerSlot { name, busy, handle });
                Ok(())
            }
            Err(err) => {
                self.shared.live.fetch_sub(1, Ordering::SeqCst);
                Err(PoolError::Spawn(err.to_string()))
            }
        }
    }

    /// Stop accepting jobs and join every idle worker.
    ///
    /// Busy workers are detached; they exit once their current job returns.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for slot in workers {
            if slot.busy.load(Ordering::SeqCst) && !slot.handle.is_finished() {
                tracing::debug!(worker = %slot.name, "detaching busy script worker");
                continue;
            }
            if slot.handle.join().is_err() {
                tracing::error!(worker = %slot.name, "script worker exited with a panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    name: String,
    shared: Arc<Shared>,
    jobs: Receiver<Job>,
    stop: Receiver<()>,
    busy: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, first: Job) {
        self.execute(first);

        loop {
            self.busy.store(false, Ordering::SeqCst);
            select! {
                recv(self.jobs) -> job => match job {
                    Ok(job) => {
                        self.busy.store(true, Ordering::SeqCst);
                        self.execute(job);
                    }
                    Err(_) => break,
                },
                recv(self.stop) -> _ => break,
                default(self.shared.config.keep_alive) => {
                    if self.try_retire() {
                        tracing::debug!(worker = %self.name, "retiring idle script worker");
                        return;
                    }
                }
            }
        }

        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn execute(&self, job: Job) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(
                worker = %self.name,
                panic = %panic_message(payload.as_ref()),
                "script job panicked"
            );
        }
    }

    /// Leave the pool if it holds more than the core worker count.
    fn try_retire(&self) -> bool {
        let core = self.shared.config.core_workers;
        self.shared
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live > core).then(|| live - 1)
            })
            .is_ok()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}


//=====================================================
// End of file
//=====================================================
