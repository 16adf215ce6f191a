//! Shared worker pool that runs node work units.
//!
//! Jobs travel over a crossbeam channel to an elastic set of worker threads.
//! The pool grows while submitted jobs outnumber idle workers, up to a hard
//! maximum, and shrinks back to its minimum after workers sit idle.
//!
//! Besides fire-and-forget submission the pool offers the two barriers the
//! graph needs: [`Scheduler::wait_idle`] joins all queued and running work,
//! and [`Scheduler::quiesce`] closes a gate so no new unit starts and waits
//! (bounded) for running units to finish before a snapshot is taken.

use crate::error::{EngineError, Result};
use crate::pipeline::lock;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Called with the panic message when a job panics.
pub type PanicHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Workers above the minimum exit after this long without work.
const IDLE_WORKER_TIMEOUT: Duration = Duration::from_secs(5);

enum Message {
    Run(Job),
    Shutdown,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Submitted but not yet started.
    queued: usize,
    /// Still in the channel, not picked up by any worker.
    unclaimed: usize,
    running: usize,
    workers: usize,
    idle: usize,
    /// Closed by `pause`.
    paused: bool,
    /// Closed by outstanding quiesce guards.
    holds: usize,
    shutdown: bool,
    completed: u64,
}

impl PoolState {
    fn gate_closed(&self) -> bool {
        !self.shutdown && (self.paused || self.holds > 0)
    }

    fn wants_worker(&self, max_workers: usize) -> bool {
        !self.shutdown && self.unclaimed > self.idle && self.workers < max_workers
    }
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signalled when the gate opens or the pool shuts down.
    gate: Condvar,
    /// Signalled whenever a unit starts or finishes.
    settled: Condvar,
    rx: Receiver<Message>,
    min_workers: usize,
    max_workers: usize,
    panic_handler: Mutex<Option<PanicHandler>>,
}

/// Elastic worker pool with join and quiesce barriers.
pub struct Scheduler {
    tx: Sender<Message>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a pool that keeps `min_workers` threads and grows up to `max_workers`.
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        let min_workers = min_workers.clamp(1, max_workers);
        let (tx, rx) = crossbeam_channel::unbounded();
        let scheduler = Self {
            tx,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                gate: Condvar::new(),
                settled: Condvar::new(),
                rx,
                min_workers,
                max_workers,
                panic_handler: Mutex::new(None),
            }),
            handles: Mutex::new(Vec::new()),
        };
        for _ in 0..min_workers {
            lock(&scheduler.shared.state).workers += 1;
            scheduler.spawn_worker();
        }
        tracing::debug!(
            "Scheduler started with {} workers (max {})",
            min_workers,
            max_workers
        );
        scheduler
    }

    /// Install the callback invoked when a job panics.
    pub fn set_panic_handler(&self, handler: PanicHandler) {
        *lock(&self.shared.panic_handler) = Some(handler);
    }

    /// Queue `job` for execution on the pool.
    pub fn submit(&self, job: Job) -> Result<()> {
        let spawn = {
            let mut state = lock(&self.shared.state);
            if state.shutdown {
                return Err(EngineError::SchedulerShutdown);
            }
            state.queued += 1;
            state.unclaimed += 1;
            let spawn = state.wants_worker(self.shared.max_workers);
            if spawn {
                state.workers += 1;
            }
            spawn
        };

        if self.tx.send(Message::Run(job)).is_err() {
            let mut state = lock(&self.shared.state);
            state.queued -= 1;
            state.unclaimed -= 1;
            if spawn {
                state.workers -= 1;
            }
            return Err(EngineError::SchedulerShutdown);
        }
        if spawn {
            self.spawn_worker();
        }
        Ok(())
    }

    /// Close the gate: queued units wait, none start, until [`Scheduler::resume`].
    pub fn pause(&self) {
        lock(&self.shared.state).paused = true;
        tracing::debug!("Scheduler paused");
    }

    pub fn resume(&self) {
        lock(&self.shared.state).paused = false;
        self.shared.gate.notify_all();
        tracing::debug!("Scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.state).paused
    }

    /// Close the gate and wait until no unit is running.
    ///
    /// The gate stays closed until the returned guard is dropped. Units that
    /// are still running when `timeout` expires make the call fail with
    /// [`EngineError::QuiesceTimeout`]; the gate is reopened in that case.
    pub fn quiesce(&self, timeout: Duration) -> Result<QuiesceGuard> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        state.holds += 1;
        while state.running > 0 {
            let now = Instant::now();
            if now >= deadline {
                let outstanding = state.running;
                state.holds -= 1;
                drop(state);
                self.shared.gate.notify_all();
                tracing::warn!(
                    "Scheduler did not quiesce within {:?}, {} units still running",
                    timeout,
                    outstanding
                );
                return Err(EngineError::QuiesceTimeout { outstanding });
            }
            state = self
                .shared
                .settled
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        Ok(QuiesceGuard {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Wait until nothing is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        while state.queued > 0 || state.running > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .settled
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }

    /// Queued plus running units.
    pub fn outstanding(&self) -> usize {
        let state = lock(&self.shared.state);
        state.queued + state.running
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.shared.state).workers
    }

    /// Units that ran to completion or panicked.
    pub fn completed(&self) -> u64 {
        lock(&self.shared.state).completed
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("flowgraph-worker".to_string())
            .spawn(move || worker_loop(shared));
        match spawned {
            Ok(handle) => {
                let mut handles = lock(&self.handles);
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(e) => {
                lock(&self.shared.state).workers -= 1;
                tracing::error!("Failed to spawn scheduler worker: {}", e);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self::new(parallelism, 64)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let workers = {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            state.workers
        };
        self.shared.gate.notify_all();
        for _ in 0..workers {
            let _ = self.tx.send(Message::Shutdown);
        }

        let current = std::thread::current().id();
        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            // The last reference can be released by a job running on one of our own workers.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Scheduler worker panicked during shutdown");
            }
        }
        tracing::debug!("Scheduler shut down");
    }
}

/// Keeps the scheduler gate closed while alive.
pub struct QuiesceGuard {
    shared: Arc<Shared>,
}

impl Drop for QuiesceGuard {
    fn drop(&mut self) {
        lock(&self.shared.state).holds -= 1;
        self.shared.gate.notify_all();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        lock(&shared.state).idle += 1;
        let received = shared.rx.recv_timeout(IDLE_WORKER_TIMEOUT);
        let mut state = lock(&shared.state);
        state.idle -= 1;

        let job = match received {
            Ok(Message::Run(job)) => job,
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                // A job submitted after the timeout may already count on this worker.
                if state.unclaimed == 0 && (state.workers > shared.min_workers || state.shutdown) {
                    break;
                }
                continue;
            }
        };
        state.unclaimed -= 1;

        while state.gate_closed() {
            state = shared.gate.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.queued -= 1;
        state.running += 1;
        drop(state);
        shared.settled.notify_all();

        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            let message = panic_message(payload.as_ref());
            tracing::error!("Work unit panicked: {}", message);
            let handler = lock(&shared.panic_handler).clone();
            if let Some(handler) = handler {
                handler(message);
            }
        }

        let mut state = lock(&shared.state);
        state.running -= 1;
        state.completed += 1;
        drop(state);
        shared.settled.notify_all();
    }

    lock(&shared.state).workers -= 1;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
