// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Fixed pool of completion workers.
//!
//! Each worker owns an ordered set of work sources (normally channels). It
//! sleeps until it is woken or one of its sources reports pending work,
//! processes every source with pending work, yields, and repeats. Sources are
//! assigned to the least loaded worker and stay there until they are removed.

use crate::error::DmaResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Something a worker can poll for completions.
pub trait PollableWorkSource: Send + Sync {
    /// Returns true if [`process_pending`](Self::process_pending) has work to do.
    fn has_pending(&self) -> bool;

    /// Drive completion for whatever is ready.
    fn process_pending(&self);

    /// Record (or clear) the worker this source is assigned to.
    fn attach(&self, worker: Option<WorkerHandle>) {
        let _ = worker;
    }
}

struct WorkerState {
    sources: Vec<Arc<dyn PollableWorkSource>>,
    schedule: bool,
    stop: bool,
}

struct WorkerShared {
    id: usize,
    cpu: Option<usize>,
    interval: Option<Duration>,
    running: AtomicBool,
    state: Mutex<WorkerState>,
    cond: Condvar,
}

impl WorkerShared {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.lock().schedule = true;
        self.cond.notify_one();
    }
}

/// Weak reference a source keeps to its worker.
#[derive(Clone)]
pub struct WorkerHandle {
    id: usize,
    shared: Weak<WorkerShared>,
}

impl WorkerHandle {
    /// Worker index within the pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns true while the worker thread is running.
    pub fn is_active(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|s| s.running.load(Ordering::Acquire))
    }

    /// Signal the worker to run a polling pass.
    pub fn wake(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.wake();
        }
    }

    /// Remove the source whose data pointer is `source` from the worker.
    pub(crate) fn detach(&self, source: *const ()) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut st = shared.lock();
        let before = st.sources.len();
        st.sources
            .retain(|s| Arc::as_ptr(s) as *const () != source);
        let removed = st.sources.len() != before;
        if removed {
            log::info!("worker {}: source removed, load {}", self.id, st.sources.len());
        }
        removed
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").field("id", &self.id).finish()
    }
}

/// One completion worker.
pub struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, cpu: Option<usize>, interval: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                id,
                cpu,
                interval,
                running: AtomicBool::new(false),
                state: Mutex::new(WorkerState {
                    sources: Vec::new(),
                    schedule: false,
                    stop: false,
                }),
                cond: Condvar::new(),
            }),
            thread: None,
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Number of assigned sources.
    pub fn load(&self) -> usize {
        self.shared.lock().sources.len()
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            id: self.shared.id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn start(&mut self) -> DmaResult<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.shared.lock().stop = false;
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("mdlx-worker-{}", self.shared.id))
            .spawn(move || worker_loop(shared))?;
        self.thread = Some(thread);
        self.shared.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::Release);
        self.shared.lock().stop = true;
        self.shared.cond.notify_all();
        if thread.join().is_err() {
            log::error!("worker {} panicked", self.shared.id);
        }
    }
}

fn worker_loop(shared: Arc<WorkerShared>) {
    if let Some(cpu) = shared.cpu {
        if let Err(e) = pin_to_cpu(cpu) {
            log::warn!("worker {}: unable to pin to cpu {}: {}", shared.id, cpu, e);
        }
    }
    log::info!("worker {} started", shared.id);

    loop {
        let sources = {
            let mut st = shared.lock();
            loop {
                if st.stop {
                    log::info!("worker {} stopped", shared.id);
                    return;
                }
                if st.schedule || st.sources.iter().any(|s| s.has_pending()) {
                    break;
                }
                match shared.interval {
                    Some(interval) => {
                        let (guard, timeout) = shared
                            .cond
                            .wait_timeout(st, interval)
                            .unwrap_or_else(PoisonError::into_inner);
                        st = guard;
                        if timeout.timed_out() {
                            break;
                        }
                    }
                    None => {
                        st = shared.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
            st.schedule = false;
            st.sources.clone()
        };

        for source in &sources {
            if source.has_pending() {
                source.process_pending();
            }
        }
        thread::yield_now();
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> std::io::Result<()> {
    // SAFETY: cpu_set_t is plain data; sched_setaffinity reads it by pointer.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "cpu affinity requires Linux",
    ))
}

/// Fixed-size pool of completion workers.
pub struct WorkerPool {
    workers: Vec<Worker>,
    assign_lock: Mutex<()>,
    running: bool,
}

impl WorkerPool {
    /// Create `count` idle workers. With `pin` set, worker `i` is bound to
    /// processor `i` modulo the processor count.
    pub fn new(count: usize, interval: Option<Duration>, pin: bool) -> Self {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        let workers = (0..count)
            .map(|id| Worker::new(id, pin.then_some(id % cpus), interval))
            .collect();
        Self {
            workers,
            assign_lock: Mutex::new(()),
            running: false,
        }
    }

    /// Spawn the worker threads.
    pub fn start(&mut self) -> DmaResult<()> {
        for worker in &mut self.workers {
            if let Err(e) = worker.start() {
                log::error!("unable to start worker {}: {}", worker.id(), e);
                self.stop();
                return Err(e);
            }
        }
        self.running = true;
        log::info!("{} completion workers running", self.workers.len());
        Ok(())
    }

    /// Stop and join every worker, then drop all assignments.
    pub fn stop(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
        for worker in &self.workers {
            let sources = std::mem::take(&mut worker.shared.lock().sources);
            for source in sources {
                source.attach(None);
            }
        }
        self.running = false;
    }

    /// Returns true between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of workers in the pool.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true for a pool without workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Current load of every worker, by id.
    pub fn loads(&self) -> Vec<usize> {
        self.workers.iter().map(Worker::load).collect()
    }

    /// Assign `source` to the least loaded worker. Returns the worker id, or
    /// `None` for an empty pool.
    pub fn assign(&self, source: Arc<dyn PollableWorkSource>) -> Option<usize> {
        let _serial = self.assign_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut best: Option<(usize, usize)> = None;
        for (idx, worker) in self.workers.iter().enumerate() {
            let load = worker.load();
            if load == 0 {
                best = Some((idx, 0));
                break;
            }
            if best.map_or(true, |(_, min)| load < min) {
                best = Some((idx, load));
            }
        }
        let (idx, _) = best?;
        let worker = &self.workers[idx];
        let load = {
            let mut st = worker.shared.lock();
            st.sources.push(Arc::clone(&source));
            st.sources.len()
        };
        source.attach(Some(worker.handle()));
        log::info!("worker {}: source assigned, load {}", worker.id(), load);
        Some(worker.id())
    }

    /// Remove `source` from whichever worker holds it.
    pub fn remove(&self, source: &Arc<dyn PollableWorkSource>) -> bool {
        let ptr = Arc::as_ptr(source) as *const ();
        let removed = self.workers.iter().any(|w| w.handle().detach(ptr));
        if removed {
            source.attach(None);
        }
        removed
    }

    /// Signal worker `id`.
    pub fn wake(&self, id: usize) {
        if let Some(worker) = self.workers.get(id) {
            worker.shared.wake();
        }
    }

    pub fn handle(&self, id: usize) -> Option<WorkerHandle> {
        self.workers.get(id).map(Worker::handle)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
