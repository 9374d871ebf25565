use crate::error::{Error, Result};
use log::{debug, warn};
use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

pub type IoJob = Box<dyn FnOnce() + Send + 'static>;

struct QueuedJob {
    priority: usize,
    seq: u64,
    job: IoJob,
}
impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedJob {}
impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedJob {
    // highest priority first, then first come first served
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolState {
    queue: BinaryHeap<QueuedJob>,
    next_seq: u64,
    running: usize,
    shutdown: bool,
}

struct PoolShared {
    capacity: usize,
    state: Mutex<PoolState>,
    not_empty: Condvar,
    not_full: Condvar,
    idle: Condvar,
}

/// A fixed set of I/O threads serving one bounded, prioritised job queue.
///
/// `submit` blocks while the queue holds `capacity` jobs. After `shutdown` the queued jobs are
/// still run, but new submissions fail with [`Error::ShutDown`].
pub struct IoPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoPool {
    /// Starts `num_threads` workers. If a thread cannot be started, the ones already running are
    /// shut down again.
    pub fn new(num_threads: usize, capacity: usize) -> Result<Self> {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(PoolShared {
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                queue: BinaryHeap::new(),
                next_seq: 0,
                running: 0,
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            idle: Condvar::new(),
        });
        let pool = IoPool {
            shared,
            workers: Mutex::new(Vec::with_capacity(num_threads)),
        };
        for i in 0..num_threads {
            let shared = pool.shared.clone();
            let worker = thread::Builder::new()
                .name(format!("tile-io-{}", i))
                .spawn(move || worker_loop(&shared))
                .map_err(|e| Error::WorkerSpawn(format!("tile-io-{}: {}", i, e)))?;
            pool.workers.lock().unwrap().push(worker);
        }
        debug!("started {} tile i/o threads, queue depth {}", num_threads, pool.shared.capacity);
        Ok(pool)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Queues `job`, blocking while the queue is full.
    pub fn submit(&self, priority: usize, job: IoJob) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        while state.queue.len() >= self.shared.capacity && !state.shutdown {
            state = self.shared.not_full.wait(state).unwrap();
        }
        self.push(&mut state, priority, job)
    }

    /// Queues `job` only if there is room right now.
    pub fn try_submit(&self, priority: usize, job: IoJob) -> Result<bool> {
        let mut state = self.shared.state.lock().unwrap();
        if state.queue.len() >= self.shared.capacity && !state.shutdown {
            return Ok(false);
        }
        self.push(&mut state, priority, job).map(|_| true)
    }

    fn push(&self, state: &mut PoolState, priority: usize, job: IoJob) -> Result<()> {
        if state.shutdown {
            return Err(Error::ShutDown);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(QueuedJob { priority, seq, job });
        self.shared.not_empty.notify_one();
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    /// Blocks until the queue is empty and no job is running.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while !state.queue.is_empty() || state.running > 0 {
            state = self.shared.idle.wait(state).unwrap();
        }
    }

    /// Refuses new jobs, runs what is queued, and joins the workers.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.shutdown {
                debug!("shutting down tile i/o pool with {} queued jobs", state.queue.len());
            }
            state.shutdown = true;
            self.shared.not_empty.notify_all();
            self.shared.not_full.notify_all();
        }
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            // the last handle may be dropped by a job running on one of the workers
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("tile i/o thread terminated abnormally");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().unwrap().shutdown
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if let Some(QueuedJob { job, priority, seq }) = state.queue.pop() {
            state.running += 1;
            shared.not_full.notify_one();
            drop(state);

            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!("tile i/o job {} (priority {}) panicked", seq, priority);
            }

            state = shared.state.lock().unwrap();
            state.running -= 1;
            if state.queue.is_empty() && state.running == 0 {
                shared.idle.notify_all();
            }
        } else if state.shutdown {
            break;
        } else {
            state = shared.not_empty.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        mpsc, Arc,
    };
    use std::time::Duration;

    #[test]
    fn runs_higher_priority_first() {
        let pool = IoPool::new(1, 10).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.submit(0, Box::new(move || gate_rx.recv().unwrap())).unwrap();

        let order = Arc::new(Mutex::new(vec![]));
        for (priority, name) in [(0, "fine"), (2, "coarse"), (1, "middle"), (2, "coarse2")] {
            let order = order.clone();
            pool.submit(priority, Box::new(move || order.lock().unwrap().push(name)))
                .unwrap();
        }
        gate_tx.send(()).unwrap();
        pool.wait_idle();
        assert_eq!(*order.lock().unwrap(), vec!["coarse", "coarse2", "middle", "fine"]);
    }

    #[test]
    fn full_queue_blocks_submitter() {
        let capacity = 3;
        let pool = Arc::new(IoPool::new(1, capacity).unwrap());
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        pool.submit(
            0,
            Box::new(move || {
                started_tx.send(()).unwrap();
                gate_rx.recv().unwrap();
            }),
        )
        .unwrap();
        started_rx.recv().unwrap();

        for _ in 0..capacity {
            pool.submit(0, Box::new(|| {})).unwrap();
        }
        assert!(!pool.try_submit(0, Box::new(|| {})).unwrap());

        let submitted = Arc::new(AtomicUsize::new(0));
        let blocked = {
            let (pool, submitted) = (pool.clone(), submitted.clone());
            thread::spawn(move || {
                pool.submit(0, Box::new(|| {})).unwrap();
                submitted.store(1, AtomicOrdering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(submitted.load(AtomicOrdering::SeqCst), 0);

        gate_tx.send(()).unwrap();
        blocked.join().unwrap();
        assert_eq!(submitted.load(AtomicOrdering::SeqCst), 1);
        pool.wait_idle();
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = IoPool::new(1, 4).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        pool.submit(0, Box::new(|| panic!("boom"))).unwrap();
        let r = ran.clone();
        pool.submit(0, Box::new(move || {
            r.fetch_add(1, AtomicOrdering::SeqCst);
        }))
        .unwrap();
        pool.wait_idle();
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn shutdown_drains_then_refuses() {
        let pool = IoPool::new(2, 8).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let r = ran.clone();
            pool.submit(0, Box::new(move || {
                r.fetch_add(1, AtomicOrdering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 5);
        assert_eq!(pool.submit(0, Box::new(|| {})), Err(Error::ShutDown));
        assert_eq!(pool.try_submit(0, Box::new(|| {})), Err(Error::ShutDown));
    }
}
