//! Fiber scheduler (spec 4.7, 5): `N` worker OS threads plus one dedicated
//! GC thread, handed off work through a single buffered channel. A worker
//! dequeues a fiber, runs it to completion via the supplied `FiberRunner`,
//! and loops; the GC thread wakes on an interval and drains the collector's
//! modification buffer. This mirrors the host's strand registry — atomic
//! lifecycle counters on the hot path, a condvar only for the cold
//! "wait for everything to finish" path — adapted from per-strand green
//! threads to a fixed worker pool pulling first-class fiber values.

use crate::gc::Collector;
use crate::value::Value;
use may::sync::mpmc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub static ACTIVE_FIBERS: AtomicUsize = AtomicUsize::new(0);
pub static TOTAL_SPAWNED: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_COMPLETED: AtomicU64 = AtomicU64::new(0);
pub static PEAK_FIBERS: AtomicUsize = AtomicUsize::new(0);

static IDLE_CONDVAR: Condvar = Condvar::new();
static IDLE_MUTEX: Mutex<()> = Mutex::new(());

/// A runnable unit of work: the fiber value plus the closure that drives it
/// to completion (set up by `vm::run_fiber`). Boxed so the scheduler stays
/// ignorant of `Vm`/`Engine` internals.
pub struct FiberJob {
    pub fiber: Value,
    pub run: Box<dyn FnOnce(Value) + Send + 'static>,
}

/// `N+1` threads: `N` workers draining the work channel, one GC thread
/// draining the collector. Dropping the `Scheduler` closes the work channel,
/// which unblocks every worker (spec 5, "Cancellation").
pub struct Scheduler {
    sender: mpmc::Sender<FiberJob>,
    workers: Vec<JoinHandle<()>>,
    gc_thread: Option<JoinHandle<()>>,
    gc_shutdown: Arc<AtomicUsize>,
}

impl Scheduler {
    /// `jobs` is the worker count (spec 6.2's `opts.jobs`, default 8).
    pub fn new(jobs: usize, collector: Arc<Mutex<Collector>>) -> Self {
        let jobs = jobs.max(1);
        let (sender, receiver) = mpmc::channel::<FiberJob>();

        let workers = (0..jobs)
            .map(|id| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("gab-worker-{id}"))
                    .spawn(move || worker_loop(receiver))
                    .expect("spawn gab worker thread")
            })
            .collect();

        let gc_shutdown = Arc::new(AtomicUsize::new(0));
        let gc_thread = {
            let shutdown = gc_shutdown.clone();
            Some(
                std::thread::Builder::new()
                    .name("gab-gc".to_string())
                    .spawn(move || gc_loop(collector, shutdown))
                    .expect("spawn gab GC thread"),
            )
        };

        Scheduler { sender, workers, gc_thread, gc_shutdown }
    }

    /// Enqueue a fiber for a worker to pick up. Never blocks the caller for
    /// long: the work channel is unbounded, matching "clients enqueue fiber
    /// values" in spec 4.7.
    pub fn spawn(&self, job: FiberJob) {
        let prev = ACTIVE_FIBERS.fetch_add(1, Ordering::AcqRel) + 1;
        TOTAL_SPAWNED.fetch_add(1, Ordering::Relaxed);
        let mut peak = PEAK_FIBERS.load(Ordering::Relaxed);
        while prev > peak {
            match PEAK_FIBERS.compare_exchange_weak(peak, prev, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(cur) => peak = cur,
            }
        }
        self.sender.send(job).expect("scheduler work channel closed");
    }

    /// Blocks until `ACTIVE_FIBERS` reaches zero (spec 6.2's `gab_run`
    /// waiting on the fiber it just spawned, or the CLI waiting for `repl`
    /// background work to settle).
    pub fn wait_idle(&self) {
        let mut guard = IDLE_MUTEX.lock().unwrap();
        while ACTIVE_FIBERS.load(Ordering::Acquire) != 0 {
            guard = IDLE_CONDVAR.wait_timeout(guard, Duration::from_millis(10)).unwrap().0;
        }
    }

    pub fn shutdown(&mut self) {
        self.gc_shutdown.store(1, Ordering::Release);
        if let Some(handle) = self.gc_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(receiver: mpmc::Receiver<FiberJob>) {
    while let Ok(job) = receiver.recv() {
        (job.run)(job.fiber);
        let prev = ACTIVE_FIBERS.fetch_sub(1, Ordering::AcqRel);
        TOTAL_COMPLETED.fetch_add(1, Ordering::Relaxed);
        if prev == 1 {
            let _guard = IDLE_MUTEX.lock().unwrap();
            IDLE_CONDVAR.notify_all();
        }
    }
}

/// Periodically runs cycle collection (spec 4.5: "A dedicated GC thread
/// drains the buffers"). Workers still free acyclic garbage inline via
/// `Collector::dref`; this thread only needs to sweep cycles.
fn gc_loop(collector: Arc<Mutex<Collector>>, shutdown: Arc<AtomicUsize>) {
    while shutdown.load(Ordering::Acquire) == 0 {
        std::thread::sleep(Duration::from_millis(5));
        let mut gc = collector.lock().unwrap();
        if gc.should_collect() {
            gc.collect_cycles();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gab_core::gab_nil;

    #[test]
    fn spawned_fibers_all_run_and_scheduler_goes_idle() {
        let collector = Arc::new(Mutex::new(Collector::new()));
        let mut sched = Scheduler::new(2, collector);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let ran = ran.clone();
            sched.spawn(FiberJob {
                fiber: gab_nil(),
                run: Box::new(move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                }),
            });
        }
        sched.wait_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        sched.shutdown();
    }
}
