// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The basic engine: a fixed set of worker threads dispatching tasks from a
//! single shared FIFO queue.

use crate::macros::{log_debug, log_error, log_warn};
use crate::task::{ClosureTask, Task};
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Stack size given to worker threads unless overridden in [`PoolConfig`]:
/// 1 MiB.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Hook invoked on a worker thread at startup or exit, with the worker index
/// as argument.
pub type ThreadHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Configuration for a [`ThreadPool`] or a
/// [`WorkStealingPool`](crate::WorkStealingPool).
#[derive(Clone)]
pub struct PoolConfig {
    /// Number of worker threads to spawn in the pool.
    ///
    /// Zero is legal: the pool then only stores tasks, and a draining
    /// [`wait()`](ThreadPool::wait) executes them on the calling thread.
    pub num_threads: usize,
    /// Stack size of each worker thread, in bytes.
    pub stack_size: usize,
    /// Hook run on each worker thread right after it is spawned, before it
    /// starts pulling tasks, e.g. to attach the thread to a host runtime. A
    /// panic in the hook aborts that worker's startup.
    pub start_handler: Option<ThreadHook>,
    /// Hook run on each worker thread after it stops pulling tasks, right
    /// before it exits.
    pub exit_handler: Option<ThreadHook>,
}

impl PoolConfig {
    /// Returns the default configuration for the given number of worker
    /// threads.
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads,
            stack_size: DEFAULT_STACK_SIZE,
            start_handler: None,
            exit_handler: None,
        }
    }
}

/// Context identifying the thread a task hook is running on, handed to every
/// task operation.
pub struct WorkerContext {
    /// Index of the worker running the task, or [`None`] on a caller thread
    /// draining the queue.
    index: Option<usize>,
}

impl WorkerContext {
    /// Context of the worker thread with the given index.
    pub(crate) fn for_worker(index: usize) -> Self {
        Self { index: Some(index) }
    }

    /// Context of a non-worker thread, used when a caller drains the queue.
    pub(crate) fn external() -> Self {
        Self { index: None }
    }

    /// Returns the index of the worker executing the task, in construction
    /// order, or [`None`] if the task runs on a non-worker thread.
    pub fn worker_index(&self) -> Option<usize> {
        self.index
    }
}

/// Queue and lifecycle state shared by both engines, under a single lock.
struct PoolState<T> {
    /// Pending tasks, enqueued at the tail and dequeued at the head.
    queue: VecDeque<T>,
    /// Whether workers may dequeue tasks. Tasks submitted while this is false
    /// are stored until [`PoolCore::start_workers()`].
    started: bool,
    /// Monotonic: once set, no new task is accepted and every worker
    /// eventually exits.
    shutting_down: bool,
    /// Number of workers currently blocked waiting for a task.
    waiting_count: usize,
    /// Time of the latest [`PoolCore::start_workers()`] call.
    start_time: Instant,
    /// Aggregate time workers spent blocked waiting for a task since
    /// `start_time`.
    total_wait_time: Duration,
}

/// Shared guts of both engines: the task queue, the lifecycle flags and the
/// wait-time counters under one lock, with the two condition variables
/// attached to it.
pub(crate) struct PoolCore<T> {
    state: Mutex<PoolState<T>>,
    /// Signaled once per enqueued task, broadcast on lifecycle changes.
    task_available: Condvar,
    /// Broadcast by the last worker to go idle on an empty queue.
    quiescence: Condvar,
    /// Mirror of the queue length, maintained under the lock and sampled
    /// lock-free by the stealing loop (see
    /// [`task_count_hint()`](Self::task_count_hint)).
    queue_len: CachePadded<AtomicUsize>,
    /// Number of worker threads attached to this core, fixed at construction.
    num_threads: usize,
}

impl<T> PoolCore<T> {
    pub(crate) fn new(num_threads: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                started: false,
                shutting_down: false,
                waiting_count: 0,
                start_time: Instant::now(),
                total_wait_time: Duration::ZERO,
            }),
            task_available: Condvar::new(),
            quiescence: Condvar::new(),
            queue_len: CachePadded::new(AtomicUsize::new(0)),
            num_threads,
        }
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Appends a task to the queue. Must not be called once the pool is
    /// shutting down.
    pub(crate) fn add_task(&self, task: T) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(task);
        self.queue_len.store(state.queue.len(), Ordering::Relaxed);
        // One task satisfies one waiter; extra signals would be wasted.
        if state.waiting_count != 0 {
            self.task_available.notify_one();
        }
    }

    /// Allows workers to dequeue tasks, and resets the wait-time accounting.
    /// Idempotent.
    pub(crate) fn start_workers(&self) {
        let mut state = self.state.lock().unwrap();
        state.started = true;
        self.task_available.notify_all();
        state.start_time = Instant::now();
        state.total_wait_time = Duration::ZERO;
        log_debug!("[pool] Started workers ({} tasks queued)", state.queue.len());
    }

    /// Pauses dispatch: workers already executing a task complete it, workers
    /// waiting for one keep waiting. Queued tasks are kept.
    pub(crate) fn stop_workers(&self) {
        self.state.lock().unwrap().started = false;
        log_debug!("[pool] Stopped workers");
    }

    /// Blocks until a task can be dequeued and returns it, or returns [`None`]
    /// once the pool is shutting down.
    pub(crate) fn get_task(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        while !state.shutting_down {
            if let Some(task) = self.pop_task(&mut state) {
                return Some(task);
            }

            state.waiting_count += 1;
            if state.waiting_count == self.num_threads && state.queue.is_empty() {
                // Every worker is idle and nothing is pending: the pool is
                // quiescent.
                self.quiescence.notify_all();
            }
            let wait_start = Instant::now();
            state = self.task_available.wait(state).unwrap();
            let wait_end = Instant::now();
            // Clip intervals that began before the latest start_workers(), so
            // the counter only aggregates idle time since then.
            let clipped_start = wait_start.max(state.start_time);
            state.total_wait_time += wait_end.saturating_duration_since(clipped_start);
            state.waiting_count -= 1;
        }
        None
    }

    /// Non-blocking variant of [`get_task()`](Self::get_task): returns a task
    /// if the pool is started and one is queued, [`None`] otherwise.
    pub(crate) fn try_get_task(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        self.pop_task(&mut state)
    }

    fn pop_task(&self, state: &mut PoolState<T>) -> Option<T> {
        if state.started && !state.queue.is_empty() {
            let task = state.queue.pop_front();
            self.queue_len.store(state.queue.len(), Ordering::Relaxed);
            task
        } else {
            None
        }
    }

    /// Blocks until the pool is shutting down, or every worker is blocked
    /// waiting for a task and the queue is empty.
    pub(crate) fn wait_until_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.shutting_down
            && (state.waiting_count != self.num_threads || !state.queue.is_empty())
        {
            state = self.quiescence.wait(state).unwrap();
        }
    }

    /// Snapshot of the queue length.
    pub(crate) fn task_count(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Lock-free snapshot of the queue length. May lag behind
    /// [`task_count()`](Self::task_count) by an update; the stealing loop uses
    /// it as an advisory signal only, so a stale value at worst delays the
    /// loop by one iteration.
    pub(crate) fn task_count_hint(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    /// Aggregate time workers spent blocked waiting for a task since the
    /// latest [`start_workers()`](Self::start_workers) call.
    pub(crate) fn total_wait_time(&self) -> Duration {
        self.state.lock().unwrap().total_wait_time
    }

    /// Initiates shutdown: no task may be enqueued afterwards, and both
    /// condition variables are broadcast so every blocked thread re-checks.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutting_down = true;
        self.task_available.notify_all();
        self.quiescence.notify_all();
    }

    /// Removes and returns the tasks still queued. Used by the destructors,
    /// after the workers are joined, to apply the discard-and-finalize
    /// policy.
    pub(crate) fn drain_remaining(&self) -> Vec<T> {
        let mut state = self.state.lock().unwrap();
        let remaining = state.queue.drain(..).collect();
        self.queue_len.store(0, Ordering::Relaxed);
        remaining
    }
}

/// Handle to a worker thread in a pool.
pub(crate) struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

/// Spawns one worker thread running the given task-pulling loop, wrapped in
/// the configured lifecycle hooks.
pub(crate) fn spawn_worker(
    name: String,
    index: usize,
    config: &PoolConfig,
    body: impl FnOnce(&WorkerContext) + Send + 'static,
) -> WorkerThreadHandle {
    let start_handler = config.start_handler.clone();
    let exit_handler = config.exit_handler.clone();
    let handle = std::thread::Builder::new()
        .name(name.clone())
        .stack_size(config.stack_size)
        .spawn(move || {
            if let Some(handler) = &start_handler {
                handler(index);
            }
            let ctx = WorkerContext::for_worker(index);
            body(&ctx);
            if let Some(handler) = &exit_handler {
                handler(index);
            }
        })
        .unwrap_or_else(|e| panic!("Failed to spawn worker thread \"{name}\": {e}"));
    WorkerThreadHandle { handle }
}

/// Joins all the worker threads of a pool. The threads must already have been
/// told to shut down, otherwise this blocks forever.
#[allow(clippy::unused_enumerate_index)]
pub(crate) fn join_workers(threads: &mut Vec<WorkerThreadHandle>) {
    log_debug!("[pool] Joining worker threads...");
    for (_i, t) in threads.drain(..).enumerate() {
        match t.handle.join() {
            Ok(()) => log_debug!("[pool] Worker {_i} joined"),
            Err(_e) => log_error!("[pool] Worker {_i} panicked: {_e:?}"),
        }
    }
    log_debug!("[pool] Joined worker threads.");
}

/// The basic engine: worker threads dispatch tasks from a single shared FIFO
/// queue.
///
/// Tasks submitted before [`start_workers()`](Self::start_workers) are stored
/// but not executed. The queue is FIFO, but which worker receives a given task
/// is unspecified.
///
/// Dropping the pool shuts it down: every worker thread is joined, and tasks
/// still queued are finalized without being run.
pub struct ThreadPool {
    core: Arc<PoolCore<Box<dyn Task>>>,
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
}

impl ThreadPool {
    /// Creates a pool of the given number of worker threads, with the default
    /// configuration.
    pub fn new(num_threads: usize) -> Self {
        Self::with_config(PoolConfig::new(num_threads))
    }

    /// Creates a pool using the given configuration.
    pub fn with_config(config: PoolConfig) -> Self {
        let core = Arc::new(PoolCore::new(config.num_threads));
        let threads = (0..config.num_threads)
            .map(|index| {
                let core = core.clone();
                spawn_worker(
                    format!("Thread pool worker {index}"),
                    index,
                    &config,
                    move |ctx| worker_loop(&core, ctx),
                )
            })
            .collect();
        log_debug!("[pool] Spawned {} worker threads", config.num_threads);
        Self { core, threads }
    }

    /// Returns the number of worker threads in this pool.
    pub fn num_threads(&self) -> usize {
        self.core.num_threads()
    }

    /// Submits a task; ownership transfers to the pool.
    ///
    /// If any worker is blocked waiting for a task, one of them is woken up.
    /// Tasks must not be submitted from a [`Task::finalize()`] hook.
    pub fn add_task(&self, task: impl Task + 'static) {
        self.core.add_task(Box::new(task));
    }

    /// Submits a closure as a task.
    pub fn execute(&self, f: impl FnOnce(&WorkerContext) + Send + 'static) {
        self.add_task(ClosureTask::new(f));
    }

    /// Allows workers to dequeue tasks, and resets the wait-time accounting.
    /// Idempotent.
    pub fn start_workers(&self) {
        self.core.start_workers();
    }

    /// Pauses dispatch without tearing the pool down: workers already
    /// executing a task complete it, queued tasks are kept until the next
    /// [`start_workers()`](Self::start_workers).
    pub fn stop_workers(&self) {
        self.core.stop_workers();
    }

    /// Blocks until the pool is quiescent: every worker blocked waiting for a
    /// task and the queue empty.
    ///
    /// If `do_work` is true, the calling thread first drains the queue,
    /// running and finalizing tasks itself; this requires the pool to be
    /// started. Waiting is correct even on a pool that was never started,
    /// since its workers are then all idle.
    pub fn wait(&self, do_work: bool) {
        if do_work {
            let ctx = WorkerContext::external();
            while let Some(mut task) = self.core.try_get_task() {
                task.run(&ctx);
                task.finalize();
            }
        }
        self.core.wait_until_idle();
    }

    /// Snapshot of the number of queued tasks.
    pub fn task_count(&self) -> usize {
        self.core.task_count()
    }

    /// Aggregate time workers spent blocked waiting for a task since the
    /// latest [`start_workers()`](Self::start_workers) call. Only completed
    /// wait intervals are counted.
    pub fn total_wait_time(&self) -> Duration {
        self.core.total_wait_time()
    }
}

impl Drop for ThreadPool {
    /// Signals shutdown, joins all the worker threads, then finalizes
    /// (without running) any task left in the queue.
    fn drop(&mut self) {
        self.core.shutdown();
        join_workers(&mut self.threads);

        let remaining = self.core.drain_remaining();
        if !remaining.is_empty() {
            log_warn!(
                "[pool] Discarding {} tasks still queued at shutdown",
                remaining.len()
            );
        }
        for task in remaining {
            task.finalize();
        }
    }
}

/// Main loop of a worker thread: pull a task, run it, finalize it, repeat
/// until shutdown.
fn worker_loop(core: &PoolCore<Box<dyn Task>>, ctx: &WorkerContext) {
    while let Some(mut task) = core.get_task() {
        task.run(ctx);
        task.finalize();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Task recording how many times it was run and finalized.
    struct ProbeTask {
        runs: Arc<AtomicUsize>,
        finalizations: Arc<AtomicUsize>,
    }

    impl Task for ProbeTask {
        fn run(&mut self, _ctx: &WorkerContext) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        fn finalize(self: Box<Self>) {
            self.finalizations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn submit_probes(pool: &ThreadPool, count: usize) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let finalizations = Arc::new(AtomicUsize::new(0));
        for _ in 0..count {
            pool.add_task(ProbeTask {
                runs: runs.clone(),
                finalizations: finalizations.clone(),
            });
        }
        (runs, finalizations)
    }

    #[test]
    fn test_tasks_are_held_until_start_workers() {
        let pool = ThreadPool::new(2);
        let (runs, _) = submit_probes(&pool, 10);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(pool.task_count(), 10);

        pool.start_workers();
        pool.wait(false);
        assert_eq!(runs.load(Ordering::SeqCst), 10);
        assert_eq!(pool.task_count(), 0);
    }

    #[test]
    fn test_start_workers_is_idempotent() {
        let pool = ThreadPool::new(2);
        pool.start_workers();
        pool.start_workers();
        let (runs, finalizations) = submit_probes(&pool, 10);
        pool.wait(false);
        assert_eq!(runs.load(Ordering::SeqCst), 10);
        assert_eq!(finalizations.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_stop_workers_pauses_dispatch() {
        let pool = ThreadPool::new(2);
        pool.start_workers();
        pool.stop_workers();

        let (runs, _) = submit_probes(&pool, 10);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // No queued task was lost by the pause.
        pool.start_workers();
        pool.wait(false);
        assert_eq!(runs.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_every_task_runs_and_finalizes_exactly_once() {
        let pool = ThreadPool::new(4);
        pool.start_workers();
        let (runs, finalizations) = submit_probes(&pool, 1000);
        pool.wait(false);
        assert_eq!(runs.load(Ordering::SeqCst), 1000);
        assert_eq!(finalizations.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_zero_worker_pool_drains_on_caller_thread() {
        let pool = ThreadPool::new(0);
        assert_eq!(pool.num_threads(), 0);
        pool.start_workers();

        let on_worker = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let on_worker = on_worker.clone();
            pool.execute(move |ctx| {
                if ctx.worker_index().is_some() {
                    on_worker.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        let (runs, _) = submit_probes(&pool, 5);

        pool.wait(true);
        assert_eq!(runs.load(Ordering::SeqCst), 5);
        // Everything ran on the calling thread.
        assert_eq!(on_worker.load(Ordering::SeqCst), 0);
        assert_eq!(pool.task_count(), 0);
    }

    #[test]
    fn test_drop_finalizes_queued_tasks_without_running_them() {
        let runs;
        let finalizations;
        {
            let pool = ThreadPool::new(2);
            let (r, f) = submit_probes(&pool, 20);
            runs = r;
            finalizations = f;
            // Never started: every task is still queued at drop.
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(finalizations.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_drop_mid_run_finalizes_every_task_exactly_once() {
        let runs;
        let finalizations;
        {
            let pool = ThreadPool::new(2);
            pool.start_workers();
            let (r, f) = submit_probes(&pool, 100);
            runs = r;
            finalizations = f;
            // Drop races with the workers: whatever was dequeued before the
            // shutdown signal runs, the rest is discarded.
        }
        let run_count = runs.load(Ordering::SeqCst);
        assert!(run_count <= 100);
        assert_eq!(finalizations.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_wait_time_accounting_is_monotonic() {
        let pool = ThreadPool::new(2);
        pool.start_workers();
        submit_probes(&pool, 10);
        pool.wait(false);
        // Let a waiting worker be woken at least once so an interval is
        // recorded.
        submit_probes(&pool, 10);
        pool.wait(false);
        let t1 = pool.total_wait_time();

        submit_probes(&pool, 10);
        pool.wait(false);
        let t2 = pool.total_wait_time();
        assert!(t2 >= t1);
    }

    #[test]
    fn test_wait_returns_immediately_on_idle_unstarted_pool() {
        let pool = ThreadPool::new(3);
        pool.wait(false);
    }

    #[test]
    fn test_tasks_may_run_under_mutex() {
        let pool = ThreadPool::new(4);
        pool.start_workers();
        let counter = Arc::new(Mutex::new(0u64));
        for _ in 0..1000 {
            let counter = counter.clone();
            pool.execute(move |_| {
                *counter.lock().unwrap() += 1;
            });
        }
        pool.wait(false);
        assert_eq!(*counter.lock().unwrap(), 1000);
    }

    #[test]
    fn test_lifecycle_hooks_run_once_per_worker() {
        let started = Arc::new(AtomicUsize::new(0));
        let exited = Arc::new(AtomicUsize::new(0));
        {
            let mut config = PoolConfig::new(3);
            let started_handler = started.clone();
            let exited_handler = exited.clone();
            config.start_handler = Some(Arc::new(move |_| {
                started_handler.fetch_add(1, Ordering::SeqCst);
            }));
            config.exit_handler = Some(Arc::new(move |_| {
                exited_handler.fetch_add(1, Ordering::SeqCst);
            }));
            let pool = ThreadPool::with_config(config);
            pool.start_workers();
            pool.wait(false);
            assert_eq!(started.load(Ordering::SeqCst), 3);
        }
        assert_eq!(exited.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_worker_threads_are_named() {
        let pool = ThreadPool::new(2);
        pool.start_workers();
        let names = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let names = names.clone();
            pool.execute(move |_| {
                let name = std::thread::current().name().map(str::to_owned);
                names.lock().unwrap().push(name);
                // Hold the worker briefly so both tasks land on different
                // threads in most schedules; either way the name is checked.
                std::thread::sleep(Duration::from_millis(10));
            });
        }
        pool.wait(false);
        for name in names.lock().unwrap().iter() {
            let name = name.as_deref().unwrap();
            assert!(
                name.starts_with("Thread pool worker "),
                "unexpected worker name: {name}"
            );
        }
    }
}
