// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The work-stealing engine: an idle worker assists another worker still
//! executing a long-running, divisible task.

use crate::macros::{log_debug, log_warn};
use crate::pool::{
    join_workers, spawn_worker, PoolConfig, PoolCore, WorkerContext, WorkerThreadHandle,
};
use crate::task::StealableTask;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A submitted task together with its shared-ownership bookkeeping.
struct Tracked<T> {
    task: T,
    /// Number of workers referencing the task: one for the worker executing
    /// it, plus one per in-flight steal. Only ever mutated with the steal lock
    /// held; the atomic makes the field shareable, not the protocol lock-free.
    ref_count: AtomicUsize,
}

impl<T> Tracked<T> {
    fn new(task: T) -> Arc<Self> {
        Arc::new(Self {
            task,
            ref_count: AtomicUsize::new(0),
        })
    }
}

/// State guarded by the steal lock: the published in-flight task of every
/// worker, and the round-robin victim cursor.
struct StealState<T> {
    /// `slots[i]` is the task worker `i` is presently executing, while it can
    /// be stolen from.
    slots: Vec<Option<Arc<Tracked<T>>>>,
    /// Last slot examined by a victim search. Persists across searches, so
    /// victim selection is spread round-robin over the workers.
    cursor: usize,
}

impl<T> StealState<T> {
    /// Scans up to one full round of slots, advancing the cursor by one per
    /// candidate, and returns the first published task found.
    ///
    /// The scan does not skip the calling worker's own slot; the call site
    /// asserts that the returned victim is not the caller's completed task,
    /// which would indicate a reference-counting bug.
    fn find_victim(&mut self) -> Option<Arc<Tracked<T>>> {
        let num_slots = self.slots.len();
        for _ in 0..num_slots {
            self.cursor += 1;
            if self.cursor >= num_slots {
                self.cursor -= num_slots;
            }
            if let Some(task) = &self.slots[self.cursor] {
                return Some(task.clone());
            }
        }
        None
    }
}

/// Guts shared between the pool handle and its worker threads.
struct Shared<T> {
    core: PoolCore<Arc<Tracked<T>>>,
    /// The steal lock. Guards every published slot, every task's reference
    /// count and the victim cursor. Only ever taken with the queue lock
    /// released, and never held while running task code.
    steal: Mutex<StealState<T>>,
}

/// The work-stealing engine.
///
/// Like [`ThreadPool`](crate::ThreadPool), workers dispatch tasks from a
/// single shared FIFO queue; additionally, a worker that finds the queue empty
/// after completing a task scans the other workers round-robin and transfers
/// part of a still-running task's work to its own completed task via
/// [`StealableTask::steal_from()`].
///
/// Each task is finalized exactly once, by whichever thread drops the last
/// reference to it: the executing worker, a stealer, or the destructor for
/// tasks never dequeued.
pub struct WorkStealingPool<T: StealableTask + 'static> {
    shared: Arc<Shared<T>>,
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
}

impl<T: StealableTask + 'static> WorkStealingPool<T> {
    /// Creates a pool of the given number of worker threads, with the default
    /// configuration.
    pub fn new(num_threads: usize) -> Self {
        Self::with_config(PoolConfig::new(num_threads))
    }

    /// Creates a pool using the given configuration.
    pub fn with_config(config: PoolConfig) -> Self {
        let shared = Arc::new(Shared {
            core: PoolCore::new(config.num_threads),
            steal: Mutex::new(StealState {
                slots: (0..config.num_threads).map(|_| None).collect(),
                cursor: 0,
            }),
        });
        let threads = (0..config.num_threads)
            .map(|index| {
                let shared = shared.clone();
                spawn_worker(
                    format!("Work stealing worker {index}"),
                    index,
                    &config,
                    move |ctx| worker_loop(&shared, ctx),
                )
            })
            .collect();
        log_debug!(
            "[stealing pool] Spawned {} worker threads",
            config.num_threads
        );
        Self { shared, threads }
    }

    /// Returns the number of worker threads in this pool.
    pub fn num_threads(&self) -> usize {
        self.shared.core.num_threads()
    }

    /// Submits a task; ownership transfers to the pool.
    pub fn add_task(&self, task: T) {
        self.shared.core.add_task(Tracked::new(task));
    }

    /// Allows workers to dequeue tasks, and resets the wait-time accounting.
    /// Idempotent.
    pub fn start_workers(&self) {
        self.shared.core.start_workers();
    }

    /// Pauses dispatch without tearing the pool down. Workers already
    /// executing (or stealing) complete what they hold.
    pub fn stop_workers(&self) {
        self.shared.core.stop_workers();
    }

    /// Blocks until the pool is quiescent; see
    /// [`ThreadPool::wait()`](crate::ThreadPool::wait).
    pub fn wait(&self, do_work: bool) {
        if do_work {
            let ctx = WorkerContext::external();
            while let Some(task) = self.shared.core.try_get_task() {
                // The caller never publishes the task, so no worker can steal
                // from it and no reference count is taken.
                task.task.run(&ctx);
                task.task.finalize();
            }
        }
        self.shared.core.wait_until_idle();
    }

    /// Snapshot of the number of queued tasks.
    pub fn task_count(&self) -> usize {
        self.shared.core.task_count()
    }

    /// Aggregate time workers spent blocked waiting for a task since the
    /// latest [`start_workers()`](Self::start_workers) call. Only completed
    /// wait intervals are counted.
    pub fn total_wait_time(&self) -> Duration {
        self.shared.core.total_wait_time()
    }
}

impl<T: StealableTask + 'static> Drop for WorkStealingPool<T> {
    /// Signals shutdown, joins all the worker threads, then finalizes
    /// (without running) any task left in the queue.
    fn drop(&mut self) {
        self.shared.core.shutdown();
        join_workers(&mut self.threads);

        let remaining = self.shared.core.drain_remaining();
        if !remaining.is_empty() {
            log_warn!(
                "[stealing pool] Discarding {} tasks still queued at shutdown",
                remaining.len()
            );
        }
        for task in remaining {
            // Never dequeued: the reference count is still zero and no worker
            // holds the task.
            task.task.finalize();
        }
    }
}

/// Main loop of a stealing worker: pull a task, publish it, run it, unpublish
/// it, then steal from the other workers until the queue has tasks again.
fn worker_loop<T: StealableTask>(shared: &Shared<T>, ctx: &WorkerContext) {
    let index = ctx
        .worker_index()
        .expect("stealing loop running outside a worker thread");
    while let Some(task) = shared.core.get_task() {
        {
            let mut steal = shared.steal.lock().unwrap();
            assert!(
                steal.slots[index].is_none(),
                "Worker {index} dequeued a task while its previous task is still published"
            );
            // Register that this worker is running the task.
            task.ref_count.fetch_add(1, Ordering::Relaxed);
            steal.slots[index] = Some(task.clone());
        }

        task.task.run(ctx);

        // Unpublish, so nobody starts stealing from a finished task. A victim
        // search that sampled the slot just before this clear still holds the
        // task alive through its reference count.
        shared.steal.lock().unwrap().slots[index] = None;

        // Steal work from the other tasks until there is none left to steal.
        // The queue-length sample is advisory: if it lags by an update, this
        // worker merely steals once more before returning to the queue.
        while shared.core.task_count_hint() == 0 {
            let victim = {
                let mut steal = shared.steal.lock().unwrap();
                match steal.find_victim() {
                    Some(victim) => {
                        assert!(
                            !Arc::ptr_eq(&victim, &task),
                            "Worker {index} attempting to steal from its completed own task"
                        );
                        victim.ref_count.fetch_add(1, Ordering::Relaxed);
                        victim
                    }
                    None => break,
                }
            };

            log_debug!("[stealing worker {index}] Stealing from a published task");
            task.task.steal_from(ctx, &victim.task);
            release(shared, &victim);
        }

        release(shared, &task);
    }
}

/// Drops one reference to a task. The releaser that brings the count to zero
/// finalizes the task, outside the lock.
fn release<T: StealableTask>(shared: &Shared<T>, task: &Arc<Tracked<T>>) {
    let finalize = {
        let _guard = shared.steal.lock().unwrap();
        task.ref_count.fetch_sub(1, Ordering::Relaxed) == 1
    };
    if finalize {
        task.task.finalize();
    }
}
