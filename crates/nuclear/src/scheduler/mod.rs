//! The prioritized work scheduler and fixed worker pool (§4.2).
//!
//! An `Arc<Self>` owns the shared state; background threads are spawned
//! holding only a `Weak` reference back to it (mirroring the
//! `worker_pool/threaded.rs` `scheduling_thread` shape), and task
//! execution happens outside any lock. The dispatch algorithm itself is
//! the classic mutex+condvar priority queue described in §4.2.

mod queue;

use std::collections::BinaryHeap;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use queue::QueueEntry;

use crate::task::Task;

struct State {
    heap: BinaryHeap<QueueEntry>,
    /// Set by `shutdown()`. Submits are still accepted while draining;
    /// workers exit only once the heap is empty (invariant 7, §3).
    draining: bool,
}

/// `on_task_complete` is invoked with the finished task's statistics after
/// every execution, on the worker thread, outside any scheduler lock. The
/// power plant uses this to drive `ReactionStatistics` emission and the
/// sync-group release/postcondition chain.
pub(crate) struct Scheduler {
    state: Mutex<State>,
    condvar: Condvar,
    sequence: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
    on_task_complete: Box<dyn Fn(Task) + Send + Sync>,
}

impl Scheduler {
    pub(crate) fn new(
        thread_count: NonZeroUsize,
        on_task_complete: impl Fn(Task) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Scheduler {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                draining: false,
            }),
            condvar: Condvar::new(),
            sequence: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
            on_task_complete: Box::new(on_task_complete),
        });

        let mut workers = Vec::with_capacity(thread_count.get());
        for index in 0..thread_count.get() {
            let weak = Arc::downgrade(&scheduler);
            let handle = std::thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker_loop(weak))
                .expect("failed to spawn scheduler worker thread");
            workers.push(handle);
        }
        *scheduler.workers.lock().unwrap() = workers;

        scheduler
    }

    /// Non-blocking; safe from any thread, including worker threads.
    ///
    /// Consults the task's reaction's `reschedule` hook before enqueuing
    /// (§4.2): if it returns `None` the task is swallowed (parked
    /// elsewhere, e.g. a sync group's waiter queue), otherwise whatever it
    /// returns is what actually gets enqueued.
    pub(crate) fn submit(&self, task: Task) {
        let task = match &task.reaction.reschedule {
            Some(reschedule) => match reschedule(task) {
                Some(rescheduled) => rescheduled,
                None => return,
            },
            None => task,
        };

        // Still accepted even while draining (§4.2): in-flight cascades
        // (e.g. sync-group releases) must be allowed to complete before
        // workers exit.
        let mut state = self.state.lock().unwrap();
        state.heap.push(QueueEntry(task));
        drop(state);
        self.condvar.notify_one();
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Transition to draining: no conceptual change to `submit`, but once
    /// the heap empties, workers observe `draining` and exit (P5).
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.draining = true;
        drop(state);
        self.condvar.notify_all();
    }

    /// Block until every worker thread has exited (i.e. the queue has
    /// fully drained after `shutdown()`).
    pub(crate) fn join(&self) {
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            match handle.join() {
                Ok(()) => {}
                Err(panic) => panic::resume_unwind(panic),
            }
        }
    }
}

fn worker_loop(scheduler: std::sync::Weak<Scheduler>) {
    loop {
        let Some(scheduler) = scheduler.upgrade() else {
            return;
        };

        let task = {
            let mut state = scheduler.state.lock().unwrap();
            loop {
                if let Some(entry) = state.heap.pop() {
                    break Some(entry.0);
                }
                if state.draining {
                    break None;
                }
                state = scheduler.condvar.wait(state).unwrap();
            }
        };

        let Some(task) = task else {
            log::debug!("worker thread exiting, queue drained after shutdown");
            return;
        };

        execute(&scheduler, task);
    }
}

fn execute(scheduler: &Scheduler, mut task: Task) {
    if !task.reaction.check_precondition() {
        task.reaction.task_completed();
        return;
    }

    task.stats.started = Some(std::time::Instant::now());
    task.stats.thread = Some(std::thread::current().id());

    let payload = task.payload.take().expect("task payload taken twice");
    let result = panic::catch_unwind(AssertUnwindSafe(payload));
    if let Err(panic) = result {
        task.stats.exception = Some(describe_panic(panic));
    }

    task.stats.finished = Some(std::time::Instant::now());

    if let Some(postcondition) = &task.reaction.postcondition {
        postcondition(&task.stats);
    }

    task.reaction.task_completed();
    (scheduler.on_task_complete)(task);
}

fn describe_panic(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "reaction panicked with a non-string payload".to_string()
    }
}
