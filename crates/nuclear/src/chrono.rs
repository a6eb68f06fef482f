//! The timed-event (chrono) service (§4.4): a single dedicated thread
//! owning a min-heap of timed callbacks and a condition variable.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Callback = Box<dyn FnMut(&mut Instant) -> bool + Send>;

struct ChronoEntry {
    next_fire: Instant,
    /// Stored for introspection only; the callback itself is the sole
    /// authority on how (and whether) `next_fire` advances (§3 invariant 5).
    #[allow(dead_code)]
    period: Option<Duration>,
    reaction_id: u64,
    callback: Callback,
}

impl PartialEq for ChronoEntry {
    fn eq(&self, other: &Self) -> bool {
        self.next_fire == other.next_fire
    }
}
impl Eq for ChronoEntry {}
impl PartialOrd for ChronoEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ChronoEntry {
    /// Reversed so that `BinaryHeap` (a max-heap) pops the soonest
    /// `next_fire` first, i.e. behaves like a min-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other.next_fire.cmp(&self.next_fire)
    }
}

struct State {
    heap: BinaryHeap<ChronoEntry>,
    shutdown: bool,
}

pub(crate) struct ChronoService {
    state: Mutex<State>,
    condvar: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ChronoService {
    pub(crate) fn new() -> Arc<Self> {
        let service = Arc::new(ChronoService {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                shutdown: false,
            }),
            condvar: Condvar::new(),
            thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&service);
        let handle = std::thread::Builder::new()
            .name("chrono".into())
            .spawn(move || chrono_loop(weak))
            .expect("failed to spawn chrono thread");
        *service.thread.lock().unwrap() = Some(handle);

        service
    }

    /// Insert a one-shot or periodic timed callback. `period` is advisory
    /// metadata only (§3); the callback itself mutates `next_fire`.
    pub(crate) fn insert(
        &self,
        next_fire: Instant,
        period: Option<Duration>,
        reaction_id: u64,
        callback: Callback,
    ) {
        let mut state = self.state.lock().unwrap();
        state.heap.push(ChronoEntry {
            next_fire,
            period,
            reaction_id,
            callback,
        });
        drop(state);
        self.condvar.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        drop(state);
        self.condvar.notify_all();
    }

    pub(crate) fn join(&self) {
        if let Some(handle) = self.thread.lock().unwrap().take() {
            match handle.join() {
                Ok(()) => {}
                // §9 open question: only ignore a join failure because the
                // thread is no longer joinable; any other panic propagates.
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
    }
}

fn chrono_loop(service: std::sync::Weak<ChronoService>) {
    loop {
        let Some(service) = service.upgrade() else {
            return;
        };

        let mut state = service.state.lock().unwrap();
        loop {
            if state.shutdown && state.heap.is_empty() {
                return;
            }
            match state.heap.peek() {
                None => {
                    state = service.condvar.wait(state).unwrap();
                }
                Some(top) => {
                    let now = Instant::now();
                    if top.next_fire <= now {
                        break;
                    }
                    let wait = top.next_fire - now;
                    let (guard, timeout) = service.condvar.wait_timeout(state, wait).unwrap();
                    state = guard;
                    if timeout.timed_out() {
                        break;
                    }
                }
            }
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while matches!(state.heap.peek(), Some(e) if e.next_fire <= now) {
            due.push(state.heap.pop().unwrap());
        }
        drop(state);

        for mut entry in due {
            let mut next_fire = entry.next_fire;
            let keep = (entry.callback)(&mut next_fire);
            if keep {
                entry.next_fire = next_fire;
                let mut state = service.state.lock().unwrap();
                state.heap.push(entry);
            } else {
                log::trace!("chrono entry for reaction {} dropped", entry.reaction_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn periodic_callback_fires_repeatedly_and_can_be_cancelled() {
        let service = ChronoService::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let limit = 5usize;

        let counter_clone = Arc::clone(&counter);
        let period = Duration::from_millis(5);
        service.insert(
            Instant::now(),
            Some(period),
            1,
            Box::new(move |next_fire| {
                let n = counter_clone.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                *next_fire += period;
                n < limit
            }),
        );

        // Give the dedicated thread enough wall-clock time to run out the
        // sequence; the bound is generous to avoid CI flakiness.
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(counter.load(AtomicOrdering::SeqCst), limit);

        service.shutdown();
        service.join();
    }
}
