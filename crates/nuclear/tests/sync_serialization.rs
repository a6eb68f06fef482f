//! Scenario 2 / property P3: two reactions sharing a sync key
//! must never run concurrently. Each sleeps briefly while asserting a
//! shared flag is false, then sets/unsets it, across many iterations.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nuclear::{Configuration, EmitScope, Environment, PowerPlant, Reactor, ReactionHandle, Startup};

#[derive(Clone)]
struct TriggerA;
#[derive(Clone)]
struct TriggerB;

struct Group;

static RUNNING: OnceLock<Arc<AtomicBool>> = OnceLock::new();
static VIOLATIONS: OnceLock<Arc<AtomicUsize>> = OnceLock::new();
static COMPLETED: OnceLock<Arc<AtomicUsize>> = OnceLock::new();

const ITERATIONS: usize = 20;

fn critical_section() {
    let running = Arc::clone(RUNNING.get().unwrap());
    let violations = Arc::clone(VIOLATIONS.get().unwrap());
    let completed = Arc::clone(COMPLETED.get().unwrap());

    if running.swap(true, Ordering::SeqCst) {
        violations.fetch_add(1, Ordering::SeqCst);
    }
    std::thread::sleep(Duration::from_millis(2));
    if !running.swap(false, Ordering::SeqCst) {
        violations.fetch_add(1, Ordering::SeqCst);
    }
    completed.fetch_add(1, Ordering::SeqCst);
}

struct Worker {
    _on_a: ReactionHandle,
    _on_b: ReactionHandle,
    _on_startup: ReactionHandle,
}

impl Reactor for Worker {
    fn new(env: &Environment) -> Self {
        let on_a = env
            .on::<TriggerA>()
            .sync::<Group>()
            .then(critical_section);
        let on_b = env
            .on::<TriggerB>()
            .sync::<Group>()
            .then(critical_section);

        let env_for_startup = env.clone();
        let on_startup = env.on::<Startup>().then(move || {
            for _ in 0..ITERATIONS {
                env_for_startup.emit(TriggerA, EmitScope::Local);
                env_for_startup.emit(TriggerB, EmitScope::Local);
            }
        });

        Worker {
            _on_a: on_a,
            _on_b: on_b,
            _on_startup: on_startup,
        }
    }
}

#[test]
fn sync_group_serializes_concurrent_reactions() {
    RUNNING.get_or_init(|| Arc::new(AtomicBool::new(false)));
    VIOLATIONS.get_or_init(|| Arc::new(AtomicUsize::new(0)));
    COMPLETED.get_or_init(|| Arc::new(AtomicUsize::new(0)));

    let plant = PowerPlant::new(Configuration::new(NonZeroUsize::new(4).unwrap())).unwrap();
    plant.install::<Worker>().unwrap();

    // `start()` blocks until `shutdown()` is called (§4.7), so the
    // shutdown trigger has to come from another thread; give the
    // 2*ITERATIONS serialized 2ms critical sections time to drain first.
    let shutdown_plant = Arc::clone(&plant);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(500));
        shutdown_plant.shutdown();
    });

    plant.start();

    assert_eq!(
        VIOLATIONS.get().unwrap().load(Ordering::SeqCst),
        0,
        "sync group allowed two tasks to run concurrently"
    );
    assert_eq!(
        COMPLETED.get().unwrap().load(Ordering::SeqCst),
        2 * ITERATIONS,
        "not every submitted task ran"
    );
}
