//! Scenario 3 / property P4: `on<Every<10, ms>>` increments a
//! counter; after 200ms the counter should land in `[18, 22]`.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nuclear::{Configuration, Environment, PowerPlant, Reactor, ReactionHandle};

static COUNTER: OnceLock<Arc<AtomicUsize>> = OnceLock::new();

struct Ticker {
    _every: ReactionHandle,
}

impl Reactor for Ticker {
    fn new(env: &Environment) -> Self {
        let counter = Arc::clone(COUNTER.get_or_init(|| Arc::new(AtomicUsize::new(0))));
        let every = env.every(
            Duration::from_millis(10),
            nuclear::Priority::NORMAL,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        Ticker { _every: every }
    }
}

#[test]
fn every_fires_at_the_expected_cadence() {
    let plant = PowerPlant::new(Configuration::new(NonZeroUsize::new(2).unwrap())).unwrap();
    plant.install::<Ticker>().unwrap();

    // `start()` blocks until `shutdown()` is called (§4.7), so the
    // shutdown trigger has to come from another thread.
    let shutdown_plant = Arc::clone(&plant);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        shutdown_plant.shutdown();
    });

    plant.start();

    let n = COUNTER.get().unwrap().load(Ordering::SeqCst);
    assert!(
        (18..=22).contains(&n),
        "expected roughly 20 ticks in 200ms at a 10ms period, got {n}"
    );
}
