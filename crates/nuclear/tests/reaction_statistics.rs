//! Scenario 6 / property P6: a reaction that panics should
//! have its exception captured into `ReactionStatistics.exception` rather
//! than escaping the worker thread.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use nuclear::{
    Configuration, EmitScope, Environment, PowerPlant, Reactor, ReactionHandle, ReactionStatistics,
    Startup,
};

#[derive(Clone)]
struct Trigger;

static CAPTURED_EXCEPTION: OnceLock<Mutex<Option<String>>> = OnceLock::new();

struct Faulty {
    _on_trigger: ReactionHandle,
    _on_startup: ReactionHandle,
}

impl Reactor for Faulty {
    fn new(env: &Environment) -> Self {
        let on_trigger = env.on::<Trigger>().then(|| {
            panic!("Exceptions happened");
        });

        let env_for_startup = env.clone();
        let on_startup = env.on::<Startup>().then(move || {
            env_for_startup.emit(Trigger, EmitScope::Local);
        });

        Faulty {
            _on_trigger: on_trigger,
            _on_startup: on_startup,
        }
    }
}

struct StatsWatcher {
    _on_stats: ReactionHandle,
}

impl Reactor for StatsWatcher {
    fn new(env: &Environment) -> Self {
        CAPTURED_EXCEPTION.get_or_init(|| Mutex::new(None));
        let on_stats = env.on::<ReactionStatistics>().then_with(|stats: ReactionStatistics| {
            if let Some(exception) = stats.0.exception {
                *CAPTURED_EXCEPTION.get().unwrap().lock().unwrap() = Some(exception);
            }
        });
        StatsWatcher {
            _on_stats: on_stats,
        }
    }
}

#[test]
fn panicking_reaction_surfaces_its_exception_in_statistics() {
    let plant = PowerPlant::new(Configuration::new(NonZeroUsize::new(2).unwrap())).unwrap();
    plant.install::<StatsWatcher>().unwrap();
    plant.install::<Faulty>().unwrap();

    // `start()` blocks until `shutdown()` is called (§4.7), so the
    // shutdown trigger has to come from another thread.
    let shutdown_plant = Arc::clone(&plant);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        shutdown_plant.shutdown();
    });

    plant.start();

    let captured = CAPTURED_EXCEPTION.get().unwrap().lock().unwrap().clone();
    assert_eq!(captured.as_deref(), Some("Exceptions happened"));
}
