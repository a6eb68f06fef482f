//! Scenario 1: install a reactor with `on<Trigger<Msg>>`; on
//! `Startup` emit `Msg{42}`; the reaction records the value.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nuclear::{Configuration, EmitScope, Environment, PowerPlant, Reactor, ReactionHandle, Startup};

#[derive(Clone)]
struct Msg(i64);

static SEEN: OnceLock<Arc<AtomicI64>> = OnceLock::new();

struct Emitter {
    _on_startup: ReactionHandle,
}

impl Reactor for Emitter {
    fn new(env: &Environment) -> Self {
        let env = env.clone();
        let on_startup = env.on::<Startup>().then(move || {
            env.emit(Msg(42), EmitScope::Local);
        });
        Emitter {
            _on_startup: on_startup,
        }
    }
}

struct Recorder {
    _on_msg: ReactionHandle,
}

impl Reactor for Recorder {
    fn new(env: &Environment) -> Self {
        let seen = Arc::clone(SEEN.get_or_init(|| Arc::new(AtomicI64::new(-1))));
        let on_msg = env.on::<Msg>().then_with(move |m: Msg| {
            seen.store(m.0, Ordering::SeqCst);
        });
        Recorder { _on_msg: on_msg }
    }
}

#[test]
fn emit_reaches_installed_reactor() {
    let plant = PowerPlant::new(Configuration::new(NonZeroUsize::new(2).unwrap())).unwrap();
    plant.install::<Recorder>().unwrap();
    plant.install::<Emitter>().unwrap();

    // `start()` blocks until `shutdown()` is called (§4.7), so the
    // shutdown trigger has to come from another thread.
    let shutdown_plant = Arc::clone(&plant);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        shutdown_plant.shutdown();
    });

    plant.start();

    assert_eq!(
        SEEN.get().unwrap().load(Ordering::SeqCst),
        42,
        "recorder reaction should have observed the emitted message"
    );
}
