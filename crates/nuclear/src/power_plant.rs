//! The root singleton (§4.7): owns the message bus, scheduler, chrono
//! service, I/O poller, and sync-group registry, and is the only thing an
//! embedding application constructs directly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::bus::{EmitScope, MessageBus};
use crate::chrono::ChronoService;
use crate::config::Configuration;
use crate::environment::{Environment, Reactor};
use crate::error::{Error, Result};
use crate::events;
use crate::io::IoPoller;
use crate::net::NetworkTransport;
use crate::object_pool::ObjectPool;
use crate::scheduler::Scheduler;
use crate::sync_group::SyncGroupRegistry;
use crate::task::Task;

/// Only one [`PowerPlant`] may exist per process at a time (§4.7): a
/// second concurrent construction is a configuration error, not a panic.
static INSTANCE_EXISTS: AtomicBool = AtomicBool::new(false);

pub struct PowerPlant {
    bus: Arc<MessageBus>,
    scheduler: Arc<Scheduler>,
    chrono: Arc<ChronoService>,
    io_poller: Arc<IoPoller>,
    sync_groups: Arc<SyncGroupRegistry>,
    network: Arc<Mutex<Option<Arc<NetworkTransport>>>>,
    stats_handlers: Arc<Mutex<HashSet<u64>>>,
    on_task_complete: Arc<dyn Fn(Task) + Send + Sync>,
    reactors: ObjectPool,
    config: Configuration,
    shutting_down: AtomicBool,
    started: Arc<AtomicBool>,
    initialize_queue: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

impl PowerPlant {
    pub fn new(config: Configuration) -> Result<Arc<Self>> {
        if INSTANCE_EXISTS.swap(true, Ordering::AcqRel) {
            return Err(Error::config(
                "a PowerPlant already exists in this process",
            ));
        }

        log::set_max_level(config.default_log_level);

        let bus = MessageBus::new();
        let sync_groups = SyncGroupRegistry::new();
        let stats_handlers: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

        // `Scheduler::new` spawns worker threads immediately and needs its
        // completion callback up front, but that callback wants to emit
        // back onto the scheduler it is completing for. Broken via a
        // `Weak` filled in right after construction (§4.2 "on_task_complete").
        let scheduler_cell: Arc<OnceLock<Weak<Scheduler>>> = Arc::new(OnceLock::new());

        let on_task_complete: Arc<dyn Fn(Task) + Send + Sync> = {
            let bus = Arc::clone(&bus);
            let stats_handlers = Arc::clone(&stats_handlers);
            let scheduler_cell = Arc::clone(&scheduler_cell);
            Arc::new(move |task: Task| {
                let reaction_id = task.reaction_id();
                // §4.2 P6: a task belonging to a reaction that itself
                // handles `ReactionStatistics` never re-triggers the event,
                // or every run would spawn another forever.
                if stats_handlers.lock().unwrap().contains(&reaction_id) {
                    return;
                }
                let Some(scheduler) = scheduler_cell.get().and_then(Weak::upgrade) else {
                    return;
                };
                bus.emit(
                    events::ReactionStatistics(task.stats.clone()),
                    EmitScope::Local,
                    &scheduler,
                    &|_task| {},
                );
            })
        };

        let scheduler = {
            let on_task_complete = Arc::clone(&on_task_complete);
            Scheduler::new(config.thread_count, move |task| {
                (on_task_complete.as_ref())(task)
            })
        };
        let _ = scheduler_cell.set(Arc::downgrade(&scheduler));

        let chrono = ChronoService::new();
        let io_poller = IoPoller::new(Arc::clone(&scheduler))?;

        Ok(Arc::new(PowerPlant {
            bus,
            scheduler,
            chrono,
            io_poller,
            sync_groups,
            network: Arc::new(Mutex::new(None)),
            stats_handlers,
            on_task_complete,
            reactors: ObjectPool::new(),
            config,
            shutting_down: AtomicBool::new(false),
            started: Arc::new(AtomicBool::new(false)),
            initialize_queue: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    fn environment(&self) -> Environment {
        Environment::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.chrono),
            Arc::clone(&self.io_poller),
            Arc::clone(&self.sync_groups),
            Arc::clone(&self.network),
            Arc::clone(&self.stats_handlers),
            Arc::clone(&self.on_task_complete),
            Arc::clone(&self.started),
            Arc::clone(&self.initialize_queue),
        )
    }

    /// Forward `message` to the `log` facade and emit it as a `LogMessage`
    /// event (SPEC_FULL.md §A.2).
    pub fn log(&self, level: log::Level, message: impl Into<String>) {
        self.environment().log(level, message);
    }

    /// Construct and install a reactor, wiring its reactions into this
    /// power plant (§1, §4.7). May be called before or after [`Self::start`].
    pub fn install<R: Reactor>(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShutdownInProgress);
        }
        let env = self.environment();
        let reactor = R::new(&env);
        // Kept alive for the lifetime of the power plant so any
        // `ReactionHandle`s it owns stay bound; never looked back up.
        self.reactors.insert(reactor);
        Ok(())
    }

    /// Emit `CommandLineArguments` and any reaction-queued `Initialize`
    /// emits (§4.1, §6), then `Startup` (Direct-scoped, so installers
    /// observe it synchronously before returning), and begin normal
    /// operation. The worker pool, chrono thread, and I/O poller are
    /// already running by this point (§4.7).
    ///
    /// Blocks until shutdown (§4.7, §6): returns only once `shutdown()` has
    /// been called (from another thread, a reaction, or a signal handler)
    /// and every worker and service thread has joined. Callers that need to
    /// drive shutdown themselves must do so concurrently, e.g. from a
    /// thread spawned before calling `start()`.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);

        self.bus.emit(
            events::CommandLineArguments(std::env::args().collect()),
            EmitScope::Local,
            &self.scheduler,
            &*self.on_task_complete,
        );

        let queued = std::mem::take(&mut *self.initialize_queue.lock().unwrap());
        for thunk in queued {
            thunk();
        }

        self.bus.emit(
            events::Startup,
            EmitScope::Direct,
            &self.scheduler,
            &*self.on_task_complete,
        );

        self.join();
    }

    /// Emit `Shutdown` and begin draining: no further reactions run other
    /// than tasks already queued or produced in cascade (P5).
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bus.emit(
            events::Shutdown,
            EmitScope::Direct,
            &self.scheduler,
            &*self.on_task_complete,
        );
        if let Some(transport) = self.network.lock().unwrap().as_ref() {
            transport.shutdown();
        }
        self.io_poller.shutdown();
        self.chrono.shutdown();
        self.scheduler.shutdown();
    }

    /// Block until every dedicated thread (workers, chrono, I/O poller,
    /// network) has exited. `start()` already calls this before returning;
    /// calling it again afterwards is a harmless no-op (each underlying
    /// service's join is idempotent once its thread handle has been taken).
    pub fn join(&self) {
        self.scheduler.join();
        self.chrono.join();
        self.io_poller.join();
        if let Some(transport) = self.network.lock().unwrap().take() {
            transport.join();
        }
    }
}

impl Drop for PowerPlant {
    fn drop(&mut self) {
        INSTANCE_EXISTS.store(false, Ordering::Release);
    }
}
