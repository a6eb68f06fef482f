//! The per-reactor collaborator handed to [`Reactor::new`] (§1, §3): the
//! thin DSL surface ("template fusion layer", §9) a reactor's constructor
//! uses to bind reactions, install periodic and I/O triggers, and emit.
//!
//! Deliberately a plain struct of cloned `Arc`s rather than a trait object:
//! every reactor gets the same view of the kernel, and there is exactly one
//! [`crate::power_plant::PowerPlant`] per process (§4.7) to hand them out.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::{EmitScope, MessageBus};
use crate::chrono::ChronoService;
use crate::error::Result;
use crate::events;
use crate::io::{Event, Interest, IoPoller};
use crate::net::{NetworkConfig, NetworkTransport, PeerInfo, TransportCallbacks};
use crate::reaction::{Reaction, ReactionHandle};
use crate::scheduler::Scheduler;
use crate::sync_group::SyncGroupRegistry;
use crate::task::Task;
use crate::type_key::TypeKey;

#[derive(Clone)]
pub struct Environment {
    pub(crate) bus: Arc<MessageBus>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) chrono: Arc<ChronoService>,
    pub(crate) io_poller: Arc<IoPoller>,
    pub(crate) sync_groups: Arc<SyncGroupRegistry>,
    pub(crate) network: Arc<Mutex<Option<Arc<NetworkTransport>>>>,
    pub(crate) stats_handlers: Arc<Mutex<std::collections::HashSet<u64>>>,
    pub(crate) on_task_complete: Arc<dyn Fn(Task) + Send + Sync>,
    pub(crate) started: Arc<std::sync::atomic::AtomicBool>,
    pub(crate) initialize_queue: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

/// A reactor: a bundle of reactions constructed once, at install time, by
/// [`crate::power_plant::PowerPlant::install`] (§1).
pub trait Reactor: Send + Sync + 'static {
    fn new(env: &Environment) -> Self
    where
        Self: Sized;
}

/// Builds a reaction bound to trigger type `T` (§3, §9 "on" + hook chain).
pub struct ReactionBuilder<'a, T> {
    env: &'a Environment,
    identifiers: Vec<String>,
    priority: i32,
    sync_key: Option<TypeKey>,
    _trigger: std::marker::PhantomData<T>,
}

impl<'a, T: 'static> ReactionBuilder<'a, T> {
    fn new(env: &'a Environment) -> Self {
        ReactionBuilder {
            env,
            identifiers: Vec::new(),
            priority: crate::task::Priority::NORMAL,
            sync_key: None,
            _trigger: std::marker::PhantomData,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn identifier(mut self, id: impl Into<String>) -> Self {
        self.identifiers.push(id.into());
        self
    }

    /// Serialize this reaction against every other reaction sharing the
    /// same sync key `G` (§4.3).
    pub fn sync<G: 'static>(mut self) -> Self {
        self.sync_key = Some(TypeKey::of::<G>());
        self
    }

    /// Bind `handler` to run whenever `T` is emitted. `handler` reads the
    /// current event, if it needs it, via [`crate::bus::with_current`].
    pub fn then(self, handler: impl Fn() + Send + Sync + 'static) -> ReactionHandle {
        let handler = Arc::new(handler);
        let generator: Box<crate::reaction::Generator> = Box::new(move || {
            let handler = Arc::clone(&handler);
            Some(Box::new(move || handler()) as crate::task::Payload)
        });

        let (reschedule, postcondition) = match self.sync_key {
            Some(key) => (
                Some(self.env.sync_groups.reschedule_hook(key)),
                Some(
                    self.env
                        .sync_groups
                        .postcondition_hook(key, Arc::downgrade(&self.env.scheduler)),
                ),
            ),
            None => (None, None),
        };

        let reaction = Reaction::new(
            self.identifiers,
            self.priority,
            self.sync_key,
            None,
            reschedule,
            postcondition,
            generator,
        );

        if TypeKey::of::<T>() == TypeKey::of::<events::ReactionStatistics>() {
            self.env.stats_handlers.lock().unwrap().insert(reaction.id);
        }

        self.env.bus.bind::<T>(Arc::clone(&reaction))
    }
}

impl<'a, T: 'static + Clone> ReactionBuilder<'a, T> {
    /// Like [`Self::then`], but hands the handler an owned copy of the
    /// triggering event (§9 "get" hook). The current-event slot is only
    /// valid for the synchronous duration of the emit call, so the event
    /// is cloned out before the task payload runs on a worker thread.
    pub fn then_with(self, handler: impl Fn(T) + Send + Sync + 'static) -> ReactionHandle {
        let handler = Arc::new(handler);
        let generator: Box<crate::reaction::Generator> = Box::new(move || {
            let handler = Arc::clone(&handler);
            crate::bus::with_current::<T, _>(|event| {
                event.cloned().map(|event| {
                    let handler = Arc::clone(&handler);
                    Box::new(move || handler(event)) as crate::task::Payload
                })
            })
        });

        let (reschedule, postcondition) = match self.sync_key {
            Some(key) => (
                Some(self.env.sync_groups.reschedule_hook(key)),
                Some(
                    self.env
                        .sync_groups
                        .postcondition_hook(key, Arc::downgrade(&self.env.scheduler)),
                ),
            ),
            None => (None, None),
        };

        let reaction = Reaction::new(
            self.identifiers,
            self.priority,
            self.sync_key,
            None,
            reschedule,
            postcondition,
            generator,
        );

        if TypeKey::of::<T>() == TypeKey::of::<events::ReactionStatistics>() {
            self.env.stats_handlers.lock().unwrap().insert(reaction.id);
        }

        self.env.bus.bind::<T>(Arc::clone(&reaction))
    }
}

impl Environment {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        bus: Arc<MessageBus>,
        scheduler: Arc<Scheduler>,
        chrono: Arc<ChronoService>,
        io_poller: Arc<IoPoller>,
        sync_groups: Arc<SyncGroupRegistry>,
        network: Arc<Mutex<Option<Arc<NetworkTransport>>>>,
        stats_handlers: Arc<Mutex<std::collections::HashSet<u64>>>,
        on_task_complete: Arc<dyn Fn(Task) + Send + Sync>,
        started: Arc<std::sync::atomic::AtomicBool>,
        initialize_queue: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
    ) -> Self {
        Environment {
            bus,
            scheduler,
            chrono,
            io_poller,
            sync_groups,
            network,
            stats_handlers,
            on_task_complete,
            started,
            initialize_queue,
        }
    }

    /// Start building a reaction triggered by every emit of `T` (§3).
    pub fn on<T: 'static>(&self) -> ReactionBuilder<'_, T> {
        ReactionBuilder::new(self)
    }

    /// Bind a periodic reaction firing every `period`, chrono-backed
    /// (§4.4). Cancelled by dropping the returned handle.
    pub fn every(
        &self,
        period: Duration,
        priority: i32,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> ReactionHandle {
        let handler = Arc::new(handler);
        let generator: Box<crate::reaction::Generator> = {
            let handler = Arc::clone(&handler);
            Box::new(move || {
                let handler = Arc::clone(&handler);
                Some(Box::new(move || handler()) as crate::task::Payload)
            })
        };
        let reaction = Reaction::new(vec![], priority, None, None, None, None, generator);

        let scheduler = Arc::clone(&self.scheduler);
        let reaction_for_chrono = Arc::clone(&reaction);
        self.chrono.insert(
            std::time::Instant::now() + period,
            Some(period),
            reaction.id,
            Box::new(move |next_fire| {
                if !reaction_for_chrono.is_enabled() {
                    return false;
                }
                if let Some(task) = reaction_for_chrono.generate(scheduler.next_sequence()) {
                    scheduler.submit(task);
                }
                *next_fire += period;
                true
            }),
        );

        ReactionHandle::new(reaction, Box::new(|| {}))
    }

    /// One-shot: emit `value` after `delay` has elapsed (§4.4 "Delay" scope).
    pub fn emit_after<T: 'static + Send>(&self, delay: Duration, value: T) {
        let bus = Arc::clone(&self.bus);
        let scheduler = Arc::clone(&self.scheduler);
        let on_complete = Arc::clone(&self.on_task_complete);
        let pending = Mutex::new(Some(value));
        self.chrono.insert(
            std::time::Instant::now() + delay,
            None,
            0,
            Box::new(move |_next_fire| {
                if let Some(value) = pending.lock().unwrap().take() {
                    bus.emit(value, EmitScope::Local, &scheduler, &*on_complete);
                }
                false
            }),
        );
    }

    /// Bind a reaction fired whenever `fd` becomes ready for `interest`
    /// (§4.5). The handler receives the observed [`Event`].
    pub fn on_io(
        &self,
        fd: RawFd,
        interest: Interest,
        priority: i32,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) -> ReactionHandle {
        let handler = Arc::new(handler);
        let generator: Box<crate::reaction::Generator> = Box::new(move || {
            let handler = Arc::clone(&handler);
            crate::bus::with_current::<Event, _>(|event| {
                event.map(|event| {
                    let event = *event;
                    let handler = Arc::clone(&handler);
                    Box::new(move || handler(event)) as crate::task::Payload
                })
            })
        });

        let reaction = Reaction::new(vec![], priority, None, None, None, None, generator);
        self.io_poller.register(fd, interest, Arc::clone(&reaction));

        let poller = Arc::clone(&self.io_poller);
        let reaction_id = reaction.id;
        ReactionHandle::new(reaction, Box::new(move || poller.unregister(reaction_id)))
    }

    /// Emit `value` of type `T` to every bound reaction (§4.1).
    ///
    /// `EmitScope::Initialize` is intercepted here rather than forwarded to
    /// the bus: before `start()` begins it is queued and replayed (in
    /// order) as `Local` right before the `Startup` event; once `start()`
    /// has already begun, deferral has nothing left to do, so it behaves
    /// like `Local` immediately.
    pub fn emit<T: 'static + Send>(&self, value: T, scope: EmitScope) {
        if matches!(scope, EmitScope::Initialize)
            && !self.started.load(std::sync::atomic::Ordering::Acquire)
        {
            let bus = Arc::clone(&self.bus);
            let scheduler = Arc::clone(&self.scheduler);
            let on_complete = Arc::clone(&self.on_task_complete);
            self.initialize_queue.lock().unwrap().push(Box::new(move || {
                bus.emit(value, EmitScope::Local, &scheduler, &*on_complete);
            }));
            return;
        }
        self.bus
            .emit(value, scope, &self.scheduler, &*self.on_task_complete);
    }

    /// Forward `message` to the `log` facade *and* emit it as a
    /// `LogMessage` event so installed reactors can observe runtime log
    /// traffic (SPEC_FULL.md §A.2).
    pub fn log(&self, level: log::Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "{message}");
        self.emit(
            events::LogMessage {
                level,
                message,
            },
            EmitScope::Local,
        );
    }

    /// Join a network (§4.6): begin announcing over UDP multicast and
    /// accepting TCP side-channel connections.
    pub fn join_network(&self, config: events::NetworkConfiguration) -> Result<()> {
        let callbacks = Arc::new(EnvironmentTransportCallbacks {
            bus: Arc::clone(&self.bus),
            scheduler: Arc::clone(&self.scheduler),
            on_complete: Arc::clone(&self.on_task_complete),
        });
        let transport = NetworkTransport::new(
            NetworkConfig {
                name: config.name,
                multicast_group: config.multicast_group,
                multicast_port: config.multicast_port,
                mtu: config.mtu,
            },
            callbacks,
            Arc::clone(&self.chrono),
        )?;
        *self.network.lock().unwrap() = Some(transport);
        Ok(())
    }

    /// Emit raw bytes identified by `type_hash` over the network (§4.6).
    /// `target` names a specific peer; `None` broadcasts to everyone
    /// currently joined. `reliable` selects the TCP side channel over
    /// fragmented, unreliable UDP.
    pub fn emit_network(
        &self,
        type_hash: u64,
        bytes: &[u8],
        target: Option<&str>,
        reliable: bool,
    ) -> Result<()> {
        let guard = self.network.lock().unwrap();
        let transport = guard
            .as_ref()
            .ok_or_else(|| crate::error::Error::config("no network joined"))?;
        transport.emit(type_hash, bytes, target, reliable)
    }
}

struct EnvironmentTransportCallbacks {
    bus: Arc<MessageBus>,
    scheduler: Arc<Scheduler>,
    on_complete: Arc<dyn Fn(Task) + Send + Sync>,
}

impl TransportCallbacks for EnvironmentTransportCallbacks {
    fn on_packet(&self, peer: PeerInfo, type_hash: u64, payload: Vec<u8>) {
        self.bus.emit(
            events::NetworkPacket {
                peer_name: peer.name,
                peer_address: peer.address,
                type_hash,
                payload,
            },
            EmitScope::Local,
            &self.scheduler,
            &*self.on_complete,
        );
    }

    fn on_join(&self, peer: PeerInfo) {
        self.bus.emit(
            events::NetworkJoin {
                name: peer.name,
                address: peer.address,
                tcp_port: peer.tcp_port,
                udp_port: peer.udp_port,
            },
            EmitScope::Local,
            &self.scheduler,
            &*self.on_complete,
        );
    }

    fn on_leave(&self, peer: PeerInfo) {
        self.bus.emit(
            events::NetworkLeave {
                name: peer.name,
                address: peer.address,
            },
            EmitScope::Local,
            &self.scheduler,
            &*self.on_complete,
        );
    }
}
