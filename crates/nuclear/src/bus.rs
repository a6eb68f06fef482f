//! The message bus: binds reactions to type keys and dispatches emits to
//! them (§4.1).
//!
//! The "current event" mechanism described in the design notes'
//! `ThreadStore<T>` abstraction — readable by a generator without being
//! passed as an argument — is implemented here as a small thread-local map
//! keyed by [`TypeKey`], holding a raw pointer for the duration of a single
//! dispatch call. This mirrors how [`crate::object_pool::ObjectPool`]
//! already keys a type-erased map by `TypeId`; the difference is that this
//! one is thread-local and the borrow is scoped to one synchronous call
//! instead of living in a slab.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use crate::reaction::{Reaction, ReactionHandle};
use crate::scheduler::Scheduler;
use crate::type_key::TypeKey;

thread_local! {
    static CURRENT_EVENT: RefCell<HashMap<TypeKey, *const ()>> = RefCell::new(HashMap::new());
}

/// Publish `value` into the thread-local current-event slot for the
/// duration of `f`, then clear it (§4.1 step 1/4).
pub(crate) fn with_event<T: 'static, R>(value: &T, f: impl FnOnce() -> R) -> R {
    let key = TypeKey::of::<T>();
    let ptr = value as *const T as *const ();
    CURRENT_EVENT.with(|c| c.borrow_mut().insert(key, ptr));
    let result = f();
    CURRENT_EVENT.with(|c| {
        c.borrow_mut().remove(&key);
    });
    result
}

/// Read the current thread's published event of type `T`, if any is being
/// dispatched right now. Used inside a reaction's generator closure.
///
/// # Safety contract
/// The pointer stored by [`with_event`] is only valid for the duration of
/// the call it wraps; generators must not stash the `&T` they are handed
/// here past their own synchronous return.
pub fn with_current<T: 'static, R>(f: impl FnOnce(Option<&T>) -> R) -> R {
    let key = TypeKey::of::<T>();
    let ptr = CURRENT_EVENT.with(|c| c.borrow().get(&key).copied());
    // Safety: `ptr`, if present, was installed by `with_event::<T>` which
    // is still executing on this same thread (the only way a slot for
    // `key` can exist), so the referent is alive and of type `T`.
    let value = ptr.map(|p| unsafe { &*(p as *const T) });
    f(value)
}

/// Emit scopes selected per call (§4.1).
///
/// `Delay` and the network scopes (`Network`/`UDP`) are not variants here:
/// they are distinct enough in their inputs (a duration, or a transport
/// target) that a focused method per concern (`Environment::emit_after`,
/// `Environment::emit_network`) reads more clearly than folding them into
/// this enum's match arms. See DESIGN.md.
pub enum EmitScope {
    /// Submit resulting tasks to the scheduler (default).
    Local,
    /// Invoke the generator and run the task inline on the emitting
    /// thread, bypassing the scheduler.
    Direct,
    /// Like `Local`, but deferred until `start()` begins (§4.1). Handled
    /// by [`crate::environment::Environment::emit`], which queues the
    /// emit rather than ever handing this variant to [`MessageBus::emit`].
    Initialize,
}

pub(crate) struct MessageBus {
    registry: DashMap<TypeKey, RwLock<Vec<Arc<Reaction>>>>,
}

impl MessageBus {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MessageBus {
            registry: DashMap::new(),
        })
    }

    /// `bind(trigger_type_key, reaction) -> handle`.
    pub(crate) fn bind<T: 'static>(
        self: &Arc<Self>,
        reaction: Arc<Reaction>,
    ) -> ReactionHandle {
        let key = TypeKey::of::<T>();
        self.registry
            .entry(key)
            .or_insert_with(|| RwLock::new(Vec::new()))
            .write()
            .unwrap()
            .push(Arc::clone(&reaction));

        let bus = Arc::clone(self);
        let id = reaction.id;
        ReactionHandle::new(
            reaction,
            Box::new(move || {
                bus.unbind::<T>(id);
            }),
        )
    }

    fn unbind<T: 'static>(&self, id: u64) {
        let key = TypeKey::of::<T>();
        if let Some(bucket) = self.registry.get(&key) {
            bucket.write().unwrap().retain(|r| r.id != id);
        }
    }

    /// Emit a value to every reaction bound under `type_key(T)` (§4.1).
    ///
    /// A reaction disabled during iteration is skipped implicitly: its
    /// `generate` call checks `enabled` itself and returns `None`. No
    /// registered listeners is a no-op, never an error.
    ///
    /// `on_direct_complete` is invoked for any task run inline under
    /// [`EmitScope::Direct`], mirroring what [`crate::scheduler::Scheduler`]
    /// does for scheduled tasks so `ReactionStatistics` emission (§4.2 P6)
    /// stays consistent across both scopes.
    pub(crate) fn emit<T: 'static>(
        self: &Arc<Self>,
        value: T,
        scope: EmitScope,
        scheduler: &Scheduler,
        on_direct_complete: &(dyn Fn(crate::task::Task) + Send + Sync),
    ) {
        let key = TypeKey::of::<T>();
        // Clone the Arc list out from under the shared lock so that the
        // lock is never held across the user callbacks triggered below
        // (§4.1, §5 "locks are never held across user callbacks").
        let reactions: Vec<Arc<Reaction>> = match self.registry.get(&key) {
            Some(bucket) => bucket.read().unwrap().clone(),
            None => return,
        };

        with_event(&value, || {
            for reaction in &reactions {
                let Some(task) = reaction.generate(scheduler.next_sequence()) else {
                    continue;
                };
                match scope {
                    // `Initialize` is intercepted by `Environment::emit`
                    // before it ever reaches here (§4.1); treat it as
                    // `Local` defensively rather than make this match
                    // partial.
                    EmitScope::Local | EmitScope::Initialize => scheduler.submit(task),
                    EmitScope::Direct => run_inline(task, on_direct_complete),
                }
            }
        });
    }
}

/// Run a task's payload synchronously on the calling thread, bypassing the
/// scheduler entirely (§4.1 Direct scope). Used to install configuration
/// synchronously during start-up.
pub(crate) fn run_inline(
    mut task: crate::task::Task,
    on_complete: &(dyn Fn(crate::task::Task) + Send + Sync),
) {
    if !task.reaction.check_precondition() {
        task.reaction.task_completed();
        return;
    }
    task.stats.started = Some(std::time::Instant::now());
    task.stats.thread = Some(std::thread::current().id());
    if let Some(payload) = task.payload.take() {
        payload();
    }
    task.stats.finished = Some(std::time::Instant::now());
    if let Some(postcondition) = &task.reaction.postcondition {
        postcondition(&task.stats);
    }
    task.reaction.task_completed();
    on_complete(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Msg(i64);

    #[test]
    fn emit_reaches_bound_reaction() {
        let bus = MessageBus::new();
        let scheduler = Scheduler::new(std::num::NonZeroUsize::new(1).unwrap(), |_task| {});

        let seen = Arc::new(AtomicI64::new(-1));
        let seen_clone = Arc::clone(&seen);
        let generator = Box::new(move || {
            seen_clone.store(0, Ordering::SeqCst);
            with_current::<Msg, _>(|m| {
                if let Some(m) = m {
                    seen_clone.store(m.0, Ordering::SeqCst);
                }
            });
            Some(Box::new(|| {}) as crate::task::Payload)
        });
        let reaction = Reaction::new(vec![], 100, None, None, None, None, generator);
        let _handle = bus.bind::<Msg>(reaction);

        bus.emit(Msg(42), EmitScope::Local, &scheduler, &|_task| {});

        // Local scope is async; give the worker a moment.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(seen.load(Ordering::SeqCst), 42);

        scheduler.shutdown();
        scheduler.join();
    }

    #[test]
    fn emit_with_no_listeners_is_a_no_op() {
        let bus = MessageBus::new();
        let scheduler = Scheduler::new(std::num::NonZeroUsize::new(1).unwrap(), |_task| {});
        bus.emit(Msg(1), EmitScope::Local, &scheduler, &|_task| {});
        scheduler.shutdown();
        scheduler.join();
    }
}
