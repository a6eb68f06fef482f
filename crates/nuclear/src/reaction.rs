//! A durable reaction registration (§3) and the six optional DSL hooks
//! described in §9 ("Template fusion layer"): `precondition`, `priority`,
//! `reschedule`, `postcondition` are represented directly as boxed
//! closures on the record; `bind` is install-time-only and so is executed
//! by the caller before the `Reaction` is constructed; `get` is the
//! thread-local event slot in [`crate::bus`], read from inside the
//! generator closure rather than stored here.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::task::{Payload, Task, TaskStatistics};
use crate::type_key::TypeKey;

pub(crate) type Precondition = dyn Fn() -> bool + Send + Sync;
pub(crate) type Reschedule = dyn Fn(Task) -> Option<Task> + Send + Sync;
pub(crate) type Postcondition = dyn Fn(&TaskStatistics) + Send + Sync;
pub(crate) type Generator = dyn Fn() -> Option<Payload> + Send + Sync;

/// A durable subscription: trigger + attributes + callback generator.
///
/// Lifecycle: created at reactor construction (or on the fly); logically
/// destroyed when its [`ReactionHandle`] is dropped/unbound *and* no
/// [`Task`] referencing it is still live — the latter falls naturally out
/// of `Arc<Reaction>` refcounting, since every `Task` holds a strong
/// reference (invariant 2, §3).
pub struct Reaction {
    pub id: u64,
    pub identifiers: Vec<String>,
    enabled: AtomicBool,
    active_tasks: AtomicUsize,
    pub(crate) priority: i32,
    pub(crate) sync_key: Option<TypeKey>,
    pub(crate) precondition: Option<Box<Precondition>>,
    pub(crate) reschedule: Option<Box<Reschedule>>,
    pub(crate) postcondition: Option<Box<Postcondition>>,
    pub(crate) generator: Box<Generator>,
}

impl Reaction {
    pub(crate) fn new(
        identifiers: Vec<String>,
        priority: i32,
        sync_key: Option<TypeKey>,
        precondition: Option<Box<Precondition>>,
        reschedule: Option<Box<Reschedule>>,
        postcondition: Option<Box<Postcondition>>,
        generator: Box<Generator>,
    ) -> Arc<Reaction> {
        Arc::new(Reaction {
            id: crate::unique_id::UniqueId::new().get(),
            identifiers,
            enabled: AtomicBool::new(true),
            active_tasks: AtomicUsize::new(0),
            priority,
            sync_key,
            precondition,
            reschedule,
            postcondition,
            generator,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, value: bool) {
        self.enabled.store(value, Ordering::Release);
    }

    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Acquire)
    }

    pub(crate) fn check_precondition(&self) -> bool {
        match &self.precondition {
            Some(p) => p(),
            None => true,
        }
    }

    /// Invoke the generator if the reaction is enabled. Returns `None` if
    /// disabled or if the generator itself declines (precondition failed).
    pub(crate) fn generate(self: &Arc<Self>, sequence: u64) -> Option<Task> {
        if !self.is_enabled() {
            return None;
        }
        let payload = (self.generator)()?;
        self.active_tasks.fetch_add(1, Ordering::AcqRel);
        Some(Task::new(Arc::clone(self), sequence, payload))
    }

    pub(crate) fn task_completed(&self) {
        self.active_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A handle returned from binding a reaction.
///
/// Dropping the handle (or calling [`ReactionHandle::unbind`] explicitly)
/// disables the reaction and removes it from whatever registries it was
/// bound into. In-flight tasks referencing it via `Arc<Reaction>` still
/// run to completion (§7 propagation policy, P7).
pub struct ReactionHandle {
    reaction: Arc<Reaction>,
    teardown: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ReactionHandle {
    pub(crate) fn new(reaction: Arc<Reaction>, teardown: Box<dyn FnOnce() + Send>) -> Self {
        ReactionHandle {
            reaction,
            teardown: Mutex::new(Some(teardown)),
        }
    }

    pub fn id(&self) -> u64 {
        self.reaction.id
    }

    pub fn reaction(&self) -> &Arc<Reaction> {
        &self.reaction
    }

    /// Unbind this reaction. After this returns, no future emit of its
    /// trigger will produce a new task (P7); tasks already in flight still
    /// run to completion.
    pub fn unbind(&self) {
        self.reaction.set_enabled(false);
        if let Some(teardown) = self.teardown.lock().unwrap().take() {
            teardown();
        }
    }
}

impl Drop for ReactionHandle {
    fn drop(&mut self) {
        self.unbind();
    }
}
