//! One dispatchable execution instance of a [`crate::reaction::Reaction`] (§3).

use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use crate::reaction::Reaction;
use crate::type_key::TypeKey;

/// Documented priority bands (§4.2). Ties within a band are broken FIFO by
/// submission order; nothing stops a reaction from using any other `i32`.
pub struct Priority;

impl Priority {
    pub const REALTIME: i32 = 1000;
    pub const HIGH: i32 = 750;
    pub const NORMAL: i32 = 500;
    pub const LOW: i32 = 250;
    pub const IDLE: i32 = 0;
}

/// Per-task record of what happened, surfaced as a `ReactionStatistics`
/// event after every task (§4.2, §6).
#[derive(Clone, Debug)]
pub struct TaskStatistics {
    pub identifiers: Vec<String>,
    pub reaction_id: u64,
    pub task_id: u64,
    pub started: Option<Instant>,
    pub finished: Option<Instant>,
    pub thread: Option<ThreadId>,
    /// Message captured from a payload that unwound, if any.
    pub exception: Option<String>,
}

impl TaskStatistics {
    pub(crate) fn new(reaction: &Reaction, task_id: u64) -> Self {
        TaskStatistics {
            identifiers: reaction.identifiers.clone(),
            reaction_id: reaction.id,
            task_id,
            started: None,
            finished: None,
            thread: None,
            exception: None,
        }
    }
}

pub(crate) type Payload = Box<dyn FnOnce() + Send>;

/// A single dispatchable instance of a reaction.
///
/// Holds a strong reference to its parent [`Reaction`] so the reaction
/// cannot be finally destroyed while a task referencing it is still live
/// (invariant 2 in §3).
pub struct Task {
    pub(crate) id: u64,
    pub(crate) reaction: Arc<Reaction>,
    pub(crate) priority: i32,
    pub(crate) sync_key: Option<TypeKey>,
    pub(crate) sequence: u64,
    pub(crate) payload: Option<Payload>,
    pub(crate) stats: TaskStatistics,
}

impl Task {
    pub(crate) fn new(
        reaction: Arc<Reaction>,
        sequence: u64,
        payload: Payload,
    ) -> Task {
        let id = crate::unique_id::UniqueId::new().get();
        let stats = TaskStatistics::new(&reaction, id);
        Task {
            id,
            priority: reaction.priority,
            sync_key: reaction.sync_key,
            reaction,
            sequence,
            payload: Some(payload),
            stats,
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn sync_key(&self) -> Option<TypeKey> {
        self.sync_key
    }

    pub fn reaction_id(&self) -> u64 {
        self.reaction.id
    }
}
