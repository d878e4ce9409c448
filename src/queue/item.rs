use std::collections::HashSet;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("nothing ready")]
    NothingReady,

    #[error("item not found")]
    NotFound,

    #[error("item already exists")]
    AlreadyExists,

    #[error("item not in the required sub-queue")]
    WrongSubQueue,

    #[error("queue closed")]
    Closed,
}

/// Which sub-queue an item currently lives in. Membership defines the
/// queue-level half of a job's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Delay,
    Dependent,
    Ready,
    Run,
    Bury,
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemState::Delay => "delay",
            ItemState::Dependent => "dependent",
            ItemState::Ready => "ready",
            ItemState::Run => "run",
            ItemState::Bury => "bury",
        };
        write!(f, "{}", s)
    }
}

/// Parameters for adding one item to a queue.
#[derive(Debug, Clone)]
pub struct ItemDef<D> {
    pub key: String,
    pub data: D,
    pub priority: u8,
    pub delay: Duration,
    pub ttr: Duration,
    /// Only reservations asking for this group may pop the item. Empty
    /// matches group-less reservations.
    pub reserve_group: String,
    /// Keys of other items that must be removed (completed) before this
    /// item leaves the dependent sub-queue.
    pub dependencies: Vec<String>,
}

impl<D> ItemDef<D> {
    pub fn new(key: impl Into<String>, data: D, priority: u8, ttr: Duration) -> Self {
        Self {
            key: key.into(),
            data,
            priority,
            delay: Duration::ZERO,
            ttr,
            reserve_group: String::new(),
            dependencies: Vec::new(),
        }
    }
}

pub(crate) struct Item<D> {
    pub key: String,
    pub data: D,
    pub priority: u8,
    pub delay: Duration,
    pub ttr: Duration,
    pub reserve_group: String,
    pub state: ItemState,
    /// Insertion sequence; FIFO tie-break within a priority.
    pub seq: u64,
    /// When a delayed item becomes ready.
    pub ready_at: Option<Instant>,
    /// When a reserved item's TTR runs out.
    pub expires_at: Option<Instant>,
    /// Dependency keys not yet resolved.
    pub outstanding_deps: HashSet<String>,
}

impl<D: Clone> Item<D> {
    pub fn snapshot(&self) -> ItemSnapshot<D> {
        ItemSnapshot {
            key: self.key.clone(),
            data: self.data.clone(),
            state: self.state,
            priority: self.priority,
            reserve_group: self.reserve_group.clone(),
        }
    }
}

/// A point-in-time copy of an item's queue-visible fields, returned by
/// every queue operation that yields items.
#[derive(Debug, Clone)]
pub struct ItemSnapshot<D> {
    pub key: String,
    pub data: D,
    pub state: ItemState,
    pub priority: u8,
    pub reserve_group: String,
}
