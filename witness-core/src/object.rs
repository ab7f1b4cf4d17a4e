//! Lock instances, as seen by the verifier.
//!
//! A [`LockObject`] is embedded in each lock primitive that wants to be
//! checked. The primitive owns it; the verifier only reads and updates the
//! bookkeeping inside it when the primitive reports activity through
//! [`Verifier`](crate::Verifier).

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    class::{LockClass, LockFlags},
    graph::WitnessHandle,
    site::Site,
};

/// The identity of one lock instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ObjectId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a lock instance is in its life cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Created, but not yet passed to `Verifier::init`.
    Uninitialized,
    Unlocked,
    /// Held. `recursion` counts acquisitions beyond the first.
    Locked { recursion: u32 },
    Destroyed,
}

#[derive(Debug)]
pub(crate) struct ObjectState {
    pub phase: Phase,
    /// `None` for unwatched locks, and for locks initialized after the
    /// verifier switched itself off.
    pub witness: Option<WitnessHandle>,
    /// Where the lock was most recently acquired.
    pub site: Option<Site>,
}

/// The verifier's view of one lock instance.
pub struct LockObject {
    id: ObjectId,
    name: Arc<str>,
    class: LockClass,
    flags: LockFlags,
    pub(crate) state: parking_lot::Mutex<ObjectState>,
}

impl LockObject {
    /// Describe a lock named `name` of class `class`.
    ///
    /// All locks with the same name share one position in the lock order.
    /// The lock must still be passed to [`Verifier::init`] before use.
    ///
    /// [`Verifier::init`]: crate::Verifier::init
    pub fn new(name: impl Into<Arc<str>>, class: LockClass, flags: LockFlags) -> Self {
        LockObject {
            id: ObjectId::next(),
            name: name.into(),
            class,
            flags,
            state: parking_lot::Mutex::new(ObjectState {
                phase: Phase::Uninitialized,
                witness: None,
                site: None,
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn class(&self) -> LockClass {
        self.class
    }

    pub fn flags(&self) -> LockFlags {
        self.flags
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Locked { .. })
    }

    /// The number of recursive acquisitions beyond the first.
    pub fn recursion(&self) -> u32 {
        match self.state.lock().phase {
            Phase::Locked { recursion } => recursion,
            _ => 0,
        }
    }

    /// Whether the verifier is checking this lock's ordering.
    pub fn is_watched(&self) -> bool {
        self.state.lock().witness.is_some()
    }

    /// Where this lock was most recently acquired.
    pub fn site(&self) -> Option<Site> {
        self.state.lock().site
    }
}

impl fmt::Debug for LockObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockObject")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("class", &self.class)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
