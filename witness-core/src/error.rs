use std::sync::Arc;

use thiserror::Error;

use crate::{class::LockClass, pool::Exhausted, site::Site};

/// A usage error that means the protected system is already broken.
///
/// There is no safe way to continue after one of these: the lock primitive
/// that received it is expected to stop the process.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("lock ({class}) {name} is already initialized")]
    AlreadyInitialized { class: LockClass, name: Arc<str> },
    #[error("lock ({class}) {name} is not initialized")]
    NotInitialized { class: LockClass, name: Arc<str> },
    #[error("lock ({class}) {name} used after it was destroyed")]
    UseAfterDestroy { class: LockClass, name: Arc<str> },
    #[error("lock ({class}) {name} destroyed while held")]
    DestroyedWhileHeld { class: LockClass, name: Arc<str> },
    #[error("lock ({class}) {name} can not be {property}")]
    InvalidLockFlags {
        class: LockClass,
        name: Arc<str>,
        property: &'static str,
    },
    #[error("recursed on non-recursive lock ({class}) {name} @ {site}")]
    RecursedNonRecursable {
        class: LockClass,
        name: Arc<str>,
        site: Site,
    },
    #[error("lock ({class}) {name} released @ {site} but not held")]
    ReleaseNotHeld {
        class: LockClass,
        name: Arc<str>,
        site: Site,
    },
    #[error("lock ({class}) {name} does not match earlier ({earlier}) lock")]
    InconsistentLockClass {
        name: Arc<str>,
        class: LockClass,
        earlier: LockClass,
    },
    #[error("parent ({parent}) and child ({child}) are not the same lock type")]
    MixedLockDomain { parent: Arc<str>, child: Arc<str> },
    #[error("spin lock {name} not in order list")]
    UnorderedLockClass { name: Arc<str> },
    #[error("context names processor {cpu}, but only {count} are configured")]
    UnknownCpu { cpu: usize, count: usize },
}

/// A condition that makes the verifier stop checking, without affecting the
/// locks it was checking.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Degraded {
    #[error(transparent)]
    Exhausted(#[from] Exhausted),
    #[error("order graph deeper than {limit} levels below {from}")]
    GraphTooDeep { from: Arc<str>, limit: usize },
}

/// The result of an internal verifier operation that failed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error(transparent)]
    Degraded(#[from] Degraded),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(*self, Error::Fatal(_))
    }
}

impl From<Exhausted> for Error {
    fn from(exhausted: Exhausted) -> Self {
        Error::Degraded(Degraded::Exhausted(exhausted))
    }
}
