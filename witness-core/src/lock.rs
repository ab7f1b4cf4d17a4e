//! A `Mutex` instrumented for lock-order verification.
//!
//! This module's [`Mutex`] wraps a [`parking_lot::Mutex`] together with a
//! [`LockObject`], and tells a shared [`Verifier`] about every acquisition and
//! release, with the caller's source position as the site.
//!
//! Misuse that the verifier treats as fatal, such as locking a mutex the
//! calling thread already holds, panics. Order violations are only reported
//! through the verifier's log and trap.

use std::{
    ops,
    panic::Location,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    class::{AcquireFlags, LockClass, LockFlags},
    error::FatalError,
    object::LockObject,
    site::Site,
    verifier::{Context, Verifier},
};

/// A `Mutex` instrumented for lock-order verification.
///
/// All mutexes created with the same name share one position in the
/// verifier's lock order.
pub struct Mutex<T> {
    inner: parking_lot::Mutex<T>,
    object: LockObject,
    verifier: Arc<Verifier>,
    /// The thread holding `inner`, or 0.
    owner: AtomicU64,
}

/// A guard produced by locking [`Mutex`].
///
/// Dropping it reports the release to the verifier.
pub struct MutexGuard<'a, T> {
    inner: parking_lot::MutexGuard<'a, T>,
    mutex: &'a Mutex<T>,
    cx: Context,
    /// Where the lock was acquired. Releases are reported against it.
    site: Site,
}

impl<T> Mutex<T> {
    /// A blocking mutex named `name`.
    #[track_caller]
    pub fn new(verifier: Arc<Verifier>, name: &str, value: T) -> Mutex<T> {
        Self::with_class(verifier, name, LockClass::SleepMutex, LockFlags::WITNESS, value)
    }

    /// A mutex named `name` that the verifier treats as a lock of `class`.
    ///
    /// # Panics
    ///
    /// If the verifier rejects the lock, for example because `flags` asks
    /// for something `class` doesn't support. Recursion is never supported:
    /// the inner mutex can't be entered twice by one thread.
    #[track_caller]
    pub fn with_class(
        verifier: Arc<Verifier>,
        name: &str,
        class: LockClass,
        flags: LockFlags,
        value: T,
    ) -> Mutex<T> {
        if flags.contains(LockFlags::RECURSABLE) {
            panic!(
                "{}",
                FatalError::InvalidLockFlags {
                    class,
                    name: Arc::from(name),
                    property: "recursable",
                }
            );
        }
        let object = LockObject::new(name, class, flags);
        if let Err(error) = verifier.init(&object) {
            panic!("{error}");
        }
        Mutex {
            inner: parking_lot::Mutex::new(value),
            object,
            verifier,
            owner: AtomicU64::new(0),
        }
    }

    pub fn object(&self) -> &LockObject {
        &self.object
    }

    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let cx = Context::current();
        let site = Site::from(Location::caller());
        if self.owner.load(Ordering::Relaxed) == cx.thread() {
            // Locking `inner` again would never return.
            if let Err(error) = self.verifier.lock(cx, &self.object, AcquireFlags::empty(), site) {
                panic!("{error}");
            }
        }
        let inner = self.inner.lock();
        self.acquired(inner, cx, AcquireFlags::empty(), site)
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let cx = Context::current();
        let site = Site::from(Location::caller());
        let inner = self.inner.try_lock()?;
        Some(self.acquired(inner, cx, AcquireFlags::TRY, site))
    }

    fn acquired<'a>(
        &'a self,
        inner: parking_lot::MutexGuard<'a, T>,
        cx: Context,
        flags: AcquireFlags,
        site: Site,
    ) -> MutexGuard<'a, T> {
        if let Err(error) = self.verifier.lock(cx, &self.object, flags, site) {
            drop(inner);
            panic!("{error}");
        }
        self.owner.store(cx.thread(), Ordering::Relaxed);
        MutexGuard {
            inner,
            mutex: self,
            cx,
            site,
        }
    }
}

impl<T> Drop for Mutex<T> {
    fn drop(&mut self) {
        if let Err(error) = self.verifier.destroy(&self.object) {
            log::error!("witness: {error}");
        }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.owner.store(0, Ordering::Relaxed);
        let result = self
            .mutex
            .verifier
            .unlock(self.cx, &self.mutex.object, self.site);
        if let Err(error) = result {
            if !std::thread::panicking() {
                panic!("{error}");
            }
        }
    }
}

impl<'a, T> ops::Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T> ops::DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("name", self.object.name())
            .field("data", &self.inner)
            .finish()
    }
}
