//! Lock classes and per-lock flags.
//!
//! A [`LockClass`] describes the *kind* of primitive a lock is: whether its
//! holder may block, whether it can be recursed on, and whether it may be held
//! across a voluntary suspension. Every lock instance names exactly one class
//! when it is initialized, and every lock name is bound to the class it was
//! first enrolled with.

use std::fmt;

bitflags::bitflags! {
    /// Capabilities of a [`LockClass`].
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ClassFlags: u32 {
        /// Blockable: the thread waiting for the lock may be suspended.
        const SLEEPLOCK = 1 << 0;
        /// Non-blockable: waiters spin, holders must not suspend.
        const SPINLOCK = 1 << 1;
        /// Locks of this class may be acquired recursively.
        const RECURSABLE = 1 << 2;
        /// Locks of this class may be held while the holder suspends.
        const SLEEPABLE = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Options chosen for one lock instance when it is initialized.
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[cfg_attr(feature = "serde", serde(transparent))]
    pub struct LockFlags: u32 {
        /// Check this lock's ordering. Locks without it are unwatched.
        const WITNESS = 1 << 0;
        /// Allow recursive acquisition. The class must be recursable.
        const RECURSABLE = 1 << 1;
        /// Allow holding across a suspension. The class must be sleepable.
        const SLEEPABLE = 1 << 2;
        /// Don't log routine activity for this lock.
        const QUIET = 1 << 3;
    }
}

impl Default for LockFlags {
    fn default() -> Self {
        LockFlags::WITNESS
    }
}

bitflags::bitflags! {
    /// Options for a single acquisition.
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct AcquireFlags: u32 {
        /// The acquisition was a successful try-lock. It could not have
        /// blocked, so it is recorded but not order-checked.
        const TRY = 1 << 0;
    }
}

/// The kind of primitive a lock is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LockClass {
    /// A blocking mutex.
    SleepMutex,
    /// A spinning mutex.
    SpinMutex,
    /// A shared/exclusive lock whose holders may sleep.
    SharedExclusive,
}

impl LockClass {
    /// The class' name tag, as shown in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            LockClass::SleepMutex => "sleep mutex",
            LockClass::SpinMutex => "spin mutex",
            LockClass::SharedExclusive => "sx",
        }
    }

    pub const fn flags(self) -> ClassFlags {
        match self {
            LockClass::SleepMutex => ClassFlags::SLEEPLOCK.union(ClassFlags::RECURSABLE),
            LockClass::SpinMutex => ClassFlags::SPINLOCK.union(ClassFlags::RECURSABLE),
            LockClass::SharedExclusive => ClassFlags::SLEEPLOCK.union(ClassFlags::SLEEPABLE),
        }
    }

    /// Which half of the order graph witnesses of this class live in.
    pub fn partition(self) -> Partition {
        if self.flags().contains(ClassFlags::SPINLOCK) {
            Partition::NonBlockable
        } else {
            Partition::Blockable
        }
    }

    pub fn is_spin(self) -> bool {
        self.partition() == Partition::NonBlockable
    }

    /// Check `flags` against what this class permits.
    ///
    /// Return the name of the first property the class doesn't support.
    pub fn check_flags(self, flags: LockFlags) -> Result<(), &'static str> {
        let class = self.flags();
        if flags.contains(LockFlags::RECURSABLE) && !class.contains(ClassFlags::RECURSABLE) {
            return Err("recursable");
        }
        if flags.contains(LockFlags::SLEEPABLE) && !class.contains(ClassFlags::SLEEPABLE) {
            return Err("sleepable");
        }
        Ok(())
    }
}

impl fmt::Display for LockClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The two disjoint halves of the order graph.
///
/// Order relations only ever connect witnesses of the same partition, and
/// each context keeps a separate held-lock stack per partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Partition {
    Blockable,
    NonBlockable,
}

#[test]
fn class_flags_are_checked() {
    assert_eq!(
        LockClass::SleepMutex.check_flags(LockFlags::WITNESS | LockFlags::RECURSABLE),
        Ok(())
    );
    assert_eq!(
        LockClass::SleepMutex.check_flags(LockFlags::SLEEPABLE),
        Err("sleepable")
    );
    assert_eq!(
        LockClass::SharedExclusive.check_flags(LockFlags::RECURSABLE),
        Err("recursable")
    );
    assert!(LockClass::SpinMutex.is_spin());
    assert_eq!(LockClass::SharedExclusive.partition(), Partition::Blockable);
}
