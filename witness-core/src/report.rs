//! Policy violations, and where they go.
//!
//! Violations are never returned to the code that acquired the lock. The
//! verifier logs each one at `warn` level and then hands it to the
//! configured [`Trap`], if any.

use std::{fmt, sync::Arc};

use crate::{class::LockClass, object::ObjectId, site::Site};

/// A lock named in a [`Violation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    /// The instance, if a particular held instance is meant. `None` when
    /// only the lock name is known.
    pub object: Option<ObjectId>,
    pub name: Arc<str>,
    pub site: Option<Site>,
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object {
            Some(object) => write!(f, "{object} {}", self.name)?,
            None => write!(f, "{} last acquired", self.name)?,
        }
        match self.site {
            Some(site) => write!(f, " @ {site}"),
            None => f.write_str(" @ (unknown)"),
        }
    }
}

/// A detected violation of the lock order policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// A lock was acquired while holding one that, by the learned order,
    /// must be acquired after it.
    Reversal {
        /// The earlier acquisition of the lock now being acquired, if one
        /// is still held; otherwise its name and last acquisition site.
        first: LockRecord,
        /// The held lock that should have come later.
        second: LockRecord,
        /// The acquisition that completed the cycle.
        third: LockRecord,
    },
    /// A second lock with the same name was acquired right after the first.
    Duplicate {
        name: Arc<str>,
        first: Option<Site>,
        second: Site,
    },
    /// A blockable lock was acquired while a non-blockable one is held.
    BlockableUnderSpin {
        class: LockClass,
        name: Arc<str>,
        site: Site,
    },
    /// The context is about to suspend, or could, while holding a lock that
    /// must not be held across a suspension.
    Sleeping {
        /// The suspension was only possible, not actual.
        check_only: bool,
        site: Site,
        name: Arc<str>,
        held_site: Option<Site>,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Violation::Reversal {
                ref first,
                ref second,
                ref third,
            } => {
                writeln!(f, "lock order reversal")?;
                writeln!(f, " 1st {first}")?;
                writeln!(f, " 2nd {second}")?;
                write!(f, " 3rd {third}")
            }
            Violation::Duplicate {
                ref name,
                first,
                second,
            } => {
                writeln!(f, "acquiring duplicate lock of same type: \"{name}\"")?;
                match first {
                    Some(first) => writeln!(f, " 1st @ {first}")?,
                    None => writeln!(f, " 1st @ (unknown)")?,
                }
                write!(f, " 2nd @ {second}")
            }
            Violation::BlockableUnderSpin {
                class,
                ref name,
                site,
            } => write!(f, "blockable sleep lock ({class}) {name} @ {site}"),
            Violation::Sleeping {
                check_only,
                site,
                ref name,
                held_site,
            } => {
                let verb = if check_only { "could sleep" } else { "sleeping" };
                write!(f, "{site}: {verb} with \"{name}\" locked from ")?;
                match held_site {
                    Some(held_site) => write!(f, "{held_site}"),
                    None => f.write_str("(unknown)"),
                }
            }
        }
    }
}

/// Entered after each violation is logged.
///
/// The verifier never holds its own lock while calling a trap, so a trap may
/// query the verifier.
pub trait Trap: Send + Sync {
    fn enter(&self, violation: &Violation);
}

impl<F> Trap for F
where
    F: Fn(&Violation) + Send + Sync,
{
    fn enter(&self, violation: &Violation) {
        self(violation)
    }
}

/// A [`Trap`] that keeps every violation it is given.
#[derive(Debug, Default)]
pub struct Recorder {
    violations: parking_lot::Mutex<Vec<Violation>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<Violation> {
        std::mem::take(&mut *self.violations.lock())
    }
}

impl Trap for Recorder {
    fn enter(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

#[test]
fn classic_wording() {
    let name: Arc<str> = Arc::from("vm page queue");
    let duplicate = Violation::Duplicate {
        name: name.clone(),
        first: Some(Site::new("vm_page.c", 10)),
        second: Site::new("vm_page.c", 20),
    };
    assert_eq!(
        duplicate.to_string(),
        "acquiring duplicate lock of same type: \"vm page queue\"\n \
         1st @ vm_page.c:10\n \
         2nd @ vm_page.c:20"
    );

    let sleeping = Violation::Sleeping {
        check_only: true,
        site: Site::new("kern_synch.c", 5),
        name,
        held_site: Some(Site::new("vm_page.c", 10)),
    };
    assert_eq!(
        sleeping.to_string(),
        "kern_synch.c:5: could sleep with \"vm page queue\" locked from vm_page.c:10"
    );
}
