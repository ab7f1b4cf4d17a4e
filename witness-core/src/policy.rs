//! Static ordering policy, fixed when a verifier is created.

use crate::class::LockClass;

/// One name in a seed order chain.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OrderEntry {
    pub name: String,
    pub class: LockClass,
}

impl OrderEntry {
    pub fn new(name: impl Into<String>, class: LockClass) -> Self {
        OrderEntry {
            name: name.into(),
            class,
        }
    }
}

/// The tables a verifier is seeded with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Policy {
    /// Chains of names, each to be acquired in the order listed.
    ///
    /// Every non-blockable lock name must appear here: non-blockable locks
    /// are only ever ordered by declaration.
    pub order: Vec<Vec<OrderEntry>>,

    /// Names for which holding two instances at once is expected.
    pub dup_ok: Vec<String>,

    /// Pairs of names whose relative order is never reported, in either
    /// direction.
    pub blessed: Vec<(String, String)>,

    /// A blockable lock that suspension releases and reacquires on its own,
    /// and so is never reported by `about_to_block`.
    pub privileged: Option<String>,
}

impl Policy {
    /// The traditional kernel tables.
    pub fn kernel() -> Self {
        use LockClass as Lc;

        let chain = |entries: &[(&str, LockClass)]| {
            entries
                .iter()
                .map(|&(name, class)| OrderEntry::new(name, class))
                .collect()
        };

        Policy {
            order: vec![
                chain(&[
                    ("Giant", Lc::SleepMutex),
                    ("proctree", Lc::SharedExclusive),
                    ("allproc", Lc::SharedExclusive),
                    ("process lock", Lc::SleepMutex),
                    ("uidinfo hash", Lc::SleepMutex),
                    ("uidinfo struct", Lc::SleepMutex),
                ]),
                chain(&[
                    ("sio", Lc::SpinMutex),
                    ("ng_node", Lc::SpinMutex),
                    ("ng_worklist", Lc::SpinMutex),
                    ("ithread table lock", Lc::SpinMutex),
                    ("ithread list lock", Lc::SpinMutex),
                    ("sched lock", Lc::SpinMutex),
                    ("callout", Lc::SpinMutex),
                    // leaf
                    ("smp rendezvous", Lc::SpinMutex),
                ]),
            ],
            dup_ok: vec!["process lock".to_string()],
            blessed: Vec::new(),
            privileged: Some("Giant".to_string()),
        }
    }

    pub fn is_dup_ok(&self, name: &str) -> bool {
        self.dup_ok.iter().any(|dup| dup == name)
    }

    pub fn is_blessed(&self, a: &str, b: &str) -> bool {
        self.blessed
            .iter()
            .any(|&(ref x, ref y)| (x == a && y == b) || (x == b && y == a))
    }

    pub fn is_privileged(&self, name: &str) -> bool {
        self.privileged.as_deref() == Some(name)
    }
}

#[test]
fn blessing_is_symmetric() {
    let policy = Policy {
        blessed: vec![("a".to_string(), "b".to_string())],
        ..Policy::default()
    };
    assert!(policy.is_blessed("a", "b"));
    assert!(policy.is_blessed("b", "a"));
    assert!(!policy.is_blessed("a", "c"));
}

#[test]
fn kernel_tables() {
    let policy = Policy::kernel();
    assert!(policy.is_dup_ok("process lock"));
    assert!(!policy.is_dup_ok("Giant"));
    assert!(policy.is_privileged("Giant"));
    assert!(policy.order[1].iter().all(|entry| entry.class.is_spin()));
}
