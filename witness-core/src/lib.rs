/*! A runtime lock-order verifier.
 *
 *  A [`Verifier`] watches lock acquisitions and releases across all the
 *  execution contexts of a program, learns the order in which locks are
 *  taken, and reports acquisitions that contradict that order before they
 *  can deadlock. Locks are grouped by name: every lock named
 *  "process lock" shares one place in the order.
 *
 *  Lock primitives report to the verifier through a [`LockObject`] embedded
 *  in each lock. [`lock::Mutex`] is such a primitive.
 */

#![allow(
    // It is much clearer to assert negative conditions with eq! false
    clippy::bool_assert_comparison,
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // Need many arguments for some core functions to be able to re-use code in many situations.
    clippy::too_many_arguments,
    // Clashes with clippy::pattern_type_mismatch
    clippy::needless_borrowed_reference,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

pub mod class;
pub mod config;
mod display;
pub mod error;
mod graph;
mod hash_utils;
mod held;
pub mod lock;
mod object;
pub mod policy;
pub mod pool;
pub mod report;
mod site;
mod verifier;

pub use class::{AcquireFlags, ClassFlags, LockClass, LockFlags, Partition};
pub use config::{Capacity, VerifierConfig};
pub use display::{HeldLockInfo, LockListing};
pub use error::{Degraded, Error, FatalError};
pub use object::{LockObject, ObjectId};
pub use policy::{OrderEntry, Policy};
pub use pool::{Exhausted, PoolReport};
pub use report::{LockRecord, Recorder, Trap, Violation};
pub use site::Site;
pub use verifier::{Context, Stats, Verifier};
