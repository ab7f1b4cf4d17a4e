//! Fixed-capacity, freelist-backed storage.
//!
//! Every node the verifier works with (witnesses, child-edge chunks and
//! held-lock chunks) lives in a [`Pool`]. A pool is sized once, when the
//! verifier is created, and never grows: [`Pool::acquire`] hands out the
//! index of a vacant slot, and [`Pool::release`] returns it to the freelist.
//! Structures refer to pool entries by [`Handle`], never by reference, so an
//! entry's "ownership" only ever moves between a live structure and the
//! freelist.
//!
//! Running out of slots is not a bug: [`Pool::acquire`] returns
//! [`Exhausted`], and the verifier responds by switching itself off.

use std::{cmp::Ordering, fmt, hash, marker::PhantomData, ops};

/// The index of a slot in a pool.
pub type Index = u32;

/// A strongly typed index of a [`Pool`] entry.
pub struct Handle<T> {
    index: Index,
    marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "[{}]", self.index)
    }
}

impl<T> hash::Hash for Handle<T> {
    fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
        self.index.hash(hasher)
    }
}

impl<T> Handle<T> {
    const fn new(index: Index) -> Self {
        Handle {
            index,
            marker: PhantomData,
        }
    }

    /// Returns the index of this handle.
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

/// A pool ran out of free slots.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
#[error("{kind} pool exhausted ({capacity} entries)")]
pub struct Exhausted {
    pub kind: &'static str,
    pub capacity: usize,
}

/// An entry in a `Pool::slots` table.
#[derive(Debug)]
enum Slot<T> {
    /// On the freelist.
    Vacant,

    /// Handed out by `acquire` and not yet released.
    Occupied(T),
}

/// A fixed-capacity table of `T` values indexed by [`Handle<T>`].
///
/// Both [`acquire`] and [`release`] are O(1). The pool prefers recently
/// released slots, so the set of touched slots stays small.
///
/// [`acquire`]: Pool::acquire
/// [`release`]: Pool::release
#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<Index>,
    kind: &'static str,
    high_water: usize,
}

impl<T> Pool<T> {
    /// Create a pool of `capacity` vacant slots.
    ///
    /// `kind` names the pool in diagnostics.
    pub fn with_capacity(kind: &'static str, capacity: usize) -> Self {
        let capacity = capacity.min(Index::MAX as usize);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Vacant);
        Self {
            slots,
            // Pop order hands out low indices first.
            free: (0..capacity as Index).rev().collect(),
            kind,
            high_water: 0,
        }
    }

    /// Take a vacant slot off the freelist and store `value` in it.
    pub fn acquire(&mut self, value: T) -> Result<Handle<T>, Exhausted> {
        let index = self.free.pop().ok_or(Exhausted {
            kind: self.kind,
            capacity: self.slots.len(),
        })?;
        self.slots[index as usize] = Slot::Occupied(value);
        self.high_water = self.high_water.max(self.in_use());
        Ok(Handle::new(index))
    }

    /// Return `handle`'s slot to the freelist, handing back its value.
    pub fn release(&mut self, handle: Handle<T>) -> T {
        match std::mem::replace(&mut self.slots[handle.index()], Slot::Vacant) {
            Slot::Occupied(value) => {
                self.free.push(handle.index);
                value
            }
            Slot::Vacant => panic!("{}[{}] released twice", self.kind, handle.index),
        }
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index()) {
            Some(&Slot::Occupied(ref value)) => Some(value),
            Some(&Slot::Vacant) | None => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index()) {
            Some(&mut Slot::Occupied(ref mut value)) => Some(value),
            Some(&mut Slot::Vacant) | None => None,
        }
    }

    /// Iterate over every occupied slot, in index order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match *slot {
                Slot::Occupied(ref value) => Some((Handle::new(index as Index), value)),
                Slot::Vacant => None,
            })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// The largest number of slots that were ever in use at once.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn report(&self) -> PoolReport {
        PoolReport {
            kind: self.kind,
            capacity: self.capacity(),
            in_use: self.in_use(),
            high_water: self.high_water,
        }
    }
}

impl<T> ops::Index<Handle<T>> for Pool<T> {
    type Output = T;
    fn index(&self, handle: Handle<T>) -> &T {
        match self.get(handle) {
            Some(value) => value,
            None => panic!("{}[{}] does not exist", self.kind, handle.index),
        }
    }
}

impl<T> ops::IndexMut<Handle<T>> for Pool<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        let kind = self.kind;
        match self.get_mut(handle) {
            Some(value) => value,
            None => panic!("{}[{}] does not exist", kind, handle.index),
        }
    }
}

/// Occupancy of one pool, for [`Stats`](crate::Stats).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub kind: &'static str,
    pub capacity: usize,
    pub in_use: usize,
    pub high_water: usize,
}

#[test]
fn acquire_release_reuses_slots() {
    let mut pool = Pool::with_capacity("test", 2);
    let a = pool.acquire('a').unwrap();
    let b = pool.acquire('b').unwrap();
    assert_eq!((a.index(), b.index()), (0, 1));
    assert_eq!(pool.in_use(), 2);

    assert_eq!(pool.release(a), 'a');
    assert!(pool.get(a).is_none());
    let c = pool.acquire('c').unwrap();
    assert_eq!(c, a);
    assert_eq!(pool[c], 'c');
    assert_eq!(pool.high_water(), 2);
}

#[test]
fn exhaustion_is_an_error() {
    let mut pool = Pool::with_capacity("witness", 1);
    pool.acquire(()).unwrap();
    assert_eq!(
        pool.acquire(()),
        Err(Exhausted {
            kind: "witness",
            capacity: 1
        })
    );
    assert_eq!(
        pool.acquire(()).unwrap_err().to_string(),
        "witness pool exhausted (1 entries)"
    );
}

#[test]
#[should_panic(expected = "released twice")]
fn double_release_panics() {
    let mut pool = Pool::with_capacity("test", 1);
    let h = pool.acquire(0u8).unwrap();
    pool.release(h);
    pool.release(h);
}
