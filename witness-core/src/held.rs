//! Per-context lists of held locks.
//!
//! Each thread has one [`LockList`] for the blockable locks it holds, and each
//! processor has one for the non-blockable locks held on it. A list is a chain
//! of [`LockListChunk`]s from a shared pool; the newest chunk is at the head,
//! and within a chunk newer entries come later.

use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::{
    class::{LockClass, LockFlags},
    graph::WitnessHandle,
    object::ObjectId,
    pool::{Exhausted, Handle, Pool},
    site::Site,
};

/// The number of entries held inline in one [`LockListChunk`].
pub(crate) const LOCK_NCHILDREN: usize = 3;

type ChunkHandle = Handle<LockListChunk>;

/// One held lock.
#[derive(Clone, Debug)]
pub(crate) struct HeldLock {
    pub object: ObjectId,
    pub witness: WitnessHandle,
    pub name: Arc<str>,
    pub class: LockClass,
    pub flags: LockFlags,
    /// Where the lock was acquired.
    pub site: Site,
}

#[derive(Debug)]
pub(crate) struct LockListChunk {
    next: Option<ChunkHandle>,
    locks: ArrayVec<HeldLock, LOCK_NCHILDREN>,
}

/// The locks one context holds, most recently acquired first.
#[derive(Debug, Default)]
pub(crate) struct LockList {
    head: Option<ChunkHandle>,
}

impl LockList {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// The most recently acquired lock still held.
    pub fn top<'a>(&self, pool: &'a Pool<LockListChunk>) -> Option<&'a HeldLock> {
        pool[self.head?].locks.last()
    }

    /// Iterate over the held locks, most recently acquired first.
    pub fn iter<'a>(&self, pool: &'a Pool<LockListChunk>) -> Iter<'a> {
        Iter {
            pool,
            chunk: self.head,
            remaining: self.head.map_or(0, |head| pool[head].locks.len()),
        }
    }

    pub fn push(
        &mut self,
        pool: &mut Pool<LockListChunk>,
        lock: HeldLock,
    ) -> Result<(), Exhausted> {
        if let Some(head) = self.head {
            let chunk = &mut pool[head];
            if !chunk.locks.is_full() {
                chunk.locks.push(lock);
                return Ok(());
            }
        }
        let mut locks = ArrayVec::new();
        locks.push(lock);
        self.head = Some(pool.acquire(LockListChunk {
            next: self.head,
            locks,
        })?);
        Ok(())
    }

    /// Remove the entry for `object`, wherever it is in the list.
    ///
    /// Later entries in the same chunk shift down to keep acquisition order.
    pub fn remove(
        &mut self,
        pool: &mut Pool<LockListChunk>,
        object: ObjectId,
    ) -> Option<HeldLock> {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let chunk = &mut pool[handle];
            if let Some(position) = chunk.locks.iter().position(|held| held.object == object) {
                let held = chunk.locks.remove(position);
                if chunk.locks.is_empty() {
                    let next = chunk.next;
                    match prev {
                        Some(prev) => pool[prev].next = next,
                        None => self.head = next,
                    }
                    pool.release(handle);
                }
                return Some(held);
            }
            prev = Some(handle);
            cursor = chunk.next;
        }
        None
    }

    pub fn find_mut<'a>(
        &self,
        pool: &'a mut Pool<LockListChunk>,
        object: ObjectId,
    ) -> Option<&'a mut HeldLock> {
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let position = pool[handle]
                .locks
                .iter()
                .position(|held| held.object == object);
            match position {
                Some(position) => return Some(&mut pool[handle].locks[position]),
                None => cursor = pool[handle].next,
            }
        }
        None
    }
}

/// Iterator over a [`LockList`], most recently acquired first.
pub(crate) struct Iter<'a> {
    pool: &'a Pool<LockListChunk>,
    chunk: Option<ChunkHandle>,
    /// Entries of `chunk` not yet returned.
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a HeldLock;

    fn next(&mut self) -> Option<&'a HeldLock> {
        let pool = self.pool;
        loop {
            let chunk = &pool[self.chunk?];
            if self.remaining > 0 {
                self.remaining -= 1;
                return Some(&chunk.locks[self.remaining]);
            }
            self.chunk = chunk.next;
            self.remaining = self.chunk.map_or(0, |next| pool[next].locks.len());
        }
    }
}
