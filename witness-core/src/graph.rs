//! The witness registry and lock order graph.
//!
//! There is one [`Witness`] per distinct lock name. Witnesses are nodes of a
//! directed acyclic graph: an edge from `parent` to `child` records that a lock
//! named `parent` may be held while a lock named `child` is acquired. Edges
//! come from the seed order list and from acquisition sequences actually
//! observed at run time.
//!
//! The graph is kept *pruned*: whenever an edge is added, every direct edge
//! that is also implied by a longer path is removed. The relation "`a` must be
//! acquired before `b`" is reachability, so pruning loses no information; it
//! only keeps the child lists short.
//!
//! The graph is split into two partitions, one for blockable locks and one
//! for non-blockable locks. No edge crosses between them.
//!
//! All storage comes from two fixed-capacity [`Pool`]s, one of witnesses and
//! one of [`ChildChunk`]s.

use std::sync::Arc;

use arrayvec::ArrayVec;
use bit_set::BitSet;

use crate::{
    class::{LockClass, Partition},
    error::{Degraded, Error, FatalError},
    hash_utils::{self, FastHashMap},
    pool::{Exhausted, Handle, Pool, PoolReport},
    site::Site,
};

/// The number of child references held inline in one [`ChildChunk`].
pub(crate) const WITNESS_NCHILDREN: usize = 6;

pub(crate) type WitnessHandle = Handle<Witness>;
type ChunkHandle = Handle<ChildChunk>;

/// The registry node for one lock name.
#[derive(Debug)]
pub(crate) struct Witness {
    pub name: Arc<str>,
    pub class: LockClass,

    /// First chunk of this witness' child list.
    children: Option<ChunkHandle>,

    /// Where a lock with this name was most recently acquired, or `None` if
    /// no such lock ever has been.
    pub site: Option<Site>,

    /// The length of the longest path from a root to this witness.
    ///
    /// Only valid right after [`Graph::assign_levels`].
    pub level: u32,

    /// The number of live lock instances bound to this witness.
    pub refcount: u32,
}

impl Witness {
    /// A witness with no live locks left.
    ///
    /// Retired witnesses keep their place in the graph, since the name may
    /// well be used again.
    pub fn is_retired(&self) -> bool {
        self.refcount == 0
    }
}

/// A fixed-size piece of a witness' child list.
#[derive(Debug)]
pub(crate) struct ChildChunk {
    next: Option<ChunkHandle>,
    children: ArrayVec<WitnessHandle, WITNESS_NCHILDREN>,
}

/// Iterator over the children of one witness.
pub(crate) struct Children<'a> {
    chunks: &'a Pool<ChildChunk>,
    chunk: Option<ChunkHandle>,
    index: usize,
}

impl<'a> Children<'a> {
    fn new(chunks: &'a Pool<ChildChunk>, first: Option<ChunkHandle>) -> Self {
        Children {
            chunks,
            chunk: first,
            index: 0,
        }
    }
}

impl Iterator for Children<'_> {
    type Item = WitnessHandle;

    fn next(&mut self) -> Option<WitnessHandle> {
        let chunks = self.chunks;
        loop {
            let chunk = &chunks[self.chunk?];
            if let Some(&child) = chunk.children.get(self.index) {
                self.index += 1;
                return Some(child);
            }
            self.chunk = chunk.next;
            self.index = 0;
        }
    }
}

/// The witness registry and the order graph over it.
#[derive(Debug)]
pub(crate) struct Graph {
    witnesses: Pool<Witness>,
    chunks: Pool<ChildChunk>,

    by_name: FastHashMap<Arc<str>, WitnessHandle>,

    /// Every witness, in enrollment order.
    all: Vec<WitnessHandle>,
    blockable: Vec<WitnessHandle>,
    non_blockable: Vec<WitnessHandle>,

    /// Traversal scratch space, kept so that queries don't allocate.
    marks: BitSet,
    stack: Vec<(WitnessHandle, usize)>,

    /// No path in the graph can be longer than this.
    depth_limit: usize,
}

impl Graph {
    pub fn new(witness_capacity: usize, chunk_capacity: usize) -> Self {
        Graph {
            witnesses: Pool::with_capacity("witness", witness_capacity),
            chunks: Pool::with_capacity("witness child", chunk_capacity),
            by_name: hash_utils::map_with_capacity(witness_capacity),
            all: Vec::with_capacity(witness_capacity),
            blockable: Vec::with_capacity(witness_capacity),
            non_blockable: Vec::with_capacity(witness_capacity),
            marks: BitSet::with_capacity(witness_capacity),
            stack: Vec::with_capacity(witness_capacity),
            depth_limit: witness_capacity,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<WitnessHandle> {
        self.by_name.get(name).copied()
    }

    pub fn witness(&self, handle: WitnessHandle) -> &Witness {
        &self.witnesses[handle]
    }

    pub fn witness_mut(&mut self, handle: WitnessHandle) -> &mut Witness {
        &mut self.witnesses[handle]
    }

    /// Every witness, in enrollment order.
    pub fn all(&self) -> &[WitnessHandle] {
        &self.all
    }

    /// The witnesses of one partition, in enrollment order.
    pub fn partition(&self, partition: Partition) -> &[WitnessHandle] {
        match partition {
            Partition::Blockable => &self.blockable,
            Partition::NonBlockable => &self.non_blockable,
        }
    }

    pub fn children(&self, parent: WitnessHandle) -> Children<'_> {
        Children::new(&self.chunks, self.witnesses[parent].children)
    }

    /// Find or create the witness for `name`, and count one more live lock
    /// bound to it.
    ///
    /// While `cold` is false, a non-blockable name must already be known:
    /// those only get witnesses from the seed order list.
    pub fn enroll(
        &mut self,
        name: &Arc<str>,
        class: LockClass,
        cold: bool,
    ) -> Result<WitnessHandle, Error> {
        if let Some(handle) = self.lookup(name) {
            let witness = &mut self.witnesses[handle];
            if witness.class != class {
                return Err(FatalError::InconsistentLockClass {
                    name: name.clone(),
                    class,
                    earlier: witness.class,
                }
                .into());
            }
            witness.refcount += 1;
            return Ok(handle);
        }

        if class.is_spin() && !cold {
            return Err(FatalError::UnorderedLockClass { name: name.clone() }.into());
        }

        let handle = self.witnesses.acquire(Witness {
            name: name.clone(),
            class,
            children: None,
            site: None,
            level: 0,
            refcount: 1,
        })?;
        self.by_name.insert(name.clone(), handle);
        self.all.push(handle);
        match class.partition() {
            Partition::Blockable => self.blockable.push(handle),
            Partition::NonBlockable => self.non_blockable.push(handle),
        }
        Ok(handle)
    }

    /// Drop one live reference to `handle`.
    ///
    /// Return `true` if that retired the witness.
    pub fn release(&mut self, handle: WitnessHandle) -> bool {
        let witness = &mut self.witnesses[handle];
        witness.refcount = witness.refcount.saturating_sub(1);
        witness.is_retired()
    }

    pub fn is_child(&self, parent: WitnessHandle, child: WitnessHandle) -> bool {
        self.children(parent).any(|c| c == child)
    }

    /// Is there a path from `ancestor` down to `descendant`?
    ///
    /// This is an iterative depth-first search that visits each witness at
    /// most once. Finding a path back to `ancestor` means the graph has a
    /// cycle, and so no depth at which the search could stop; that internal
    /// inconsistency is reported as [`Degraded::GraphTooDeep`].
    pub fn reachable(
        &mut self,
        ancestor: WitnessHandle,
        descendant: WitnessHandle,
    ) -> Result<bool, Degraded> {
        self.marks.clear();
        self.stack.clear();
        self.stack.push((ancestor, 0));
        while let Some((node, depth)) = self.stack.pop() {
            for child in Children::new(&self.chunks, self.witnesses[node].children) {
                if child == descendant {
                    return Ok(true);
                }
                if child == ancestor {
                    return Err(Degraded::GraphTooDeep {
                        from: self.witnesses[ancestor].name.clone(),
                        limit: self.depth_limit,
                    });
                }
                if self.marks.insert(child.index()) {
                    self.stack.push((child, depth + 1));
                }
            }
        }
        Ok(false)
    }

    /// Record that `parent` may be held while `child` is acquired.
    ///
    /// Afterwards, prune the partition and recompute levels.
    pub fn add_edge(&mut self, parent: WitnessHandle, child: WitnessHandle) -> Result<(), Error> {
        let partition = self.witnesses[parent].class.partition();
        if partition != self.witnesses[child].class.partition() {
            return Err(FatalError::MixedLockDomain {
                parent: self.witnesses[parent].name.clone(),
                child: self.witnesses[child].name.clone(),
            }
            .into());
        }

        log::trace!(
            "witness: learned order \"{}\" -> \"{}\"",
            self.witnesses[parent].name,
            self.witnesses[child].name
        );
        self.insert_child(parent, child)?;
        self.prune(partition)?;
        self.assign_levels()?;
        Ok(())
    }

    /// Add `child` to `parent`'s child list, without pruning.
    fn insert_child(&mut self, parent: WitnessHandle, child: WitnessHandle) -> Result<(), Exhausted> {
        let mut last = None;
        let mut cursor = self.witnesses[parent].children;
        while let Some(handle) = cursor {
            let chunk = &mut self.chunks[handle];
            if !chunk.children.is_full() {
                chunk.children.push(child);
                return Ok(());
            }
            last = Some(handle);
            cursor = chunk.next;
        }

        let mut children = ArrayVec::new();
        children.push(child);
        let fresh = self.chunks.acquire(ChildChunk {
            next: None,
            children,
        })?;
        match last {
            Some(handle) => self.chunks[handle].next = Some(fresh),
            None => self.witnesses[parent].children = Some(fresh),
        }
        Ok(())
    }

    /// Remove `child` from `parent`'s child list, freeing emptied chunks.
    fn remove_child(&mut self, parent: WitnessHandle, child: WitnessHandle) {
        let mut prev = None;
        let mut cursor = self.witnesses[parent].children;
        while let Some(handle) = cursor {
            let chunk = &mut self.chunks[handle];
            if let Some(position) = chunk.children.iter().position(|&c| c == child) {
                chunk.children.swap_remove(position);
                if chunk.children.is_empty() {
                    let next = chunk.next;
                    match prev {
                        Some(prev) => self.chunks[prev].next = next,
                        None => self.witnesses[parent].children = next,
                    }
                    self.chunks.release(handle);
                }
                return;
            }
            prev = Some(handle);
            cursor = chunk.next;
        }
    }

    /// Remove every direct edge in `partition` that a longer path implies.
    fn prune(&mut self, partition: Partition) -> Result<(), Error> {
        let mut pruned = 0;
        let count = self.partition(partition).len();
        for i in 0..count {
            let child = self.partition(partition)[i];
            for j in 0..count {
                let parent = self.partition(partition)[j];
                if !self.is_child(parent, child) {
                    continue;
                }
                self.remove_child(parent, child);
                if self.reachable(parent, child)? {
                    log::trace!(
                        "witness: pruned redundant order \"{}\" -> \"{}\"",
                        self.witnesses[parent].name,
                        self.witnesses[child].name
                    );
                    pruned += 1;
                    continue;
                }
                self.insert_child(parent, child)?;
            }
        }
        if pruned > 0 {
            log::trace!("witness: pruned {pruned} edges");
        }
        Ok(())
    }

    /// Does any witness in `partition` list `handle` as a child?
    fn has_parent(&self, handle: WitnessHandle) -> bool {
        let partition = self.witnesses[handle].class.partition();
        self.partition(partition)
            .iter()
            .any(|&parent| self.is_child(parent, handle))
    }

    /// Recompute every witness' level: the length of the longest path from a
    /// root (a witness without parents) of its partition.
    pub fn assign_levels(&mut self) -> Result<(), Degraded> {
        for i in 0..self.all.len() {
            let handle = self.all[i];
            self.witnesses[handle].level = 0;
        }

        self.marks.clear();
        for i in 0..self.all.len() {
            let handle = self.all[i];
            if self.has_parent(handle) {
                self.marks.insert(handle.index());
            }
        }

        for i in 0..self.all.len() {
            let root = self.all[i];
            if self.marks.contains(root.index()) {
                continue;
            }
            self.stack.clear();
            self.stack.push((root, 0));
            while let Some((node, level)) = self.stack.pop() {
                if level > self.depth_limit {
                    return Err(Degraded::GraphTooDeep {
                        from: self.witnesses[root].name.clone(),
                        limit: self.depth_limit,
                    });
                }
                for child in Children::new(&self.chunks, self.witnesses[node].children) {
                    let child_level = level + 1;
                    let witness = &mut self.witnesses[child];
                    if (witness.level as usize) < child_level {
                        witness.level = child_level as u32;
                        self.stack.push((child, child_level));
                    }
                }
            }
        }
        Ok(())
    }

    /// Is `handle` a root of its partition?
    pub fn is_root(&self, handle: WitnessHandle) -> bool {
        !self.has_parent(handle)
    }

    pub fn witness_report(&self) -> PoolReport {
        self.witnesses.report()
    }

    pub fn chunk_report(&self) -> PoolReport {
        self.chunks.report()
    }
}
