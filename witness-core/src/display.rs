//! Human-readable dumps of the order graph and of held locks.

use std::{fmt, sync::Arc};

use crate::{
    class::{LockClass, Partition},
    graph::{Graph, WitnessHandle},
    held::{LockList, LockListChunk},
    object::ObjectId,
    pool::Pool,
    site::Site,
};

/// Write the whole order graph.
///
/// Each partition is listed from its roots down, one line per witness,
/// indented by level. Levels must be current.
pub(crate) fn write_graph(out: &mut impl fmt::Write, graph: &Graph) -> fmt::Result {
    writeln!(out, "Sleep locks:")?;
    write_partition(out, graph, Partition::Blockable)?;

    writeln!(out, "\nSpin locks:")?;
    write_partition(out, graph, Partition::NonBlockable)?;

    writeln!(out, "\nLocks which were never acquired:")?;
    for &handle in graph.all() {
        let witness = graph.witness(handle);
        if witness.site.is_none() {
            writeln!(out, "{}", display_name(graph, handle))?;
        }
    }
    Ok(())
}

fn write_partition(
    out: &mut impl fmt::Write,
    graph: &Graph,
    partition: Partition,
) -> fmt::Result {
    let mut stack = Vec::new();
    for &root in graph.partition(partition) {
        if graph.witness(root).site.is_none() || !graph.is_root(root) {
            continue;
        }
        stack.push(root);
        while let Some(handle) = stack.pop() {
            let witness = graph.witness(handle);
            let level = witness.level as usize;
            write!(out, "{level:<2}{:level$}{}", "", display_name(graph, handle))?;
            match witness.site {
                Some(site) if !witness.is_retired() => {
                    writeln!(out, " -- last acquired @ {site}")?
                }
                _ => writeln!(out)?,
            }
            let first_child = stack.len();
            stack.extend(graph.children(handle));
            stack[first_child..].reverse();
        }
    }
    Ok(())
}

fn display_name(graph: &Graph, handle: WitnessHandle) -> &str {
    let witness = graph.witness(handle);
    if witness.is_retired() {
        "(dead)"
    } else {
        &witness.name
    }
}

/// One line of a [`LockListing`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeldLockInfo {
    pub class: LockClass,
    pub name: Arc<str>,
    pub object: ObjectId,
    pub site: Site,
}

/// The locks one context holds, most recently acquired first: blockable
/// locks, then the processor's non-blockable locks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockListing {
    pub locks: Vec<HeldLockInfo>,
}

impl LockListing {
    pub(crate) fn extend_from(&mut self, list: &LockList, pool: &Pool<LockListChunk>) {
        self.locks.extend(list.iter(pool).map(|held| HeldLockInfo {
            class: held.class,
            name: held.name.clone(),
            object: held.object,
            site: held.site,
        }));
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl fmt::Display for LockListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for lock in &self.locks {
            writeln!(
                f,
                "\t({}) {} ({}) locked at {}",
                lock.class, lock.name, lock.object, lock.site
            )?;
        }
        Ok(())
    }
}
