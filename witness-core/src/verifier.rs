//! The lock-order verifier.
//!
//! A [`Verifier`] is told about every initialization, acquisition and release
//! of the locks it watches, and checks each acquisition against the locks the
//! acquiring context already holds:
//!
//! - If the new lock has the same name as the most recently acquired one, that
//!   is a duplicate acquisition, reported once per name unless the policy
//!   allows it.
//!
//! - If the learned order says the new lock must come *before* some held
//!   lock, that is a lock order reversal, reported once per pair of names
//!   unless the policy blesses the pair.
//!
//! - Otherwise, if the order graph doesn't relate the most recently acquired
//!   lock to the new one yet, the verifier learns that the former comes first.
//!
//! Acquisitions are checked per context. A thread's blockable locks form one
//! stack; the non-blockable locks held on a processor form another. No order
//! relation crosses between the two.
//!
//! All verifier state sits behind one internal mutex, which is not itself
//! verified. Pruning the graph, answering reachability queries and editing
//! held-lock stacks are all serialized by it. A lock object's own bookkeeping
//! may be locked while that mutex is taken, never the other way around.
//!
//! Running out of pool space, or finding the graph deeper than it could
//! possibly be, switches checking off for good. Locks keep working; the
//! verifier just stops looking at them.

use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use arrayvec::ArrayVec;
use parking_lot::Mutex;

use crate::{
    class::{AcquireFlags, LockFlags, Partition},
    config::VerifierConfig,
    display::{self, LockListing},
    error::{Degraded, Error, FatalError},
    graph::{Graph, WitnessHandle},
    hash_utils::{self, FastHashMap, FastHashSet},
    held::{HeldLock, LockList, LockListChunk},
    object::{LockObject, Phase},
    pool::{Pool, PoolReport},
    report::{LockRecord, Trap, Violation},
    site::Site,
};

/// The execution context performing a lock operation: a thread, and the
/// processor it is running on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Context {
    thread: u64,
    cpu: usize,
}

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD: u64 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
    static CPU: Cell<usize> = const { Cell::new(0) };
}

impl Context {
    pub const fn new(thread: u64, cpu: usize) -> Self {
        Context { thread, cpu }
    }

    /// The calling thread, on the processor it last bound itself to with
    /// [`Context::bind_cpu`] (processor 0 by default).
    pub fn current() -> Self {
        Context {
            thread: THREAD.with(|thread| *thread),
            cpu: CPU.with(Cell::get),
        }
    }

    /// Make [`Context::current`] report `cpu` for the calling thread.
    pub fn bind_cpu(cpu: usize) {
        CPU.with(|current| current.set(cpu));
    }

    pub fn thread(&self) -> u64 {
        self.thread
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

/// Counters reported by [`Verifier::stats`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stats {
    /// Locks initialized and not yet destroyed.
    pub locks: usize,
    /// The most locks that were ever initialized at once.
    pub max_locks: usize,
    pub witnesses: PoolReport,
    pub child_chunks: PoolReport,
    pub lock_list_chunks: PoolReport,
    /// Threads currently holding blockable locks.
    pub threads: usize,
    /// Checking has been switched off.
    pub dead: bool,
}

/// Violations found by one check, delivered once the state lock is released.
type Pending = ArrayVec<Violation, 2>;

struct State {
    graph: Graph,
    lock_chunks: Pool<LockListChunk>,

    /// Blockable locks held by each thread.
    threads: FastHashMap<u64, LockList>,
    /// Non-blockable locks held on each processor.
    cpus: Vec<LockList>,

    /// Names already reported for duplicate acquisition.
    squawked_dups: FastHashSet<WitnessHandle>,
    /// `(acquired, held)` pairs already reported as reversals.
    squawked_orders: FastHashSet<(WitnessHandle, WitnessHandle)>,

    /// Why checking was switched off.
    degraded: Option<Degraded>,

    /// Still seeding from the policy's order list.
    cold: bool,

    locks: usize,
    max_locks: usize,
}

impl State {
    /// Drop `thread`'s blockable stack once it holds nothing, so only
    /// threads with locks held have one.
    fn forget_if_idle(&mut self, thread: u64) {
        if self.threads.get(&thread).is_some_and(LockList::is_empty) {
            self.threads.remove(&thread);
        }
    }
}

/// A runtime lock-order verifier.
///
/// Instances are independent of one another: each has its own order graph,
/// pools and held-lock stacks.
pub struct Verifier {
    config: VerifierConfig,
    dead: AtomicBool,
    state: Mutex<State>,
    trap: Option<Arc<dyn Trap>>,
}

impl Verifier {
    /// Create a verifier and seed its order graph from `config.policy`.
    ///
    /// Fails if the seed order list contradicts itself: a name listed under
    /// two classes, or a chain mixing blockable and non-blockable classes.
    pub fn new(config: VerifierConfig) -> Result<Self, FatalError> {
        let capacity = config.capacity;
        let cpus = config.cpus.max(1);
        let verifier = Verifier {
            state: Mutex::new(State {
                graph: Graph::new(capacity.witnesses, capacity.child_chunks),
                lock_chunks: Pool::with_capacity("lock list", capacity.lock_list_chunks),
                threads: hash_utils::map_with_capacity(16),
                cpus: (0..cpus).map(|_| LockList::default()).collect(),
                squawked_dups: hash_utils::set_with_capacity(capacity.witnesses),
                squawked_orders: hash_utils::set_with_capacity(capacity.witnesses),
                degraded: None,
                cold: true,
                locks: 0,
                max_locks: 0,
            }),
            config,
            dead: AtomicBool::new(false),
            trap: None,
        };
        verifier.seed()?;
        Ok(verifier)
    }

    /// Enter `trap` after each reported violation.
    pub fn with_trap(mut self, trap: Arc<dyn Trap>) -> Self {
        self.trap = Some(trap);
        self
    }

    fn seed(&self) -> Result<(), FatalError> {
        let mut state = self.state.lock();
        if self.config.watch {
            'chains: for chain in &self.config.policy.order {
                let mut parent = None;
                for entry in chain {
                    if self.config.skip_spin && entry.class.is_spin() {
                        continue;
                    }
                    let name: Arc<str> = Arc::from(entry.name.as_str());
                    let result = state.graph.enroll(&name, entry.class, true);
                    let Some(child) = self.absorb(&mut state, result)? else {
                        break 'chains;
                    };
                    state.graph.witness_mut(child).site = Some(Site::ORDER_LIST);
                    if let Some(parent) = parent {
                        let result = self.seed_edge(&mut state, parent, child);
                        if self.absorb(&mut state, result)?.is_none() {
                            break 'chains;
                        }
                    }
                    parent = Some(child);
                }
            }
        }
        state.cold = false;
        log::info!(
            "witness: watching {} lock names ({} blockable, {} non-blockable)",
            state.graph.all().len(),
            state.graph.partition(Partition::Blockable).len(),
            state.graph.partition(Partition::NonBlockable).len(),
        );
        Ok(())
    }

    /// Add one edge of a seed chain, unless the graph already implies it.
    fn seed_edge(
        &self,
        state: &mut State,
        parent: WitnessHandle,
        child: WitnessHandle,
    ) -> Result<(), Error> {
        if parent == child || state.graph.reachable(parent, child)? {
            return Ok(());
        }
        if state.graph.reachable(child, parent)? {
            log::warn!(
                "witness: order list puts \"{}\" before \"{}\" both ways; keeping the first",
                state.graph.witness(parent).name,
                state.graph.witness(child).name,
            );
            return Ok(());
        }
        state.graph.add_edge(parent, child)
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Checking has been switched off for good.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Why checking was switched off, if it was.
    pub fn degraded(&self) -> Option<Degraded> {
        self.state.lock().degraded.clone()
    }

    /// Switch checking off, logging why the first time.
    fn degrade(&self, state: &mut State, reason: Degraded) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            log::error!("witness: {reason}; lock order checking disabled");
            state.degraded = Some(reason);
        }
    }

    /// Split an internal result into fatal errors, which are returned, and
    /// degradation, which switches checking off and yields `None`.
    fn absorb<T>(&self, state: &mut State, result: Result<T, Error>) -> Result<Option<T>, FatalError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(Error::Fatal(error)) => Err(error),
            Err(Error::Degraded(reason)) => {
                self.degrade(state, reason);
                Ok(None)
            }
        }
    }

    fn deliver(&self, pending: impl IntoIterator<Item = Violation>) {
        for violation in pending {
            log::warn!("{violation}");
            if let Some(ref trap) = self.trap {
                trap.enter(&violation);
            }
        }
    }

    /// Start tracking `object`, enrolling its name unless it is unwatched.
    #[must_use = "a fatal error means the lock is being misused"]
    pub fn init(&self, object: &LockObject) -> Result<(), FatalError> {
        let mut object_state = object.state.lock();
        match object_state.phase {
            Phase::Uninitialized => {}
            Phase::Destroyed => {
                return Err(FatalError::UseAfterDestroy {
                    class: object.class(),
                    name: object.name().clone(),
                })
            }
            Phase::Unlocked | Phase::Locked { .. } => {
                return Err(FatalError::AlreadyInitialized {
                    class: object.class(),
                    name: object.name().clone(),
                })
            }
        }
        object
            .class()
            .check_flags(object.flags())
            .map_err(|property| FatalError::InvalidLockFlags {
                class: object.class(),
                name: object.name().clone(),
                property,
            })?;

        let mut state = self.state.lock();
        let state = &mut *state;
        let watched = self.config.watch
            && object.flags().contains(LockFlags::WITNESS)
            && !(self.config.skip_spin && object.class().is_spin())
            && !self.is_dead();
        if watched {
            let result = state.graph.enroll(object.name(), object.class(), state.cold);
            object_state.witness = self.absorb(state, result)?;
        }

        state.locks += 1;
        state.max_locks = state.max_locks.max(state.locks);
        object_state.phase = Phase::Unlocked;
        Ok(())
    }

    /// Stop tracking `object`.
    ///
    /// When the last lock with a given name is destroyed, the name's witness
    /// is retired. It keeps its place in the order graph, and is revived if
    /// the name is initialized again.
    #[must_use = "a fatal error means the lock is being misused"]
    pub fn destroy(&self, object: &LockObject) -> Result<(), FatalError> {
        let mut object_state = object.state.lock();
        match object_state.phase {
            Phase::Unlocked => {}
            Phase::Uninitialized => {
                return Err(FatalError::NotInitialized {
                    class: object.class(),
                    name: object.name().clone(),
                })
            }
            Phase::Destroyed => {
                return Err(FatalError::UseAfterDestroy {
                    class: object.class(),
                    name: object.name().clone(),
                })
            }
            Phase::Locked { .. } => {
                return Err(FatalError::DestroyedWhileHeld {
                    class: object.class(),
                    name: object.name().clone(),
                })
            }
        }

        let mut state = self.state.lock();
        state.locks -= 1;
        if let Some(witness) = object_state.witness.take() {
            if state.graph.release(witness) && !object.flags().contains(LockFlags::QUIET) {
                log::debug!("witness: retired \"{}\"", object.name());
            }
        }
        object_state.phase = Phase::Destroyed;
        Ok(())
    }

    /// Record that `cx` acquired `object` at `site`, and check the
    /// acquisition against the locks `cx` already holds.
    ///
    /// Violations are reported, not returned: the result is only an error
    /// for misuse of the lock itself.
    #[must_use = "a fatal error means the lock is being misused"]
    pub fn lock(
        &self,
        cx: Context,
        object: &LockObject,
        flags: AcquireFlags,
        site: Site,
    ) -> Result<(), FatalError> {
        let mut object_state = object.state.lock();
        match object_state.phase {
            Phase::Unlocked => {}
            Phase::Locked { recursion } => {
                if !object.flags().contains(LockFlags::RECURSABLE) {
                    return Err(FatalError::RecursedNonRecursable {
                        class: object.class(),
                        name: object.name().clone(),
                        site,
                    });
                }
                object_state.phase = Phase::Locked {
                    recursion: recursion + 1,
                };
                return Ok(());
            }
            Phase::Uninitialized => {
                return Err(FatalError::NotInitialized {
                    class: object.class(),
                    name: object.name().clone(),
                })
            }
            Phase::Destroyed => {
                return Err(FatalError::UseAfterDestroy {
                    class: object.class(),
                    name: object.name().clone(),
                })
            }
        }
        let cpus = self.config.cpus.max(1);
        if cx.cpu >= cpus {
            return Err(FatalError::UnknownCpu {
                cpu: cx.cpu,
                count: cpus,
            });
        }

        object_state.phase = Phase::Locked { recursion: 0 };
        object_state.site = Some(site);
        let Some(witness) = object_state.witness else {
            return Ok(());
        };
        if self.is_dead() {
            return Ok(());
        }
        if !object.flags().contains(LockFlags::QUIET) {
            log::trace!("witness: {} \"{}\" locked @ {site}", object.class(), object.name());
        }

        let mut pending = Pending::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let class = object.class();

            if !class.is_spin() && !state.cpus[cx.cpu].is_empty() {
                pending.push(Violation::BlockableUnderSpin {
                    class,
                    name: object.name().clone(),
                    site,
                });
            }

            if !flags.contains(AcquireFlags::TRY) {
                let result = self.check_order(state, cx, object, witness, site, &mut pending);
                self.absorb(state, result)?;
            }

            if !self.is_dead() {
                state.graph.witness_mut(witness).site = Some(site);
                let held = HeldLock {
                    object: object.id(),
                    witness,
                    name: object.name().clone(),
                    class,
                    flags: object.flags(),
                    site,
                };
                let list = match class.partition() {
                    Partition::Blockable => state.threads.entry(cx.thread).or_default(),
                    Partition::NonBlockable => &mut state.cpus[cx.cpu],
                };
                if let Err(exhausted) = list.push(&mut state.lock_chunks, held) {
                    state.forget_if_idle(cx.thread);
                    self.degrade(state, exhausted.into());
                }
            }
        }
        drop(object_state);
        self.deliver(pending);
        Ok(())
    }

    /// Check acquiring `witness` against the stack it will be pushed on.
    fn check_order(
        &self,
        state: &mut State,
        cx: Context,
        object: &LockObject,
        witness: WitnessHandle,
        site: Site,
        pending: &mut Pending,
    ) -> Result<(), Error> {
        let chunks = &state.lock_chunks;
        let list = match object.class().partition() {
            Partition::Blockable => state.threads.get(&cx.thread),
            Partition::NonBlockable => state.cpus.get(cx.cpu),
        };
        let Some(list) = list else {
            return Ok(());
        };
        let Some(top) = list.top(chunks) else {
            return Ok(());
        };

        // Duplicates only need checking against the top of the stack; any
        // other repeat shows up as a reversal.
        if top.witness == witness {
            let name = object.name();
            if self.config.policy.is_dup_ok(name) || !state.squawked_dups.insert(witness) {
                return Ok(());
            }
            pending.push(Violation::Duplicate {
                name: name.clone(),
                first: state.graph.witness(witness).site,
                second: site,
            });
            return Ok(());
        }

        let newest = top.witness;
        if self.config.use_levels
            && state.graph.witness(witness).level > state.graph.witness(newest).level
        {
            return Ok(());
        }
        if state.graph.reachable(newest, witness)? {
            return Ok(());
        }

        for held in list.iter(chunks) {
            if !state.graph.reachable(witness, held.witness)? {
                continue;
            }
            if self.config.policy.is_blessed(object.name(), &held.name)
                || !state.squawked_orders.insert((witness, held.witness))
            {
                return Ok(());
            }

            let earlier = list
                .iter(chunks)
                .skip_while(|entry| entry.object != held.object)
                .find(|entry| entry.witness == witness);
            let first = match earlier {
                Some(entry) => LockRecord {
                    object: Some(entry.object),
                    name: entry.name.clone(),
                    site: Some(entry.site),
                },
                None => LockRecord {
                    object: None,
                    name: object.name().clone(),
                    site: state.graph.witness(witness).site,
                },
            };
            pending.push(Violation::Reversal {
                first,
                second: LockRecord {
                    object: Some(held.object),
                    name: held.name.clone(),
                    site: Some(held.site),
                },
                third: LockRecord {
                    object: Some(object.id()),
                    name: object.name().clone(),
                    site: Some(site),
                },
            });
            return Ok(());
        }

        state.graph.add_edge(newest, witness)
    }

    /// Record that `cx` released `object` at `site`.
    #[must_use = "a fatal error means the lock is being misused"]
    pub fn unlock(&self, cx: Context, object: &LockObject, site: Site) -> Result<(), FatalError> {
        let mut object_state = object.state.lock();
        match object_state.phase {
            Phase::Locked { recursion: 0 } => {}
            Phase::Locked { recursion } => {
                object_state.phase = Phase::Locked {
                    recursion: recursion - 1,
                };
                return Ok(());
            }
            Phase::Unlocked => {
                return Err(FatalError::ReleaseNotHeld {
                    class: object.class(),
                    name: object.name().clone(),
                    site,
                })
            }
            Phase::Uninitialized => {
                return Err(FatalError::NotInitialized {
                    class: object.class(),
                    name: object.name().clone(),
                })
            }
            Phase::Destroyed => {
                return Err(FatalError::UseAfterDestroy {
                    class: object.class(),
                    name: object.name().clone(),
                })
            }
        }

        if object_state.witness.is_some() && !self.is_dead() {
            let mut state = self.state.lock();
            let state = &mut *state;
            let list = match object.class().partition() {
                Partition::Blockable => state.threads.get_mut(&cx.thread),
                Partition::NonBlockable => state.cpus.get_mut(cx.cpu),
            };
            let removed = list.and_then(|list| list.remove(&mut state.lock_chunks, object.id()));
            if removed.is_none() {
                return Err(FatalError::ReleaseNotHeld {
                    class: object.class(),
                    name: object.name().clone(),
                    site,
                });
            }
            state.forget_if_idle(cx.thread);
            if !object.flags().contains(LockFlags::QUIET) {
                log::trace!("witness: {} \"{}\" unlocked @ {site}", object.class(), object.name());
            }
        }
        object_state.phase = Phase::Unlocked;
        Ok(())
    }

    /// Report every lock `cx` holds that must not be held while it suspends,
    /// and return how many there are.
    ///
    /// `exempt` is the lock the suspension itself releases, if any. The
    /// policy's privileged lock and locks flagged [`LockFlags::SLEEPABLE`]
    /// are never counted.
    pub fn about_to_block(&self, cx: Context, exempt: Option<&LockObject>, site: Site) -> usize {
        self.scan_blocking(cx, exempt, site, false)
    }

    /// Like [`Verifier::about_to_block`], for a path that only *could*
    /// suspend.
    pub fn could_block(&self, cx: Context, exempt: Option<&LockObject>, site: Site) -> usize {
        self.scan_blocking(cx, exempt, site, true)
    }

    fn scan_blocking(
        &self,
        cx: Context,
        exempt: Option<&LockObject>,
        site: Site,
        check_only: bool,
    ) -> usize {
        if self.is_dead() {
            return 0;
        }
        let exempt = exempt.map(LockObject::id);
        let mut found = Vec::new();
        {
            let state = self.state.lock();
            let lists = [state.threads.get(&cx.thread), state.cpus.get(cx.cpu)];
            for list in lists.into_iter().flatten() {
                for held in list.iter(&state.lock_chunks) {
                    if Some(held.object) == exempt
                        || self.config.policy.is_privileged(&held.name)
                        || held.flags.contains(LockFlags::SLEEPABLE)
                    {
                        continue;
                    }
                    found.push(Violation::Sleeping {
                        check_only,
                        site,
                        name: held.name.clone(),
                        held_site: Some(held.site),
                    });
                }
            }
        }
        let count = found.len();
        self.deliver(found);
        count
    }

    /// The site `object` was last acquired at, to be put back with
    /// [`Verifier::restore_site`] after a suspension reacquires it.
    pub fn save_site(&self, object: &LockObject) -> Option<Site> {
        let object_state = object.state.lock();
        object_state.witness?;
        object_state.site
    }

    /// Make `site` the last acquisition site of `object`, as held by `cx`.
    pub fn restore_site(&self, cx: Context, object: &LockObject, site: Site) {
        let mut object_state = object.state.lock();
        let Some(witness) = object_state.witness else {
            return;
        };
        object_state.site = Some(site);
        if self.is_dead() {
            return;
        }
        let mut state = self.state.lock();
        let state = &mut *state;
        state.graph.witness_mut(witness).site = Some(site);
        let list = match object.class().partition() {
            Partition::Blockable => state.threads.get(&cx.thread),
            Partition::NonBlockable => state.cpus.get(cx.cpu),
        };
        if let Some(held) = list.and_then(|list| list.find_mut(&mut state.lock_chunks, object.id())) {
            held.site = site;
        }
    }

    /// The locks `cx` holds.
    pub fn list_locks(&self, cx: Context) -> LockListing {
        let state = self.state.lock();
        let mut listing = LockListing::default();
        if let Some(list) = state.threads.get(&cx.thread) {
            listing.extend_from(list, &state.lock_chunks);
        }
        if let Some(list) = state.cpus.get(cx.cpu) {
            listing.extend_from(list, &state.lock_chunks);
        }
        listing
    }

    /// The whole order graph, as text.
    pub fn dump(&self) -> String {
        let mut state = self.state.lock();
        if let Err(reason) = state.graph.assign_levels() {
            self.degrade(&mut state, reason);
        }
        let mut out = String::new();
        // Writing to a `String` can't fail.
        let _ = display::write_graph(&mut out, &state.graph);
        out
    }

    pub fn stats(&self) -> Stats {
        let state = self.state.lock();
        Stats {
            locks: state.locks,
            max_locks: state.max_locks,
            witnesses: state.graph.witness_report(),
            child_chunks: state.graph.chunk_report(),
            lock_list_chunks: state.lock_chunks.report(),
            threads: state.threads.len(),
            dead: self.is_dead(),
        }
    }

    /// Forget the blockable stack of a thread that is exiting.
    ///
    /// Returns the number of locks it still held; each is logged.
    pub fn thread_exit(&self, cx: Context) -> usize {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(mut list) = state.threads.remove(&cx.thread) else {
            return 0;
        };
        let mut held = 0;
        while let Some(top) = list.top(&state.lock_chunks).map(|held| held.object) {
            if let Some(lock) = list.remove(&mut state.lock_chunks, top) {
                log::warn!(
                    "witness: thread {} exiting with ({}) {} locked at {}",
                    cx.thread,
                    lock.class,
                    lock.name,
                    lock.site
                );
            }
            held += 1;
        }
        held
    }

    /// Does the learned order say a lock named `first` must be acquired
    /// before one named `second`?
    pub fn is_ordered_before(&self, first: &str, second: &str) -> bool {
        let mut state = self.state.lock();
        let (Some(a), Some(b)) = (state.graph.lookup(first), state.graph.lookup(second)) else {
            return false;
        };
        match state.graph.reachable(a, b) {
            Ok(ordered) => ordered,
            Err(reason) => {
                self.degrade(&mut state, reason);
                false
            }
        }
    }
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("config", &self.config)
            .field("dead", &self.is_dead())
            .finish_non_exhaustive()
    }
}
