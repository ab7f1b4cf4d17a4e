//! Replay recorded lock activity through a lock-order verifier.
//!
//! Usage: `witness-replay TRACE [CONFIG]`
//!
//! `TRACE` is a file of RON-encoded [`Event`]s, one per line. Blank lines and
//! lines starting with `//` are skipped. Each event is fed to a [`Verifier`],
//! and every violation it reports is printed along with the trace line that
//! caused it. At the end, the learned order graph is printed.
//!
//! `CONFIG`, if given, is a RON-encoded `VerifierConfig`. Otherwise the
//! kernel policy is used, adjusted by the `WITNESS_*` environment variables.
//!
//! A trace might look like this:
//!
//! ```text
//! Init(lock: "p1", name: "process lock", class: SleepMutex)
//! Init(lock: "p2", name: "process lock", class: SleepMutex)
//! Init(lock: "ui", name: "uidinfo hash", class: SleepMutex)
//! Acquire(thread: 1, lock: "ui")
//! Acquire(thread: 1, lock: "p1")
//! Holding(thread: 1)
//! Block(thread: 1)
//! ```

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use witness_core::{
    AcquireFlags, Context, LockClass, LockFlags, LockObject, Recorder, Site, Verifier,
    VerifierConfig,
};

/// One recorded lock operation.
///
/// Locks are named by `lock`, a key unique to the instance within the trace.
/// `cpu` defaults to processor 0.
#[derive(Debug, serde::Deserialize)]
enum Event {
    Init {
        lock: String,
        name: String,
        class: LockClass,
        #[serde(default)]
        flags: LockFlags,
    },
    Destroy {
        lock: String,
    },
    Acquire {
        thread: u64,
        #[serde(default)]
        cpu: usize,
        lock: String,
    },
    TryAcquire {
        thread: u64,
        #[serde(default)]
        cpu: usize,
        lock: String,
    },
    Release {
        thread: u64,
        #[serde(default)]
        cpu: usize,
        lock: String,
    },
    /// The thread suspends, or with `check_only`, reaches a point where it
    /// could. `exempt` is a lock the suspension releases.
    Block {
        thread: u64,
        #[serde(default)]
        cpu: usize,
        #[serde(default)]
        exempt: Option<String>,
        #[serde(default)]
        check_only: bool,
    },
    /// Print the locks the thread holds.
    Holding {
        thread: u64,
        #[serde(default)]
        cpu: usize,
    },
}

struct Replay {
    verifier: Verifier,
    recorder: Arc<Recorder>,
    locks: HashMap<String, LockObject>,
    /// The trace's path, as it appears in sites.
    file: &'static str,
}

impl Replay {
    fn object(&self, key: &str) -> Result<&LockObject> {
        self.locks
            .get(key)
            .with_context(|| format!("lock {key:?} was never initialized"))
    }

    fn apply(&mut self, event: Event, line: u32) -> Result<()> {
        let site = Site::new(self.file, line);
        match event {
            Event::Init {
                lock,
                name,
                class,
                flags,
            } => {
                let object = self
                    .locks
                    .entry(lock)
                    .or_insert_with(|| LockObject::new(name, class, flags));
                self.verifier.init(object)?;
            }
            Event::Destroy { lock } => {
                self.verifier.destroy(self.object(&lock)?)?;
            }
            Event::Acquire { thread, cpu, lock } => {
                let object = self.object(&lock)?;
                let cx = Context::new(thread, cpu);
                self.verifier.lock(cx, object, AcquireFlags::empty(), site)?;
            }
            Event::TryAcquire { thread, cpu, lock } => {
                let object = self.object(&lock)?;
                let cx = Context::new(thread, cpu);
                self.verifier.lock(cx, object, AcquireFlags::TRY, site)?;
            }
            Event::Release { thread, cpu, lock } => {
                let object = self.object(&lock)?;
                self.verifier.unlock(Context::new(thread, cpu), object, site)?;
            }
            Event::Block {
                thread,
                cpu,
                exempt,
                check_only,
            } => {
                let exempt = exempt.as_deref().map(|key| self.object(key)).transpose()?;
                let cx = Context::new(thread, cpu);
                let count = if check_only {
                    self.verifier.could_block(cx, exempt, site)
                } else {
                    self.verifier.about_to_block(cx, exempt, site)
                };
                if count > 0 {
                    println!("{site}: {count} lock(s) held across suspension");
                }
            }
            Event::Holding { thread, cpu } => {
                let listing = self.verifier.list_locks(Context::new(thread, cpu));
                println!("{site}: thread {thread} holds {} lock(s)", listing.len());
                print!("{listing}");
            }
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args_os().skip(1);
    let Some(trace) = args.next().map(PathBuf::from) else {
        eprintln!("Usage: witness-replay TRACE [CONFIG]");
        anyhow::bail!("no trace file given");
    };

    let config = match args.next().map(PathBuf::from) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read configuration from {}", path.display()))?;
            ron::from_str::<VerifierConfig>(&text)
                .with_context(|| format!("error parsing configuration from {}", path.display()))?
        }
        None => VerifierConfig::kernel().from_env(),
    };

    let recorder = Arc::new(Recorder::new());
    let verifier = Verifier::new(config)
        .context("the configured order list is inconsistent")?
        .with_trap(recorder.clone());

    let contents = std::fs::read_to_string(&trace)
        .with_context(|| format!("failed to read lock activity from {}", trace.display()))?;
    // Sites refer to their file for the life of the program.
    let file: &'static str = Box::leak(trace.display().to_string().into_boxed_str());
    let mut replay = Replay {
        verifier,
        recorder,
        locks: HashMap::default(),
        file,
    };

    let mut reported = 0;
    for (index, text) in contents.lines().enumerate() {
        let line = index as u32 + 1;
        let text = text.trim();
        if text.is_empty() || text.starts_with("//") {
            continue;
        }
        let event = ron::from_str::<Event>(text)
            .with_context(|| format!("{file}:{line}: error parsing event"))?;
        log::debug!("{file}:{line}: {event:?}");
        replay
            .apply(event, line)
            .with_context(|| format!("{file}:{line}: fatal lock misuse"))?;
        for violation in replay.recorder.take() {
            println!("{violation}");
            reported += 1;
        }
    }

    println!();
    print!("{}", replay.verifier.dump());

    let stats = replay.verifier.stats();
    println!();
    println!("{reported} violation(s) reported");
    println!(
        "{} lock(s) live, at most {} at once",
        stats.locks, stats.max_locks
    );
    for pool in [stats.witnesses, stats.child_chunks, stats.lock_list_chunks] {
        println!(
            "{} pool: {} of {} in use, high water {}",
            pool.kind, pool.in_use, pool.capacity, pool.high_water
        );
    }
    if let Some(reason) = replay.verifier.degraded() {
        println!("checking stopped: {reason}");
    }
    Ok(())
}
