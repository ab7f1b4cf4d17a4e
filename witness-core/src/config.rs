//! Verifier configuration.

use crate::policy::Policy;

/// Pool sizes. Pools never grow after the verifier is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Capacity {
    /// The number of distinct lock names that can be tracked.
    pub witnesses: usize,
    /// Chunks of child references, shared by all witnesses.
    pub child_chunks: usize,
    /// Chunks of held-lock entries, shared by all contexts.
    pub lock_list_chunks: usize,
}

impl Capacity {
    pub const WITNESSES: usize = 200;
    pub const CHILD_CHUNKS: usize = Self::WITNESSES * 4;

    /// The default sizes for a system with `cpus` processors.
    pub const fn for_cpus(cpus: usize) -> Self {
        Capacity {
            witnesses: Self::WITNESSES,
            child_chunks: Self::CHILD_CHUNKS,
            lock_list_chunks: (cpus + 1024) * 2,
        }
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Capacity::for_cpus(1)
    }
}

/// Everything a [`Verifier`](crate::Verifier) is configured with.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct VerifierConfig {
    /// Check lock ordering at all. Without it, locks are still tracked for
    /// life cycle errors but never get witnesses.
    pub watch: bool,
    /// Leave non-blockable locks unwatched.
    pub skip_spin: bool,
    /// Skip the order scan when the acquired lock's level is already known
    /// to be deeper than the held lock's.
    pub use_levels: bool,
    /// The number of processors, each with its own non-blockable stack.
    pub cpus: usize,
    pub capacity: Capacity,
    pub policy: Policy,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            watch: true,
            skip_spin: false,
            use_levels: false,
            cpus: 1,
            capacity: Capacity::default(),
            policy: Policy::default(),
        }
    }
}

impl VerifierConfig {
    /// The default configuration, seeded with [`Policy::kernel`].
    pub fn kernel() -> Self {
        VerifierConfig {
            policy: Policy::kernel(),
            ..VerifierConfig::default()
        }
    }

    /// Size the pools for `cpus` processors.
    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus.max(1);
        self.capacity = Capacity::for_cpus(self.cpus);
        self
    }

    /// Override switches from the `WITNESS_WATCH`, `WITNESS_SKIPSPIN` and
    /// `WITNESS_LEVELS` environment variables, where set.
    pub fn from_env(mut self) -> Self {
        if let Some(watch) = switch_from_env("WITNESS_WATCH") {
            self.watch = watch;
        }
        if let Some(skip_spin) = switch_from_env("WITNESS_SKIPSPIN") {
            self.skip_spin = skip_spin;
        }
        if let Some(use_levels) = switch_from_env("WITNESS_LEVELS") {
            self.use_levels = use_levels;
        }
        self
    }
}

/// Get an on/off switch from the environment variable `name`.
fn switch_from_env(name: &str) -> Option<bool> {
    parse_switch(std::env::var(name).as_deref().ok()?)
}

fn parse_switch(value: &str) -> Option<bool> {
    Some(match value.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => true,
        "0" | "false" | "off" | "no" => false,
        _ => {
            log::warn!("witness: ignoring unrecognized switch value {value:?}");
            return None;
        }
    })
}

#[test]
fn switches() {
    assert_eq!(parse_switch("ON"), Some(true));
    assert_eq!(parse_switch(" 0 "), Some(false));
    assert_eq!(parse_switch("False"), Some(false));
    assert_eq!(parse_switch("maybe"), None);
}

#[test]
fn capacity_scales_with_cpus() {
    let config = VerifierConfig::default().with_cpus(4);
    assert_eq!(config.cpus, 4);
    assert_eq!(config.capacity.lock_list_chunks, (4 + 1024) * 2);
    assert_eq!(config.capacity.witnesses, 200);
    assert_eq!(config.capacity.child_chunks, 800);
}
