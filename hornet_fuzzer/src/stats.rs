//! Activity counters, updated by atomic add from every proc and swapped to
//! zero by the pollster.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Stat {
    Generate = 0,
    Fuzz,
    Candidate,
    Triage,
    Minimize,
    Smash,
    Hint,
    Seed,
}

pub const STAT_COUNT: usize = 8;

/// Wire names, as the manager expects them.
const STAT_NAMES: [&str; STAT_COUNT] = [
    "exec gen",
    "exec fuzz",
    "exec candidate",
    "exec triage",
    "exec minimize",
    "exec smash",
    "exec hints",
    "exec seeds",
];

pub const ALL_STATS: [Stat; STAT_COUNT] = [
    Stat::Generate,
    Stat::Fuzz,
    Stat::Candidate,
    Stat::Triage,
    Stat::Minimize,
    Stat::Smash,
    Stat::Hint,
    Stat::Seed,
];

impl Stat {
    pub fn name(self) -> &'static str {
        STAT_NAMES[self as usize]
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    counts: [AtomicU64; STAT_COUNT],
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self, stat: Stat) {
        self.counts[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, stat: Stat, n: u64) {
        self.counts[stat as usize].fetch_add(n, Ordering::Relaxed);
    }

    /// Drain one counter to zero, returning the drained value.
    #[inline]
    pub fn swap(&self, stat: Stat) -> u64 {
        self.counts[stat as usize].swap(0, Ordering::Relaxed)
    }
}

/// Per-proc counters, swapped into the poll payload.
#[derive(Debug, Default)]
pub struct ProcStats {
    pub exec_total: AtomicU64,
    pub restarts: AtomicU64,
}

impl ProcStats {
    #[inline]
    pub fn inc_exec_total(&self) {
        self.exec_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_restarts(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_drains() {
        let stats = Stats::new();
        stats.inc(Stat::Generate);
        stats.inc(Stat::Generate);
        stats.add(Stat::Hint, 5);
        assert_eq!(stats.swap(Stat::Generate), 2);
        assert_eq!(stats.swap(Stat::Generate), 0);
        assert_eq!(stats.swap(Stat::Hint), 5);
        assert_eq!(stats.swap(Stat::Fuzz), 0);
    }

    #[test]
    fn wire_names() {
        assert_eq!(Stat::Generate.name(), "exec gen");
        assert_eq!(Stat::Hint.name(), "exec hints");
        assert_eq!(ALL_STATS.len(), STAT_COUNT);
    }
}
