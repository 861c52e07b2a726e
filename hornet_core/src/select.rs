//! Call selection.
//!
//! The [`ChoiceTable`] holds cumulative generation priorities over the
//! enabled call set. It is built once at bootstrap from the manager's
//! priorities and never changes afterwards.

use crate::{
    syscall::SyscallId,
    target::Target,
    HashSet, RngType,
};
use rand::Rng;

/// Weight boost for calls that produce a resource; producers unlock more of
/// the call set during generation.
const PRODUCER_BONUS: u64 = 3;

#[derive(Debug)]
pub struct ChoiceTable {
    calls: Vec<SyscallId>,
    runs: Vec<u64>,
}

impl ChoiceTable {
    /// Build from the enabled call set and optional per-syscall priorities
    /// (indexed by syscall id, as sent by the manager).
    pub fn build(target: &Target, enabled: &HashSet<SyscallId>, prios: Option<&[u64]>) -> Self {
        let mut calls: Vec<SyscallId> = enabled.iter().copied().collect();
        calls.sort_unstable();

        let mut runs = Vec::with_capacity(calls.len());
        let mut sum = 0u64;
        for &sid in &calls {
            let prio = match prios {
                Some(p) => p.get(sid).copied().unwrap_or(1).max(1),
                None => {
                    let s = target.syscall_of(sid);
                    1 + if s.ret().is_some() { PRODUCER_BONUS } else { 0 }
                }
            };
            sum += prio;
            runs.push(sum);
        }
        ChoiceTable { calls, runs }
    }

    #[inline(always)]
    pub fn enabled(&self) -> &[SyscallId] {
        &self.calls
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn select(&self, rng: &mut RngType) -> SyscallId {
        assert!(!self.calls.is_empty(), "empty choice table");
        let idx = choose_weighted(rng, &self.runs);
        self.calls[idx]
    }
}

/// Pick an index from a cumulative weight array.
pub fn choose_weighted(rng: &mut RngType, runs: &[u64]) -> usize {
    let total = *runs.last().unwrap();
    let n = rng.gen_range(0..total);
    runs.partition_point(|&r| r <= n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn choose_weighted_bounds() {
        let mut rng = RngType::seed_from_u64(1);
        let runs = [2, 3, 10];
        for _ in 0..1000 {
            assert!(choose_weighted(&mut rng, &runs) < 3);
        }
    }

    #[test]
    fn prios_bias_selection() {
        let target = Target::new("linux", "amd64").unwrap();
        let enabled: HashSet<SyscallId> = [0, 1].into_iter().collect();
        let mut prios = vec![1u64; target.syscalls().len()];
        prios[1] = 1000;
        let ct = ChoiceTable::build(&target, &enabled, Some(&prios));

        let mut rng = RngType::seed_from_u64(2);
        let picked: Vec<SyscallId> = (0..100).map(|_| ct.select(&mut rng)).collect();
        let ones = picked.iter().filter(|&&sid| sid == 1).count();
        assert!(ones > 80, "biased select picked {} / 100", ones);
    }

    #[test]
    fn select_only_enabled() {
        let target = Target::new("linux", "amd64").unwrap();
        let enabled: HashSet<SyscallId> = [3, 5, 7].into_iter().collect();
        let ct = ChoiceTable::build(&target, &enabled, None);
        let mut rng = RngType::seed_from_u64(3);
        for _ in 0..100 {
            assert!(enabled.contains(&ct.select(&mut rng)));
        }
    }
}
