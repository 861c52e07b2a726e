//! Coverage-signal state shared by all procs.
//!
//! Three sets under one lock: `max` is every token this worker has ever
//! seen, `corpus` the tokens attributable to corpus progs, `new` the tokens
//! to report on the next poll. `corpus ⊆ max` and `new ⊆ max` always hold;
//! all three grow monotonically except `new`, which the pollster drains.

use hornet_core::HashSet;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct Feedback {
    inner: RwLock<SignalSets>,
}

#[derive(Debug, Default)]
struct SignalSets {
    max: HashSet<u32>,
    corpus: HashSet<u32>,
    new: HashSet<u32>,
}

impl Feedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only diff against `max`: the tokens of `signal` not yet seen.
    pub fn diff_max(&self, signal: impl IntoIterator<Item = u32>) -> HashSet<u32> {
        let inner = self.inner.read().unwrap();
        signal
            .into_iter()
            .filter(|s| !inner.max.contains(s))
            .collect()
    }

    /// Extend `max` only; used when absorbing the manager's view.
    pub fn merge_max(&self, signal: impl IntoIterator<Item = u32>) {
        let mut inner = self.inner.write().unwrap();
        inner.max.extend(signal);
    }

    /// Extend `max` and `corpus` by `diff`; used for inputs pushed by the
    /// manager, whose signal is already known upstream and must not be
    /// reported back.
    pub fn absorb_input(&self, diff: &HashSet<u32>) {
        let mut inner = self.inner.write().unwrap();
        inner.max.extend(diff.iter().copied());
        inner.corpus.extend(diff.iter().copied());
    }

    /// Fold a stabilized triage signal in: `corpus` gets the whole set,
    /// `max` and `new` the genuinely novel part, which is returned. Two
    /// procs racing on the same token both succeed; only the first sees it
    /// in the returned diff.
    pub fn merge_triage(&self, stable: &HashSet<u32>) -> HashSet<u32> {
        let mut inner = self.inner.write().unwrap();
        let diff: HashSet<u32> = stable
            .iter()
            .copied()
            .filter(|t| !inner.max.contains(t))
            .collect();
        inner.max.extend(diff.iter().copied());
        inner.new.extend(diff.iter().copied());
        inner.corpus.extend(stable.iter().copied());
        diff
    }

    /// Drain `new` into a vector for the poll payload.
    pub fn drain_new(&self) -> Vec<u32> {
        let mut inner = self.inner.write().unwrap();
        let drained: Vec<u32> = inner.new.iter().copied().collect();
        inner.new.clear();
        drained
    }

    pub fn max_len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.max.len()
    }

    pub fn corpus_len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.corpus.len()
    }

    #[cfg(test)]
    fn invariants_hold(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.corpus.is_subset(&inner.max) && inner.new.is_subset(&inner.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tokens: &[u32]) -> HashSet<u32> {
        tokens.iter().copied().collect()
    }

    #[test]
    fn diff_is_read_only() {
        let fb = Feedback::new();
        let d = fb.diff_max([1, 2, 3]);
        assert_eq!(d, set(&[1, 2, 3]));
        // a second diff sees the same tokens as novel
        assert_eq!(fb.diff_max([1, 2, 3]), set(&[1, 2, 3]));
        assert_eq!(fb.max_len(), 0);
    }

    #[test]
    fn triage_merge_extends_all_sets() {
        let fb = Feedback::new();
        let diff = fb.merge_triage(&set(&[17, 42]));
        assert_eq!(diff, set(&[17, 42]));
        assert!(fb.diff_max([17, 42]).is_empty());
        assert_eq!(fb.corpus_len(), 2);
        assert_eq!(fb.max_len(), 2);
        assert!(fb.invariants_hold());

        let drained = fb.drain_new();
        assert_eq!(drained.len(), 2);
        assert!(drained.contains(&17) && drained.contains(&42));
    }

    #[test]
    fn racing_triage_is_idempotent() {
        let fb = Feedback::new();
        assert_eq!(fb.merge_triage(&set(&[9])), set(&[9]));
        // second publisher of the same token wins nothing but breaks nothing
        assert!(fb.merge_triage(&set(&[9])).is_empty());
        assert_eq!(fb.max_len(), 1);
        assert_eq!(fb.drain_new(), vec![9]);
        assert!(fb.invariants_hold());
    }

    #[test]
    fn drain_law() {
        let fb = Feedback::new();
        fb.merge_triage(&set(&[9]));
        assert_eq!(fb.drain_new(), vec![9]);
        assert!(fb.drain_new().is_empty());
        // tokens published between drains show up in the next one
        fb.merge_triage(&set(&[10]));
        assert_eq!(fb.drain_new(), vec![10]);
        assert!(fb.invariants_hold());
    }

    #[test]
    fn absorb_does_not_report_back() {
        let fb = Feedback::new();
        fb.absorb_input(&set(&[5, 6]));
        assert!(fb.drain_new().is_empty());
        assert!(fb.diff_max([5]).is_empty());
        assert!(fb.invariants_hold());
    }

    #[test]
    fn monotone_growth() {
        let fb = Feedback::new();
        let mut last = 0;
        for round in 0..32u32 {
            fb.merge_triage(&set(&[round * 3, round * 3 + 1]));
            fb.merge_max([round * 7]);
            let len = fb.max_len();
            assert!(len >= last);
            last = len;
            assert!(fb.invariants_hold());
            if round % 4 == 0 {
                fb.drain_new();
            }
        }
    }
}
