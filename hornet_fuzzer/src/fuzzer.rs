//! Shared worker state and its owner.

use crate::{
    feedback::Feedback,
    gate::Gate,
    queue::WorkQueue,
    stats::{ProcStats, Stats},
};
use hornet_core::{corpus::CorpusWrapper, prog::Prog, select::ChoiceTable, target::Target, HashSet};
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

/// Everything the procs and the pollster share. Cloning bumps the `Arc`s.
pub struct SharedState {
    pub target: Arc<Target>,
    pub choice_table: Arc<ChoiceTable>,
    pub corpus: Arc<CorpusWrapper>,
    pub feedback: Arc<Feedback>,
    pub stats: Arc<Stats>,
    pub queue: Arc<WorkQueue>,
    pub gate: Arc<Gate>,
    pub all_triaged: Arc<AtomicU32>,
    /// Coverage collection is unavailable; candidates go straight to the
    /// corpus and no triage happens.
    pub no_cover: bool,
}

impl Clone for SharedState {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
            choice_table: Arc::clone(&self.choice_table),
            corpus: Arc::clone(&self.corpus),
            feedback: Arc::clone(&self.feedback),
            stats: Arc::clone(&self.stats),
            queue: Arc::clone(&self.queue),
            gate: Arc::clone(&self.gate),
            all_triaged: Arc::clone(&self.all_triaged),
            no_cover: self.no_cover,
        }
    }
}

impl SharedState {
    /// Add a prog with known signal, e.g. one pushed by the manager.
    /// Dedup by content hash is a silent no-op; the signal is merged either
    /// way. Lock order is corpus first, signal second; nothing else takes
    /// both.
    pub fn add_input(&self, prog: Prog, signal: impl IntoIterator<Item = u32>) {
        self.corpus.add_prog(prog);
        let diff: HashSet<u32> = self.feedback.diff_max(signal);
        if !diff.is_empty() {
            self.feedback.absorb_input(&diff);
        }
    }

    pub fn have_triaged_all(&self) -> bool {
        self.all_triaged.load(Ordering::Acquire) != 0
    }

    pub fn mark_triaged(&self) {
        self.all_triaged.store(1, Ordering::Release);
    }
}

/// Passive owner of the proc pool and the shared state. Constructed at
/// bootstrap; the pollster borrows it for the rest of the process lifetime.
pub struct Fuzzer {
    pub shared: SharedState,
    pub proc_stats: Vec<Arc<ProcStats>>,
    pub handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Gate;
    use hornet_core::prog::{Arg, Call};
    use std::sync::mpsc::sync_channel;

    fn shared_state() -> SharedState {
        let target = Target::new("linux", "amd64").unwrap();
        let enabled = target.build_call_set("", |_| true).unwrap();
        let ct = ChoiceTable::build(&target, &enabled, None);
        let (tx, _rx) = sync_channel(1);
        SharedState {
            target: Arc::new(target),
            choice_table: Arc::new(ct),
            corpus: Arc::new(CorpusWrapper::new()),
            feedback: Arc::new(Feedback::new()),
            stats: Arc::new(Stats::new()),
            queue: Arc::new(WorkQueue::new(1, tx)),
            gate: Arc::new(Gate::new(2, u64::MAX, None)),
            all_triaged: Arc::new(AtomicU32::new(0)),
            no_cover: false,
        }
    }

    fn prog(tag: u64) -> Prog {
        Prog::new(vec![Call::new(0, vec![Arg::Const(tag)])])
    }

    #[test]
    fn add_input_dedups_but_merges_signal() {
        let shared = shared_state();
        shared.add_input(prog(1), [17, 42]);
        assert_eq!(shared.corpus.len(), 1);
        assert_eq!(shared.feedback.max_len(), 2);

        // same bytes, more signal: corpus unchanged, signal still merged
        shared.add_input(prog(1), [17, 42, 99]);
        assert_eq!(shared.corpus.len(), 1);
        assert_eq!(shared.feedback.max_len(), 3);
        // manager-known signal is not reported back
        assert!(shared.feedback.drain_new().is_empty());
    }

    #[test]
    fn triage_flag_latches() {
        let shared = shared_state();
        assert!(!shared.have_triaged_all());
        shared.mark_triaged();
        assert!(shared.have_triaged_all());
        shared.mark_triaged();
        assert!(shared.have_triaged_all());
    }
}
