//! Shared work queue.
//!
//! Unbounded by design: triage must never be dropped or deadlocked, and
//! the procs self-throttle (generation only happens when the queue is
//! empty). Priority: triage > candidate > smash, FIFO within a class.

use hornet_core::{prog::Prog, HashSet};
use std::{
    collections::VecDeque,
    sync::{mpsc::SyncSender, Mutex},
};

/// Why a triage item exists; controls stabilization depth and whether
/// minimization may be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriageFlags {
    /// Signal was collected under collide mode and is likely noisy.
    pub noisy: bool,
    /// The prog is already minimal (manager said so).
    pub minimized: bool,
    /// Re-triage of a smash mutant; do not smash again.
    pub smashed: bool,
}

#[derive(Debug)]
pub enum WorkItem {
    Triage {
        prog: Prog,
        call_index: usize,
        signal: HashSet<u32>,
        flags: TriageFlags,
    },
    Candidate {
        prog: Prog,
        minimized: bool,
    },
    Smash {
        prog: Prog,
        call_index: usize,
    },
}

#[derive(Default)]
struct Inner {
    triage: VecDeque<WorkItem>,
    candidate: VecDeque<WorkItem>,
    smash: VecDeque<WorkItem>,
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    proc_count: usize,
    need_poll: SyncSender<()>,
}

impl WorkQueue {
    pub fn new(proc_count: usize, need_poll: SyncSender<()>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            proc_count,
            need_poll,
        }
    }

    /// Never blocks; the queue grows without bound.
    pub fn enqueue(&self, item: WorkItem) {
        let mut inner = self.inner.lock().unwrap();
        match &item {
            WorkItem::Triage { .. } => inner.triage.push_back(item),
            WorkItem::Candidate { .. } => inner.candidate.push_back(item),
            WorkItem::Smash { .. } => inner.smash.push_back(item),
        }
    }

    /// Highest-priority pending item, or `None` when empty.
    pub fn dequeue(&self) -> Option<WorkItem> {
        let item;
        let want_more;
        {
            let mut inner = self.inner.lock().unwrap();
            item = inner
                .triage
                .pop_front()
                .or_else(|| inner.candidate.pop_front())
                .or_else(|| inner.smash.pop_front());
            want_more = inner.candidate.len() < self.proc_count;
        }
        if want_more {
            // coalesced one-slot pulse; a full slot means a poll is due anyway
            let _ = self.need_poll.try_send(());
        }
        item
    }

    /// True when the candidate backlog runs below the low watermark.
    pub fn want_candidates(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.candidate.len() < self.proc_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hornet_core::prog::{Arg, Call, Prog};
    use std::sync::mpsc::sync_channel;

    fn prog(tag: u64) -> Prog {
        Prog::new(vec![Call::new(0, vec![Arg::Const(tag)])])
    }

    fn triage(tag: u64) -> WorkItem {
        WorkItem::Triage {
            prog: prog(tag),
            call_index: 0,
            signal: HashSet::new(),
            flags: TriageFlags {
                noisy: false,
                minimized: false,
                smashed: false,
            },
        }
    }

    fn candidate(tag: u64) -> WorkItem {
        WorkItem::Candidate {
            prog: prog(tag),
            minimized: false,
        }
    }

    fn smash(tag: u64) -> WorkItem {
        WorkItem::Smash {
            prog: prog(tag),
            call_index: 0,
        }
    }

    fn tag_of(item: &WorkItem) -> u64 {
        let p = match item {
            WorkItem::Triage { prog, .. } => prog,
            WorkItem::Candidate { prog, .. } => prog,
            WorkItem::Smash { prog, .. } => prog,
        };
        match p.calls()[0].args()[0] {
            Arg::Const(v) => v,
            _ => unreachable!(),
        }
    }

    #[test]
    fn priority_and_fifo() {
        let (tx, _rx) = sync_channel(1);
        let queue = WorkQueue::new(2, tx);
        queue.enqueue(smash(30));
        queue.enqueue(candidate(20));
        queue.enqueue(smash(31));
        queue.enqueue(triage(10));
        queue.enqueue(candidate(21));
        queue.enqueue(triage(11));

        let order: Vec<u64> = std::iter::from_fn(|| queue.dequeue()).map(|i| tag_of(&i)).collect();
        assert_eq!(order, vec![10, 11, 20, 21, 30, 31]);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn want_candidates_watermark() {
        let (tx, _rx) = sync_channel(1);
        let queue = WorkQueue::new(2, tx);
        assert!(queue.want_candidates());
        queue.enqueue(candidate(0));
        assert!(queue.want_candidates());
        queue.enqueue(candidate(1));
        assert!(!queue.want_candidates());
        queue.dequeue().unwrap();
        assert!(queue.want_candidates());
    }

    #[test]
    fn dequeue_pulses_need_poll() {
        let (tx, rx) = sync_channel(1);
        let queue = WorkQueue::new(1, tx);
        queue.enqueue(triage(1));
        queue.dequeue().unwrap();
        assert!(rx.try_recv().is_ok());
        // pulses coalesce: several dequeues, at most one pending pulse
        queue.enqueue(triage(2));
        queue.enqueue(triage(3));
        queue.dequeue().unwrap();
        queue.dequeue().unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
