//! Proc: one fuzz loop over one executor.
//!
//! Triage, minimization, smash and hint analysis all run inline on the
//! proc thread. That keeps executor affinity and means a proc's own
//! discoveries stabilize before it returns to generation.

use crate::{
    config::OutputKind,
    fuzzer::SharedState,
    proc_log,
    queue::{TriageFlags, WorkItem},
    stats::{ProcStats, Stat},
    util::stop_soon,
};
use anyhow::Context;
use hornet_core::{
    gen::gen,
    mutation::{mutate, mutate_with_hints},
    prog::Prog,
    HashSet, RngType,
};
use hornet_exec::{CallExecInfo, ExecError, ExecOpt, Executor, FLAG_COLLECT_COMPS};
use rand::Rng;
use std::{
    env::temp_dir,
    fs::{File, OpenOptions},
    io::Write,
    sync::Arc,
    thread::sleep,
    time::Duration,
};

/// Stabilization runs; noisy signal (collide mode) gets one more.
const TRIAGE_RUNS_NOISY: usize = 3;
const TRIAGE_RUNS: usize = 2;
/// Mutations per smash burst.
const SMASH_BURST: usize = 100;
/// At least one generated prog per this many fuzz iterations, however
/// large the corpus grows.
const GEN_PERIOD_CAP: u32 = 100;
/// Without coverage there is nothing to mutate toward.
const GEN_PERIOD_NO_COVER: u32 = 2;
const MAX_SPAWN_TRIES: usize = 10;

/// How an execution came to be; decides the triage flags of any novel
/// signal it produces.
#[derive(Debug, Clone, Copy)]
enum ExecKind {
    Fuzz,
    Candidate { minimized: bool },
    Smash,
}

impl ExecKind {
    fn triage_flags(self) -> TriageFlags {
        match self {
            ExecKind::Fuzz => TriageFlags {
                noisy: true,
                minimized: false,
                smashed: false,
            },
            ExecKind::Candidate { minimized } => TriageFlags {
                noisy: false,
                minimized,
                smashed: false,
            },
            ExecKind::Smash => TriageFlags {
                noisy: true,
                minimized: false,
                smashed: true,
            },
        }
    }
}

#[inline]
fn gen_period(no_cover: bool, corpus_len: usize) -> u32 {
    if no_cover {
        GEN_PERIOD_NO_COVER
    } else {
        (corpus_len as u32).saturating_add(1).min(GEN_PERIOD_CAP)
    }
}

pub struct Proc {
    shared: SharedState,
    id: usize,
    rng: RngType,
    executor: Executor,
    stats: Arc<ProcStats>,
    output: OutputKind,
    sink: Option<File>,
}

impl Proc {
    pub fn new(
        shared: SharedState,
        id: usize,
        rng: RngType,
        executor: Executor,
        stats: Arc<ProcStats>,
        output: OutputKind,
    ) -> Self {
        let sink = match output {
            OutputKind::Dmesg => OpenOptions::new().write(true).open("/dev/kmsg").ok(),
            OutputKind::File => {
                File::create(temp_dir().join(format!("hornet-prog-{}.log", id))).ok()
            }
            _ => None,
        };
        Self {
            shared,
            id,
            rng,
            executor,
            stats,
            output,
            sink,
        }
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        proc_log::set_proc_id(self.id as u64);
        if !self.executor.is_spawned() {
            self.executor
                .spawn()
                .with_context(|| format!("failed to spawn executor for proc-{}", self.id))?;
        }
        proc_log!(info, "executor ready");

        while !stop_soon() {
            if let Some(item) = self.shared.queue.dequeue() {
                match item {
                    WorkItem::Triage {
                        prog,
                        call_index,
                        signal,
                        flags,
                    } => self.triage(prog, call_index, signal, flags)?,
                    WorkItem::Candidate { prog, minimized } => {
                        self.candidate(prog, minimized)?
                    }
                    WorkItem::Smash { prog, call_index } => self.smash(prog, call_index)?,
                }
                continue;
            }

            let corpus_len = self.shared.corpus.len();
            let period = gen_period(self.shared.no_cover, corpus_len);
            if corpus_len == 0 || self.rng.gen_ratio(1, period) {
                let p = gen(&self.shared.target, &self.shared.choice_table, &mut self.rng);
                self.execute_and_check(&p, &ExecOpt::new(), Stat::Generate, ExecKind::Fuzz)?;
            } else {
                let mut p = (*self.shared.corpus.select_one(&mut self.rng).unwrap()).clone();
                let donor = self.shared.corpus.select_one(&mut self.rng);
                mutate(
                    &self.shared.target,
                    &self.shared.choice_table,
                    &mut self.rng,
                    &mut p,
                    donor.as_deref(),
                );
                self.execute_and_check(&p, &ExecOpt::new(), Stat::Fuzz, ExecKind::Fuzz)?;
            }
        }
        Ok(())
    }

    /// Execute and enqueue a triage item for every call with novel signal.
    fn execute_and_check(
        &mut self,
        p: &Prog,
        opt: &ExecOpt,
        stat: Stat,
        kind: ExecKind,
    ) -> anyhow::Result<Option<Vec<CallExecInfo>>> {
        let info = match self.execute(p, opt, stat)? {
            Some(info) => info,
            None => return Ok(None),
        };
        if !self.shared.no_cover {
            for (i, call_info) in info.iter().enumerate() {
                let diff = self
                    .shared
                    .feedback
                    .diff_max(call_info.branches.iter().copied());
                if diff.is_empty() {
                    continue;
                }
                proc_log!(trace, "call {} produced {} novel tokens", i, diff.len());
                self.shared.queue.enqueue(WorkItem::Triage {
                    prog: p.clone(),
                    call_index: i,
                    signal: diff,
                    flags: kind.triage_flags(),
                });
            }
        }
        Ok(Some(info))
    }

    /// One gated executor round-trip. `None` means the execution was lost
    /// to an executor failure and the current work item should be dropped.
    fn execute(
        &mut self,
        p: &Prog,
        opt: &ExecOpt,
        stat: Stat,
    ) -> anyhow::Result<Option<Vec<CallExecInfo>>> {
        self.log_prog(p);
        let ticket = self.shared.gate.enter();
        let ret = self.executor.execute_one(&self.shared.target, p, opt);
        self.shared.gate.leave(ticket);
        self.shared.stats.inc(stat);
        self.stats.inc_exec_total();

        match ret {
            Ok(info) => Ok(Some(info)),
            // our own progs must always fit the input region; this is a
            // pipeline bug, not an executor failure
            Err(ExecError::ProgSerialization(e)) => {
                Err(e).context("prog serialization failed")
            }
            Err(e) => {
                if matches!(e, ExecError::TimedOut) {
                    proc_log!(
                        warn,
                        "prog hanged, killed by watchdog:\n{}",
                        p.display(&self.shared.target)
                    );
                } else {
                    proc_log!(warn, "executor failed: {}", e);
                }
                self.restart_executor()?;
                Ok(None)
            }
        }
    }

    fn restart_executor(&mut self) -> anyhow::Result<()> {
        self.stats.inc_restarts();
        let mut delay = Duration::from_millis(100);
        for _ in 0..MAX_SPAWN_TRIES {
            match self.executor.spawn() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    proc_log!(warn, "executor respawn failed: {}", e);
                    sleep(delay);
                    delay *= 2;
                }
            }
        }
        anyhow::bail!(
            "proc-{}: executor would not come back after {} tries",
            self.id,
            MAX_SPAWN_TRIES
        )
    }

    /// Re-execute to stabilize the signal, minimize, publish.
    fn triage(
        &mut self,
        prog: Prog,
        call_index: usize,
        signal: HashSet<u32>,
        flags: TriageFlags,
    ) -> anyhow::Result<()> {
        proc_log!(trace, "triaging call {} with {} tokens", call_index, signal.len());
        let mut stable = signal;
        let runs = if flags.noisy {
            TRIAGE_RUNS_NOISY
        } else {
            TRIAGE_RUNS
        };
        let opt = ExecOpt::new_no_collide();
        for _ in 0..runs {
            let info = match self.execute(&prog, &opt, Stat::Triage)? {
                Some(info) => info,
                None => return Ok(()),
            };
            let observed = call_signal(&info, call_index);
            intersect_signal(&mut stable, &observed);
            if stable.is_empty() {
                // not reproducible
                return Ok(());
            }
        }
        if self.shared.feedback.diff_max(stable.iter().copied()).is_empty() {
            // another proc published it while we stabilized
            return Ok(());
        }

        let (min_p, min_call) = if flags.minimized {
            (prog, call_index)
        } else {
            self.minimize(prog, call_index, &stable)?
        };

        // corpus lock first, signal lock second
        let added = self.shared.corpus.add_prog(min_p.clone());
        let diff = self.shared.feedback.merge_triage(&stable);
        proc_log!(
            info,
            "new input ({} tokens), corpus {}, max signal {}",
            diff.len(),
            self.shared.corpus.len(),
            self.shared.feedback.max_len()
        );
        if added && !flags.smashed {
            self.shared.queue.enqueue(WorkItem::Smash {
                prog: min_p,
                call_index: min_call,
            });
        }
        Ok(())
    }

    fn candidate(&mut self, prog: Prog, minimized: bool) -> anyhow::Result<()> {
        self.execute_and_check(
            &prog,
            &ExecOpt::new(),
            Stat::Candidate,
            ExecKind::Candidate { minimized },
        )?;
        Ok(())
    }

    /// Drop calls from last to first as long as the stable signal of the
    /// pivotal call survives.
    fn minimize(
        &mut self,
        mut p: Prog,
        mut call_idx: usize,
        stable: &HashSet<u32>,
    ) -> anyhow::Result<(Prog, usize)> {
        let opt = ExecOpt::new_no_collide();
        let mut i = p.len();
        while i > 0 {
            i -= 1;
            if p.len() <= 1 {
                break;
            }
            if i == call_idx {
                continue;
            }
            let cand = p.remove_call(i);
            let cand_idx = if i < call_idx { call_idx - 1 } else { call_idx };
            let info = match self.execute(&cand, &opt, Stat::Minimize)? {
                Some(info) => info,
                // executor trouble: keep the best prog so far
                None => return Ok((p, call_idx)),
            };
            let observed = call_signal(&info, cand_idx);
            if stable.iter().all(|t| observed.contains(t)) {
                p = cand;
                call_idx = cand_idx;
            }
        }
        Ok((p, call_idx))
    }

    /// Long mutation burst over a freshly triaged prog, plus one round of
    /// comparison-hint mutations.
    fn smash(&mut self, p: Prog, call_index: usize) -> anyhow::Result<()> {
        self.hints(&p, call_index)?;
        for _ in 0..SMASH_BURST {
            if stop_soon() {
                break;
            }
            let mut m = p.clone();
            let donor = self.shared.corpus.select_one(&mut self.rng);
            mutate(
                &self.shared.target,
                &self.shared.choice_table,
                &mut self.rng,
                &mut m,
                donor.as_deref(),
            );
            self.execute_and_check(&m, &ExecOpt::new(), Stat::Smash, ExecKind::Smash)?;
        }
        Ok(())
    }

    fn hints(&mut self, p: &Prog, call_index: usize) -> anyhow::Result<()> {
        let mut opt = ExecOpt::new_no_collide();
        opt.enable(FLAG_COLLECT_COMPS);
        let info = match self.execute(p, &opt, Stat::Seed)? {
            Some(info) => info,
            None => return Ok(()),
        };
        let comps = match info.get(call_index) {
            Some(call_info) if !call_info.comps.is_empty() => call_info.comps.clone(),
            _ => return Ok(()),
        };
        for mutant in mutate_with_hints(p, call_index, &comps) {
            if stop_soon() {
                break;
            }
            self.execute_and_check(&mutant, &ExecOpt::new(), Stat::Hint, ExecKind::Fuzz)?;
        }
        Ok(())
    }

    fn log_prog(&mut self, p: &Prog) {
        match self.output {
            OutputKind::None => {}
            OutputKind::Stdout => println!("{}", p.display(&self.shared.target)),
            OutputKind::Dmesg | OutputKind::File => {
                if let Some(sink) = self.sink.as_mut() {
                    let _ = writeln!(sink, "proc-{}:\n{}", self.id, p.display(&self.shared.target));
                }
            }
        }
    }
}

fn call_signal(info: &[CallExecInfo], call_index: usize) -> HashSet<u32> {
    info.get(call_index)
        .map(|call_info| call_info.branches.iter().copied().collect())
        .unwrap_or_default()
}

/// Keep only the tokens every run reproduced.
fn intersect_signal(stable: &mut HashSet<u32>, observed: &HashSet<u32>) {
    stable.retain(|t| observed.contains(t));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triage_flags_by_kind() {
        let f = ExecKind::Fuzz.triage_flags();
        assert!(f.noisy && !f.minimized && !f.smashed);

        let f = ExecKind::Candidate { minimized: true }.triage_flags();
        assert!(!f.noisy && f.minimized && !f.smashed);

        let f = ExecKind::Smash.triage_flags();
        assert!(f.noisy && f.smashed);
    }

    #[test]
    fn gen_period_scaling() {
        assert_eq!(gen_period(false, 0), 1);
        assert_eq!(gen_period(false, 9), 10);
        assert_eq!(gen_period(false, 10_000), GEN_PERIOD_CAP);
        assert_eq!(gen_period(true, 10_000), GEN_PERIOD_NO_COVER);
    }

    #[test]
    fn stabilization_is_an_intersection() {
        // deterministic signal: stabilizing changes nothing
        let run: HashSet<u32> = [1, 2, 3].into_iter().collect();
        let mut stable = run.clone();
        for _ in 0..3 {
            intersect_signal(&mut stable, &run);
        }
        assert_eq!(stable, run);

        // noisy signal: the stable set is a subset of every run
        let runs: Vec<HashSet<u32>> = vec![
            [1, 2, 3].into_iter().collect(),
            [2, 3, 4].into_iter().collect(),
            [2, 3, 5].into_iter().collect(),
        ];
        let mut stable = runs[0].clone();
        for run in &runs {
            intersect_signal(&mut stable, run);
        }
        for run in &runs {
            assert!(stable.is_subset(run));
        }
        assert_eq!(stable, [2, 3].into_iter().collect::<HashSet<u32>>());
    }

    #[test]
    fn call_signal_out_of_range() {
        let info = vec![CallExecInfo {
            branches: vec![1, 2],
            ..Default::default()
        }];
        assert_eq!(call_signal(&info, 0).len(), 2);
        assert!(call_signal(&info, 5).is_empty());
    }
}
