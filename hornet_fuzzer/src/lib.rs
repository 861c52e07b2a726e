//! Hornet fuzzer worker: one instance per test VM, driven by the manager.

#[macro_use]
pub mod proc_log;
pub mod arch;
pub mod config;
pub mod feedback;
pub mod fuzzer;
pub mod gate;
pub mod leak;
pub mod proc;
pub mod queue;
pub mod rpc;
pub mod stats;
pub mod util;

use crate::{
    config::{Config, OutputKind},
    feedback::Feedback,
    fuzzer::{Fuzzer, SharedState},
    gate::{Gate, ScanCallback},
    leak::LeakScanner,
    proc::Proc,
    queue::{WorkItem, WorkQueue},
    rpc::{CheckArgs, PollArgs, RpcCandidate, RpcClient},
    stats::{ProcStats, Stats, ALL_STATS},
    util::{stop_req, stop_soon},
};
use anyhow::Context;
use hornet_core::{
    corpus::CorpusWrapper, prog::Prog, select::ChoiceTable, target::Target,
};
use hornet_exec::{
    default_env_flags,
    features::{
        detect_features, supported_syscalls, FEATURES_NAME, FEATURE_COMPARISONS,
        FEATURE_COVERAGE, FEATURE_FAULT, FEATURE_LEAK, FEATURE_NET_INJECTION, FEATURE_USER_NS,
    },
    executor_version, ExecConfig, Executor, FLAG_ENABLE_FAULT, FLAG_ENABLE_TUN, FLAG_SIGNAL,
    IN_SHM_SZ, OUT_SHM_SZ,
};
use rand::{rngs::SmallRng, SeedableRng};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        mpsc::{sync_channel, Receiver, RecvTimeoutError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

const POLL_TICK: Duration = Duration::from_secs(3);
/// Poll at least this often even with a full candidate backlog.
const POLL_IDLE: Duration = Duration::from_secs(10);
const KEEPALIVE: Duration = Duration::from_secs(10);
/// Completed executions between gate barriers (leak scans).
const LEAK_SCAN_PERIOD: u64 = 4096;

pub fn boot(config: Config) -> anyhow::Result<()> {
    config.check().context("config error")?;
    setup_signal_handler();

    if config.test {
        return test_image(&config);
    }

    let target = Target::new("linux", &config.arch).context("failed to resolve target")?;

    // The connect reply can be very large; do it on a transient connection
    // so that memory is freed before steady state.
    log::info!("dialing manager at {}", config.manager);
    let mut conn = RpcClient::connect(&config.manager).context("failed to dial manager")?;
    let r = conn
        .handshake(&config.name)
        .context("connect rpc failed")?;
    log::info!(
        "connected: {} inputs, {} candidates, {} max signal, need_check={}",
        r.inputs.len(),
        r.candidates.len(),
        r.max_signal.len(),
        r.need_check
    );

    let supported = supported_syscalls();
    let calls = target
        .build_call_set(&r.enabled_calls, |s| {
            supported.as_ref().map_or(true, |set| set.contains(s.name()))
        })
        .context("bad enabled call list")?;
    if calls.is_empty() {
        anyhow::bail!("no syscalls enabled for this worker");
    }
    log::info!("enabled calls: {}", calls.len());
    let choice_table = ChoiceTable::build(&target, &calls, r.prios.as_deref());

    let features = detect_features(&config.executor).context("failed to detect features")?;
    for (i, feature) in FEATURES_NAME.iter().enumerate() {
        if features & (1 << i) != 0 {
            log::info!("{:<24}: enabled", feature);
        }
    }
    let no_cover = features & FEATURE_COVERAGE == 0;
    let mut env = default_env_flags(config.debug);
    if no_cover {
        env &= !FLAG_SIGNAL;
    }
    if features & FEATURE_NET_INJECTION != 0 {
        env |= FLAG_ENABLE_TUN;
    }
    if features & FEATURE_FAULT != 0 {
        env |= FLAG_ENABLE_FAULT;
    }

    if r.need_check {
        let vers =
            executor_version(&config.executor).context("failed to probe executor version")?;
        if vers.arch != config.arch {
            anyhow::bail!("executor arch mismatch: {} vs {}", vers.arch, config.arch);
        }
        let args = CheckArgs {
            name: config.name.clone(),
            arch: config.arch.clone(),
            fuzzer_rev: hornet_core::target::REVISION.to_string(),
            executor_syz_rev: vers.syz_rev,
            executor_git_rev: vers.git_rev,
            executor_arch: vers.arch,
            calls: calls
                .iter()
                .map(|&sid| target.syscall_of(sid).name().to_string())
                .collect(),
            kcov: features & FEATURE_COVERAGE != 0,
            leak: features & FEATURE_LEAK != 0,
            fault: features & FEATURE_FAULT != 0,
            comps: features & FEATURE_COMPARISONS != 0,
            user_ns: features & FEATURE_USER_NS != 0,
        };
        conn.check(args).context("manager check failed")?;
    }

    // swap the transient connection for the long-lived one
    drop(conn);
    let manager = RpcClient::connect(&config.manager).context("failed to re-dial manager")?;

    let leak_enabled = config.leak && features & FEATURE_LEAK != 0;
    let scanner =
        Arc::new(LeakScanner::init(leak_enabled).context("failed to init leak scanner")?);

    let stats = Arc::new(Stats::new());
    let all_triaged = Arc::new(AtomicU32::new(0));
    let (need_poll_tx, need_poll_rx) = sync_channel(1);
    let queue = Arc::new(WorkQueue::new(config.procs, need_poll_tx.clone()));
    let leak_cb: Option<ScanCallback> = if leak_enabled {
        let scanner = Arc::clone(&scanner);
        let all_triaged = Arc::clone(&all_triaged);
        Some(Box::new(move || {
            // scans are slow; hold off until bring-up is done
            if all_triaged.load(Ordering::Acquire) != 0 {
                scanner.scan(true);
            }
        }))
    } else {
        None
    };
    let gate = Arc::new(Gate::new(2 * config.procs, LEAK_SCAN_PERIOD, leak_cb));

    let shared = SharedState {
        target: Arc::new(target),
        choice_table: Arc::new(choice_table),
        corpus: Arc::new(CorpusWrapper::new()),
        feedback: Arc::new(Feedback::new()),
        stats,
        queue,
        gate,
        all_triaged,
        no_cover,
    };

    shared.feedback.merge_max(r.max_signal.iter().copied());
    for inp in &r.inputs {
        let p = Prog::from_bytes(&inp.prog).context("manager sent an undecodable input")?;
        shared.add_input(p, inp.signal.iter().copied());
    }
    log::info!("corpus seeded: {} progs", shared.corpus.len());
    enqueue_candidates(&shared, r.candidates)?;

    let mut fuzzer = Fuzzer {
        shared: SharedState::clone(&shared),
        proc_stats: Vec::new(),
        handles: Vec::new(),
    };
    for pid in 0..config.procs {
        let proc_stats = Arc::new(ProcStats::default());
        fuzzer.proc_stats.push(Arc::clone(&proc_stats));

        let mut executor = Executor::with_config(ExecConfig {
            pid: pid as u64,
            env,
            executor: config.executor.clone(),
            shms: setup_shm(pid),
            debug: config.debug,
        });
        if pid == 0 {
            // fail fast on a broken image before starting the pool
            executor
                .spawn()
                .context("failed to spawn executor for proc-0")?;
        }

        let shared = SharedState::clone(&shared);
        let output = config.output;
        let handle = thread::Builder::new()
            .name(format!("proc-{}", pid))
            .spawn(move || {
                Proc::new(
                    shared,
                    pid,
                    SmallRng::from_entropy(),
                    executor,
                    proc_stats,
                    output,
                )
                .run()
            })
            .context("failed to spawn proc thread")?;
        fuzzer.handles.push(handle);
    }
    log::info!("{} procs started", config.procs);

    // wake the pollster right away; the first poll reports bring-up state
    let _ = need_poll_tx.try_send(());
    poll_loop(&fuzzer, manager, need_poll_rx, &config, &scanner)
}

/// Periodic exchange with the manager. Runs on the bootstrap thread.
fn poll_loop(
    fuzzer: &Fuzzer,
    mut manager: RpcClient,
    need_poll: Receiver<()>,
    config: &Config,
    scanner: &LeakScanner,
) -> anyhow::Result<()> {
    let shared = &fuzzer.shared;
    let mut exec_total = 0u64;
    let mut last_poll = Instant::now();
    let mut last_print = Instant::now();

    loop {
        let pulsed = match need_poll.recv_timeout(POLL_TICK) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => anyhow::bail!("work queue disappeared"),
        };
        if stop_soon() {
            return Ok(());
        }
        if config.output != OutputKind::Stdout && last_print.elapsed() > KEEPALIVE {
            // keep-alive for the manager's liveness check
            log::info!("alive, executed {}", exec_total);
            last_print = Instant::now();
        }
        if !pulsed && last_poll.elapsed() <= POLL_IDLE {
            continue;
        }
        let need_candidates = shared.queue.want_candidates();
        if pulsed && !need_candidates {
            continue;
        }

        let mut stats_map: HashMap<String, u64> = HashMap::new();
        let mut execs = 0;
        let mut restarts = 0;
        for ps in &fuzzer.proc_stats {
            execs += ps.exec_total.swap(0, Ordering::Relaxed);
            restarts += ps.restarts.swap(0, Ordering::Relaxed);
        }
        stats_map.insert("exec total".to_string(), execs);
        stats_map.insert("executor restarts".to_string(), restarts);
        for stat in ALL_STATS {
            let v = shared.stats.swap(stat);
            stats_map.insert(stat.name().to_string(), v);
            exec_total += v;
        }

        let args = PollArgs {
            name: config.name.clone(),
            need_candidates,
            stats: stats_map,
            max_signal: shared.feedback.drain_new(),
        };
        let r = manager.poll(args).context("poll rpc failed")?;
        log::debug!(
            "poll: candidates={} inputs={} signal={}",
            r.candidates.len(),
            r.new_inputs.len(),
            r.max_signal.len()
        );

        if !r.max_signal.is_empty() {
            shared.feedback.merge_max(r.max_signal.iter().copied());
        }
        for inp in &r.new_inputs {
            let p = Prog::from_bytes(&inp.prog).context("manager sent an undecodable input")?;
            shared.add_input(p, inp.signal.iter().copied());
        }
        let no_candidates = r.candidates.is_empty();
        let no_inputs = r.new_inputs.is_empty();
        enqueue_candidates(shared, r.candidates)?;

        if no_candidates && !shared.have_triaged_all() {
            // bring-up complete; take the leak baseline before enabling scans
            if config.leak {
                scanner.scan(false);
            }
            shared.mark_triaged();
        }
        if no_inputs && no_candidates {
            // idle manager: rate-limit subsequent polls
            last_poll = Instant::now();
        }
    }
}

fn enqueue_candidates(shared: &SharedState, candidates: Vec<RpcCandidate>) -> anyhow::Result<()> {
    for candidate in candidates {
        let p =
            Prog::from_bytes(&candidate.prog).context("manager sent an undecodable candidate")?;
        if shared.no_cover {
            shared.corpus.add_prog(p);
        } else {
            shared.queue.enqueue(WorkItem::Candidate {
                prog: p,
                minimized: candidate.minimized,
            });
        }
    }
    Ok(())
}

fn setup_signal_handler() {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    thread::spawn(move || {
        let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS).unwrap();
        let info = signals.into_iter().next().unwrap();
        let name = signal_hook::low_level::signal_name(info.signal)
            .map(|n| n.to_string())
            .unwrap_or_else(|| info.signal.to_string());
        log::error!("{} received: preempted", name);
        // no graceful drain: the manager redistributes in-flight work
        stop_req();
        std::process::exit(1);
    });
}

/// One-shot image smoke test; bypasses the fuzz loop entirely.
fn test_image(config: &Config) -> anyhow::Result<()> {
    let vers = executor_version(&config.executor).context("executor version probe failed")?;
    log::info!(
        "executor: arch {}, rev {}/{}",
        vers.arch,
        vers.syz_rev,
        vers.git_rev
    );
    let features = detect_features(&config.executor).context("feature probe failed")?;
    for (i, feature) in FEATURES_NAME.iter().enumerate() {
        if features & (1 << i) != 0 {
            log::info!("{:<24}: enabled", feature);
        }
    }
    let mut executor = Executor::with_config(ExecConfig {
        pid: 0,
        env: default_env_flags(config.debug),
        executor: config.executor.clone(),
        shms: None,
        debug: config.debug,
    });
    executor.spawn().context("executor smoke test failed")?;
    log::info!("image ok");
    Ok(())
}

fn setup_shm(pid: usize) -> Option<(Shmem, Shmem)> {
    let in_id = format!("hornet-in-{}-{}", pid, std::process::id());
    let out_id = format!("hornet-out-{}-{}", pid, std::process::id());
    let in_shm = create_shm(&in_id, IN_SHM_SZ)?;
    let out_shm = create_shm(&out_id, OUT_SHM_SZ)?;
    Some((in_shm, out_shm))
}

fn create_shm(id: &str, sz: usize) -> Option<Shmem> {
    match ShmemConf::new().os_id(id).size(sz).create() {
        Ok(mut shm) => {
            shm.set_owner(true);
            Some(shm)
        }
        Err(ShmemError::MappingIdExists) => {
            let mut shm = ShmemConf::new().os_id(id).size(sz).open().ok()?;
            shm.set_owner(true);
            Some(shm)
        }
        Err(e) => {
            log::warn!("shm unavailable ({}), falling back to pipe transfer", e);
            None
        }
    }
}
