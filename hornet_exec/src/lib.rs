//! Driver for the native executor child process.
//!
//! One executor per proc, for the proc's whole lifetime. The handle owns
//! the child, its pipes and the shared-memory I/O region, and is respawned
//! by its owner on transport failure.

pub mod features;
pub mod message;
pub mod serialization;

use crate::{message::*, serialization::*};
use bytes::Buf;
use chrono::Duration;
use hornet_core::{prog::Prog, target::Target};
use iota::iota;
use nix::{
    sys::signal::{kill, Signal::SIGTERM},
    unistd::Pid,
};
use shared_memory::Shmem;
use std::{
    io::Write,
    mem::size_of,
    path::PathBuf,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    slice,
};
use thiserror::Error;

/// Env flags, fixed for the lifetime of one executor.
pub type EnvFlags = u64;

iota! {
    pub const FLAG_DEBUG: EnvFlags = 1 << (iota);    // debug output from executor
    , FLAG_SIGNAL                                    // collect feedback signals (coverage)
    , FLAG_ENABLE_TUN                                // setup and use /dev/tun for packet injection
    , FLAG_ENABLE_FAULT                              // fault injection support
}

pub fn default_env_flags(debug: bool) -> EnvFlags {
    let mut env = FLAG_SIGNAL;
    if debug {
        env |= FLAG_DEBUG;
    }
    env
}

/// Flags controlling one execution.
pub type ExecFlags = u64;

iota! {
    pub const FLAG_COLLECT_COVER: ExecFlags = 1 << (iota); // collect coverage
    , FLAG_DEDUP_COVER                                 // deduplicate coverage in executor
    , FLAG_INJECT_FAULT                                // inject a fault in this execution
    , FLAG_COLLECT_COMPS                               // collect comparison operands
    , FLAG_THREADED                                    // use threads to mitigate blocked syscalls
    , FLAG_COLLIDE                                     // collide syscalls to provoke data races
}

#[derive(Debug, Clone)]
pub struct ExecOpt {
    pub flags: ExecFlags,
    pub fault_call: i32,
    pub fault_nth: i32,
}

impl Default for ExecOpt {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecOpt {
    pub const fn new() -> Self {
        Self {
            flags: FLAG_DEDUP_COVER | FLAG_THREADED | FLAG_COLLIDE,
            fault_call: 0,
            fault_nth: 0,
        }
    }

    /// Deterministic variant used for triage and minimization runs.
    pub const fn new_no_collide() -> Self {
        Self {
            flags: FLAG_DEDUP_COVER | FLAG_THREADED,
            fault_call: 0,
            fault_nth: 0,
        }
    }

    #[inline]
    pub fn enable(&mut self, flag: ExecFlags) {
        self.flags |= flag;
    }

    #[inline]
    pub fn disable(&mut self, flag: ExecFlags) {
        self.flags &= ExecFlags::MAX ^ flag;
    }
}

/// Per-call result flags.
pub type CallFlags = u32;

iota! {
    pub const CALL_EXECUTED: CallFlags = 1 << (iota); // started at all
    , CALL_FINISHED                               // finished executing, not blocked forever
    , CALL_BLOCKED                                // blocked during execution
    , CALL_FAULT_INJECTED                         // fault was injected into this call
}

/// Execution result of one call.
#[derive(Debug, Default, Clone)]
pub struct CallExecInfo {
    pub flags: CallFlags,
    /// Branch coverage signal.
    pub branches: Vec<u32>,
    /// Block coverage.
    pub blocks: Vec<u32>,
    /// Comparison operands observed during the call.
    pub comps: Vec<(u64, u64)>,
    pub errno: i32,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("prog serialization: {0}")]
    ProgSerialization(#[from] SerializeError),
    #[error("executor internal error")]
    ExecInternal,
    #[error("killed (likely a hanged prog)")]
    TimedOut,
    #[error("unexpected executor exit status: {0}")]
    UnexpectedExitStatus(i32),
    #[error("output parse: {0}")]
    OutputParse(String),
}

/// Size of the executor input region.
pub const IN_SHM_SZ: usize = 4 << 20;
/// Size of the executor output region.
pub const OUT_SHM_SZ: usize = 16 << 20;

const EXTRA_REPLY_INDEX: u32 = 0xffff_ffff;
const STATUS_INTERNAL_ERROR: i32 = 67;
const EXEC_TIMEOUT_S: i64 = 20;

pub struct ExecConfig {
    pub pid: u64,
    pub env: EnvFlags,
    pub executor: PathBuf,
    pub shms: Option<(Shmem, Shmem)>,
    pub debug: bool,
}

// The shm region is owned exclusively by one proc; never shared.
unsafe impl Send for ExecConfig {}

pub struct Executor {
    pid: u64,
    env: EnvFlags,
    executor: PathBuf,
    debug: bool,

    in_shm: Option<Shmem>,
    out_shm: Option<Shmem>,
    in_mem: Option<Box<[u8]>>,
    out_mem: Option<Box<[u8]>>,

    exec_child: Option<Child>,
    exec_stdin: Option<ChildStdin>,
    exec_stdout: Option<ChildStdout>,

    watchdog: timer::Timer,
}

// See ExecConfig: exclusive ownership by the spawning proc.
unsafe impl Send for Executor {}

impl Executor {
    pub fn with_config(config: ExecConfig) -> Self {
        let (mut in_shm, mut out_shm) = (None, None);
        let (mut in_mem, mut out_mem) = (None, None);
        match config.shms {
            Some((i, o)) => {
                in_shm = Some(i);
                out_shm = Some(o);
            }
            None => {
                in_mem = Some(vec![0; IN_SHM_SZ].into_boxed_slice());
                out_mem = Some(vec![0; OUT_SHM_SZ].into_boxed_slice());
            }
        }
        Self {
            pid: config.pid,
            env: config.env,
            executor: config.executor,
            debug: config.debug,
            in_shm,
            out_shm,
            in_mem,
            out_mem,
            exec_child: None,
            exec_stdin: None,
            exec_stdout: None,
            watchdog: timer::Timer::new(),
        }
    }

    /// Spawn (or respawn) the child and run the handshake.
    pub fn spawn(&mut self) -> Result<(), std::io::Error> {
        self.kill();

        let mut cmd = Command::new(&self.executor);
        cmd.arg("exec");
        if let (Some(in_shm), Some(out_shm)) = (self.in_shm.as_ref(), self.out_shm.as_ref()) {
            cmd.arg("--in-shm")
                .arg(in_shm.get_os_id())
                .arg("--out-shm")
                .arg(out_shm.get_os_id());
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        if self.debug {
            cmd.stderr(Stdio::inherit());
        } else {
            cmd.stderr(Stdio::null());
        }

        log::debug!("spawning executor-{}: {:?}", self.pid, cmd);
        let mut child = cmd.spawn()?;
        self.exec_stdin = Some(child.stdin.take().unwrap());
        self.exec_stdout = Some(child.stdout.take().unwrap());
        self.exec_child = Some(child);

        if let Err(e) = self.handshake() {
            self.kill();
            return Err(e);
        }
        Ok(())
    }

    fn handshake(&mut self) -> Result<(), std::io::Error> {
        let req = HandshakeReq {
            magic: IN_MAGIC,
            env_flags: self.env,
            pid: self.pid,
        };
        req.write_to(self.exec_stdin.as_mut().unwrap())?;

        let reply = HandshakeReply::read_from(self.exec_stdout.as_mut().unwrap())?;
        if reply.magic != OUT_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "handshake magic mismatch: want {:x}, got {:x}",
                    OUT_MAGIC, reply.magic
                ),
            ));
        }
        Ok(())
    }

    /// Execute one prog and parse the per-call results.
    pub fn execute_one(
        &mut self,
        target: &Target,
        p: &Prog,
        opt: &ExecOpt,
    ) -> Result<Vec<CallExecInfo>, ExecError> {
        if let Err(ExecError::Io(e)) = self.req_exec(target, p, opt) {
            self.kill();
            return Err(ExecError::Io(e));
        }
        if let Err(e) = self.wait_finish() {
            self.kill();
            return Err(e);
        }
        self.parse_output(target, p)
    }

    fn req_exec(&mut self, target: &Target, p: &Prog, opt: &ExecOpt) -> Result<(), ExecError> {
        let use_shm = self.in_shm.is_some();
        let in_buf = self
            .in_shm
            .as_mut()
            .map(|shm| unsafe { shm.as_slice_mut() })
            .or(self.in_mem.as_deref_mut())
            .unwrap();
        let prog_sz = match serialize(target, p, in_buf) {
            Ok(left) => in_buf.len() - left,
            Err(e) => return Err(ExecError::ProgSerialization(e)),
        };

        let req = ExecuteReq {
            magic: IN_MAGIC,
            env_flags: self.env,
            exec_flags: opt.flags,
            pid: self.pid,
            fault_call: opt.fault_call as u64,
            fault_nth: opt.fault_nth as u64,
            syscall_timeout_ms: 100,
            program_timeout_ms: 5000,
            prog_size: if use_shm { 0 } else { prog_sz as u64 },
        };
        req.write_to(self.exec_stdin.as_mut().unwrap())?;
        if !use_shm {
            self.exec_stdin
                .as_mut()
                .unwrap()
                .write_all(&in_buf[..prog_sz])?;
        }
        Ok(())
    }

    fn wait_finish(&mut self) -> Result<(), ExecError> {
        let mut out_buf = self
            .out_shm
            .as_mut()
            .map(|shm| unsafe { shm.as_slice_mut() })
            .or(self.out_mem.as_deref_mut())
            .unwrap();
        out_buf[0..4].iter_mut().for_each(|v| *v = 0);
        let (_, rest) = std::mem::take(&mut out_buf).split_at_mut(4);
        out_buf = rest;

        let child = self.exec_child.as_ref().unwrap().id();
        let watchdog = self
            .watchdog
            .schedule_with_delay(Duration::seconds(EXEC_TIMEOUT_S), move || {
                let _ = kill(Pid::from_raw(child as i32), SIGTERM);
            });

        let exit_status;
        loop {
            let reply = match ExecuteReply::read_from(self.exec_stdout.as_mut().unwrap()) {
                Ok(r) => r,
                Err(e) => return Err(self.handle_possible_timeout(e)),
            };
            if reply.magic != OUT_MAGIC {
                return Err(ExecError::OutputParse(format!(
                    "reply magic mismatch: want {:x}, got {:x}",
                    OUT_MAGIC, reply.magic
                )));
            }
            if reply.done != 0 {
                exit_status = reply.status as i32;
                break;
            }

            // per-call reply streamed while the prog still runs
            let r = match CallReply::read_from(self.exec_stdout.as_mut().unwrap()) {
                Ok(r) => r,
                Err(e) => return Err(self.handle_possible_timeout(e)),
            };
            let (chunk, rest) =
                std::mem::take(&mut out_buf).split_at_mut(size_of::<CallReply>());
            chunk.copy_from_slice(r.as_bytes());
            out_buf = rest;
        }

        drop(watchdog);
        match exit_status {
            0 => Ok(()),
            STATUS_INTERNAL_ERROR => Err(ExecError::ExecInternal),
            status => Err(ExecError::UnexpectedExitStatus(status)),
        }
    }

    fn parse_output(&self, target: &Target, p: &Prog) -> Result<Vec<CallExecInfo>, ExecError> {
        let out_buf = self
            .out_shm
            .as_ref()
            .map(|shm| unsafe { shm.as_slice() })
            .or(self.out_mem.as_deref())
            .unwrap();
        let mut region = OutRegion::new(out_buf);
        let ncmd = region
            .take_u32()
            .ok_or_else(|| ExecError::OutputParse("failed to read call count".to_string()))?;
        let mut call_infos = vec![CallExecInfo::default(); p.calls().len()];

        for i in 0..ncmd {
            let reply: &CallReply = region.take_record().ok_or_else(|| {
                ExecError::OutputParse(format!("failed to read call {} reply", i))
            })?;

            if reply.index == EXTRA_REPLY_INDEX {
                // remote-thread coverage, not attributable to a call
                skip_payload(&mut region, reply)?;
                continue;
            }
            if reply.index as usize >= call_infos.len() {
                return Err(ExecError::OutputParse(format!(
                    "bad call {} index {}/{}",
                    i,
                    reply.index,
                    call_infos.len()
                )));
            }
            let sid = p.calls()[reply.index as usize].sid();
            let nr = target.syscall_of(sid).nr();
            if nr != reply.num as u64 {
                return Err(ExecError::OutputParse(format!(
                    "wrong call {} num {}/{}",
                    i, reply.num, nr
                )));
            }
            let info = &mut call_infos[reply.index as usize];
            if info.flags != 0 || !info.branches.is_empty() {
                return Err(ExecError::OutputParse(format!(
                    "duplicate reply for call {}/{}/{}",
                    i, reply.index, nr
                )));
            }
            info.flags = reply.flags;
            info.errno = reply.errno as i32;

            if reply.branch_size != 0 {
                let branches = region
                    .take_u32_slice(reply.branch_size as usize)
                    .ok_or_else(|| signal_overflow(i, reply, region.left()))?;
                info.branches = branches.to_vec();
            }
            if reply.block_size != 0 {
                let blocks = region
                    .take_u32_slice(reply.block_size as usize)
                    .ok_or_else(|| signal_overflow(i, reply, region.left()))?;
                info.blocks = blocks.to_vec();
            }
            for _ in 0..reply.comps_size {
                let comp: &CompReply = region.take_record().ok_or_else(|| {
                    ExecError::OutputParse(format!("call {}: truncated comps table", i))
                })?;
                info.comps.push((comp.op1, comp.op2));
            }
        }
        Ok(call_infos)
    }

    fn handle_possible_timeout(&mut self, e: std::io::Error) -> ExecError {
        use std::os::unix::process::ExitStatusExt;

        let status = match self.exec_child.as_mut().unwrap().wait() {
            Ok(status) => status,
            Err(_) => return ExecError::Io(e),
        };
        if let Some(code) = status.signal() {
            if code == SIGTERM as i32 {
                return ExecError::TimedOut;
            }
        }
        ExecError::Io(e)
    }

    #[inline]
    pub fn is_spawned(&self) -> bool {
        self.exec_child.is_some()
    }

    pub fn kill(&mut self) {
        if let Some(child) = self.exec_child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.exec_child = None;
        self.exec_stdin = None;
        self.exec_stdout = None;
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Cursor over the executor output region.
struct OutRegion<'a> {
    buf: &'a [u8],
}

impl<'a> OutRegion<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take_u32(&mut self) -> Option<u32> {
        if self.buf.remaining() < size_of::<u32>() {
            return None;
        }
        Some(self.buf.get_u32_le())
    }

    fn take_u32_slice(&mut self, len: usize) -> Option<&'a [u32]> {
        let sz = len * size_of::<u32>();
        if self.buf.len() < sz {
            return None;
        }
        let ret = unsafe { slice::from_raw_parts(self.buf.as_ptr().cast::<u32>(), len) };
        self.buf.advance(sz);
        Some(ret)
    }

    fn take_record<T: PipeRecord>(&mut self) -> Option<&'a T> {
        if self.buf.len() < size_of::<T>() {
            return None;
        }
        let ret = unsafe { &*self.buf.as_ptr().cast::<T>() };
        self.buf.advance(size_of::<T>());
        Some(ret)
    }

    fn left(&self) -> usize {
        self.buf.len()
    }
}

fn skip_payload(region: &mut OutRegion<'_>, reply: &CallReply) -> Result<(), ExecError> {
    let words = (reply.branch_size + reply.block_size) as usize;
    region
        .take_u32_slice(words)
        .ok_or_else(|| ExecError::OutputParse("truncated extra reply".to_string()))?;
    for _ in 0..reply.comps_size {
        region
            .take_record::<CompReply>()
            .ok_or_else(|| ExecError::OutputParse("truncated extra comps".to_string()))?;
    }
    Ok(())
}

fn signal_overflow(i: u32, reply: &CallReply, left: usize) -> ExecError {
    ExecError::OutputParse(format!(
        "call {}/{}/{}: signal overflow: {}+{}/{}",
        i, reply.index, reply.num, reply.branch_size, reply.block_size, left
    ))
}

/// Parsed output of the executor `version` probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorVersion {
    pub arch: String,
    pub syz_rev: String,
    pub git_rev: String,
}

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad executor version: {0:?}")]
    BadOutput(String),
}

/// Run `executor version`; the reply is four whitespace-separated tokens
/// `<ignored> <arch> <syz-rev> <git-rev>`.
pub fn executor_version(executor: &std::path::Path) -> Result<ExecutorVersion, VersionError> {
    let output = Command::new(executor).arg("version").output()?;
    let out = String::from_utf8_lossy(&output.stdout);
    parse_version(&out)
}

fn parse_version(out: &str) -> Result<ExecutorVersion, VersionError> {
    let vers: Vec<&str> = out.trim().split_ascii_whitespace().collect();
    if vers.len() != 4 {
        return Err(VersionError::BadOutput(out.to_string()));
    }
    Ok(ExecutorVersion {
        arch: vers[1].to_string(),
        syz_rev: vers[2].to_string(),
        git_rev: vers[3].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parse() {
        let v = parse_version("executor amd64 a1b2c3 d4e5f6\n").unwrap();
        assert_eq!(
            v,
            ExecutorVersion {
                arch: "amd64".to_string(),
                syz_rev: "a1b2c3".to_string(),
                git_rev: "d4e5f6".to_string(),
            }
        );
        assert!(parse_version("too few tokens").is_err());
        assert!(parse_version("").is_err());
    }

    #[test]
    fn out_region_cursor() {
        let mut data = Vec::new();
        for v in [3u32, 7, 9] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let mut region = OutRegion::new(&data);
        assert_eq!(region.take_u32(), Some(3));
        assert_eq!(region.take_u32_slice(2), Some(&[7u32, 9][..]));
        assert_eq!(region.left(), 0);
        assert!(region.take_u32().is_none());
        assert!(region.take_record::<CompReply>().is_none());
    }

    #[test]
    fn pipe_record_roundtrip() {
        let req = ExecuteReq {
            magic: IN_MAGIC,
            pid: 3,
            prog_size: 128,
            ..Default::default()
        };
        let bytes = req.as_bytes().to_vec();
        let got = ExecuteReq::read_from(&bytes[..]).unwrap();
        assert_eq!(got.magic, IN_MAGIC);
        assert_eq!(got.pid, 3);
        assert_eq!(got.prog_size, 128);
    }

    #[test]
    fn exec_opt_flags() {
        let mut opt = ExecOpt::new();
        assert_ne!(opt.flags & FLAG_COLLIDE, 0);
        opt.disable(FLAG_COLLIDE);
        assert_eq!(opt.flags & FLAG_COLLIDE, 0);
        opt.enable(FLAG_COLLECT_COMPS);
        assert_ne!(opt.flags & FLAG_COLLECT_COMPS, 0);

        let opt = ExecOpt::new_no_collide();
        assert_eq!(opt.flags & FLAG_COLLIDE, 0);
    }
}
