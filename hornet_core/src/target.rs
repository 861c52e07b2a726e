//! Target description: syscall table, resources, call-set construction.

use crate::{
    syscall::{Field, ResKind, Syscall, SyscallId},
    HashSet,
};
use thiserror::Error;

/// Revision of the builtin descriptions, cross-checked against the executor.
pub const REVISION: &str = "9b1f3e6";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),
    #[error("bad syscall id: {0}")]
    BadSyscallId(String),
}

#[derive(Debug)]
pub struct Target {
    os: String,
    arch: String,
    syscalls: Vec<Syscall>,
    resources: Vec<&'static str>,
}

impl Target {
    /// Resolve a target by OS and architecture. Unknown pairs are an error.
    pub fn new(os: &str, arch: &str) -> Result<Target, TargetError> {
        if os != "linux" || !matches!(arch, "amd64" | "arm64") {
            return Err(TargetError::UnknownTarget(format!("{}/{}", os, arch)));
        }
        Ok(Target {
            os: os.to_string(),
            arch: arch.to_string(),
            syscalls: builtin_syscalls(),
            resources: RESOURCES.to_vec(),
        })
    }

    #[inline(always)]
    pub fn os(&self) -> &str {
        &self.os
    }

    #[inline(always)]
    pub fn arch(&self) -> &str {
        &self.arch
    }

    #[inline(always)]
    pub fn syscalls(&self) -> &[Syscall] {
        &self.syscalls
    }

    #[inline(always)]
    pub fn syscall_of(&self, sid: SyscallId) -> &Syscall {
        &self.syscalls[sid]
    }

    pub fn syscall_of_name(&self, name: &str) -> Option<&Syscall> {
        self.syscalls.iter().find(|s| s.name() == name)
    }

    #[inline(always)]
    pub fn res_name(&self, kind: ResKind) -> &'static str {
        self.resources[kind as usize]
    }

    /// Build the set of calls this worker may use.
    ///
    /// `enabled` is the manager's comma-separated id list; empty means all.
    /// Host-unsupported calls are dropped first, then calls whose resource
    /// inputs cannot be produced by any remaining call, to a fixpoint.
    pub fn build_call_set(
        &self,
        enabled: &str,
        supported: impl Fn(&Syscall) -> bool,
    ) -> Result<HashSet<SyscallId>, TargetError> {
        let mut calls: HashSet<SyscallId> = if enabled.is_empty() {
            (0..self.syscalls.len()).collect()
        } else {
            let mut set = HashSet::new();
            for id in enabled.split(',') {
                let n: usize = id
                    .trim()
                    .parse()
                    .map_err(|_| TargetError::BadSyscallId(id.to_string()))?;
                if n >= self.syscalls.len() {
                    return Err(TargetError::BadSyscallId(id.to_string()));
                }
                set.insert(n);
            }
            set
        };

        calls.retain(|&sid| {
            let ok = supported(&self.syscalls[sid]);
            if !ok {
                log::debug!("disabling unsupported syscall: {}", self.syscalls[sid].name());
            }
            ok
        });
        self.transitively_enabled(&mut calls);
        Ok(calls)
    }

    fn transitively_enabled(&self, calls: &mut HashSet<SyscallId>) {
        loop {
            let produced: HashSet<ResKind> = calls
                .iter()
                .filter_map(|&sid| self.syscalls[sid].ret())
                .collect();
            let before = calls.len();
            calls.retain(|&sid| {
                let ok = self.syscalls[sid]
                    .input_res()
                    .all(|kind| produced.contains(&kind));
                if !ok {
                    log::debug!(
                        "disabling transitively unsupported syscall: {}",
                        self.syscalls[sid].name()
                    );
                }
                ok
            });
            if calls.len() == before {
                break;
            }
        }
    }
}

const RES_FD: ResKind = 0;
const RES_SOCK: ResKind = 1;
const RES_PIPE: ResKind = 2;
const RES_EPOLL: ResKind = 3;
const RES_TIMER: ResKind = 4;

const RESOURCES: [&str; 5] = ["fd", "sock", "pipefd", "epollfd", "timerfd"];

macro_rules! syscalls {
    ($(($nr:expr, $name:expr, [$($field:expr),*], $ret:expr)),* $(,)?) => {{
        let mut table = Vec::new();
        $(
            let id = table.len();
            table.push(Syscall::new(id, $nr, $name, vec![$($field),*], $ret));
        )*
        table
    }};
}

/// Builtin linux table. Numbers are the amd64 ABI; the executor remaps for
/// other architectures.
fn builtin_syscalls() -> Vec<Syscall> {
    use Field::*;
    syscalls![
        (0, "read", [ResUse(RES_FD), Buffer, Scalar], None),
        (1, "write", [ResUse(RES_FD), Buffer, Scalar], None),
        (2, "open", [Buffer, Scalar, Scalar], Some(RES_FD)),
        (3, "close", [ResUse(RES_FD)], None),
        (8, "lseek", [ResUse(RES_FD), Scalar, Scalar], None),
        (9, "mmap", [Scalar, Scalar, Scalar, Scalar, ResUse(RES_FD), Scalar], None),
        (16, "ioctl", [ResUse(RES_FD), Scalar, Scalar], None),
        (22, "pipe", [Buffer], Some(RES_PIPE)),
        (32, "dup", [ResUse(RES_FD)], Some(RES_FD)),
        (41, "socket", [Scalar, Scalar, Scalar], Some(RES_SOCK)),
        (42, "connect", [ResUse(RES_SOCK), Buffer, Scalar], None),
        (44, "sendto", [ResUse(RES_SOCK), Buffer, Scalar, Scalar, Buffer, Scalar], None),
        (45, "recvfrom", [ResUse(RES_SOCK), Buffer, Scalar, Scalar, Buffer, Buffer], None),
        (49, "bind", [ResUse(RES_SOCK), Buffer, Scalar], None),
        (50, "listen", [ResUse(RES_SOCK), Scalar], None),
        (54, "setsockopt", [ResUse(RES_SOCK), Scalar, Scalar, Buffer, Scalar], None),
        (72, "fcntl", [ResUse(RES_FD), Scalar, Scalar], None),
        (77, "ftruncate", [ResUse(RES_FD), Scalar], None),
        (213, "epoll_create", [Scalar], Some(RES_EPOLL)),
        (232, "epoll_wait", [ResUse(RES_EPOLL), Buffer, Scalar, Scalar], None),
        (233, "epoll_ctl", [ResUse(RES_EPOLL), Scalar, ResUse(RES_FD), Buffer], None),
        (257, "openat", [Scalar, Buffer, Scalar, Scalar], Some(RES_FD)),
        (283, "timerfd_create", [Scalar, Scalar], Some(RES_TIMER)),
        (286, "timerfd_settime", [ResUse(RES_TIMER), Scalar, Buffer, Buffer], None),
        (290, "eventfd", [Scalar], Some(RES_FD)),
        (318, "getrandom", [Buffer, Scalar, Scalar], None),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_target_rejected() {
        assert!(Target::new("plan9", "amd64").is_err());
        assert!(Target::new("linux", "mips").is_err());
        assert!(Target::new("linux", "amd64").is_ok());
    }

    #[test]
    fn bad_syscall_id_rejected() {
        let target = Target::new("linux", "amd64").unwrap();
        assert!(target.build_call_set("1,boom", |_| true).is_err());
        assert!(target.build_call_set("99999", |_| true).is_err());
    }

    #[test]
    fn transitive_closure_drops_consumers() {
        let target = Target::new("linux", "amd64").unwrap();
        // disable every producer of sock; all sock consumers must go too
        let calls = target
            .build_call_set("", |s| s.name() != "socket")
            .unwrap();
        for &sid in &calls {
            let s = target.syscall_of(sid);
            assert!(s.input_res().all(|k| target.res_name(k) != "sock"), "{}", s.name());
        }
        assert!(calls.iter().any(|&sid| target.syscall_of(sid).name() == "open"));
    }
}
