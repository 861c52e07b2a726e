//! Program representation.
//!
//! A prog is an ordered sequence of calls. Resource arguments refer to the
//! producing call by index; removing a call fixes the references up so a
//! prog is always internally consistent.

use crate::{
    syscall::{ResKind, SyscallId},
    target::Target,
};
use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::hash::{BuildHasher, Hash, Hasher};
use thiserror::Error;

/// Content hash of a serialized prog, used for corpus dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sig(u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arg {
    Const(u64),
    /// Opaque payload copied into target memory by the executor.
    Data(Vec<u8>),
    /// Use of a resource; `src` is the index of the producing call,
    /// `None` stands for a null resource.
    Res { kind: ResKind, src: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    sid: SyscallId,
    args: Vec<Arg>,
}

impl Call {
    pub fn new(sid: SyscallId, args: Vec<Arg>) -> Self {
        Self { sid, args }
    }

    #[inline(always)]
    pub fn sid(&self) -> SyscallId {
        self.sid
    }

    #[inline(always)]
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    #[inline(always)]
    pub fn args_mut(&mut self) -> &mut [Arg] {
        &mut self.args
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Prog {
    calls: Vec<Call>,
}

#[derive(Debug, Error)]
#[error("prog decode: {0}")]
pub struct DecodeError(#[from] bincode::Error);

impl Prog {
    #[inline(always)]
    pub fn new(calls: Vec<Call>) -> Self {
        Self { calls }
    }

    #[inline(always)]
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    #[inline(always)]
    pub fn calls_mut(&mut self) -> &mut Vec<Call> {
        &mut self.calls
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Serialize for exchange with the manager. Progs travel as opaque bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap()
    }

    /// Decode a prog received from a peer. Failure indicates a peer bug and
    /// is surfaced to the caller as a hard error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Prog, DecodeError> {
        let p: Prog = bincode::deserialize(bytes)?;
        Ok(p)
    }

    pub fn sig(&self) -> Sig {
        let seed = RandomState::with_seeds(
            0x6c62_272e_07bb_0142,
            0x62b8_2175_6295_c58d,
            0x8465_fd77_1d24_a1f9,
            0x2f7e_9a1c_56d4_03bd,
        );
        let mut hasher = seed.build_hasher();
        self.to_bytes().hash(&mut hasher);
        Sig(hasher.finish())
    }

    /// Return a copy with call `i` removed and resource references fixed up.
    pub fn remove_call(&self, i: usize) -> Prog {
        let mut new_p = self.clone();
        new_p.remove_call_inplace(i);
        new_p
    }

    pub fn remove_call_inplace(&mut self, i: usize) {
        self.calls.remove(i);
        for call in &mut self.calls {
            for arg in call.args.iter_mut() {
                if let Arg::Res { src, .. } = arg {
                    match *src {
                        Some(s) if s == i => *src = None,
                        Some(s) if s > i => *src = Some(s - 1),
                        _ => (),
                    }
                }
            }
        }
    }

    /// Check internal consistency: every resource reference points to an
    /// earlier call that produces the right kind.
    pub fn validate(&self, target: &Target) -> bool {
        for (i, call) in self.calls.iter().enumerate() {
            for arg in call.args() {
                if let Arg::Res {
                    kind,
                    src: Some(src),
                } = arg
                {
                    if *src >= i {
                        return false;
                    }
                    if target.syscall_of(self.calls[*src].sid()).ret() != Some(*kind) {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn display<'a, 'b>(&'a self, target: &'b Target) -> ProgDisplay<'a, 'b> {
        ProgDisplay { prog: self, target }
    }
}

pub struct ProgDisplay<'a, 'b> {
    prog: &'a Prog,
    target: &'b Target,
}

impl std::fmt::Display for ProgDisplay<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, call) in self.prog.calls.iter().enumerate() {
            let syscall = self.target.syscall_of(call.sid());
            if syscall.ret().is_some() {
                write!(f, "r{} = ", i)?;
            }
            write!(f, "{}(", syscall.name())?;
            for (j, arg) in call.args().iter().enumerate() {
                match arg {
                    Arg::Const(v) => write!(f, "{:#x}", v)?,
                    Arg::Data(data) => write!(f, "&[u8; {}]", data.len())?,
                    Arg::Res { src: Some(src), .. } => write!(f, "r{}", src)?,
                    Arg::Res { src: None, .. } => write!(f, "nil")?,
                }
                if j != call.args().len() - 1 {
                    write!(f, ", ")?;
                }
            }
            writeln!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;

    fn sample_prog(target: &Target) -> Prog {
        let open = target.syscall_of_name("open").unwrap().id();
        let read = target.syscall_of_name("read").unwrap().id();
        let close = target.syscall_of_name("close").unwrap().id();
        Prog::new(vec![
            Call::new(open, vec![Arg::Data(b"/dev/null\0".to_vec()), Arg::Const(0), Arg::Const(0)]),
            Call::new(
                read,
                vec![
                    Arg::Res { kind: 0, src: Some(0) },
                    Arg::Data(vec![0; 16]),
                    Arg::Const(16),
                ],
            ),
            Call::new(close, vec![Arg::Res { kind: 0, src: Some(0) }]),
        ])
    }

    #[test]
    fn remove_call_fixes_refs() {
        let target = Target::new("linux", "amd64").unwrap();
        let p = sample_prog(&target);
        assert!(p.validate(&target));

        let removed = p.remove_call(0);
        assert_eq!(removed.len(), 2);
        for call in removed.calls() {
            for arg in call.args() {
                assert!(matches!(arg, Arg::Res { src: None, .. } | Arg::Data(_) | Arg::Const(_)));
            }
        }
        assert!(removed.validate(&target));

        let removed = p.remove_call(1);
        assert!(removed.validate(&target));
        // the close still refers to call 0
        assert_eq!(
            removed.calls()[1].args()[0],
            Arg::Res { kind: 0, src: Some(0) }
        );
    }

    #[test]
    fn sig_is_content_hash() {
        let target = Target::new("linux", "amd64").unwrap();
        let p = sample_prog(&target);
        assert_eq!(p.sig(), p.clone().sig());
        assert_ne!(p.sig(), p.remove_call(2).sig());
    }

    #[test]
    fn bytes_roundtrip() {
        let target = Target::new("linux", "amd64").unwrap();
        let p = sample_prog(&target);
        let restored = Prog::from_bytes(&p.to_bytes()).unwrap();
        assert_eq!(p, restored);
    }

    #[test]
    fn bad_bytes_rejected() {
        assert!(Prog::from_bytes(&[0xff; 3]).is_err());
    }
}
