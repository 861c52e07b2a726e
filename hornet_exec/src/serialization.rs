//! Encoding of progs into the executor input region.
//!
//! Layout is a stream of little-endian u64 words: the call count, then for
//! each call its syscall number, argument count and tagged arguments.
//! `Data` payloads are length-prefixed and padded to word size.

use hornet_core::{
    prog::{Arg, Prog},
    target::Target,
};
use thiserror::Error;

const ARG_CONST: u64 = 0;
const ARG_RES: u64 = 1;
const ARG_DATA: u64 = 2;

/// Encodes "no producing call" for a resource argument.
pub const RES_NULL: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("input region too small (need > {0} bytes)")]
    BufferTooSmall(usize),
}

/// Serialize `p` into `buf`; returns the number of bytes left unused.
pub fn serialize(target: &Target, p: &Prog, buf: &mut [u8]) -> Result<usize, SerializeError> {
    let mut w = WordWriter { buf, pos: 0 };
    w.put(p.calls().len() as u64)?;
    for call in p.calls() {
        let syscall = target.syscall_of(call.sid());
        w.put(syscall.nr())?;
        w.put(call.args().len() as u64)?;
        for arg in call.args() {
            match arg {
                Arg::Const(v) => {
                    w.put(ARG_CONST)?;
                    w.put(*v)?;
                }
                Arg::Res { src, .. } => {
                    w.put(ARG_RES)?;
                    w.put(src.map(|s| s as u64).unwrap_or(RES_NULL))?;
                }
                Arg::Data(data) => {
                    w.put(ARG_DATA)?;
                    w.put(data.len() as u64)?;
                    w.put_bytes(data)?;
                }
            }
        }
    }
    Ok(w.buf.len() - w.pos)
}

struct WordWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl WordWriter<'_> {
    fn put(&mut self, v: u64) -> Result<(), SerializeError> {
        if self.pos + 8 > self.buf.len() {
            return Err(SerializeError::BufferTooSmall(self.buf.len()));
        }
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
        Ok(())
    }

    fn put_bytes(&mut self, data: &[u8]) -> Result<(), SerializeError> {
        let padded = (data.len() + 7) & !7;
        if self.pos + padded > self.buf.len() {
            return Err(SerializeError::BufferTooSmall(self.buf.len()));
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.buf[self.pos + data.len()..self.pos + padded].fill(0);
        self.pos += padded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hornet_core::prog::{Arg, Call, Prog};

    #[test]
    fn serialize_layout() {
        let target = Target::new("linux", "amd64").unwrap();
        let open = target.syscall_of_name("open").unwrap();
        let p = Prog::new(vec![Call::new(
            open.id(),
            vec![Arg::Data(vec![1, 2, 3]), Arg::Const(0x42), Arg::Const(0)],
        )]);
        let mut buf = [0u8; 256];
        let left = serialize(&target, &p, &mut buf).unwrap();
        let used = buf.len() - left;
        // ncalls, nr, nargs, (tag, len, 1 padded word), (tag, val) x2
        assert_eq!(used, 8 * 10);
        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), open.nr());
    }

    #[test]
    fn serialize_too_small() {
        let target = Target::new("linux", "amd64").unwrap();
        let p = Prog::new(vec![Call::new(0, vec![Arg::Const(1); 8])]);
        let mut buf = [0u8; 16];
        assert!(matches!(
            serialize(&target, &p, &mut buf),
            Err(SerializeError::BufferTooSmall(_))
        ));
    }
}
