//! Manager RPC client.
//!
//! Framed bincode over a plain TCP stream: a `u32` length header followed
//! by the body. The worker is useless without its manager, so every error
//! here is terminal for the caller.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::TcpStream,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("encode/decode: {0}")]
    Codec(#[from] bincode::Error),
    #[error("manager rejected check: {0}")]
    CheckRejected(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcInput {
    pub prog: Vec<u8>,
    pub signal: Vec<u32>,
    pub cover: Vec<u32>,
    pub call_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCandidate {
    pub prog: Vec<u8>,
    pub minimized: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectArgs {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectRes {
    /// Comma-separated syscall ids; empty enables everything.
    pub enabled_calls: String,
    /// Per-syscall generation priorities, indexed by syscall id.
    pub prios: Option<Vec<u64>>,
    pub inputs: Vec<RpcInput>,
    pub max_signal: Vec<u32>,
    pub need_check: bool,
    pub candidates: Vec<RpcCandidate>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckArgs {
    pub name: String,
    pub arch: String,
    pub fuzzer_rev: String,
    pub executor_syz_rev: String,
    pub executor_git_rev: String,
    pub executor_arch: String,
    pub calls: Vec<String>,
    pub kcov: bool,
    pub leak: bool,
    pub fault: bool,
    pub comps: bool,
    pub user_ns: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckRes {
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollArgs {
    pub name: String,
    pub need_candidates: bool,
    pub stats: HashMap<String, u64>,
    pub max_signal: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollRes {
    pub candidates: Vec<RpcCandidate>,
    pub new_inputs: Vec<RpcInput>,
    pub max_signal: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
enum Request {
    Connect(ConnectArgs),
    Check(CheckArgs),
    Poll(PollArgs),
}

pub struct RpcClient {
    stream: TcpStream,
}

impl RpcClient {
    pub fn connect(addr: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn handshake(&mut self, name: &str) -> Result<ConnectRes, RpcError> {
        send_frame(
            &mut self.stream,
            &Request::Connect(ConnectArgs {
                name: name.to_string(),
            }),
        )?;
        recv_frame(&mut self.stream)
    }

    pub fn check(&mut self, args: CheckArgs) -> Result<(), RpcError> {
        send_frame(&mut self.stream, &Request::Check(args))?;
        let res: CheckRes = recv_frame(&mut self.stream)?;
        match res.error {
            None => Ok(()),
            Some(e) => Err(RpcError::CheckRejected(e)),
        }
    }

    pub fn poll(&mut self, args: PollArgs) -> Result<PollRes, RpcError> {
        send_frame(&mut self.stream, &Request::Poll(args))?;
        recv_frame(&mut self.stream)
    }
}

pub fn send_frame<T: Serialize, W: Write>(out: &mut W, v: &T) -> Result<(), RpcError> {
    let body = bincode::serialize(v)?;
    let len = body.len() as u32;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&body)?;
    out.flush()?;
    Ok(())
}

pub fn recv_frame<T: DeserializeOwned, R: Read>(src: &mut R) -> Result<T, RpcError> {
    let mut header = [0u8; 4];
    src.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    let mut body = vec![0u8; len];
    src.read_exact(&mut body)?;
    Ok(bincode::deserialize(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let args = PollArgs {
            name: "vm-3".to_string(),
            need_candidates: true,
            stats: [("exec total".to_string(), 42u64)].into_iter().collect(),
            max_signal: vec![17, 42],
        };
        let mut buf = Vec::new();
        send_frame(&mut buf, &args).unwrap();
        let got: PollArgs = recv_frame(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(got.name, "vm-3");
        assert!(got.need_candidates);
        assert_eq!(got.stats["exec total"], 42);
        assert_eq!(got.max_signal, vec![17, 42]);
    }

    #[test]
    fn truncated_frame_is_io_error() {
        let mut buf = Vec::new();
        send_frame(&mut buf, &ConnectArgs { name: "x".into() }).unwrap();
        buf.truncate(buf.len() - 1);
        let r: Result<ConnectArgs, _> = recv_frame(&mut Cursor::new(&buf));
        assert!(matches!(r, Err(RpcError::Io(_))));
    }
}
