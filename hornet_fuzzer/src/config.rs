use std::{path::PathBuf, str::FromStr};

/// Where executed programs are echoed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    None,
    Stdout,
    Dmesg,
    File,
}

impl FromStr for OutputKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(OutputKind::None),
            "stdout" => Ok(OutputKind::Stdout),
            "dmesg" => Ok(OutputKind::Dmesg),
            "file" => Ok(OutputKind::File),
            other => Err(format!(
                "output must be one of none/stdout/dmesg/file, got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Unique worker identity, sent on every RPC.
    pub name: String,
    pub arch: String,
    /// Manager RPC endpoint address.
    pub manager: String,
    /// Number of parallel procs.
    pub procs: usize,
    /// Enable kmemleak-based periodic leak scanning.
    pub leak: bool,
    pub output: OutputKind,
    /// Path to the native executor binary.
    pub executor: PathBuf,
    /// One-shot image smoke test, bypasses the fuzz loop.
    pub test: bool,
    pub debug: bool,
}

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("worker name must not be empty");
        }
        if self.procs < 1 {
            anyhow::bail!("procs must be >= 1, got {}", self.procs);
        }
        if !self.test && self.manager.is_empty() {
            anyhow::bail!("manager address must not be empty");
        }
        if !self.executor.exists() {
            anyhow::bail!("executor binary not found: {}", self.executor.display());
        }
        Ok(())
    }
}
