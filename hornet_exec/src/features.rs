//! Host capability probing.
//!
//! Two sources: the executor's own `check` probe (feature bits it was built
//! with) and direct presence probes of kernel interfaces.

use iota::iota;
use std::{
    fs::OpenOptions,
    path::Path,
    process::Command,
};
use thiserror::Error;

pub type Features = u64;

iota! {
    pub const FEATURE_COVERAGE: Features = 1 << (iota);
    , FEATURE_COMPARISONS
    , FEATURE_FAULT
    , FEATURE_LEAK
    , FEATURE_NET_INJECTION
    , FEATURE_USER_NS
}

pub const FEATURES_NAME: [&str; 6] = [
    "code coverage",
    "comparison tracing",
    "fault injection",
    "leak checking",
    "net packet injection",
    "user namespaces",
];

pub const FAIL_NTH_PATH: &str = "/proc/self/fail-nth";
pub const KMEMLEAK_PATH: &str = "/sys/kernel/debug/kmemleak";
pub const KCOV_PATH: &str = "/sys/kernel/debug/kcov";
pub const USER_NS_PATH: &str = "/proc/self/ns/user";

#[derive(Debug, Error)]
pub enum DetectFeaturesError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("detect: {0}")]
    Detect(String),
}

/// Ask the executor which features it was built with, then mask with what
/// the host actually exposes.
pub fn detect_features(executor: &Path) -> Result<Features, DetectFeaturesError> {
    let mut cmd = Command::new(executor);
    cmd.arg("check");
    let output = cmd.output()?;
    if !output.status.success() {
        let err = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(DetectFeaturesError::Detect(format!("'{:?}': {}", cmd, err)));
    }
    let out = output.stdout;
    if out.len() != 8 {
        return Err(DetectFeaturesError::Detect(format!(
            "bad check reply length: {}",
            out.len()
        )));
    }
    let mut val = [0; 8];
    val.copy_from_slice(&out);
    let mut features = u64::from_le_bytes(val);

    if !probe_rw(FAIL_NTH_PATH) {
        features &= !FEATURE_FAULT;
    }
    if !probe_rw(KMEMLEAK_PATH) {
        features &= !FEATURE_LEAK;
    }
    if !Path::new(KCOV_PATH).exists() {
        features &= !(FEATURE_COVERAGE | FEATURE_COMPARISONS);
    }
    if Path::new(USER_NS_PATH).exists() {
        features |= FEATURE_USER_NS;
    }
    Ok(features)
}

/// Presence probe: the interface counts only if we can open it read-write.
pub fn probe_rw(path: &str) -> bool {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .is_ok()
}

/// Syscall names the running kernel exports, from /proc/kallsyms.
/// `None` when the symbol table is unreadable; callers should then assume
/// everything is supported.
pub fn supported_syscalls() -> Option<std::collections::HashSet<String>> {
    let symbols = std::fs::read_to_string("/proc/kallsyms").ok()?;
    let mut supported = std::collections::HashSet::new();
    for line in symbols.lines() {
        let sym = match line.split_ascii_whitespace().nth(2) {
            Some(s) => s,
            None => continue,
        };
        for prefix in ["__x64_sys_", "__arm64_sys_", "sys_"] {
            if let Some(name) = sym.strip_prefix(prefix) {
                supported.insert(name.to_string());
                break;
            }
        }
    }
    if supported.is_empty() {
        None
    } else {
        Some(supported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_bits_distinct() {
        let all = [
            FEATURE_COVERAGE,
            FEATURE_COMPARISONS,
            FEATURE_FAULT,
            FEATURE_LEAK,
            FEATURE_NET_INJECTION,
            FEATURE_USER_NS,
        ];
        let mut seen = 0u64;
        for f in all {
            assert_eq!(seen & f, 0);
            seen |= f;
        }
        assert_eq!(all.len(), FEATURES_NAME.len());
    }

    #[test]
    fn probe_missing_path() {
        assert!(!probe_rw("/definitely/not/a/real/path"));
    }
}
