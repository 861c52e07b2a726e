//! Shared corpus: interesting progs plus their content hashes.

use crate::{
    prog::{Prog, Sig},
    HashSet, RngType,
};
use rand::Rng;
use std::sync::{Arc, RwLock};

/// Corpus shared by all procs. Entries are never removed within a process
/// lifetime; duplicates by content hash are rejected silently.
#[derive(Debug, Default)]
pub struct CorpusWrapper {
    inner: RwLock<Corpus>,
}

impl CorpusWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.progs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a prog, deduplicating by content hash. Returns false on duplicate.
    pub fn add_prog(&self, prog: Prog) -> bool {
        let sig = prog.sig();
        let mut inner = self.inner.write().unwrap();
        if !inner.hashes.insert(sig) {
            return false;
        }
        inner.progs.push(Arc::new(prog));
        true
    }

    pub fn contains(&self, sig: Sig) -> bool {
        let inner = self.inner.read().unwrap();
        inner.hashes.contains(&sig)
    }

    pub fn select_one(&self, rng: &mut RngType) -> Option<Arc<Prog>> {
        let inner = self.inner.read().unwrap();
        if inner.progs.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..inner.progs.len());
        Some(Arc::clone(&inner.progs[idx]))
    }

    /// Immutable view of the current progs, usable without holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<Prog>> {
        let inner = self.inner.read().unwrap();
        inner.progs.clone()
    }
}

#[derive(Debug, Default)]
struct Corpus {
    progs: Vec<Arc<Prog>>,
    hashes: HashSet<Sig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prog::{Arg, Call};
    use rand::SeedableRng;

    fn prog(n: u64) -> Prog {
        Prog::new(vec![Call::new(0, vec![Arg::Const(n)])])
    }

    #[test]
    fn dedup_by_hash() {
        let corpus = CorpusWrapper::new();
        assert!(corpus.add_prog(prog(1)));
        assert!(!corpus.add_prog(prog(1)));
        assert_eq!(corpus.len(), 1);
        assert!(corpus.add_prog(prog(2)));
        assert_eq!(corpus.len(), 2);
    }

    #[test]
    fn snapshot_is_stable() {
        let corpus = CorpusWrapper::new();
        corpus.add_prog(prog(1));
        let snap = corpus.snapshot();
        corpus.add_prog(prog(2));
        assert_eq!(snap.len(), 1);
        assert_eq!(corpus.snapshot().len(), 2);
    }

    #[test]
    fn select_from_empty() {
        let corpus = CorpusWrapper::new();
        let mut rng = RngType::seed_from_u64(0);
        assert!(corpus.select_one(&mut rng).is_none());
        corpus.add_prog(prog(7));
        assert!(corpus.select_one(&mut rng).is_some());
    }
}
