//! Core data structures and algorithms of hornet.

use ahash::{AHashMap, AHashSet};

pub mod corpus;
pub mod gen;
pub mod mutation;
pub mod prog;
pub mod select;
pub mod syscall;
pub mod target;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;
pub type RngType = rand::rngs::SmallRng;
