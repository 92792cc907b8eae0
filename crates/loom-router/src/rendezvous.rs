// Rendezvous (highest-random-weight) hashing over consumer ids.
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};

/// Stable key-to-node selector.
///
/// Each instance carries its own random seed, so weights are not comparable
/// across instances (or process restarts), only within one. A given key maps
/// to the same node while the node set is unchanged, and joining or leaving
/// nodes only remaps the keys they win or lose.
pub struct Rendezvous {
    seed: RandomState,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            seed: RandomState::new(),
        }
    }

    /// Pick the node with the maximum weight for `key`. Ties go to the first
    /// such node in iteration order; an empty node set yields `None`.
    pub fn pick<'a, I>(&self, key: &[u8], nodes: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut winner: Option<(&'a str, u64)> = None;
        for node in nodes {
            let mut hasher = self.seed.build_hasher();
            hasher.write(key);
            hasher.write(&[0u8]);
            hasher.write(node.as_bytes());
            let weight = hasher.finish();
            match winner {
                Some((_, best)) if weight <= best => {}
                _ => winner = Some((node, weight)),
            }
        }
        winner.map(|(node, _)| node)
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}
