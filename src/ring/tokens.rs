//! Token generation and key hashing

use rand::Rng;
use std::collections::HashSet;
use twox_hash::XxHash32;

/// Hash an arbitrary key onto the ring's token space.
pub fn hash_key(key: &str) -> u32 {
    XxHash32::oneshot(0, key.as_bytes())
}

/// Generate `count` random tokens that collide neither with each other nor
/// with `taken`. The result is sorted.
pub fn generate_tokens(count: usize, taken: &HashSet<u32>) -> Vec<u32> {
    generate_tokens_with(&mut rand::thread_rng(), count, taken)
}

pub(crate) fn generate_tokens_with<R: Rng>(
    rng: &mut R,
    count: usize,
    taken: &HashSet<u32>,
) -> Vec<u32> {
    let mut chosen = HashSet::with_capacity(count);
    while chosen.len() < count {
        let candidate: u32 = rng.gen();
        if !taken.contains(&candidate) {
            chosen.insert(candidate);
        }
    }
    let mut tokens: Vec<u32> = chosen.into_iter().collect();
    tokens.sort_unstable();
    tokens
}
