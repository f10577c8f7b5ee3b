//! Read-routing policies: map a key to the peer that serves the read.
//!
//! All variants implement [`ReadPolicy`] over a fixed list of server ids.
//! The ring-based variants (`hash`, `random_token`) partition the 32-bit
//! token space into `N × num_tokens` equal arcs, arc `i` owned by
//! `servers[i % N]`; a token lands on the first ring position at or above
//! it, wrapping past the last position to the first. The hash variant
//! tokenizes keys with MurmurHash3 x86_32 under a fixed seed so routing is
//! identical across client processes.
//!
//! Policies never block and never perform I/O. Each random variant owns
//! its RNG, seeded from entropy at construction.

use std::collections::HashMap;
use std::io::Cursor;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

/// Fixed murmur seed shared by every client.
const MURMUR_SEED: u32 = 0x499602D2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    #[error("read policy requires at least one server")]
    NoServers,

    #[error("num_tokens cannot be 0")]
    ZeroTokens,
}

/// Strategy mapping each read to a serving peer.
pub trait ReadPolicy: Send {
    /// The id of the peer that should serve a read of `key`.
    fn next_server(&mut self, key: &[u8]) -> i32;
}

// ── Round robin ───────────────────────────────────────────────────────────────

/// Cycles through the peers in order, starting at the first.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    server_ids: Vec<i32>,
    next: usize,
}

impl RoundRobinPolicy {
    pub fn new(server_ids: Vec<i32>) -> Result<Self, PolicyError> {
        if server_ids.is_empty() {
            return Err(PolicyError::NoServers);
        }
        Ok(Self {
            server_ids,
            next: 0,
        })
    }
}

impl ReadPolicy for RoundRobinPolicy {
    fn next_server(&mut self, _key: &[u8]) -> i32 {
        let id = self.server_ids[self.next];
        self.next = (self.next + 1) % self.server_ids.len();
        id
    }
}

// ── Token ring ────────────────────────────────────────────────────────────────

/// `N × num_tokens` positions evenly spaced over the u32 space, position
/// `i` owned by `server_ids[i % N]`.
#[derive(Debug)]
struct TokenRing {
    server_ids: Vec<i32>,
    ranges: Vec<u32>,
}

impl TokenRing {
    fn new(server_ids: Vec<i32>, num_tokens: usize) -> Result<Self, PolicyError> {
        if server_ids.is_empty() {
            return Err(PolicyError::NoServers);
        }
        if num_tokens == 0 {
            return Err(PolicyError::ZeroTokens);
        }

        let total = server_ids.len() * num_tokens;
        let incr = u32::MAX / total as u32;
        let ranges = (1..=total as u32).map(|i| i * incr).collect();

        Ok(Self { server_ids, ranges })
    }

    /// First ring position at or above `token`; equal tokens land on the
    /// lower index, tokens past the last position wrap to the first.
    fn server_for(&self, token: u32) -> i32 {
        let idx = self.ranges.partition_point(|&r| r < token);
        let idx = if idx == self.ranges.len() { 0 } else { idx };
        self.server_ids[idx % self.server_ids.len()]
    }
}

/// Routes each key by its murmur hash, so a key always lands on the same
/// arc of the ring.
#[derive(Debug)]
pub struct HashPolicy {
    ring: TokenRing,
}

impl HashPolicy {
    pub fn new(server_ids: Vec<i32>, num_tokens: usize) -> Result<Self, PolicyError> {
        Ok(Self {
            ring: TokenRing::new(server_ids, num_tokens)?,
        })
    }

    fn token(key: &[u8]) -> u32 {
        // Reading from an in-memory cursor cannot fail.
        murmur3::murmur3_32(&mut Cursor::new(key), MURMUR_SEED)
            .expect("murmur3 over a memory cursor is infallible")
    }
}

impl ReadPolicy for HashPolicy {
    fn next_server(&mut self, key: &[u8]) -> i32 {
        self.ring.server_for(Self::token(key))
    }
}

/// Draws a uniform token per read; load spreads like `hash` without being
/// keyed to content.
#[derive(Debug)]
pub struct RandomTokenPolicy {
    ring: TokenRing,
    rng: StdRng,
}

impl RandomTokenPolicy {
    pub fn new(server_ids: Vec<i32>, num_tokens: usize) -> Result<Self, PolicyError> {
        Ok(Self {
            ring: TokenRing::new(server_ids, num_tokens)?,
            rng: StdRng::from_entropy(),
        })
    }
}

impl ReadPolicy for RandomTokenPolicy {
    fn next_server(&mut self, _key: &[u8]) -> i32 {
        let token = self.rng.gen::<u32>();
        self.ring.server_for(token)
    }
}

// ── Uniform and fixed ─────────────────────────────────────────────────────────

/// Picks a peer uniformly at random per read.
#[derive(Debug)]
pub struct RandomUniformPolicy {
    server_ids: Vec<i32>,
    rng: StdRng,
}

impl RandomUniformPolicy {
    pub fn new(server_ids: Vec<i32>) -> Result<Self, PolicyError> {
        if server_ids.is_empty() {
            return Err(PolicyError::NoServers);
        }
        Ok(Self {
            server_ids,
            rng: StdRng::from_entropy(),
        })
    }
}

impl ReadPolicy for RandomUniformPolicy {
    fn next_server(&mut self, _key: &[u8]) -> i32 {
        let idx = self.rng.gen_range(0..self.server_ids.len());
        self.server_ids[idx]
    }
}

/// Consults a caller-supplied map from key to peer index. Panics on a key
/// with no mapping; pinning reads is the caller's contract.
pub struct FixedPolicy {
    server_ids: Vec<i32>,
    mapping: HashMap<Vec<u8>, usize>,
}

impl FixedPolicy {
    pub fn new(
        server_ids: Vec<i32>,
        mapping: HashMap<Vec<u8>, usize>,
    ) -> Result<Self, PolicyError> {
        if server_ids.is_empty() {
            return Err(PolicyError::NoServers);
        }
        Ok(Self {
            server_ids,
            mapping,
        })
    }
}

impl ReadPolicy for FixedPolicy {
    fn next_server(&mut self, key: &[u8]) -> i32 {
        let idx = *self
            .mapping
            .get(key)
            .unwrap_or_else(|| panic!("fixed read policy has no mapping for key {key:?}"));
        self.server_ids[idx]
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_in_order() {
        let mut policy = RoundRobinPolicy::new(vec![1, 2, 3]).unwrap();
        let picks: Vec<i32> = (0..7).map(|_| policy.next_server(b"k")).collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn empty_server_list_is_rejected() {
        assert_eq!(
            RoundRobinPolicy::new(vec![]).unwrap_err(),
            PolicyError::NoServers
        );
        assert_eq!(HashPolicy::new(vec![], 3).unwrap_err(), PolicyError::NoServers);
        assert_eq!(
            RandomUniformPolicy::new(vec![]).unwrap_err(),
            PolicyError::NoServers
        );
    }

    #[test]
    fn zero_tokens_is_rejected() {
        assert_eq!(
            HashPolicy::new(vec![1, 2, 3], 0).unwrap_err(),
            PolicyError::ZeroTokens
        );
        assert_eq!(
            RandomTokenPolicy::new(vec![1], 0).unwrap_err(),
            PolicyError::ZeroTokens
        );
    }

    #[test]
    fn hash_routing_is_deterministic() {
        let mut a = HashPolicy::new(vec![1, 2, 3], 3).unwrap();
        let mut b = HashPolicy::new(vec![1, 2, 3], 3).unwrap();

        let first = a.next_server(b"apple");
        for _ in 0..10 {
            assert_eq!(a.next_server(b"apple"), first);
            assert_eq!(b.next_server(b"apple"), first);
        }
    }

    #[test]
    fn hash_routing_survives_peer_removal() {
        // Keys routed to peer 1 under [1, 2, 3] must stay on peer 1 after
        // peer 2 leaves and the policy is rebuilt over [1, 3].
        let mut before = HashPolicy::new(vec![1, 2, 3], 3).unwrap();
        let mut after = HashPolicy::new(vec![1, 3], 3).unwrap();

        let keys: Vec<String> = (0..500).map(|i| format!("key-{i}")).collect();
        let mut kept = 0;
        for key in &keys {
            if before.next_server(key.as_bytes()) == 1 {
                kept += 1;
                assert_eq!(after.next_server(key.as_bytes()), 1);
            }
        }
        assert!(kept > 0, "expected some keys on peer 1");
    }

    #[test]
    fn ring_ties_land_on_the_lower_index() {
        let ring = TokenRing::new(vec![1, 2, 3], 1).unwrap();
        let incr = u32::MAX / 3;
        // A token exactly on a ring position belongs to that position.
        assert_eq!(ring.server_for(incr), 1);
        assert_eq!(ring.server_for(incr + 1), 2);
    }

    #[test]
    fn ring_wraps_past_the_last_position() {
        let ring = TokenRing::new(vec![1, 2], 2).unwrap();
        // u32::MAX sits past the last position (rounding slack) and wraps
        // to the first arc.
        assert_eq!(ring.server_for(u32::MAX), 1);
        assert_eq!(ring.server_for(0), 1);
    }

    #[test]
    fn random_uniform_stays_in_range() {
        let mut policy = RandomUniformPolicy::new(vec![7, 8, 9]).unwrap();
        for _ in 0..1000 {
            let id = policy.next_server(b"ignored");
            assert!((7..=9).contains(&id));
        }
    }

    #[test]
    fn random_token_stays_in_range() {
        let mut policy = RandomTokenPolicy::new(vec![4, 5], 8).unwrap();
        for _ in 0..1000 {
            let id = policy.next_server(b"ignored");
            assert!(id == 4 || id == 5);
        }
    }

    #[test]
    fn fixed_policy_follows_the_mapping() {
        let mapping = HashMap::from([(b"a".to_vec(), 0), (b"b".to_vec(), 2)]);
        let mut policy = FixedPolicy::new(vec![10, 20, 30], mapping).unwrap();
        assert_eq!(policy.next_server(b"a"), 10);
        assert_eq!(policy.next_server(b"b"), 30);
    }

    #[test]
    #[should_panic(expected = "no mapping")]
    fn fixed_policy_panics_on_unmapped_key() {
        let mut policy = FixedPolicy::new(vec![1], HashMap::new()).unwrap();
        policy.next_server(b"unmapped");
    }
}
