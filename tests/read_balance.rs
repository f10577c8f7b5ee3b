//! Load-distribution properties of the ring-based read policies.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use replicated_kv::read_policy::{HashPolicy, RandomTokenPolicy, ReadPolicy};

const NUM_KEYS: usize = 100_000;

fn random_keys(seed: u64) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..NUM_KEYS)
        .map(|_| {
            let len = rng.gen_range(4..=24);
            (0..len).map(|_| rng.gen::<u8>()).collect()
        })
        .collect()
}

fn assert_balanced(counts: &[usize], num_servers: usize) {
    let total: usize = counts.iter().sum();
    let fair = total as f64 / num_servers as f64;
    for (idx, &count) in counts.iter().enumerate() {
        let share = count as f64 / fair;
        assert!(
            (0.85..=1.15).contains(&share),
            "peer index {idx} received {count} of {total} requests \
             ({share:.3} of fair share)"
        );
    }
}

#[test]
fn hash_policy_balances_within_fifteen_percent() {
    let server_ids = vec![1, 2, 3];
    let mut policy = HashPolicy::new(server_ids.clone(), 64).unwrap();

    let mut counts = vec![0usize; server_ids.len()];
    for key in random_keys(42) {
        let id = policy.next_server(&key);
        let idx = server_ids.iter().position(|&s| s == id).unwrap();
        counts[idx] += 1;
    }
    assert_balanced(&counts, server_ids.len());
}

#[test]
fn hash_policy_balances_with_five_peers() {
    let server_ids = vec![1, 2, 3, 4, 5];
    let mut policy = HashPolicy::new(server_ids.clone(), 128).unwrap();

    let mut counts = vec![0usize; server_ids.len()];
    for key in random_keys(7) {
        let id = policy.next_server(&key);
        let idx = server_ids.iter().position(|&s| s == id).unwrap();
        counts[idx] += 1;
    }
    assert_balanced(&counts, server_ids.len());
}

#[test]
fn random_token_policy_balances_within_fifteen_percent() {
    let server_ids = vec![10, 20, 30];
    let mut policy = RandomTokenPolicy::new(server_ids.clone(), 64).unwrap();

    let mut counts = vec![0usize; server_ids.len()];
    for _ in 0..NUM_KEYS {
        let id = policy.next_server(b"ignored");
        let idx = server_ids.iter().position(|&s| s == id).unwrap();
        counts[idx] += 1;
    }
    assert_balanced(&counts, server_ids.len());
}

#[test]
fn hash_policy_is_stable_across_instances() {
    let mut a = HashPolicy::new(vec![1, 2, 3], 64).unwrap();
    let mut b = HashPolicy::new(vec![1, 2, 3], 64).unwrap();
    for key in random_keys(99).into_iter().take(1000) {
        assert_eq!(a.next_server(&key), b.next_server(&key));
    }
}
