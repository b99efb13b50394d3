//! Deterministic traffic bucketing.
//!
//! The bucket of a (flag key, bucketing key) pair is
//!
//! ```text
//! murmur3_x86_32(utf8(flag_key + ":" + bucketing_key), seed = 0) mod 100000
//! ```
//!
//! Every SDK must reproduce this bit for bit; `tests/data/bucketing_vectors.json`
//! holds the shared vectors.

use std::io::Cursor;

use murmur3::murmur3_32;

use crate::snapshot::WeightedVariation;

/// Size of the bucket space; rollout weights are basis points of this.
pub const BUCKET_SPACE: u32 = 100_000;

pub const HASH_SEED: u32 = 0;

/// Raw 32-bit hash of `flag_key:bucketing_key`.
pub fn hash(flag_key: &str, bucketing_key: &str) -> u32 {
    let input = format!("{}:{}", flag_key, bucketing_key);
    // Reading from an in-memory cursor cannot fail
    murmur3_32(&mut Cursor::new(input.as_bytes()), HASH_SEED).unwrap_or(0)
}

pub fn bucket(flag_key: &str, bucketing_key: &str) -> u32 {
    hash(flag_key, bucketing_key) % BUCKET_SPACE
}

/// Walk the rollout in declaration order; entry `i` owns `[start_i, start_i + weight_i)`.
pub fn select(rollout: &[WeightedVariation], bucket: u32) -> Option<&WeightedVariation> {
    let mut upper: u64 = 0;
    for entry in rollout {
        upper += u64::from(entry.weight);
        if u64::from(bucket) < upper {
            return Some(entry);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(weights: &[(&str, u32)]) -> Vec<WeightedVariation> {
        weights
            .iter()
            .map(|(id, weight)| WeightedVariation {
                variation_id: id.to_string(),
                weight: *weight,
            })
            .collect()
    }

    #[test]
    fn test_known_hash_values() {
        assert_eq!(hash("new-ui", "user-42"), 3_578_623_286);
        assert_eq!(hash("checkout-flow", "org-7"), 1_470_669_364);
        assert_eq!(hash("beta-banner", ""), 1_205_082_964);
    }

    #[test]
    fn test_bucket_is_hash_mod_space() {
        assert_eq!(bucket("new-ui", "user-42"), 23_286);
        assert_eq!(bucket("new-ui", "anonymous"), 96_851);
    }

    #[test]
    fn test_select_boundaries() {
        let rollout = split(&[("a", 20_000), ("b", 80_000)]);

        assert_eq!(select(&rollout, 0).unwrap().variation_id, "a");
        assert_eq!(select(&rollout, 19_999).unwrap().variation_id, "a");
        assert_eq!(select(&rollout, 20_000).unwrap().variation_id, "b");
        assert_eq!(select(&rollout, 99_999).unwrap().variation_id, "b");
    }

    #[test]
    fn test_zero_weight_entries_never_selected() {
        let rollout = split(&[("a", 0), ("b", 100_000), ("c", 0)]);
        for b in [0, 1, 50_000, 99_999] {
            assert_eq!(select(&rollout, b).unwrap().variation_id, "b");
        }
    }

    #[test]
    fn test_uncovered_bucket() {
        let rollout = split(&[("a", 10_000)]);
        assert!(select(&rollout, 10_000).is_none());
        assert!(select(&[], 0).is_none());
    }

    #[test]
    fn test_consistent_hashing() {
        // Same pair always lands in the same bucket
        let first = bucket("test_flag", "user123");
        let second = bucket("test_flag", "user123");
        assert_eq!(first, second);

        // Roughly even spread over 1000 keys at a 50/50 split
        let rollout = split(&[("on", 50_000), ("off", 50_000)]);
        let on = (0..1000)
            .filter(|i| {
                let b = bucket("test_flag", &format!("user{}", i));
                select(&rollout, b).unwrap().variation_id == "on"
            })
            .count();
        assert!(on > 400 && on < 600, "on = {}", on);
    }
}
