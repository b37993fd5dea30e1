//! Content hashing: canonical digests, Merkle roots, derived identifiers.
//!
//! Identity, not security: digests exist so that structurally-equal
//! workloads collapse to the same id, making re-submission recognizable.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::DispatchError;

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic digest of a canonical serialization of `value`.
///
/// Canonical form is JSON with map keys in sorted order (serde_json's
/// default `Map` is ordered by key), so two structurally-equal values
/// produce identical digests regardless of field insertion order or
/// execution context. A value that cannot be serialized is a caller
/// error and fails fast.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, DispatchError> {
    let canonical = serde_json::to_value(value)
        .map_err(|e| DispatchError::Canonicalize(e.to_string()))?;
    Ok(digest_hex(canonical.to_string().as_bytes()))
}

/// The defined root for an empty leaf set (digest of empty input).
pub fn empty_root() -> String {
    digest_hex(b"")
}

/// Merkle root over an ordered sequence of leaf digests.
///
/// Adjacent digests are paired left to right and each pair is combined by
/// hashing the sort-ordered concatenation of the two (order-independent
/// per pair; overall leaf order still matters because pairing is
/// positional). A trailing unpaired leaf is paired with itself. A single
/// leaf yields the hash of that leaf.
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return empty_root();
    }
    if leaves.len() == 1 {
        return digest_hex(leaves[0].as_bytes());
    }

    let mut level: Vec<String> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let (a, b) = match pair {
                [a, b] => (a, b),
                [a] => (a, a),
                _ => unreachable!("chunks(2) yields 1 or 2 elements"),
            };
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            next.push(digest_hex(format!("{lo}{hi}").as_bytes()));
        }
        level = next;
    }
    level.pop().unwrap_or_else(empty_root)
}

/// Storage-layer primary key for a job: `task_id + ":" + content hash`.
/// Identical inputs under different tasks never collide.
pub fn job_id<T: Serialize + ?Sized>(task_id: &str, input: &T) -> Result<String, DispatchError> {
    Ok(format!("{task_id}:{}", content_hash(input)?))
}

/// Id for a deterministic task: `hash(name + ":" + merkle_root)`. Two
/// tasks with identical name and input set collapse to the same id.
pub fn deterministic_task_id(name: &str, merkle_root: &str) -> String {
    digest_hex(format!("{name}:{merkle_root}").as_bytes())
}

/// Id for a dynamic task: `hash(name + ":" + creation timestamp)`,
/// intentionally non-deterministic.
pub fn dynamic_task_id(name: &str, created_at: DateTime<Utc>) -> String {
    digest_hex(format!("{name}:{}", created_at.timestamp_millis()).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structurally_equal_values_hash_equal() {
        let a = json!({"b": 2, "a": 1, "nested": {"y": [1, 2], "x": null}});
        let b = json!({"nested": {"x": null, "y": [1, 2]}, "a": 1, "b": 2});
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn different_values_hash_differently() {
        let a = content_hash(&json!({"n": 1})).unwrap();
        let b = content_hash(&json!({"n": 2})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn hashing_is_stable_across_calls() {
        let v = json!(["x", {"k": true}]);
        assert_eq!(content_hash(&v).unwrap(), content_hash(&v).unwrap());
    }

    #[test]
    fn empty_leaves_yield_the_sentinel_root() {
        assert_eq!(merkle_root(&[]), empty_root());
    }

    #[test]
    fn single_leaf_root_is_hash_of_leaf() {
        let leaf = "aa".to_string();
        assert_eq!(merkle_root(std::slice::from_ref(&leaf)), digest_hex(b"aa"));
    }

    #[test]
    fn root_is_deterministic() {
        let leaves: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(merkle_root(&leaves), merkle_root(&leaves));
    }

    #[test]
    fn pairing_is_positional() {
        // Swapping leaves across a pair boundary changes the root even
        // though each individual pair combines order-independently.
        let a: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["a", "c", "b", "d"].iter().map(|s| s.to_string()).collect();
        assert_ne!(merkle_root(&a), merkle_root(&b));
    }

    #[test]
    fn swapping_within_a_pair_keeps_the_root() {
        let a: Vec<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["y", "x"].iter().map(|s| s.to_string()).collect();
        assert_eq!(merkle_root(&a), merkle_root(&b));
    }

    #[test]
    fn leaf_content_change_changes_the_root() {
        let a: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let mut b = a.clone();
        b[2] = "c2".to_string();
        assert_ne!(merkle_root(&a), merkle_root(&b));
    }

    #[test]
    fn odd_leaf_is_paired_with_itself() {
        // Three leaves collapse: level 1 = [h(ab), h(cc)], then the root.
        let leaves: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let ab = digest_hex(b"ab");
        let cc = digest_hex(b"cc");
        let (lo, hi) = if ab <= cc { (&ab, &cc) } else { (&cc, &ab) };
        let expected = digest_hex(format!("{lo}{hi}").as_bytes());
        assert_eq!(merkle_root(&leaves), expected);
    }

    #[test]
    fn job_ids_are_namespaced_by_task() {
        let input = json!({"url": "https://example.com"});
        let a = job_id("task-a", &input).unwrap();
        let b = job_id("task-b", &input).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("task-a:"));
    }

    #[test]
    fn task_id_varies_with_name_but_root_does_not() {
        let leaves: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let root = merkle_root(&leaves);
        // Same inputs, different names: same root, different ids.
        assert_ne!(
            deterministic_task_id("alpha", &root),
            deterministic_task_id("beta", &root)
        );
        assert_eq!(
            deterministic_task_id("alpha", &root),
            deterministic_task_id("alpha", &root)
        );
    }
}
