//! Canonical JSON hashing used to agree on a catalog version across peers.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize `value` with sorted object keys and hash the result. Peers
/// that hold the same logical document set must produce the same hash
/// regardless of insertion order, so this always goes through
/// `serde_json::Value` and its `BTreeMap`-backed object representation.
pub fn canonical_hash<T: Serialize>(value: &T) -> anyhow::Result<String> {
    let as_value = serde_json::to_value(value)?;
    let canonical = to_canonical_string(&as_value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn to_canonical_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let joined = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap(), to_canonical_string(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{joined}}}")
        }
        serde_json::Value::Array(items) => {
            let joined = items.iter().map(to_canonical_string).collect::<Vec<_>>().join(",");
            format!("[{joined}]")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn key_order_does_not_affect_hash() {
        let mut a = HashMap::new();
        a.insert("b", 2);
        a.insert("a", 1);

        let mut b = HashMap::new();
        b.insert("a", 1);
        b.insert("b", 2);

        assert_eq!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn differing_content_differs() {
        let a = vec![1, 2, 3];
        let b = vec![1, 2, 4];
        assert_ne!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }
}
