use serde_json::{json, Value};
use sha2::{Sha256, Digest};
use super::ServiceEntry;

/// SHA-256 over the registry's stable content.
///
/// Entries are ordered by addr, and only addr + descriptor are hashed:
/// `last_seen` and `seen_count` move on every re-announcement without the
/// service itself changing.
pub fn compute_digest(entries: &[ServiceEntry]) -> String {
    let mut indices: Vec<usize> = (0..entries.len()).collect();
    indices.sort_by(|&a, &b| entries[a].addr.cmp(&entries[b].addr));

    let views: Vec<Value> = indices
        .iter()
        .map(|&i| {
            let e = &entries[i];
            json!({ "addr": e.addr, "descriptor": e.descriptor })
        })
        .collect();

    let hash = Sha256::digest(Value::Array(views).to_string().as_bytes());
    hex::encode(hash)
}
