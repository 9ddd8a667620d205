use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Sha256, Digest};

/// Computes a SHA-256 hash of a record list.
/// Records are serialized individually and sorted, so delivery order does
/// not change the hash.
pub fn compute_hash<R: Serialize>(records: &[R]) -> Result<String> {
    let mut encoded = records
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to serialize records for hashing")?;
    encoded.sort_unstable();

    let mut hasher = Sha256::new();
    for record in &encoded {
        hasher.update(record.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}
