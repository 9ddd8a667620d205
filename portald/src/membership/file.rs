//! File-backed membership source.
//!
//! Polls a JSON file holding an array of records and delivers the full list
//! whenever its content hash changes. Each delivery is a complete
//! replacement, never a delta.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use super::hash::compute_hash;

pub struct FileSource {
    /// Label used in logs, e.g. "services"
    kind: &'static str,
    path: PathBuf,
    last_hash: Option<String>,
}

impl FileSource {
    pub fn new(kind: &'static str, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            last_hash: None,
        }
    }

    /// Read the file and return its records if they differ from the last delivery.
    ///
    /// A missing file means no snapshot is available yet.
    pub async fn poll<R>(&mut self) -> Result<Option<Vec<R>>>
    where
        R: DeserializeOwned + Serialize,
    {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("No {} snapshot at {} yet", self.kind, self.path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };

        let records: Vec<R> = decode_records(self.kind, &contents)
            .with_context(|| format!("Failed to decode {}", self.path.display()))?;
        let hash = compute_hash(&records)?;

        if self.last_hash.as_deref() == Some(hash.as_str()) {
            return Ok(None);
        }

        tracing::info!(
            "Loaded {} {} records from {} ({})",
            records.len(),
            self.kind,
            self.path.display(),
            &hash[..12]
        );
        self.last_hash = Some(hash);
        Ok(Some(records))
    }
}

/// Decode a JSON array element by element, skipping elements that fail.
pub fn decode_records<R: DeserializeOwned>(kind: &str, contents: &str) -> Result<Vec<R>> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(contents).context("Snapshot is not a JSON array")?;

    let mut records = Vec::with_capacity(values.len());
    for (idx, value) in values.into_iter().enumerate() {
        match serde_json::from_value(value) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("Skipping {} record {}: {}", kind, idx, e),
        }
    }
    Ok(records)
}

/// Poll `source` every `interval` and forward changed snapshots to `tx`.
pub async fn run_watcher<R>(
    mut source: FileSource,
    interval: Duration,
    tx: mpsc::Sender<Vec<R>>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: DeserializeOwned + Serialize + Send + 'static,
{
    tracing::info!("Watching {} snapshots at {}", source.kind, source.path.display());
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match source.poll::<R>().await {
                    Ok(Some(records)) => {
                        if tx.send(records).await.is_err() {
                            tracing::info!("{} receiver closed, stopping watcher", source.kind);
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!("Failed to poll {} snapshot: {:#}", source.kind, e);
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("{} watcher shutting down", source.kind);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{EndpointRecord, ServiceRecord};

    const SERVICES: &str = r#"[
        {"namespace": "ns", "name": "foo", "portal_ip": "10.0.0.10", "ports": [{"port": 80}]},
        {"namespace": "ns", "name": "broken", "portal_ip": "not-an-ip"},
        {"namespace": "ns", "name": "bar", "portal_ip": "10.0.0.11", "ports": [{"port": 53, "protocol": "UDP"}]}
    ]"#;

    #[test]
    fn test_decode_skips_bad_elements() {
        let records: Vec<ServiceRecord> = decode_records("services", SERVICES).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["foo", "bar"]);
    }

    #[test]
    fn test_decode_rejects_non_array() {
        assert!(decode_records::<ServiceRecord>("services", r#"{"name": "foo"}"#).is_err());
    }

    #[tokio::test]
    async fn test_poll_reports_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("endpoints.json");
        let mut source = FileSource::new("endpoints", &path);

        assert!(source.poll::<EndpointRecord>().await.unwrap().is_none(), "missing file");

        std::fs::write(&path, r#"[{"namespace": "ns", "name": "foo", "addresses": ["10.0.0.1:80"]}]"#).unwrap();
        let first = source.poll::<EndpointRecord>().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);

        assert!(source.poll::<EndpointRecord>().await.unwrap().is_none(), "unchanged content");

        std::fs::write(&path, "[]").unwrap();
        let emptied = source.poll::<EndpointRecord>().await.unwrap().unwrap();
        assert!(emptied.is_empty());
    }

    #[tokio::test]
    async fn test_watcher_forwards_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        std::fs::write(&path, SERVICES).unwrap();

        let (tx, mut rx) = mpsc::channel::<Vec<ServiceRecord>>(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(
            FileSource::new("services", &path),
            Duration::from_millis(10),
            tx,
            cancel.clone(),
        ));

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.len(), 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
