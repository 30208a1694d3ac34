//! Snapshot writer for the in-memory backend.
//!
//! Persists both registers to a single JSON file shaped as a one- or
//! two-member array: `[ <gauges> , <counters> ]`. Snapshot trouble is never
//! fatal: a failed write is skipped, a failed restore starts the server
//! empty.

use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, instrument, warn};
use vitals_core::error::{Result, VitalsError};
use vitals_core::metric::{CounterMap, GaugeMap};
use vitals_core::store::MemoryStore;

pub struct Backup {
    path: PathBuf,
    interval_secs: u64,
    restore_flag: bool,
    // The snapshot file is never written concurrently.
    mu: Mutex<()>,
}

impl Backup {
    pub fn new(path: PathBuf, interval_secs: u64, restore_flag: bool) -> Self {
        Self { path, interval_secs, restore_flag, mu: Mutex::new(()) }
    }

    pub fn should_restore(&self) -> bool {
        self.restore_flag
    }

    /// Serialize both registers into the snapshot file. `truncate` is set
    /// for the final shutdown write; scheduled writes rewrite from offset
    /// zero and rely on restore's tolerance for trailing bytes.
    #[instrument(skip(self, store), fields(path = %self.path.display()))]
    pub async fn write(&self, store: &MemoryStore, truncate: bool) -> Result<()> {
        let _guard = self.mu.lock().await;

        let (gauges, counters) = tokio::join!(store.gauge_all(), store.counter_all());
        let data = encode_snapshot(&gauges, &counters).ok_or_else(|| VitalsError::Snapshot {
            path: self.path.clone(),
            reason: "nothing to write".to_string(),
        })?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .open(&self.path)
            .await
            .map_err(|source| VitalsError::Io { path: self.path.clone(), source })?;
        file.write_all(&data)
            .await
            .map_err(|source| VitalsError::Io { path: self.path.clone(), source })?;

        Ok(())
    }

    /// Load the snapshot file back into the store. Each array member is
    /// decoded independently; one good member is enough for success.
    #[instrument(skip(self, store), fields(path = %self.path.display()))]
    pub async fn restore_into(&self, store: &MemoryStore) -> Result<()> {
        let _guard = self.mu.lock().await;

        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| VitalsError::Io { path: self.path.clone(), source })?;

        let (gauge_token, counter_token) = split_snapshot(&raw);
        let gauge_token = trim_array_chrome(gauge_token);
        let counter_token = trim_array_chrome(counter_token);

        let mut restored = 0usize;

        if gauge_token.len() > 2 {
            match serde_json::from_slice::<GaugeMap>(gauge_token) {
                Ok(gauges) => {
                    store.set_gauge_all(gauges).await;
                    restored += 1;
                }
                Err(e) => warn!(error = %e, "gauge member of the snapshot did not decode"),
            }
        }

        if counter_token.len() > 2 {
            match serde_json::from_slice::<CounterMap>(counter_token) {
                Ok(counters) => {
                    store.set_counter_all(counters).await;
                    restored += 1;
                }
                Err(e) => warn!(error = %e, "counter member of the snapshot did not decode"),
            }
        }

        if restored == 0 {
            return Err(VitalsError::Snapshot {
                path: self.path.clone(),
                reason: "no meaningful values could be read".to_string(),
            });
        }

        Ok(())
    }

    /// Drive scheduled writes until shutdown, then perform one final
    /// truncating write.
    pub async fn schedule(
        &self,
        store: &MemoryStore,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first interval tick completes immediately; consume it so the
        // first scheduled write lands a full period after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.write(store, false).await {
                        Ok(()) => info!("scheduled snapshot written"),
                        Err(e) => error!(error = %e, "scheduled snapshot failed"),
                    }
                }
                _ = shutdown.recv() => {
                    match self.write(store, true).await {
                        Ok(()) => info!("shutdown snapshot written"),
                        Err(e) => error!(error = %e, "shutdown snapshot failed"),
                    }
                    return Ok(());
                }
            }
        }
    }
}

/// `[ gauges , counters ]`, skipping a missing trailing member and using
/// `{}` when gauges are empty but counters are not. Returns `None` when
/// both maps are empty.
fn encode_snapshot(gauges: &GaugeMap, counters: &CounterMap) -> Option<Vec<u8>> {
    if gauges.is_empty() && counters.is_empty() {
        return None;
    }

    let gauge_json = if gauges.is_empty() {
        b"{}".to_vec()
    } else {
        serde_json::to_vec(gauges).ok()?
    };

    let mut data = Vec::with_capacity(gauge_json.len() + 64);
    data.push(b'[');
    data.extend_from_slice(&gauge_json);
    if !counters.is_empty() {
        data.push(b',');
        data.extend_from_slice(&serde_json::to_vec(counters).ok()?);
    }
    data.push(b']');
    Some(data)
}

/// Split the top-level two-member array at the `,{` boundary at depth 1.
/// The scan is string-aware so ids containing `,{` cannot shift the
/// boundary.
fn split_snapshot(data: &[u8]) -> (&[u8], &[u8]) {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in data.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'[' | b'{' if !in_string => depth += 1,
            b']' | b'}' if !in_string => depth -= 1,
            b',' if !in_string && depth == 1 && data.get(i + 1) == Some(&b'{') => {
                return (&data[..=i], &data[i + 1..]);
            }
            _ => {}
        }
    }

    (data, &[])
}

/// Trim the array chrome (`[`, `,`, `]`) from both ends of a member token.
fn trim_array_chrome(mut token: &[u8]) -> &[u8] {
    while let Some((&first, rest)) = token.split_first() {
        if matches!(first, b'[' | b',' | b']') {
            token = rest;
        } else {
            break;
        }
    }
    while let Some((&last, rest)) = token.split_last() {
        if matches!(last, b'[' | b',' | b']') {
            token = rest;
        } else {
            break;
        }
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_backup(restore: bool) -> (tempfile::TempDir, Backup) {
        let dir = tempfile::tempdir().unwrap();
        let backup = Backup::new(dir.path().join("backup.json"), 300, restore);
        (dir, backup)
    }

    #[tokio::test]
    async fn snapshot_round_trips_full_state() {
        let (_dir, backup) = temp_backup(true);

        let store = MemoryStore::new();
        store.set_gauge("Alloc", 3.5).await;
        store.set_gauge("Sys", 1024.0).await;
        store.set_counter("PollCount", 42).await;
        backup.write(&store, true).await.unwrap();

        let restored = MemoryStore::new();
        backup.restore_into(&restored).await.unwrap();

        assert_eq!(restored.gauge_all().await, store.gauge_all().await);
        assert_eq!(restored.counter_all().await, store.counter_all().await);
    }

    #[tokio::test]
    async fn snapshot_with_counters_only_uses_empty_object_placeholder() {
        let (_dir, backup) = temp_backup(true);

        let store = MemoryStore::new();
        store.set_counter("PollCount", 7).await;
        backup.write(&store, true).await.unwrap();

        let restored = MemoryStore::new();
        backup.restore_into(&restored).await.unwrap();
        assert!(restored.gauge_all().await.is_empty());
        assert_eq!(restored.counter("PollCount").await, Some(7));
    }

    #[tokio::test]
    async fn snapshot_with_gauges_only_has_one_member() {
        let (_dir, backup) = temp_backup(true);

        let store = MemoryStore::new();
        store.set_gauge("Alloc", 1.0).await;
        backup.write(&store, true).await.unwrap();

        let restored = MemoryStore::new();
        backup.restore_into(&restored).await.unwrap();
        assert_eq!(restored.gauge("Alloc").await, Some(1.0));
        assert!(restored.counter_all().await.is_empty());
    }

    #[tokio::test]
    async fn empty_state_is_not_written() {
        let (_dir, backup) = temp_backup(false);
        let store = MemoryStore::new();
        assert!(backup.write(&store, true).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_member_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");
        tokio::fs::write(&path, br#"[{"Alloc":not-json},{"PollCount":5}]"#).await.unwrap();

        let backup = Backup::new(path, 300, true);
        let store = MemoryStore::new();
        backup.restore_into(&store).await.unwrap();

        assert!(store.gauge_all().await.is_empty());
        assert_eq!(store.counter("PollCount").await, Some(5));
    }

    #[tokio::test]
    async fn fully_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");
        tokio::fs::write(&path, b"garbage").await.unwrap();

        let backup = Backup::new(path, 300, true);
        let store = MemoryStore::new();
        assert!(backup.restore_into(&store).await.is_err());
        assert!(store.gauge_all().await.is_empty());
    }

    #[test]
    fn split_ignores_boundary_bytes_inside_strings() {
        let data = br#"[{"we,{ird":1},{"c":2}]"#;
        let (left, right) = split_snapshot(data);
        assert_eq!(left, &br#"[{"we,{ird":1},"#[..]);
        assert_eq!(right, &br#"{"c":2}]"#[..]);
    }

    #[test]
    fn encode_skips_empty_state() {
        assert!(encode_snapshot(&GaugeMap::new(), &CounterMap::new()).is_none());

        let counters = HashMap::from([("c".to_string(), 1i64)]);
        let data = encode_snapshot(&GaugeMap::new(), &counters).unwrap();
        assert_eq!(data, br#"[{},{"c":1}]"#);
    }
}
