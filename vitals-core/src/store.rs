//! In-memory metrics store.
//!
//! [`MemoryStore`] composes a gauge register and a counter register and
//! exposes the getter/setter contract shared with the SQL backend. The
//! registers themselves are public so that callers with many writes per
//! tick (the agent's samplers, the snapshot writer) can batch them into a
//! single transaction.

use crate::error::{Result, VitalsError};
use crate::metric::{CounterMap, GaugeMap};
use crate::register::TransactionalRegister;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub gauge: TransactionalRegister<f64>,
    pub counter: TransactionalRegister<i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { gauge: TransactionalRegister::new(), counter: TransactionalRegister::new() }
    }

    pub async fn gauge(&self, name: &str) -> Option<f64> {
        let v = self.gauge.read(|tx| tx.get(name)).await;
        debug!(name, value = ?v, "read gauge from memory store");
        v
    }

    pub async fn gauge_all(&self) -> GaugeMap {
        self.gauge.read(|tx| tx.get_all()).await
    }

    pub async fn set_gauge(&self, name: &str, value: f64) {
        self.gauge.update(|tx| tx.set(name, value)).await;
        debug!(name, value, "set gauge in memory store");
    }

    pub async fn set_gauge_all(&self, values: GaugeMap) {
        self.gauge.update(|tx| tx.set_all(values)).await;
    }

    pub async fn counter(&self, name: &str) -> Option<i64> {
        let v = self.counter.read(|tx| tx.get(name)).await;
        debug!(name, value = ?v, "read counter from memory store");
        v
    }

    pub async fn counter_all(&self) -> CounterMap {
        self.counter.read(|tx| tx.get_all()).await
    }

    /// Counters accumulate: the stored value becomes `existing + value`.
    pub async fn set_counter(&self, name: &str, value: i64) {
        self.counter.update(|tx| tx.set_accum(name, value)).await;
        debug!(name, value, "accumulated counter in memory store");
    }

    pub async fn set_counter_all(&self, values: CounterMap) {
        self.counter.update(|tx| tx.set_accum_all(values)).await;
    }

    /// The in-memory backend has no remote database behind it; `ping`
    /// reports that as an error so `/ping` stays an honest healthcheck.
    pub fn ping(&self) -> Result<()> {
        Err(VitalsError::RemoteDbNotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn counter_accumulates_across_calls() {
        let store = MemoryStore::new();
        store.set_counter("PollCount", 56).await;
        store.set_counter("PollCount", 21).await;
        assert_eq!(store.counter("PollCount").await, Some(77));
    }

    #[tokio::test]
    async fn gauge_replaces_across_calls() {
        let store = MemoryStore::new();
        store.set_gauge("Alloc", 1.0).await;
        store.set_gauge("Alloc", 2.5).await;
        assert_eq!(store.gauge("Alloc").await, Some(2.5));
    }

    #[tokio::test]
    async fn counter_batch_preserves_sum_semantics() {
        let store = MemoryStore::new();
        store.set_counter("c", 10).await;
        store
            .set_counter_all(HashMap::from([("c".to_string(), 3), ("d".to_string(), 4)]))
            .await;
        assert_eq!(store.counter("c").await, Some(13));
        assert_eq!(store.counter("d").await, Some(4));
    }

    #[tokio::test]
    async fn missing_ids_read_as_none() {
        let store = MemoryStore::new();
        assert_eq!(store.gauge("nope").await, None);
        assert_eq!(store.counter("nope").await, None);
    }

    #[tokio::test]
    async fn ping_reports_missing_remote_db() {
        let store = MemoryStore::new();
        assert!(matches!(store.ping(), Err(VitalsError::RemoteDbNotConfigured)));
    }
}
