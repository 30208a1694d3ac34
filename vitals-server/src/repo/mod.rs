//! Repository façade.
//!
//! Chooses a backend at startup and hides the choice from the handlers:
//! a configured database DSN that connects successfully selects Postgres,
//! anything else selects the transactional in-memory store with snapshot
//! scheduling enabled.

use crate::backup::Backup;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};
use vitals_core::error::Result;
use vitals_core::metric::{CounterMap, GaugeMap};
use vitals_core::store::MemoryStore;

pub mod postgres;

use postgres::PgStore;

enum Backend {
    Memory(MemoryStore),
    Postgres(PgStore),
}

pub struct Repository {
    backend: Backend,
    backup: Backup,
}

impl Repository {
    /// Resolve the backend. A DSN that fails to connect is logged and the
    /// façade falls back to the in-memory store.
    pub async fn init(database_dsn: Option<&str>, backup: Backup) -> Self {
        if let Some(dsn) = database_dsn {
            match PgStore::connect(dsn).await {
                Ok(pg) => {
                    return Self { backend: Backend::Postgres(pg), backup };
                }
                Err(e) => {
                    warn!(error = %e, "database connection failed, falling back to in-memory store");
                }
            }
        }

        info!("using in-memory store");
        Self::in_memory(backup)
    }

    pub fn in_memory(backup: Backup) -> Self {
        Self { backend: Backend::Memory(MemoryStore::new()), backup }
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.backend, Backend::Memory(_))
    }

    // ========================
    // Getters / setters
    // ========================

    pub async fn gauge(&self, name: &str) -> Result<Option<f64>> {
        match &self.backend {
            Backend::Memory(m) => Ok(m.gauge(name).await),
            Backend::Postgres(pg) => pg.gauge(name).await,
        }
    }

    pub async fn gauge_all(&self) -> Result<GaugeMap> {
        match &self.backend {
            Backend::Memory(m) => Ok(m.gauge_all().await),
            Backend::Postgres(pg) => pg.gauge_all().await,
        }
    }

    pub async fn set_gauge(&self, name: &str, value: f64) -> Result<()> {
        match &self.backend {
            Backend::Memory(m) => {
                m.set_gauge(name, value).await;
                Ok(())
            }
            Backend::Postgres(pg) => pg.set_gauge(name, value).await,
        }
    }

    pub async fn set_gauge_all(&self, values: GaugeMap) -> Result<()> {
        match &self.backend {
            Backend::Memory(m) => {
                m.set_gauge_all(values).await;
                Ok(())
            }
            Backend::Postgres(pg) => pg.set_gauge_all(&values).await,
        }
    }

    pub async fn counter(&self, name: &str) -> Result<Option<i64>> {
        match &self.backend {
            Backend::Memory(m) => Ok(m.counter(name).await),
            Backend::Postgres(pg) => pg.counter(name).await,
        }
    }

    pub async fn counter_all(&self) -> Result<CounterMap> {
        match &self.backend {
            Backend::Memory(m) => Ok(m.counter_all().await),
            Backend::Postgres(pg) => pg.counter_all().await,
        }
    }

    pub async fn set_counter(&self, name: &str, value: i64) -> Result<()> {
        match &self.backend {
            Backend::Memory(m) => {
                m.set_counter(name, value).await;
                Ok(())
            }
            Backend::Postgres(pg) => pg.set_counter(name, value).await,
        }
    }

    pub async fn set_counter_all(&self, values: CounterMap) -> Result<()> {
        match &self.backend {
            Backend::Memory(m) => {
                m.set_counter_all(values).await;
                Ok(())
            }
            Backend::Postgres(pg) => pg.set_counter_all(&values).await,
        }
    }

    /// Healthcheck behind `/ping`. The in-memory backend reports its
    /// missing remote database as an error on purpose.
    pub async fn ping(&self) -> Result<()> {
        match &self.backend {
            Backend::Memory(m) => m.ping(),
            Backend::Postgres(pg) => pg.ping().await,
        }
    }

    // ========================
    // Snapshot lifecycle
    // ========================

    /// Populate the in-memory store from the snapshot file when the restore
    /// flag is set. Failures are reported but never fatal; the server then
    /// starts empty.
    #[instrument(skip(self))]
    pub async fn restore(&self) {
        let Backend::Memory(store) = &self.backend else {
            return;
        };

        if !self.backup.should_restore() {
            warn!("restore flag wasn't set");
            return;
        }

        match self.backup.restore_into(store).await {
            Ok(()) => info!("values were restored from the snapshot file"),
            Err(e) => error!(error = %e, "values couldn't be restored from the snapshot"),
        }
    }

    /// Drive the snapshot writer until shutdown; no-op under Postgres.
    pub async fn schedule_backup(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        match &self.backend {
            Backend::Memory(store) => self.backup.schedule(store, shutdown).await,
            Backend::Postgres(_) => Ok(()),
        }
    }

    pub async fn close(&self) {
        if let Backend::Postgres(pg) = &self.backend {
            pg.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use vitals_core::error::VitalsError;

    fn memory_repo() -> Repository {
        Repository::in_memory(Backup::new(PathBuf::from("unused-backup.json"), 300, false))
    }

    #[tokio::test]
    async fn facade_dispatches_counter_accumulation() {
        let repo = memory_repo();
        repo.set_counter("PollCount", 1).await.unwrap();
        repo.set_counter("PollCount", 2).await.unwrap();
        assert_eq!(repo.counter("PollCount").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn facade_dispatches_gauge_replacement() {
        let repo = memory_repo();
        repo.set_gauge("g", 1.0).await.unwrap();
        repo.set_gauge("g", 2.0).await.unwrap();
        assert_eq!(repo.gauge("g").await.unwrap(), Some(2.0));
    }

    #[tokio::test]
    async fn memory_ping_is_a_diagnostic_error() {
        let repo = memory_repo();
        assert!(matches!(repo.ping().await, Err(VitalsError::RemoteDbNotConfigured)));
    }

    #[tokio::test]
    async fn restore_populates_store_when_flag_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");
        tokio::fs::write(&path, br#"[{"Alloc":1.5},{"PollCount":9}]"#).await.unwrap();

        let repo = Repository::in_memory(Backup::new(path, 300, true));
        repo.restore().await;

        assert_eq!(repo.gauge("Alloc").await.unwrap(), Some(1.5));
        assert_eq!(repo.counter("PollCount").await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn restore_without_flag_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");
        tokio::fs::write(&path, br#"[{"Alloc":1.5}]"#).await.unwrap();

        let repo = Repository::in_memory(Backup::new(path, 300, false));
        repo.restore().await;
        assert!(repo.gauge_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_setters_collapse_into_state() {
        let repo = memory_repo();
        repo.set_counter("c", 10).await.unwrap();
        repo.set_counter_all(HashMap::from([("c".to_string(), 5)])).await.unwrap();
        repo.set_gauge_all(HashMap::from([("g".to_string(), 3.5)])).await.unwrap();

        assert_eq!(repo.counter("c").await.unwrap(), Some(15));
        assert_eq!(repo.gauge("g").await.unwrap(), Some(3.5));
    }
}
