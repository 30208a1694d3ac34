//! Postgres metrics repository.
//!
//! Implements the same getter/setter contract as the in-memory store over
//! two relational tables. Every operation runs inside a transaction driven
//! by a retrying wrapper: serialization failures, deadlocks and
//! connection-class errors are retried with a `1s + (attempt-1) * 2s`
//! backoff up to three times; anything else bubbles up on the first
//! attempt. Uncommitted transactions roll back on drop.

use std::future::Future;
use std::time::Duration;
use tracing::{info, instrument, warn};
use vitals_core::error::{Result, VitalsError};
use vitals_core::metric::{CounterMap, GaugeMap};

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

const MAX_RETRIES: u32 = 3;

const CREATE_GAUGE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS gauge_metrics (
        id SERIAL PRIMARY KEY,
        name VARCHAR(64) UNIQUE,
        value DOUBLE PRECISION NOT NULL DEFAULT 0
    )
"#;

const CREATE_COUNTER_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS counter_metrics (
        id SERIAL PRIMARY KEY,
        name VARCHAR(64) UNIQUE,
        value BIGINT NOT NULL DEFAULT 0
    )
"#;

const UPSERT_GAUGE: &str = r#"
    INSERT INTO gauge_metrics (name, value)
    VALUES ($1, $2)
    ON CONFLICT (name)
    DO UPDATE SET value = EXCLUDED.value
"#;

const UPSERT_COUNTER: &str = r#"
    INSERT INTO counter_metrics (name, value)
    VALUES ($1, $2)
    ON CONFLICT (name)
    DO UPDATE SET value = counter_metrics.value + EXCLUDED.value
"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with a bounded pool and create the schema if missing.
    #[instrument(skip(dsn))]
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(15)
            .min_connections(2)
            .idle_timeout(Duration::from_secs(20))
            .connect(dsn)
            .await
            .map_err(|e| VitalsError::Database(e.to_string()))?;

        let store = Self { pool };
        store.migrate().await?;
        info!("postgres repository initialized");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        self.execute_tx("migrate", || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(CREATE_GAUGE_TABLE).execute(&mut *tx).await?;
            sqlx::query(CREATE_COUNTER_TABLE).execute(&mut *tx).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// The retryable set is narrow: serialization failure, deadlock
    /// detected, the connection-exception class, and pool/IO trouble.
    fn is_retryable(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db) => match db.code() {
                Some(code) => code == "40001" || code == "40P01" || code.starts_with("08"),
                None => false,
            },
            _ => false,
        }
    }

    async fn execute_tx<T, F, Fut>(&self, op: &'static str, body: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut retries = 0u32;
        loop {
            match body().await {
                Ok(v) => return Ok(v),
                Err(e) if retries < MAX_RETRIES && Self::is_retryable(&e) => {
                    retries += 1;
                    let delay = Duration::from_secs(2 * u64::from(retries) - 1);
                    warn!(op, attempt = retries, error = %e, delay_s = delay.as_secs(), "retrying database operation");
                    metrics::counter!("vitals_db_retries_total", "operation" => op).increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::counter!("vitals_db_errors_total", "operation" => op).increment(1);
                    return Err(VitalsError::Database(e.to_string()));
                }
            }
        }
    }

    // ========================
    // Gauge metrics
    // ========================

    pub async fn gauge(&self, name: &str) -> Result<Option<f64>> {
        self.execute_tx("gauge", || async {
            let mut tx = self.pool.begin().await?;
            let v: Option<f64> =
                sqlx::query_scalar("SELECT value FROM gauge_metrics WHERE name = $1")
                    .bind(name)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.commit().await?;
            Ok(v)
        })
        .await
    }

    pub async fn gauge_all(&self) -> Result<GaugeMap> {
        self.execute_tx("gauge_all", || async {
            let mut tx = self.pool.begin().await?;
            let rows = sqlx::query("SELECT name, value FROM gauge_metrics")
                .fetch_all(&mut *tx)
                .await?;
            tx.commit().await?;

            let mut map = GaugeMap::new();
            for row in rows {
                map.insert(row.try_get("name")?, row.try_get("value")?);
            }
            Ok(map)
        })
        .await
    }

    pub async fn set_gauge(&self, name: &str, value: f64) -> Result<()> {
        self.execute_tx("set_gauge", || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(UPSERT_GAUGE).bind(name).bind(value).execute(&mut *tx).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// N upserts within a single transaction.
    pub async fn set_gauge_all(&self, values: &GaugeMap) -> Result<()> {
        self.execute_tx("set_gauge_all", || async {
            let mut tx = self.pool.begin().await?;
            for (name, value) in values {
                sqlx::query(UPSERT_GAUGE).bind(name).bind(value).execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    // ========================
    // Counter metrics
    // ========================

    pub async fn counter(&self, name: &str) -> Result<Option<i64>> {
        self.execute_tx("counter", || async {
            let mut tx = self.pool.begin().await?;
            let v: Option<i64> =
                sqlx::query_scalar("SELECT value FROM counter_metrics WHERE name = $1")
                    .bind(name)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.commit().await?;
            Ok(v)
        })
        .await
    }

    pub async fn counter_all(&self) -> Result<CounterMap> {
        self.execute_tx("counter_all", || async {
            let mut tx = self.pool.begin().await?;
            let rows = sqlx::query("SELECT name, value FROM counter_metrics")
                .fetch_all(&mut *tx)
                .await?;
            tx.commit().await?;

            let mut map = CounterMap::new();
            for row in rows {
                map.insert(row.try_get("name")?, row.try_get("value")?);
            }
            Ok(map)
        })
        .await
    }

    /// Accumulating upsert: the stored value becomes `existing + value`,
    /// matching the in-memory register's `set_accum`.
    pub async fn set_counter(&self, name: &str, value: i64) -> Result<()> {
        self.execute_tx("set_counter", || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(UPSERT_COUNTER).bind(name).bind(value).execute(&mut *tx).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn set_counter_all(&self, values: &CounterMap) -> Result<()> {
        self.execute_tx("set_counter_all", || async {
            let mut tx = self.pool.begin().await?;
            for (name, value) in values {
                sqlx::query(UPSERT_COUNTER).bind(name).bind(value).execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| VitalsError::Database(e.to_string()))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_is_narrow() {
        assert!(PgStore::is_retryable(&sqlx::Error::PoolTimedOut));
        assert!(PgStore::is_retryable(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))));
        assert!(!PgStore::is_retryable(&sqlx::Error::RowNotFound));
        assert!(!PgStore::is_retryable(&sqlx::Error::ColumnNotFound("value".into())));
    }

    #[test]
    fn retry_delays_follow_the_schedule() {
        // delay = 1s + (attempt - 1) * 2s for attempts 1..=3
        let delays: Vec<u64> = (1..=MAX_RETRIES).map(|n| 2 * u64::from(n) - 1).collect();
        assert_eq!(delays, vec![1, 3, 5]);
    }
}
