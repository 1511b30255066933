use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use pushbuild_core::{
    config::LogConfig,
    models::{LogEntry, LogLevel, RunLog, TimeStamp},
};
use sqlx::{Pool, Row, Sqlite, SqlitePool, migrate::MigrateDatabase};

/// Durable destination for run logs.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persist every entry of `log` under `timestamp`.
    ///
    /// Flushing the same run again appends only the entries added since the
    /// previous flush.
    async fn flush(&self, timestamp: TimeStamp, log: &RunLog) -> Result<()>;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StoredRun {
    pub timestamp: TimeStamp,
    pub has_errors: bool,
    pub entries: Vec<LogEntry>,
}

/// Rolling run log backed by SQLite.
///
/// Only the `retain_runs` most recently flushed runs are kept, ordered by flush
/// rather than by event timestamp. The run being flushed always survives, even
/// with `retain_runs` of zero.
#[derive(Clone)]
pub struct SqliteLogStore {
    pub pool: Pool<Sqlite>,
    retain_runs: u32,
}

impl SqliteLogStore {
    pub async fn new(config: &LogConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            tracing::info!(url = %config.url, "Creating database");
            Sqlite::create_database(&config.url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&config.url).await.context("Failed to connect to database")?;
        Self::from_pool(pool, config.retain_runs).await
    }

    pub async fn from_pool(pool: Pool<Sqlite>, retain_runs: u32) -> Result<Self> {
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool, retain_runs })
    }

    pub async fn close(&self) { self.pool.close().await }

    /// The most recently flushed runs, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<StoredRun>> {
        let runs = sqlx::query(
            "SELECT timestamp, has_errors FROM runs ORDER BY flush_seq DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(runs.len());
        for run in runs {
            let timestamp: i64 = run.get("timestamp");
            let entries = sqlx::query(
                "SELECT level, message FROM run_entries WHERE run_timestamp = ? ORDER BY seq",
            )
            .bind(timestamp)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| {
                let level: String = row.get("level");
                Ok(LogEntry {
                    level: level.parse().map_err(|_| anyhow!("Unknown log level {level}"))?,
                    message: row.get("message"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
            out.push(StoredRun {
                timestamp: TimeStamp::from_millis(timestamp as u64),
                has_errors: run.get("has_errors"),
                entries,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn flush(&self, timestamp: TimeStamp, log: &RunLog) -> Result<()> {
        let entries = log.entries();
        let has_errors = entries.iter().any(|e| e.level == LogLevel::Error);
        let run_timestamp = timestamp.as_millis() as i64;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO runs (timestamp, has_errors, flush_seq)
            VALUES (?, ?, (SELECT COALESCE(MAX(flush_seq), 0) + 1 FROM runs))
            ON CONFLICT (timestamp) DO UPDATE
            SET has_errors = EXCLUDED.has_errors,
                flush_seq = EXCLUDED.flush_seq,
                flushed_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(run_timestamp)
        .bind(has_errors)
        .execute(&mut *tx)
        .await?;
        for (seq, entry) in entries.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO run_entries (run_timestamp, seq, level, message)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (run_timestamp, seq) DO NOTHING
                "#,
            )
            .bind(run_timestamp)
            .bind(seq as i64)
            .bind(entry.level.as_str())
            .bind(entry.message.as_str())
            .execute(&mut *tx)
            .await?;
        }
        let pruned = prune(&mut tx, run_timestamp, self.retain_runs).await?;
        tx.commit().await.context("Failed to commit run log")?;
        tracing::debug!(
            "Flushed run log {} ({} entries, pruned {} runs)",
            timestamp,
            entries.len(),
            pruned
        );
        Ok(())
    }
}

/// Drops every run outside the newest `retain_runs` flushes, except `current`.
async fn prune(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    current: i64,
    retain_runs: u32,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM runs
        WHERE timestamp != ?
          AND timestamp NOT IN (SELECT timestamp FROM runs ORDER BY flush_seq DESC LIMIT ?)
        "#,
    )
    .bind(current)
    .bind(i64::from(retain_runs))
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM run_entries WHERE run_timestamp NOT IN (SELECT timestamp FROM runs)")
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}
