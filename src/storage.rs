//! Durable off-chain state: the dedup journal and the transaction watcher
//! log, both in SQLite.
//!
//! The pipeline is otherwise stateless. Both tables tolerate losing their
//! newest rows; anything lost is re-observed on the next cycle.

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, Pool, Row, Sqlite};
use tracing::{debug, info};

/// Watcher row for a broadcast transaction.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct TxRecord {
    pub tx_hash: String,
    pub nonce: i64,
    pub status: String,
    pub updated_ts: i64,
}

/// SQLite-backed store shared by the deduplicator and the submitter.
pub struct OracleStore {
    pool: Pool<Sqlite>,
}

impl OracleStore {
    /// Open (or create) the database at `path`. Use ":memory:" in tests.
    pub async fn open(path: &str) -> Result<Self> {
        // An in-memory database exists per connection, so the pool must
        // stay at one.
        let (url, max_connections) = if path == ":memory:" {
            ("sqlite::memory:".to_string(), 1)
        } else {
            (format!("sqlite:{}?mode=rwc", path), 5)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await
            .context("failed to connect to SQLite database")?;

        Self::create_schema(&pool).await?;
        info!("oracle store opened at {}", path);
        Ok(Self { pool })
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_items (
                item_id TEXT PRIMARY KEY,
                first_seen_ts INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("failed to create seen_items table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS submitted_transactions (
                tx_hash TEXT PRIMARY KEY,
                nonce INTEGER NOT NULL,
                status TEXT NOT NULL,
                updated_ts INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("failed to create submitted_transactions table")?;

        Ok(())
    }

    /// Journal first-seen item ids. Conflicts keep the earlier timestamp.
    pub async fn record_seen(&self, entries: &[(String, i64)]) -> Result<()> {
        for (item_id, first_seen_ts) in entries {
            sqlx::query(
                "INSERT INTO seen_items (item_id, first_seen_ts) VALUES (?, ?)
                 ON CONFLICT(item_id) DO NOTHING",
            )
            .bind(item_id)
            .bind(first_seen_ts)
            .execute(&self.pool)
            .await
            .context("failed to record seen item")?;
        }
        Ok(())
    }

    /// Load the journal entries newer than `since_ts`, for warm-up after a
    /// restart.
    pub async fn load_seen_since(&self, since_ts: i64) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT item_id, first_seen_ts FROM seen_items WHERE first_seen_ts > ?")
            .bind(since_ts)
            .fetch_all(&self.pool)
            .await
            .context("failed to load seen items")?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<i64, _>(1)))
            .collect())
    }

    /// Drop journal entries older than the horizon.
    pub async fn prune_seen(&self, before_ts: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM seen_items WHERE first_seen_ts <= ?")
            .bind(before_ts)
            .execute(&self.pool)
            .await
            .context("failed to prune seen items")?;
        let pruned = result.rows_affected();
        if pruned > 0 {
            debug!("pruned {} expired dedup entries", pruned);
        }
        Ok(pruned)
    }

    /// Upsert a watcher row for a broadcast transaction.
    pub async fn record_tx(&self, tx_hash: &str, nonce: u64, status: &str, ts: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO submitted_transactions (tx_hash, nonce, status, updated_ts)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(tx_hash) DO UPDATE SET status = excluded.status,
                                                updated_ts = excluded.updated_ts",
        )
        .bind(tx_hash)
        .bind(nonce as i64)
        .bind(status)
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("failed to record transaction")?;
        Ok(())
    }

    /// Transactions still awaiting a terminal status, oldest nonce first.
    pub async fn pending_txs(&self) -> Result<Vec<TxRecord>> {
        let rows = sqlx::query_as::<_, TxRecord>(
            "SELECT tx_hash, nonce, status, updated_ts FROM submitted_transactions
             WHERE status IN ('pending_broadcast', 'pending_confirm')
             ORDER BY nonce ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load pending transactions")?;
        Ok(rows)
    }

    /// Drop terminal watcher rows older than `before_ts`.
    pub async fn prune_txs(&self, before_ts: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM submitted_transactions
             WHERE updated_ts <= ? AND status IN ('confirmed', 'reverted')",
        )
        .bind(before_ts)
        .execute(&self.pool)
        .await
        .context("failed to prune transactions")?;
        Ok(result.rows_affected())
    }
}
