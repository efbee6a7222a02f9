// =============================================================================
// Persistent Trade Store — SQLite-backed durability layer
// =============================================================================
//
// Two tables:
//   trades                  — upserted full trade snapshots (JSON column plus
//                             indexed columns for queries)
//   raw_execution_reports   — append-only log of every execution report
//                             received, matched or not
//
// A successful write here is the trade service's commit point, so the pool is
// opened with synchronous=FULL and every write is awaited before returning.
// The JSON snapshot deserializes with serde defaults, so records written by
// older versions load cleanly (schema additions, never removals).
// =============================================================================

use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, error, info, warn};

use crate::errors::TradeError;
use crate::trade::model::Trade;

/// Database connection pool.
pub type DbPool = SqlitePool;

/// Open (creating if missing) and migrate the trade database.
///
/// SQLite is a single-writer database and the trade service is a single
/// writer, so one pooled connection is all that is needed - and it keeps
/// `sqlite::memory:` behaving as one database in tests.
pub async fn open(database_url: &str) -> Result<DbPool, TradeError> {
    info!(url = %database_url, "opening trade database");

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("trade database ready");
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), TradeError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            status TEXT NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_execution_reports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_time INTEGER NOT NULL,
            payload TEXT NOT NULL,
            received_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_reports_event_time ON raw_execution_reports(event_time)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Durable record of trades and raw execution reports.
#[derive(Clone)]
pub struct TradeStore {
    pool: DbPool,
}

impl TradeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// Upsert the full trade snapshot keyed by trade ID. The write is flushed
    /// before this returns; the caller treats success as the commit point.
    pub async fn save_trade(&self, trade: &Trade) -> Result<(), TradeError> {
        let data = serde_json::to_string(trade)
            .map_err(|e| TradeError::Persistence(format!("failed to serialize trade: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO trades (id, symbol, status, archived, data, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                symbol = excluded.symbol,
                status = excluded.status,
                archived = excluded.archived,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.symbol)
        .bind(trade.status.to_string())
        .bind(trade.archived as i64)
        .bind(&data)
        .bind(&trade.created_at)
        .bind(&trade.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(trade_id = %trade.id, status = %trade.status, "trade saved");
        Ok(())
    }

    /// Load every stored trade. Records that no longer parse are skipped with
    /// an error log rather than aborting recovery.
    pub async fn load_all_trades(&self) -> Result<Vec<Trade>, TradeError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT id, data FROM trades")
            .fetch_all(&self.pool)
            .await?;

        let mut trades = Vec::with_capacity(rows.len());
        for (id, data) in rows {
            match serde_json::from_str::<Trade>(&data) {
                Ok(trade) => trades.push(trade),
                Err(e) => {
                    error!(trade_id = %id, error = %e, "unreadable trade record skipped");
                }
            }
        }

        Ok(trades)
    }

    // -------------------------------------------------------------------------
    // Raw execution reports
    // -------------------------------------------------------------------------

    /// Append a raw execution report verbatim. Never updated or deleted.
    pub async fn save_raw_execution_report(
        &self,
        event_time: i64,
        payload: &str,
    ) -> Result<(), TradeError> {
        sqlx::query(
            "INSERT INTO raw_execution_reports (event_time, payload, received_at) VALUES (?1, ?2, ?3)",
        )
        .bind(event_time)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load all raw reports in arrival order for recovery replay.
    pub async fn load_all_raw_execution_reports(&self) -> Result<Vec<(i64, String)>, TradeError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT event_time, payload FROM raw_execution_reports ORDER BY event_time, id",
        )
        .fetch_all(&self.pool)
        .await?;

        if !rows.is_empty() {
            warn!(count = rows.len(), "raw execution reports loaded for replay");
        }
        Ok(rows)
    }
}

impl std::fmt::Debug for TradeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeStore").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::model::{ExitStrategy, OrderRef, TradeStatus};
    use crate::types::{OrderSide, OrderStatus};

    fn sample_trade() -> Trade {
        Trade::new(
            "BTCUSDT",
            OrderRef {
                order_id: 42,
                client_order_id: "c1".to_string(),
                side: OrderSide::Buy,
                quantity: 0.01,
                price: Some(30000.0),
                filled_qty: 0.0,
                cumulative_quote: 0.0,
                avg_fill_price: 0.0,
                status: OrderStatus::New,
            },
        )
    }

    #[tokio::test]
    async fn trade_round_trips_through_store() {
        let pool = open("sqlite::memory:").await.unwrap();
        let store = TradeStore::new(pool);

        let trade = sample_trade();
        store.save_trade(&trade).await.unwrap();

        let loaded = store.load_all_trades().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], trade);
    }

    #[tokio::test]
    async fn save_trade_upserts_by_id() {
        let pool = open("sqlite::memory:").await.unwrap();
        let store = TradeStore::new(pool);

        let mut trade = sample_trade();
        store.save_trade(&trade).await.unwrap();

        trade.status = TradeStatus::Open;
        trade.exit_strategy = ExitStrategy::StopLoss {
            trigger_price: 29000.0,
        };
        trade.touch();
        store.save_trade(&trade).await.unwrap();

        let loaded = store.load_all_trades().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, TradeStatus::Open);
        assert_eq!(
            loaded[0].exit_strategy,
            ExitStrategy::StopLoss {
                trigger_price: 29000.0
            }
        );
    }

    #[tokio::test]
    async fn raw_reports_are_append_only_and_ordered() {
        let pool = open("sqlite::memory:").await.unwrap();
        let store = TradeStore::new(pool);

        store
            .save_raw_execution_report(200, r#"{"e":"executionReport","E":200}"#)
            .await
            .unwrap();
        store
            .save_raw_execution_report(100, r#"{"e":"executionReport","E":100}"#)
            .await
            .unwrap();
        store
            .save_raw_execution_report(100, r#"{"e":"executionReport","E":100,"second":true}"#)
            .await
            .unwrap();

        let reports = store.load_all_raw_execution_reports().await.unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].0, 100);
        assert_eq!(reports[1].0, 100);
        assert!(reports[1].1.contains("second"));
        assert_eq!(reports[2].0, 200);
    }
}
