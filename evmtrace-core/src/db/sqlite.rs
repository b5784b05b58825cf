use crate::{
    db::{DatabaseBackend, EventRecord},
    error::{EvmtraceError, Result},
    types::{BlockNumber, InsertOutcome, TrackedEvent},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::str::FromStr;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        app_name TEXT NOT NULL,
        contract_address TEXT NOT NULL,
        transaction_hash TEXT NOT NULL,
        log_index INTEGER NOT NULL,
        block_number INTEGER NOT NULL,
        event_name TEXT NOT NULL,
        event_signature TEXT,
        event_signature_hash TEXT NOT NULL,
        topics TEXT NOT NULL,
        raw_data TEXT NOT NULL,
        decoded_arguments TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_tx_log_unique ON events(app_name, transaction_hash, log_index)",
    "CREATE INDEX IF NOT EXISTS idx_events_block ON events(app_name, block_number)",
    "CREATE INDEX IF NOT EXISTS idx_events_name ON events(event_name)",
    r#"
    CREATE TABLE IF NOT EXISTS watermarks (
        app_name TEXT PRIMARY KEY,
        block_number INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

const SELECT_EVENTS: &str = "SELECT id, app_name, contract_address, transaction_hash, log_index, block_number, event_name, event_signature, event_signature_hash, topics, raw_data, decoded_arguments, created_at FROM events";

/// SQLite database backend
#[derive(Clone)]
pub struct SqliteBackend {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqliteBackend {
    pub async fn new(database_url: &str) -> Result<Self> {
        let db_path = database_url.trim_start_matches("sqlite:");
        let db_path = db_path.trim_start_matches("//");

        let pool = if Self::is_in_memory(db_path) {
            tracing::info!("Using in-memory SQLite database");
            let options = sqlx::sqlite::SqliteConnectOptions::from_str("sqlite::memory:")?;

            // Every connection to :memory: opens its own empty database
            sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<std::time::Duration>)
                .max_lifetime(None::<std::time::Duration>)
                .connect_with(options)
                .await?
        } else {
            tracing::info!("Database path: {}", db_path);

            if let Some(parent) = std::path::Path::new(db_path).parent() {
                let parent_str = parent.display().to_string();
                if !parent_str.is_empty() {
                    tracing::info!("Creating database directory: {}", parent_str);
                    std::fs::create_dir_all(parent)?;
                }
            }

            tracing::info!("Connecting to database: {}", database_url);
            let options = sqlx::sqlite::SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true);

            sqlx::sqlite::SqlitePool::connect_with(options).await?
        };

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    fn is_in_memory(db_path: &str) -> bool {
        db_path.is_empty() || db_path.starts_with(":memory:") || db_path.contains("mode=memory")
    }

    fn parse_timestamp(ts_str: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(ts_str)
            .map(|dt| dt.into())
            .map_err(|e| EvmtraceError::Database(format!("Invalid timestamp: {}", e)))
    }

    fn row_to_event_record(row: sqlx::sqlite::SqliteRow) -> Result<EventRecord> {
        let decoded_arguments = row
            .get::<Option<String>, _>("decoded_arguments")
            .map(|s| serde_json::from_str::<serde_json::Value>(&s))
            .transpose()?;

        Ok(EventRecord {
            id: row.get::<i64, _>("id").to_string(),
            event: TrackedEvent {
                app_name: row.get("app_name"),
                contract_address: row.get("contract_address"),
                transaction_hash: row.get("transaction_hash"),
                log_index: row.get::<i64, _>("log_index") as u64,
                block_number: row.get::<i64, _>("block_number") as BlockNumber,
                event_name: row.get("event_name"),
                event_signature: row.get("event_signature"),
                event_signature_hash: row.get("event_signature_hash"),
                topics: serde_json::from_str(row.get::<String, _>("topics").as_str())?,
                raw_data: row.get("raw_data"),
                decoded_arguments,
            },
            created_at: Self::parse_timestamp(row.get::<String, _>("created_at").as_str())?,
        })
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn run_migrations(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        tracing::info!("SQLite migrations completed");
        Ok(())
    }

    async fn insert_event(&self, event: &TrackedEvent) -> Result<InsertOutcome> {
        let decoded_arguments = event
            .decoded_arguments
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO events (app_name, contract_address, transaction_hash, log_index, block_number,
                event_name, event_signature, event_signature_hash, topics, raw_data, decoded_arguments, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        )
        .bind(&event.app_name)
        .bind(&event.contract_address)
        .bind(&event.transaction_hash)
        .bind(event.log_index as i64)
        .bind(event.block_number as i64)
        .bind(&event.event_name)
        .bind(&event.event_signature)
        .bind(&event.event_signature_hash)
        .bind(serde_json::to_string(&event.topics)?)
        .bind(&event.raw_data)
        .bind(decoded_arguments)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Stored),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Ok(InsertOutcome::DuplicateIgnored)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn max_block_number(&self, app_name: &str) -> Result<Option<BlockNumber>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(block_number) FROM events WHERE app_name = ?1")
                .bind(app_name)
                .fetch_one(&self.pool)
                .await?;

        Ok(max.map(|b| b as BlockNumber))
    }

    async fn get_events_by_block_range(
        &self,
        app_name: &str,
        start_block: BlockNumber,
        end_block: BlockNumber,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE app_name = ?1 AND block_number >= ?2 AND block_number <= ?3 ORDER BY block_number ASC, log_index ASC",
            SELECT_EVENTS
        ))
        .bind(app_name)
        .bind(start_block as i64)
        .bind(end_block as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event_record).collect()
    }

    async fn get_events_by_name(
        &self,
        app_name: &str,
        event_name: &str,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE app_name = ?1 AND event_name = ?2 ORDER BY block_number DESC, log_index DESC",
            SELECT_EVENTS
        ))
        .bind(app_name)
        .bind(event_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event_record).collect()
    }

    async fn count_events(&self, app_name: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE app_name = ?1")
            .bind(app_name)
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn get_watermark(&self, app_name: &str) -> Result<Option<BlockNumber>> {
        let block: Option<i64> =
            sqlx::query_scalar("SELECT block_number FROM watermarks WHERE app_name = ?1")
                .bind(app_name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(block.map(|b| b as BlockNumber))
    }

    async fn set_watermark(&self, app_name: &str, block_number: BlockNumber) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watermarks (app_name, block_number, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(app_name) DO UPDATE SET
                block_number = excluded.block_number,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(app_name)
        .bind(block_number as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("SQLite connection pool closed");
    }
}
