use crate::{
    db::{DatabaseBackend, EventRecord},
    error::Result,
    types::{BlockNumber, InsertOutcome, TrackedEvent},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id BIGSERIAL PRIMARY KEY,
        app_name TEXT NOT NULL,
        contract_address TEXT NOT NULL,
        transaction_hash TEXT NOT NULL,
        log_index BIGINT NOT NULL,
        block_number BIGINT NOT NULL,
        event_name TEXT NOT NULL,
        event_signature TEXT,
        event_signature_hash TEXT NOT NULL,
        topics TEXT[] NOT NULL,
        raw_data TEXT NOT NULL,
        decoded_arguments JSON,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_tx_log_unique ON events(app_name, transaction_hash, log_index)",
    "CREATE INDEX IF NOT EXISTS idx_events_block ON events(app_name, block_number)",
    "CREATE INDEX IF NOT EXISTS idx_events_name ON events(event_name)",
    "CREATE INDEX IF NOT EXISTS idx_events_args_gin ON events USING GIN ((decoded_arguments::jsonb))",
    r#"
    CREATE TABLE IF NOT EXISTS watermarks (
        app_name TEXT PRIMARY KEY,
        block_number BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

const SELECT_EVENTS: &str = "SELECT id, app_name, contract_address, transaction_hash, log_index, block_number, event_name, event_signature, event_signature_hash, topics, raw_data, decoded_arguments, created_at FROM events";

/// PostgreSQL database backend
///
/// Decoded arguments live in a `JSON` column so argument order survives a round trip.
/// Containment queries go through the GIN index on the `jsonb` cast.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: sqlx::postgres::PgPool,
}

impl PostgresBackend {
    pub async fn new(database_url: &str) -> Result<Self> {
        tracing::info!("Connecting to PostgreSQL database");

        let pool = sqlx::postgres::PgPool::connect(database_url).await?;

        let backend = Self { pool };
        backend.run_migrations().await?;

        Ok(backend)
    }

    /// Arguments as JSON text. A bound `serde_json::Value` is sent as `jsonb`, which reorders keys.
    fn encode_arguments(arguments: Option<&serde_json::Value>) -> Result<Option<String>> {
        Ok(arguments.map(serde_json::to_string).transpose()?)
    }

    fn row_to_event_record(row: sqlx::postgres::PgRow) -> Result<EventRecord> {
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
                topics: row.get::<Vec<String>, _>("topics"),
                raw_data: row.get("raw_data"),
                decoded_arguments: row.get::<Option<serde_json::Value>, _>("decoded_arguments"),
            },
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
        })
    }
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    async fn run_migrations(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        tracing::info!("PostgreSQL migrations completed");
        Ok(())
    }

    async fn insert_event(&self, event: &TrackedEvent) -> Result<InsertOutcome> {
        let decoded_arguments = Self::encode_arguments(event.decoded_arguments.as_ref())?;

        let result = sqlx::query(
            r#"
            INSERT INTO events (app_name, contract_address, transaction_hash, log_index, block_number,
                event_name, event_signature, event_signature_hash, topics, raw_data, decoded_arguments)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11::json)
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
        .bind(&event.topics)
        .bind(&event.raw_data)
        .bind(decoded_arguments)
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
        let row = sqlx::query("SELECT MAX(block_number) as max_block FROM events WHERE app_name = $1")
            .bind(app_name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .and_then(|r| r.get::<Option<i64>, _>("max_block"))
            .map(|b| b as BlockNumber))
    }

    async fn get_events_by_block_range(
        &self,
        app_name: &str,
        start_block: BlockNumber,
        end_block: BlockNumber,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE app_name = $1 AND block_number >= $2 AND block_number <= $3 ORDER BY block_number ASC, log_index ASC",
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
            "{} WHERE app_name = $1 AND event_name = $2 ORDER BY block_number DESC, log_index DESC",
            SELECT_EVENTS
        ))
        .bind(app_name)
        .bind(event_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event_record).collect()
    }

    async fn count_events(&self, app_name: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE app_name = $1")
            .bind(app_name)
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn get_watermark(&self, app_name: &str) -> Result<Option<BlockNumber>> {
        let block: Option<i64> =
            sqlx::query_scalar("SELECT block_number FROM watermarks WHERE app_name = $1")
                .bind(app_name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(block.map(|b| b as BlockNumber))
    }

    async fn set_watermark(&self, app_name: &str, block_number: BlockNumber) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watermarks (app_name, block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (app_name) DO UPDATE SET
                block_number = EXCLUDED.block_number,
                updated_at = NOW()
        "#,
        )
        .bind(app_name)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }
}
