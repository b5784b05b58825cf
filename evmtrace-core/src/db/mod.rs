use crate::{
    error::Result,
    types::{BlockNumber, InsertOutcome, TrackedEvent},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event record stored in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    #[serde(flatten)]
    pub event: TrackedEvent,
    pub created_at: DateTime<Utc>,
}

/// Trait defining the database backend interface
///
/// A backend stores tracked events and the per-application watermark. Uniqueness of
/// `(app_name, transaction_hash, log_index)` must be enforced by the storage itself (a unique
/// index), so concurrent inserts of the same log resolve to exactly one row.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Run database migrations/schema setup
    async fn run_migrations(&self) -> Result<()>;

    /// Append an event. A uniqueness violation is reported as
    /// [`InsertOutcome::DuplicateIgnored`], never as an error.
    async fn insert_event(&self, event: &TrackedEvent) -> Result<InsertOutcome>;

    /// Highest block number with a stored event for `app_name`
    async fn max_block_number(&self, app_name: &str) -> Result<Option<BlockNumber>>;

    /// Get events by block range (inclusive), ascending
    async fn get_events_by_block_range(
        &self,
        app_name: &str,
        start_block: BlockNumber,
        end_block: BlockNumber,
    ) -> Result<Vec<EventRecord>>;

    /// Get events by event name, newest block first
    async fn get_events_by_name(&self, app_name: &str, event_name: &str)
        -> Result<Vec<EventRecord>>;

    async fn count_events(&self, app_name: &str) -> Result<u64>;

    /// Last fully processed block for `app_name`
    async fn get_watermark(&self, app_name: &str) -> Result<Option<BlockNumber>>;

    async fn set_watermark(&self, app_name: &str, block_number: BlockNumber) -> Result<()>;

    /// Release connections
    async fn close(&self);
}

/// Database wrapper that holds a dynamic backend
#[derive(Clone)]
pub struct Database {
    backend: std::sync::Arc<dyn DatabaseBackend>,
}

impl Database {
    /// Create a new database instance by parsing the URL scheme
    pub async fn new(database_url: &str) -> Result<Self> {
        let backend = crate::db::factory::create_backend(database_url).await?;
        Ok(Self { backend })
    }

    pub fn from_backend(backend: std::sync::Arc<dyn DatabaseBackend>) -> Self {
        Self { backend }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        self.backend.run_migrations().await
    }

    pub async fn insert_event(&self, event: &TrackedEvent) -> Result<InsertOutcome> {
        self.backend.insert_event(event).await
    }

    pub async fn max_block_number(&self, app_name: &str) -> Result<Option<BlockNumber>> {
        self.backend.max_block_number(app_name).await
    }

    pub async fn get_events_by_block_range(
        &self,
        app_name: &str,
        start_block: BlockNumber,
        end_block: BlockNumber,
    ) -> Result<Vec<EventRecord>> {
        self.backend
            .get_events_by_block_range(app_name, start_block, end_block)
            .await
    }

    pub async fn get_events_by_name(
        &self,
        app_name: &str,
        event_name: &str,
    ) -> Result<Vec<EventRecord>> {
        self.backend.get_events_by_name(app_name, event_name).await
    }

    pub async fn count_events(&self, app_name: &str) -> Result<u64> {
        self.backend.count_events(app_name).await
    }

    pub async fn get_watermark(&self, app_name: &str) -> Result<Option<BlockNumber>> {
        self.backend.get_watermark(app_name).await
    }

    pub async fn set_watermark(&self, app_name: &str, block_number: BlockNumber) -> Result<()> {
        self.backend.set_watermark(app_name, block_number).await
    }

    pub async fn close(&self) {
        self.backend.close().await
    }
}

pub mod factory;
pub mod mongodb;
pub mod postgres;
pub mod sqlite;

pub use factory::create_backend;
