use crate::{
    db::{DatabaseBackend, EventRecord},
    error::{EvmtraceError, Result},
    types::{BlockNumber, InsertOutcome, TrackedEvent},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::{
    bson,
    bson::doc,
    error::{ErrorKind, WriteFailure},
    options::IndexOptions,
    Client, Collection, Cursor, IndexModel,
};
use serde::{Deserialize, Serialize};

const DUPLICATE_KEY_CODE: i32 = 11000;

/// MongoDB document structure for events
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventDocument {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<bson::oid::ObjectId>,
    app_name: String,
    contract_address: String,
    transaction_hash: String,
    log_index: i64,
    block_number: i64,
    event_name: String,
    event_signature: Option<String>,
    event_signature_hash: String,
    topics: Vec<String>,
    raw_data: String,
    /// Nested document rather than a JSON string
    decoded_arguments: Option<bson::Document>,
    created_at: DateTime<Utc>,
}

impl From<EventDocument> for EventRecord {
    fn from(doc: EventDocument) -> Self {
        EventRecord {
            id: doc.id.map(|oid| oid.to_string()).unwrap_or_default(),
            event: TrackedEvent {
                app_name: doc.app_name,
                contract_address: doc.contract_address,
                transaction_hash: doc.transaction_hash,
                log_index: doc.log_index as u64,
                block_number: doc.block_number as BlockNumber,
                event_name: doc.event_name,
                event_signature: doc.event_signature,
                event_signature_hash: doc.event_signature_hash,
                topics: doc.topics,
                raw_data: doc.raw_data,
                decoded_arguments: doc
                    .decoded_arguments
                    .map(|d| bson::Bson::Document(d).into()),
            },
            created_at: doc.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WatermarkDocument {
    app_name: String,
    block_number: i64,
    updated_at: String,
}

/// MongoDB database backend
#[derive(Clone)]
pub struct MongoDbBackend {
    client: Client,
    events: Collection<EventDocument>,
    watermarks: Collection<WatermarkDocument>,
}

impl MongoDbBackend {
    pub async fn new(database_url: &str) -> Result<Self> {
        tracing::info!("Connecting to MongoDB database");

        // Parse URL to extract database name
        let parsed = url::Url::parse(database_url)
            .map_err(|e| EvmtraceError::Database(format!("Invalid MongoDB URL: {}", e)))?;

        let db_name = parsed
            .path_segments()
            .and_then(|mut s| s.next())
            .filter(|s| !s.is_empty())
            .unwrap_or("evmtrace");

        let client = Client::with_uri_str(database_url)
            .await
            .map_err(|e| EvmtraceError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        let db = client.database(db_name);
        let events = db.collection::<EventDocument>("events");
        let watermarks = db.collection::<WatermarkDocument>("watermarks");

        let backend = Self {
            client,
            events,
            watermarks,
        };
        backend.run_migrations().await?;

        Ok(backend)
    }

    async fn create_indexes(&self) -> Result<()> {
        let unique_log_index = IndexModel::builder()
            .keys(doc! { "app_name": 1, "transaction_hash": 1, "log_index": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();

        let block_index = IndexModel::builder()
            .keys(doc! { "app_name": 1, "block_number": 1 })
            .build();

        let event_name_index = IndexModel::builder().keys(doc! { "event_name": 1 }).build();

        self.events
            .create_indexes(vec![unique_log_index, block_index, event_name_index])
            .await
            .map_err(|e| EvmtraceError::Database(format!("Failed to create indexes: {}", e)))?;

        let watermark_index = IndexModel::builder()
            .keys(doc! { "app_name": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();

        self.watermarks
            .create_index(watermark_index)
            .await
            .map_err(|e| EvmtraceError::Database(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    async fn collect(mut cursor: Cursor<EventDocument>) -> Result<Vec<EventRecord>> {
        let mut events = Vec::new();
        while cursor
            .advance()
            .await
            .map_err(|e| EvmtraceError::Database(format!("Failed to advance cursor: {}", e)))?
        {
            let doc = cursor.deserialize_current().map_err(|e| {
                EvmtraceError::Database(format!("Failed to deserialize event: {}", e))
            })?;
            events.push(doc.into());
        }

        Ok(events)
    }

    fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
        matches!(
            error.kind.as_ref(),
            ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY_CODE
        )
    }
}

#[async_trait]
impl DatabaseBackend for MongoDbBackend {
    async fn run_migrations(&self) -> Result<()> {
        self.create_indexes().await?;
        tracing::info!("MongoDB migrations completed");
        Ok(())
    }

    async fn insert_event(&self, event: &TrackedEvent) -> Result<InsertOutcome> {
        let decoded_arguments = event
            .decoded_arguments
            .as_ref()
            .map(bson::to_document)
            .transpose()
            .map_err(|e| {
                EvmtraceError::Database(format!("Failed to convert event data to BSON: {}", e))
            })?;

        let doc = EventDocument {
            id: None,
            app_name: event.app_name.clone(),
            contract_address: event.contract_address.clone(),
            transaction_hash: event.transaction_hash.clone(),
            log_index: event.log_index as i64,
            block_number: event.block_number as i64,
            event_name: event.event_name.clone(),
            event_signature: event.event_signature.clone(),
            event_signature_hash: event.event_signature_hash.clone(),
            topics: event.topics.clone(),
            raw_data: event.raw_data.clone(),
            decoded_arguments,
            created_at: Utc::now(),
        };

        match self.events.insert_one(doc).await {
            Ok(_) => Ok(InsertOutcome::Stored),
            Err(e) if Self::is_duplicate_key(&e) => Ok(InsertOutcome::DuplicateIgnored),
            Err(e) => Err(EvmtraceError::Database(format!(
                "Failed to insert event: {}",
                e
            ))),
        }
    }

    async fn max_block_number(&self, app_name: &str) -> Result<Option<BlockNumber>> {
        let latest = self
            .events
            .find_one(doc! { "app_name": app_name })
            .sort(doc! { "block_number": -1 })
            .await
            .map_err(|e| EvmtraceError::Database(format!("Failed to query events: {}", e)))?;

        Ok(latest.map(|doc| doc.block_number as BlockNumber))
    }

    async fn get_events_by_block_range(
        &self,
        app_name: &str,
        start_block: BlockNumber,
        end_block: BlockNumber,
    ) -> Result<Vec<EventRecord>> {
        let filter = doc! {
            "app_name": app_name,
            "block_number": {
                "$gte": start_block as i64,
                "$lte": end_block as i64
            }
        };

        let cursor = self
            .events
            .find(filter)
            .sort(doc! { "block_number": 1, "log_index": 1 })
            .await
            .map_err(|e| EvmtraceError::Database(format!("Failed to query events: {}", e)))?;

        Self::collect(cursor).await
    }

    async fn get_events_by_name(
        &self,
        app_name: &str,
        event_name: &str,
    ) -> Result<Vec<EventRecord>> {
        let filter = doc! { "app_name": app_name, "event_name": event_name };

        let cursor = self
            .events
            .find(filter)
            .sort(doc! { "block_number": -1, "log_index": -1 })
            .await
            .map_err(|e| EvmtraceError::Database(format!("Failed to query events: {}", e)))?;

        Self::collect(cursor).await
    }

    async fn count_events(&self, app_name: &str) -> Result<u64> {
        self.events
            .count_documents(doc! { "app_name": app_name })
            .await
            .map_err(|e| EvmtraceError::Database(format!("Failed to count events: {}", e)))
    }

    async fn get_watermark(&self, app_name: &str) -> Result<Option<BlockNumber>> {
        let doc = self
            .watermarks
            .find_one(doc! { "app_name": app_name })
            .await
            .map_err(|e| EvmtraceError::Database(format!("Failed to read watermark: {}", e)))?;

        Ok(doc.map(|d| d.block_number as BlockNumber))
    }

    async fn set_watermark(&self, app_name: &str, block_number: BlockNumber) -> Result<()> {
        self.watermarks
            .update_one(
                doc! { "app_name": app_name },
                doc! { "$set": {
                    "block_number": block_number as i64,
                    "updated_at": Utc::now().to_rfc3339(),
                } },
            )
            .upsert(true)
            .await
            .map_err(|e| EvmtraceError::Database(format!("Failed to write watermark: {}", e)))?;

        Ok(())
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
        tracing::info!("MongoDB client shut down");
    }
}
