use crate::{db::Database, error::Result, types::BlockNumber};
use tokio::sync::Mutex;
use tracing::debug;

/// Persisted last-processed block for one application
#[derive(Clone)]
pub struct WatermarkStore {
    db: Database,
    app_name: String,
}

impl WatermarkStore {
    pub fn new(db: Database, app_name: impl Into<String>) -> Self {
        Self {
            db,
            app_name: app_name.into(),
        }
    }

    pub async fn get(&self) -> Result<Option<BlockNumber>> {
        self.db.get_watermark(&self.app_name).await
    }

    pub async fn set(&self, block_number: BlockNumber) -> Result<()> {
        self.db.set_watermark(&self.app_name, block_number).await
    }
}

/// In-memory watermark that only moves forward
///
/// Every advance is written to the store before memory is updated, so the value seen
/// by `get` is never ahead of what has been persisted.
pub struct Watermark {
    store: WatermarkStore,
    current: Mutex<BlockNumber>,
}

impl Watermark {
    pub fn new(store: WatermarkStore) -> Self {
        Self {
            store,
            current: Mutex::new(0),
        }
    }

    /// Read the persisted value and lift the in-memory value to it
    pub async fn load(&self) -> Result<Option<BlockNumber>> {
        let mut current = self.current.lock().await;
        let stored = self.store.get().await?;
        if let Some(stored) = stored {
            if stored > *current {
                *current = stored;
            }
        }
        Ok(stored)
    }

    pub async fn get(&self) -> BlockNumber {
        *self.current.lock().await
    }

    /// Move to `block_number` if it is ahead. Returns whether the watermark moved.
    pub async fn advance(&self, block_number: BlockNumber) -> Result<bool> {
        let mut current = self.current.lock().await;
        if block_number <= *current {
            debug!(
                "Watermark stays at {} (offered {})",
                *current, block_number
            );
            return Ok(false);
        }

        self.store.set(block_number).await?;
        *current = block_number;
        Ok(true)
    }
}
