pub mod abi;
pub mod db;
pub mod error;
pub mod event;
pub mod metrics;
pub mod retry;
pub mod rpc;
pub mod tracker;
pub mod types;
pub mod utils;
pub mod validation;
pub mod value;
pub mod watermark;

pub use abi::{EventCatalog, EventDefinition};
pub use db::{Database, EventRecord};
pub use error::{EvmtraceError, Result};
pub use event::{DecodeOutcome, LogDecoder};
pub use metrics::{HealthCheck, Metrics};
pub use rpc::{BlockSubscription, JsonRpcClient, LogSource};
pub use tracker::{BackfillSummary, BatchPlan, EventTracker, RangeStats, TrackerConfig, TrackerState};
pub use types::{BlockNumber, BlockRange, DecodedEvent, RawLog, TrackedEvent};
pub use utils::parse_event_names;
