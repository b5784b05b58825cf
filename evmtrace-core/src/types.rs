use crate::utils::to_hex;
use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};

pub type BlockNumber = u64;

/// Event name used when a log cannot be matched or decoded.
pub const UNKNOWN_EVENT: &str = "UnknownEvent";

/// Raw log as returned by the log source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: BlockNumber,
    pub transaction_hash: B256,
    pub log_index: u64,
}

impl RawLog {
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }
}

/// Log query over an inclusive block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    /// Accepted topic-0 values. Empty means any.
    pub topics: Vec<B256>,
    pub from_block: BlockNumber,
    pub to_block: BlockNumber,
}

/// Inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: BlockNumber,
    pub to: BlockNumber,
}

impl BlockRange {
    pub fn new(from: BlockNumber, to: BlockNumber) -> Self {
        Self { from, to }
    }

    pub fn len(&self) -> u64 {
        if self.to < self.from {
            0
        } else {
            self.to - self.from + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

/// A log matched against the catalog and decoded into named arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub event_name: String,
    pub signature: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// One occurrence of a log, ready to be appended to the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub app_name: String,
    pub contract_address: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: BlockNumber,
    pub event_name: String,
    pub event_signature: Option<String>,
    pub event_signature_hash: String,
    pub topics: Vec<String>,
    pub raw_data: String,
    pub decoded_arguments: Option<serde_json::Value>,
}

impl TrackedEvent {
    /// Build the stored representation of `log`. A `None` decode keeps only the raw fields.
    pub fn from_log(
        log: &RawLog,
        decoded: Option<DecodedEvent>,
        app_name: &str,
        contract_address: &Address,
    ) -> Self {
        let (event_name, event_signature, decoded_arguments) = match decoded {
            Some(event) => (
                event.event_name,
                Some(event.signature),
                Some(serde_json::Value::Object(event.arguments)),
            ),
            None => (UNKNOWN_EVENT.to_string(), None, None),
        };

        Self {
            app_name: app_name.to_string(),
            contract_address: contract_address.to_checksum(None),
            transaction_hash: to_hex(log.transaction_hash),
            log_index: log.log_index,
            block_number: log.block_number,
            event_name,
            event_signature,
            event_signature_hash: log.topic0().map(to_hex).unwrap_or_default(),
            topics: log.topics.iter().map(to_hex).collect(),
            raw_data: to_hex(&log.data),
            decoded_arguments,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.event_name == UNKNOWN_EVENT
    }
}

/// Outcome of an idempotent append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    DuplicateIgnored,
}
