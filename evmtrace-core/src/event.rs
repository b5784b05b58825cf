use crate::{
    abi::{EventCatalog, EventDefinition},
    error::{EvmtraceError, Result},
    types::{DecodedEvent, RawLog},
    value::AbiValueRenderer,
};
use alloy_dyn_abi::EventExt;
use serde_json::Map;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of matching a raw log against the catalog
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Decoded(DecodedEvent),
    /// Log has no topic 0 or its topic 0 is not catalogued
    Unmatched,
    /// Topic 0 matched but the payload did not decode
    Malformed(String),
}

impl DecodeOutcome {
    pub fn into_decoded(self) -> Option<DecodedEvent> {
        match self {
            DecodeOutcome::Decoded(event) => Some(event),
            _ => None,
        }
    }

    pub fn is_decoded(&self) -> bool {
        matches!(self, DecodeOutcome::Decoded(_))
    }
}

#[derive(Clone)]
pub struct LogDecoder {
    catalog: Arc<EventCatalog>,
}

impl LogDecoder {
    pub fn new(catalog: Arc<EventCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &EventCatalog {
        &self.catalog
    }

    /// Match and decode a log. Never fails: logs that cannot be decoded come back as
    /// [`DecodeOutcome::Unmatched`] or [`DecodeOutcome::Malformed`] so they can still be stored raw.
    pub fn decode(&self, log: &RawLog) -> DecodeOutcome {
        let Some(topic0) = log.topic0() else {
            debug!(
                "Log {}:{} has no topics",
                log.transaction_hash, log.log_index
            );
            return DecodeOutcome::Unmatched;
        };

        let Some(definition) = self.catalog.find_by_signature_hash(topic0) else {
            debug!("No catalogued event for topic {}", topic0);
            return DecodeOutcome::Unmatched;
        };

        match Self::decode_with(definition, log) {
            Ok(event) => DecodeOutcome::Decoded(event),
            Err(e) => {
                warn!(
                    "Failed to decode {} in tx {} (log {}): {}",
                    definition.name, log.transaction_hash, log.log_index, e
                );
                DecodeOutcome::Malformed(e.to_string())
            }
        }
    }

    /// Decode topics and data using the ABI event of `definition`
    ///
    /// Indexed parameters are taken from topics 1.., the rest from the data payload.
    /// Unnamed parameters are keyed `param_<index>`.
    pub fn decode_with(definition: &EventDefinition, log: &RawLog) -> Result<DecodedEvent> {
        let decoded = definition
            .event
            .decode_log_parts(log.topics.iter().copied(), &log.data, true)
            .map_err(|e| EvmtraceError::EventDecode(e.to_string()))?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut arguments = Map::new();

        for (idx, input) in definition.event.inputs.iter().enumerate() {
            let value = if input.indexed {
                indexed.next()
            } else {
                body.next()
            }
            .ok_or_else(|| {
                EvmtraceError::EventDecode(format!(
                    "Missing value for parameter {} of {}",
                    idx, definition.signature
                ))
            })?;

            let name = if input.name.is_empty() {
                format!("param_{}", idx)
            } else {
                input.name.clone()
            };

            arguments.insert(name, AbiValueRenderer::render(&value, &input.components));
        }

        Ok(DecodedEvent {
            event_name: definition.name.clone(),
            signature: definition.signature.clone(),
            arguments,
        })
    }
}
