use crate::error::{EvmtraceError, Result};
use alloy_json_abi::{Event, JsonAbi};
use alloy_primitives::{keccak256, B256};
use serde_json::Value;
use tracing::{debug, info, warn};

/// A contract event the tracker knows how to recognise
#[derive(Debug, Clone)]
pub struct EventDefinition {
    pub name: String,
    /// Canonical `Name(type,type,...)` form
    pub signature: String,
    /// keccak256 of `signature`, i.e. the log's topic 0
    pub signature_hash: B256,
    /// ABI entry the definition was derived from, used for decoding
    pub event: Event,
}

impl EventDefinition {
    pub fn from_event(event: &Event) -> Self {
        let signature = event.signature();
        Self {
            name: event.name.clone(),
            signature_hash: EventCatalog::calculate_signature_hash(&signature),
            signature,
            event: event.clone(),
        }
    }
}

/// Events selected from a contract ABI.
///
/// Built once at startup. Every wanted event name must exist in the ABI, otherwise construction
/// fails with [`EvmtraceError::EventNotFound`]. An empty wanted list selects every event in the ABI
/// and leaves the log query unfiltered by topic.
#[derive(Debug, Clone)]
pub struct EventCatalog {
    definitions: Vec<EventDefinition>,
    filter_by_topic: bool,
}

impl EventCatalog {
    /// Load an ABI from a JSON file
    pub fn load_from_file(path: &str, wanted: &[String]) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let catalog = Self::load_from_str(&content, wanted)?;
        info!("Loaded ABI: {} ({} event(s) selected)", path, catalog.len());
        Ok(catalog)
    }

    /// Load an ABI from a JSON string
    pub fn load_from_str(json: &str, wanted: &[String]) -> Result<Self> {
        let abi = parse_abi_json(json)?;
        Self::from_abi(&abi, wanted)
    }

    pub fn from_abi(abi: &JsonAbi, wanted: &[String]) -> Result<Self> {
        let all_events: Vec<&Event> = abi.events().collect();

        for name in wanted {
            if !all_events.iter().any(|event| &event.name == name) {
                return Err(EvmtraceError::EventNotFound(name.clone()));
            }
        }

        let definitions: Vec<EventDefinition> = all_events
            .into_iter()
            .filter(|event| wanted.is_empty() || wanted.contains(&event.name))
            .map(EventDefinition::from_event)
            .collect();

        for definition in &definitions {
            if definition.event.anonymous {
                warn!(
                    "Event {} is anonymous; its logs carry no signature topic and will not match",
                    definition.signature
                );
            }
            debug!(
                "Catalogued event {} -> 0x{}",
                definition.signature,
                hex::encode(definition.signature_hash)
            );
        }

        if wanted.is_empty() {
            info!(
                "No event names configured; tracking all {} ABI event(s)",
                definitions.len()
            );
        }

        Ok(Self {
            definitions,
            filter_by_topic: !wanted.is_empty(),
        })
    }

    /// Event signature hash as used in topic 0: keccak256("Name(type,...)")
    pub fn calculate_signature_hash(signature: &str) -> B256 {
        keccak256(signature.as_bytes())
    }

    pub fn definitions(&self) -> &[EventDefinition] {
        &self.definitions
    }

    /// Signature hashes in the same order as [`Self::definitions`]
    pub fn signature_hashes(&self) -> Vec<B256> {
        self.definitions.iter().map(|d| d.signature_hash).collect()
    }

    /// Topic-0 set for log queries. Empty means "any topic".
    pub fn topic_filter(&self) -> Vec<B256> {
        if self.filter_by_topic {
            self.signature_hashes()
        } else {
            Vec::new()
        }
    }

    pub fn find_by_signature_hash(&self, hash: &B256) -> Option<&EventDefinition> {
        self.definitions.iter().find(|d| &d.signature_hash == hash)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Parse ABI JSON in any of the shapes contracts are usually published in:
/// a bare ABI array, an Etherscan `getabi` response whose `result` holds the ABI as a string,
/// or a compiler artifact with an `abi` field.
pub fn parse_abi_json(json: &str) -> Result<JsonAbi> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| EvmtraceError::AbiParse(format!("Failed to parse ABI JSON: {}", e)))?;

    let abi_value = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => {
            if let Some(Value::String(inner)) = map.remove("result") {
                serde_json::from_str(&inner).map_err(|e| {
                    EvmtraceError::AbiParse(format!("Failed to parse ABI in 'result': {}", e))
                })?
            } else if let Some(abi) = map.remove("abi") {
                abi
            } else {
                return Err(EvmtraceError::AbiParse(
                    "Expected an ABI array, a 'result' string or an 'abi' field".to_string(),
                ));
            }
        }
        _ => {
            return Err(EvmtraceError::AbiParse(
                "ABI JSON must be an array or an object".to_string(),
            ))
        }
    };

    serde_json::from_value(abi_value)
        .map_err(|e| EvmtraceError::AbiParse(format!("Invalid ABI: {}", e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const ERC20_ABI: &str = r#"[
        {
            "type": "event",
            "name": "Transfer",
            "anonymous": false,
            "inputs": [
                {"name": "from", "type": "address", "indexed": true, "internalType": "address"},
                {"name": "to", "type": "address", "indexed": true, "internalType": "address"},
                {"name": "value", "type": "uint256", "indexed": false, "internalType": "uint256"}
            ]
        },
        {
            "type": "event",
            "name": "Approval",
            "anonymous": false,
            "inputs": [
                {"name": "owner", "type": "address", "indexed": true, "internalType": "address"},
                {"name": "spender", "type": "address", "indexed": true, "internalType": "address"},
                {"name": "value", "type": "uint256", "indexed": false, "internalType": "uint256"}
            ]
        },
        {
            "type": "function",
            "name": "balanceOf",
            "stateMutability": "view",
            "inputs": [{"name": "owner", "type": "address", "internalType": "address"}],
            "outputs": [{"name": "", "type": "uint256", "internalType": "uint256"}]
        }
    ]"#;

    const TRANSFER_TOPIC: &str =
        "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    #[test]
    fn test_signature_hash_calculation() {
        let hash = EventCatalog::calculate_signature_hash("Transfer(address,address,uint256)");
        assert_eq!(hex::encode(hash), TRANSFER_TOPIC);
    }

    #[test]
    fn test_catalog_filters_wanted_events() {
        let catalog = EventCatalog::load_from_str(ERC20_ABI, &["Transfer".to_string()]).unwrap();

        assert_eq!(catalog.len(), 1);
        let definition = &catalog.definitions()[0];
        assert_eq!(definition.name, "Transfer");
        assert_eq!(definition.signature, "Transfer(address,address,uint256)");
        assert_eq!(hex::encode(definition.signature_hash), TRANSFER_TOPIC);
        assert_eq!(catalog.topic_filter(), vec![definition.signature_hash]);
    }

    #[test]
    fn test_catalog_unknown_event_is_fatal() {
        let err = EventCatalog::load_from_str(
            ERC20_ABI,
            &["Transfer".to_string(), "Mint".to_string()],
        )
        .unwrap_err();

        assert!(matches!(err, EvmtraceError::EventNotFound(ref name) if name == "Mint"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_catalog_empty_wanted_tracks_everything() {
        let catalog = EventCatalog::load_from_str(ERC20_ABI, &[]).unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.topic_filter().is_empty());
        assert_eq!(catalog.signature_hashes().len(), 2);
    }

    #[test]
    fn test_catalog_is_deterministic() {
        let wanted = vec!["Approval".to_string(), "Transfer".to_string()];
        let a = EventCatalog::load_from_str(ERC20_ABI, &wanted).unwrap();
        let b = EventCatalog::load_from_str(ERC20_ABI, &wanted).unwrap();
        assert_eq!(a.signature_hashes(), b.signature_hashes());

        let names_a: Vec<_> = a.definitions().iter().map(|d| d.name.clone()).collect();
        let names_b: Vec<_> = b.definitions().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names_a, names_b);
    }

    #[test]
    fn test_etherscan_envelope() {
        let envelope = serde_json::json!({
            "status": "1",
            "message": "OK",
            "result": ERC20_ABI,
        })
        .to_string();

        let catalog = EventCatalog::load_from_str(&envelope, &["Approval".to_string()]).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.definitions()[0].signature, "Approval(address,address,uint256)");
    }

    #[test]
    fn test_artifact_abi_field() {
        let artifact = format!(r#"{{"contractName": "Token", "abi": {}}}"#, ERC20_ABI);
        let catalog = EventCatalog::load_from_str(&artifact, &[]).unwrap();
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_invalid_abi() {
        assert!(parse_abi_json("not json").is_err());
        assert!(parse_abi_json(r#"{"foo": 1}"#).is_err());
        assert!(parse_abi_json("42").is_err());
    }

    #[test]
    fn test_find_by_signature_hash() {
        let catalog = EventCatalog::load_from_str(ERC20_ABI, &[]).unwrap();
        let hash = EventCatalog::calculate_signature_hash("Approval(address,address,uint256)");
        assert_eq!(catalog.find_by_signature_hash(&hash).unwrap().name, "Approval");
        assert!(catalog.find_by_signature_hash(&B256::ZERO).is_none());
    }
}
