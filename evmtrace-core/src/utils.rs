use crate::error::{EvmtraceError, Result};

/// Lowercase 0x-prefixed hex of `bytes`.
pub fn to_hex<T: AsRef<[u8]>>(bytes: T) -> String {
    format!("0x{}", hex::encode(bytes.as_ref()))
}

/// Parse a JSON-RPC hex quantity such as `"0x1b4"`.
pub fn parse_quantity(value: &str) -> Result<u64> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return Err(EvmtraceError::Rpc(format!("Empty hex quantity: '{}'", value)));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| EvmtraceError::Rpc(format!("Invalid hex quantity '{}': {}", value, e)))
}

/// Format a block number as a JSON-RPC quantity.
pub fn to_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

/// Split a comma separated list of event names, dropping blanks and repeats.
pub fn parse_event_names(names: &str) -> Vec<String> {
    let mut parsed: Vec<String> = Vec::new();
    for name in names.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !parsed.iter().any(|existing| existing == name) {
            parsed.push(name.to_string());
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x1b4").unwrap(), 436);
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("ff").unwrap(), 255);
        assert!(parse_quantity("0x").is_err());
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn test_to_quantity() {
        assert_eq!(to_quantity(0), "0x0");
        assert_eq!(to_quantity(2500), "0x9c4");
    }

    #[test]
    fn test_parse_event_names() {
        let names = parse_event_names(" Transfer, Approval,,Transfer ");
        assert_eq!(names, vec!["Transfer".to_string(), "Approval".to_string()]);
        assert!(parse_event_names("").is_empty());
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex([0xde, 0xad]), "0xdead");
        assert_eq!(to_hex(Vec::<u8>::new()), "0x");
    }
}
