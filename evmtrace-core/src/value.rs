use alloy_dyn_abi::DynSolValue;
use alloy_json_abi::Param;
use serde_json::{Map, Value};

use crate::utils::to_hex;

/// Converts decoded ABI values into JSON
///
/// Integers of every width are rendered as decimal strings so that 64-bit and wider
/// values survive a round trip through JSON consumers that parse numbers as doubles.
pub struct AbiValueRenderer;

impl AbiValueRenderer {
    /// Render `value`; `components` names tuple members when the ABI provides them.
    pub fn render(value: &DynSolValue, components: &[Param]) -> Value {
        match value {
            DynSolValue::Bool(b) => Value::Bool(*b),
            DynSolValue::Int(i, _) => Value::String(i.to_string()),
            DynSolValue::Uint(u, _) => Value::String(u.to_string()),
            DynSolValue::FixedBytes(word, size) => {
                let size = (*size).min(word.len());
                Value::String(to_hex(&word[..size]))
            }
            DynSolValue::Address(address) => Value::String(address.to_checksum(None)),
            DynSolValue::Function(function) => Value::String(to_hex(function.as_slice())),
            DynSolValue::Bytes(bytes) => Value::String(to_hex(bytes)),
            DynSolValue::String(s) => Value::String(s.clone()),

            // Array elements share the element components of the array type
            DynSolValue::Array(values) | DynSolValue::FixedArray(values) => Value::Array(
                values
                    .iter()
                    .map(|v| Self::render(v, components))
                    .collect(),
            ),

            DynSolValue::Tuple(values) => Self::render_tuple(values, components),

            #[allow(unreachable_patterns)]
            other => Value::String(format!("{:?}", other)),
        }
    }

    fn render_tuple(values: &[DynSolValue], components: &[Param]) -> Value {
        let mut object = Map::new();
        for (idx, value) in values.iter().enumerate() {
            let component = components.get(idx);
            let name = match component {
                Some(param) if !param.name.is_empty() => param.name.clone(),
                _ => idx.to_string(),
            };
            let nested = component.map(|p| p.components.as_slice()).unwrap_or(&[]);
            object.insert(name, Self::render(value, nested));
        }
        Value::Object(object)
    }
}
