//! JSON payload codec. The default transcoding.

use serde_json::Value;

use super::PayloadCodec;
use crate::error::{CrosstalkError, Result};

/// Serializes payloads as compact JSON under the transcoding name `json`.
#[derive(Debug, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn to_bytes(&self, payload: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }

    fn from_bytes(&self, data: &[u8]) -> Result<Value> {
        serde_json::from_slice(data).map_err(|err| CrosstalkError::Decode {
            token: None,
            reason: format!("invalid JSON payload: {err}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec;
        let payload = json!({"a": 27, "b": [1, 2, 3], "c": "text"});
        let bytes = codec.to_bytes(&payload).unwrap();
        assert_eq!(codec.from_bytes(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_invalid_json_is_decode_error() {
        let codec = JsonCodec;
        let err = codec.from_bytes(b"{broken").unwrap_err();
        assert!(matches!(err, CrosstalkError::Decode { .. }));
    }
}
