use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{Error, Result};

/// JSON codec, UTF-8 text on the wire
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    const CONTENT_TYPE: &'static str = "application/json";

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn encodes_as_text() {
        let bytes = JsonCodec.encode(&json!({"a": 1})).unwrap();
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn encodes_unsized_values() {
        let text: &str = "plain";
        assert_eq!(JsonCodec.encode(text).unwrap(), br#""plain""#);

        let items: &[u8] = &[1, 2];
        assert_eq!(JsonCodec.encode(items).unwrap(), b"[1,2]");
    }

    #[test]
    fn decode_rejects_invalid_text() {
        let err = JsonCodec.decode::<Value>(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
