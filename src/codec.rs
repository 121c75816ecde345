//! Encoding and decoding of the metadata mapping stored in each data file.
//!
//! The mapping is held in memory as a [`DataMap`]. The default codec writes
//! YAML and reads YAML, falling back to JSON for files written by a JSON
//! codec that YAML can't parse.

use serde_json::Value;
use thiserror::Error;

/// Key/value mapping persisted for an entry.
pub type DataMap = serde_json::Map<String, Value>;

/// Errors produced while encoding or decoding a data file.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode data as {format}: {message}")]
    Encode { format: &'static str, message: String },

    #[error("Failed to decode {format} data: {message}")]
    Decode { format: &'static str, message: String },

    #[error("Expected a mapping at the top level of the data file, found {found}")]
    NotAMapping { found: &'static str },
}

/// Pluggable encoder/decoder for the data file.
pub trait Codec: Send + Sync {
    /// Short name used in log output.
    fn name(&self) -> &'static str;

    fn encode(&self, data: &DataMap) -> Result<Vec<u8>, CodecError>;

    /// Decode raw bytes. Empty input must decode to an empty mapping.
    fn decode(&self, raw: &[u8]) -> Result<DataMap, CodecError>;
}

/// YAML codec using block style output.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlCodec;

impl Codec for YamlCodec {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn encode(&self, data: &DataMap) -> Result<Vec<u8>, CodecError> {
        serde_yaml::to_string(data)
            .map(String::into_bytes)
            .map_err(|e| CodecError::Encode {
                format: "yaml",
                message: e.to_string(),
            })
    }

    fn decode(&self, raw: &[u8]) -> Result<DataMap, CodecError> {
        if is_blank(raw) {
            return Ok(DataMap::new());
        }
        let value: Value = serde_yaml::from_slice(raw).map_err(|e| CodecError::Decode {
            format: "yaml",
            message: e.to_string(),
        })?;
        into_mapping(value)
    }
}

/// JSON codec producing indented output with sorted keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, data: &DataMap) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec_pretty(data).map_err(|e| CodecError::Encode {
            format: "json",
            message: e.to_string(),
        })
    }

    fn decode(&self, raw: &[u8]) -> Result<DataMap, CodecError> {
        if is_blank(raw) {
            return Ok(DataMap::new());
        }
        let value: Value = serde_json::from_slice(raw).map_err(|e| CodecError::Decode {
            format: "json",
            message: e.to_string(),
        })?;
        into_mapping(value)
    }
}

/// YAML first, JSON as a fallback when decoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCodec;

impl Codec for DefaultCodec {
    fn name(&self) -> &'static str {
        "yaml+json"
    }

    fn encode(&self, data: &DataMap) -> Result<Vec<u8>, CodecError> {
        YamlCodec.encode(data)
    }

    fn decode(&self, raw: &[u8]) -> Result<DataMap, CodecError> {
        match YamlCodec.decode(raw) {
            Ok(data) => Ok(data),
            Err(yaml_err) => {
                tracing::debug!("YAML decode failed ({}), trying JSON", yaml_err);
                JsonCodec.decode(raw).map_err(|_| yaml_err)
            }
        }
    }
}

fn is_blank(raw: &[u8]) -> bool {
    raw.iter().all(|b| b.is_ascii_whitespace())
}

fn into_mapping(value: Value) -> Result<DataMap, CodecError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(DataMap::new()),
        Value::Bool(_) => Err(CodecError::NotAMapping { found: "a boolean" }),
        Value::Number(_) => Err(CodecError::NotAMapping { found: "a number" }),
        Value::String(_) => Err(CodecError::NotAMapping { found: "a string" }),
        Value::Array(_) => Err(CodecError::NotAMapping { found: "a sequence" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> DataMap {
        match json!({"frames": 24, "meta": {"artist": "dan", "tags": ["a", "b"]}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_empty_input_decodes_to_empty_map() {
        assert!(YamlCodec.decode(b"").unwrap().is_empty());
        assert!(JsonCodec.decode(b"  \n").unwrap().is_empty());
        assert!(DefaultCodec.decode(b"").unwrap().is_empty());
    }

    #[test]
    fn test_yaml_null_document_is_empty_map() {
        assert!(YamlCodec.decode(b"~\n").unwrap().is_empty());
    }

    #[test]
    fn test_non_mapping_is_rejected() {
        let err = YamlCodec.decode(b"- 1\n- 2\n").unwrap_err();
        assert!(matches!(err, CodecError::NotAMapping { found: "a sequence" }));
    }

    #[test]
    fn test_default_codec_writes_yaml() {
        let encoded = String::from_utf8(DefaultCodec.encode(&sample()).unwrap()).unwrap();
        assert!(encoded.contains("frames: 24"));
        assert_eq!(DefaultCodec.decode(encoded.as_bytes()).unwrap(), sample());
    }

    #[test]
    fn test_default_codec_reads_json_files() {
        let encoded = JsonCodec.encode(&sample()).unwrap();
        assert_eq!(DefaultCodec.decode(&encoded).unwrap(), sample());
    }

    #[test]
    fn test_garbage_reports_yaml_error() {
        let err = DefaultCodec.decode(b"a: [unclosed").unwrap_err();
        assert!(matches!(err, CodecError::Decode { format: "yaml", .. }));
    }
}
