//! Payload encoding and typed reply decoding
//!
//! Raw byte buffers travel unchanged; every other value is MessagePack.
//! Replies are decoded according to the kind the caller asks for.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use rmpv::Value;

use crate::error::{ApiError, ApiResult};

/// Encode a payload for the wire
///
/// `Value::Binary` is passed through as-is; anything else is serialized
/// as MessagePack.
pub fn encode(value: &Value) -> ApiResult<Bytes> {
    match value {
        Value::Binary(raw) => Ok(Bytes::copy_from_slice(raw)),
        other => encode_message_pack(other),
    }
}

/// Serialize a value as MessagePack regardless of its shape
pub fn encode_message_pack(value: &Value) -> ApiResult<Bytes> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).map_err(|e| ApiError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a MessagePack body; a zero-length body is "no value"
pub fn decode_message_pack(bytes: &[u8]) -> ApiResult<Option<Value>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let mut cursor = bytes;
    rmpv::decode::read_value(&mut cursor)
        .map(Some)
        .map_err(|e| ApiError::Decode(e.to_string()))
}

/// Look up a string key in a MessagePack map
pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// Supported reply decodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeKind {
    /// UTF-8 text
    String,
    /// 4-byte little-endian signed integer
    Int,
    /// 8-byte little-endian float
    Double,
    /// Structured MessagePack value
    MessagePack,
}

impl FromStr for DecodeKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(DecodeKind::String),
            "int" => Ok(DecodeKind::Int),
            "double" => Ok(DecodeKind::Double),
            "messagepack" => Ok(DecodeKind::MessagePack),
            other => Err(ApiError::UnsupportedDecodeType(other.to_string())),
        }
    }
}

impl fmt::Display for DecodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecodeKind::String => "string",
            DecodeKind::Int => "int",
            DecodeKind::Double => "double",
            DecodeKind::MessagePack => "messagepack",
        };
        f.write_str(name)
    }
}

/// A decoded reply body
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    String(String),
    Int(i32),
    Double(f64),
    MessagePack(Option<Value>),
}

impl Decoded {
    pub fn kind(&self) -> DecodeKind {
        match self {
            Decoded::String(_) => DecodeKind::String,
            Decoded::Int(_) => DecodeKind::Int,
            Decoded::Double(_) => DecodeKind::Double,
            Decoded::MessagePack(_) => DecodeKind::MessagePack,
        }
    }

    /// Wire representation of this value for its kind
    pub fn to_bytes(&self) -> ApiResult<Bytes> {
        match self {
            Decoded::String(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            Decoded::Int(v) => Ok(Bytes::copy_from_slice(&v.to_le_bytes())),
            Decoded::Double(v) => Ok(Bytes::copy_from_slice(&v.to_le_bytes())),
            Decoded::MessagePack(None) => Ok(Bytes::new()),
            Decoded::MessagePack(Some(v)) => encode_message_pack(v),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Decoded::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Decoded::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Decoded::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Decoded::MessagePack(v) => v,
            _ => None,
        }
    }
}

/// Decode a reply body as `kind`
pub fn decode(bytes: &[u8], kind: DecodeKind) -> ApiResult<Decoded> {
    match kind {
        DecodeKind::String => String::from_utf8(bytes.to_vec())
            .map(Decoded::String)
            .map_err(|e| ApiError::Decode(e.to_string())),
        DecodeKind::Int => {
            let raw = fixed::<4>(bytes, kind)?;
            Ok(Decoded::Int(i32::from_le_bytes(raw)))
        }
        DecodeKind::Double => {
            let raw = fixed::<8>(bytes, kind)?;
            Ok(Decoded::Double(f64::from_le_bytes(raw)))
        }
        DecodeKind::MessagePack => decode_message_pack(bytes).map(Decoded::MessagePack),
    }
}

fn fixed<const N: usize>(bytes: &[u8], kind: DecodeKind) -> ApiResult<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|head| head.try_into().ok())
        .ok_or_else(|| {
            ApiError::Decode(format!(
                "{} reply needs {} bytes, got {}",
                kind,
                N,
                bytes.len()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_binary_passthrough() {
        let raw = vec![0xde, 0xad, 0xbe, 0xef];
        let encoded = encode(&Value::Binary(raw.clone())).unwrap();
        assert_eq!(&encoded[..], &raw[..]);
    }

    #[test]
    fn test_string_is_message_packed() {
        let encoded = encode(&Value::from("hello")).unwrap();
        // fixstr header 0xa5 followed by the bytes
        assert_eq!(encoded[0], 0xa5);
        assert_eq!(&encoded[1..], b"hello");
    }

    #[test]
    fn test_round_trip_each_kind() {
        let samples = vec![
            Decoded::String("camlink".into()),
            Decoded::Int(-123_456),
            Decoded::Double(1.5e-3),
            Decoded::MessagePack(Some(Value::Map(vec![(
                Value::from("boot_select"),
                Value::from("A"),
            )]))),
            Decoded::MessagePack(None),
        ];
        for sample in samples {
            let bytes = sample.to_bytes().unwrap();
            assert_eq!(decode(&bytes, sample.kind()).unwrap(), sample);
        }
    }

    #[test]
    fn test_empty_message_pack_is_none() {
        assert_eq!(
            decode(&[], DecodeKind::MessagePack).unwrap(),
            Decoded::MessagePack(None)
        );
    }

    #[test]
    fn test_short_int_is_error() {
        assert!(matches!(
            decode(&[1, 2], DecodeKind::Int),
            Err(ApiError::Decode(_))
        ));
    }

    #[test]
    fn test_unsupported_kind() {
        let err = "bool".parse::<DecodeKind>().unwrap_err();
        assert!(matches!(err, ApiError::UnsupportedDecodeType(ref k) if k == "bool"));
        assert_eq!("double".parse::<DecodeKind>().unwrap(), DecodeKind::Double);
    }

    #[test]
    fn test_malformed_message_pack() {
        // fixstr of length 5 truncated after one byte
        assert!(decode_message_pack(&[0xa5, b'h']).is_err());
    }
}
