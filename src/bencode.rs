//! Bencode Values
//!
//! The structured encoding used by protocol version three for headers and
//! argument/error structures. Only the four bencode shapes are modelled:
//!
//! ```text
//! bytes      4:spam
//! integer    i42e
//! list       l4:spami42ee
//! dict       d3:cow3:mooe     (keys are byte strings, sorted on encode)
//! ```
//!
//! Encoding and decoding go through `bendy`.

use std::collections::BTreeMap;
use std::fmt;

use bendy::decoding::{Decoder, Object};
use bendy::encoding::{Error as EncodeError, SingleItemEncoder, ToBencode};
use bytes::Bytes;

use crate::error::{Result, SmartError};

/// Nesting limit applied on both encode and decode.
const MAX_DEPTH: usize = 64;

/// A decoded bencode value.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Bytes(Bytes),
    Int(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Encode this value as bencode.
    pub fn to_bencode(&self) -> Result<Vec<u8>> {
        Ref(self)
            .to_bencode()
            .map_err(|e| SmartError::Bencode(format!("{:?}", e)))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes(b) => write!(f, "{:?}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Dict(map) => f.debug_map().entries(map.iter()).finish(),
        }
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }
}

impl<const N: usize> From<&[u8; N]> for Value {
    fn from(b: &[u8; N]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(Bytes::from(s))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl PartialEq<&str> for Value {
    fn eq(&self, other: &&str) -> bool {
        matches!(self, Value::Bytes(b) if b.as_ref() == other.as_bytes())
    }
}

impl PartialEq<&[u8]> for Value {
    fn eq(&self, other: &&[u8]) -> bool {
        matches!(self, Value::Bytes(b) if b.as_ref() == *other)
    }
}

/// Build a list of byte-string values.
pub fn byte_list<I, T>(items: I) -> Vec<Value>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    items
        .into_iter()
        .map(|item| Value::Bytes(Bytes::copy_from_slice(item.as_ref())))
        .collect()
}

// =============================================================================
// Encoding
// =============================================================================

struct Ref<'a>(&'a Value);

impl ToBencode for Ref<'_> {
    const MAX_DEPTH: usize = MAX_DEPTH;

    fn encode(&self, encoder: SingleItemEncoder) -> std::result::Result<(), EncodeError> {
        match self.0 {
            Value::Bytes(b) => encoder.emit_bytes(b),
            Value::Int(i) => encoder.emit_int(*i),
            Value::List(items) => encoder.emit_list(|e| {
                for item in items {
                    e.emit(Ref(item))?;
                }
                Ok(())
            }),
            Value::Dict(map) => encoder.emit_dict(|mut e| {
                for (key, value) in map {
                    e.emit_pair(key, Ref(value))?;
                }
                Ok(())
            }),
        }
    }
}

/// Encode a list of values as a bencoded list.
pub fn encode_list(items: &[Value]) -> Result<Vec<u8>> {
    Value::List(items.to_vec()).to_bencode()
}

// =============================================================================
// Decoding
// =============================================================================

fn bencode_error(e: impl fmt::Debug) -> SmartError {
    SmartError::Bencode(format!("{:?}", e))
}

fn decode_object(object: Object<'_, '_>) -> Result<Value> {
    match object {
        Object::Bytes(b) => Ok(Value::Bytes(Bytes::copy_from_slice(b))),
        Object::Integer(text) => text
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| SmartError::Bencode(format!("bad integer {:?}", text))),
        Object::List(mut list) => {
            let mut items = Vec::new();
            while let Some(item) = list.next_object().map_err(bencode_error)? {
                items.push(decode_object(item)?);
            }
            Ok(Value::List(items))
        }
        Object::Dict(mut dict) => {
            let mut map = BTreeMap::new();
            while let Some((key, value)) = dict.next_pair().map_err(bencode_error)? {
                let key = Bytes::copy_from_slice(key);
                map.insert(key, decode_object(value)?);
            }
            Ok(Value::Dict(map))
        }
    }
}

/// Decode exactly one bencoded value; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut decoder = Decoder::new(bytes).with_max_depth(MAX_DEPTH);
    let value = match decoder.next_object().map_err(bencode_error)? {
        Some(object) => decode_object(object)?,
        None => return Err(SmartError::Bencode("empty input".to_string())),
    };
    if decoder.next_object().map_err(bencode_error)?.is_some() {
        return Err(SmartError::Bencode("trailing data after value".to_string()));
    }
    Ok(value)
}
