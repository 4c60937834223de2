//! Records: values that write themselves to a stream and read themselves back
//!
//! A record has no identity of its own. Sort order, ids and references are
//! supplied per call by comparators and handlers, so the same record type can
//! be sorted by one key in one phase and joined on another in the next.

use std::io::{self, Read, Write};

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::max_record_bytes;

/// A value that can be stored in a record stream.
///
/// `decode` fills a blank instance produced by a [`RecordFactory`]; the binary
/// layout is entirely up to the implementation but must be self-delimiting,
/// since streams carry no framing of their own.
pub trait Record: Sized {
    fn encode<W: Write>(&self, out: &mut W) -> io::Result<()>;

    fn decode<R: Read>(&mut self, input: &mut R) -> io::Result<()>;

    /// Line-oriented debug representation.
    fn to_json(&self) -> serde_json::Result<Value>;

    fn from_json(&mut self, json: Value) -> serde_json::Result<()>;
}

/// Produces blank records for the iterator to decode into.
pub trait RecordFactory<T> {
    fn construct(&self) -> T;
}

impl<T, F> RecordFactory<T> for F
where
    F: Fn() -> T,
{
    fn construct(&self) -> T {
        self()
    }
}

/// Binary encoding shared by every serde-backed record.
pub fn encode_bincode<T: Serialize, W: Write>(value: &T, out: &mut W) -> io::Result<()> {
    bincode::serialize_into(out, value).map_err(bincode_to_io)
}

/// Decode a bincode record, refusing any that claims more than
/// [`max_record_bytes`].
pub fn decode_bincode<T: DeserializeOwned, R: Read>(input: &mut R) -> io::Result<T> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(max_record_bytes())
        .deserialize_from(input)
        .map_err(bincode_to_io)
}

fn bincode_to_io(err: bincode::Error) -> io::Error {
    match *err {
        bincode::ErrorKind::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

pub fn to_json_value<T: Serialize>(value: &T) -> serde_json::Result<Value> {
    serde_json::to_value(value)
}

pub fn from_json_value<T: DeserializeOwned>(json: Value) -> serde_json::Result<T> {
    serde_json::from_value(json)
}

/// Implement [`Record`] for serde types: bincode on the wire, JSON for text.
///
/// ```
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Default, Serialize, Deserialize)]
/// struct Node {
///     id: i64,
///     lat: i32,
///     lon: i32,
/// }
///
/// mapgen_io::serde_record!(Node);
/// ```
#[macro_export]
macro_rules! serde_record {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::Record for $ty {
            fn encode<W: ::std::io::Write>(&self, out: &mut W) -> ::std::io::Result<()> {
                $crate::record::encode_bincode(self, out)
            }

            fn decode<R: ::std::io::Read>(&mut self, input: &mut R) -> ::std::io::Result<()> {
                *self = $crate::record::decode_bincode(input)?;
                Ok(())
            }

            fn to_json(&self) -> $crate::record::JsonResult<$crate::record::JsonValue> {
                $crate::record::to_json_value(self)
            }

            fn from_json(&mut self, json: $crate::record::JsonValue) -> $crate::record::JsonResult<()> {
                *self = $crate::record::from_json_value(json)?;
                Ok(())
            }
        }
    )+};
}

#[doc(hidden)]
pub use serde_json::Result as JsonResult;
#[doc(hidden)]
pub use serde_json::Value as JsonValue;

pub fn write_i64<W: Write>(out: &mut W, value: i64) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

pub fn read_i64<R: Read>(input: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// Length-prefixed byte string.
pub fn write_bytes<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "byte string too long"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(bytes)
}

pub fn read_bytes<R: Read>(input: &mut R) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    input.read_exact(&mut len)?;
    let len = u64::from(u32::from_le_bytes(len));
    if len > max_record_bytes() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("byte string of {} bytes exceeds the record limit", len),
        ));
    }
    let mut bytes = Vec::new();
    input.by_ref().take(len).read_to_end(&mut bytes)?;
    if (bytes.len() as u64) < len {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(bytes)
}

pub fn write_str<W: Write>(out: &mut W, s: &str) -> io::Result<()> {
    write_bytes(out, s.as_bytes())
}

pub fn read_str<R: Read>(input: &mut R) -> io::Result<String> {
    String::from_utf8(read_bytes(input)?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// A bare id, the element type of id lists used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdRecord {
    pub id: i64,
}

impl IdRecord {
    pub fn new(id: i64) -> Self {
        Self { id }
    }

    /// Factory for iterating id streams.
    pub fn blank() -> Self {
        Self { id: -1 }
    }
}

impl Default for IdRecord {
    fn default() -> Self {
        Self::blank()
    }
}

impl Record for IdRecord {
    fn encode<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_i64(out, self.id)
    }

    fn decode<R: Read>(&mut self, input: &mut R) -> io::Result<()> {
        self.id = read_i64(input)?;
        Ok(())
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        to_json_value(self)
    }

    fn from_json(&mut self, json: Value) -> serde_json::Result<()> {
        *self = from_json_value(json)?;
        Ok(())
    }
}
