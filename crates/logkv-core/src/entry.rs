//! On-Disk Entry Format
//!
//! This module defines [`Entry`] - the typed key/value record - and the
//! codec for the length-prefixed frame each entry occupies on disk.
//!
//! ## Frame Layout
//!
//! All integers are little-endian:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────┬──────────┬──────────────────┐
//! │ size (u32)   │ kl (u32)     │ key      │ tag (u8) │ payload          │
//! │ total frame  │ key length   │ kl bytes │ 0=string │ see below        │
//! │ length       │              │          │ 1=int64  │                  │
//! └──────────────┴──────────────┴──────────┴──────────┴──────────────────┘
//! ```
//!
//! The payload depends on the tag:
//!
//! - **string**: `vl: u32` followed by `vl` raw bytes;
//!   `size = kl + vl + 13`
//! - **int64**: exactly 8 bytes, two's-complement little-endian;
//!   `size = kl + 21`
//!
//! A segment file is nothing but a concatenation of such frames - no
//! header, no footer. Frames are self-describing, which is what makes the
//! front-to-back recovery scan possible.
//!
//! ## Why a typed payload?
//!
//! Values are a tagged variant, not raw bytes: the tag byte is the on-disk
//! discriminant and [`Value`] is its in-memory form. Adding a type means
//! adding a tag constant plus encode/decode arms - there is no inheritance
//! and no registry to keep in sync.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// On-disk tag byte for string values.
pub const STR_TAG: u8 = 0;
/// On-disk tag byte for int64 values.
pub const INT64_TAG: u8 = 1;

/// Fixed bytes in every frame: size (4) + key length (4) + tag (1).
const FRAME_OVERHEAD: usize = 9;
/// Smallest structurally possible frame: overhead + string length header.
pub const MIN_FRAME_LEN: usize = FRAME_OVERHEAD + 4;

/// The one-byte type discriminant stored with every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeTag {
    Str,
    Int64,
}

impl TypeTag {
    /// Decode a tag byte read from disk.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            STR_TAG => Some(TypeTag::Str),
            INT64_TAG => Some(TypeTag::Int64),
            _ => None,
        }
    }

    /// The byte written to disk for this tag.
    pub fn as_byte(self) -> u8 {
        match self {
            TypeTag::Str => STR_TAG,
            TypeTag::Int64 => INT64_TAG,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Str => write!(f, "string"),
            TypeTag::Int64 => write!(f, "int64"),
        }
    }
}

/// A typed value. The textual form of an `Int64` exists only at the API
/// boundary; on disk it is always the fixed 8-byte representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Int64(i64),
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Str(_) => TypeTag::Str,
            Value::Int64(_) => TypeTag::Int64,
        }
    }
}

/// A single key/value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Value,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    /// Total length of this entry's frame, including the size field.
    pub fn frame_len(&self) -> usize {
        match &self.value {
            Value::Str(s) => self.key.len() + s.len() + 13,
            Value::Int64(_) => self.key.len() + 21,
        }
    }

    /// Encode this entry as one frame.
    pub fn encode(&self) -> Bytes {
        let size = self.frame_len();
        let mut buf = BytesMut::with_capacity(size);

        buf.put_u32_le(size as u32);
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(self.key.as_bytes());
        buf.put_u8(self.value.tag().as_byte());
        match &self.value {
            Value::Str(s) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::Int64(n) => buf.put_i64_le(*n),
        }

        buf.freeze()
    }

    /// Decode one complete frame (including its size prefix) back into an
    /// entry. Used by the recovery scan, which needs the key as well as
    /// the value.
    pub fn decode(frame: &[u8]) -> Result<Entry> {
        let (key_end, tag) = check_frame(frame)?;

        let key = std::str::from_utf8(&frame[8..key_end])
            .map_err(|_| Error::CorruptedFrame("key is not valid UTF-8".into()))?
            .to_string();
        let value = decode_value(frame, key_end, tag)?;

        Ok(Entry { key, value })
    }
}

/// Decode only the value of a frame, skipping over the key. This is the
/// random-access read path: a get already knows which key it asked for.
pub fn read_value(frame: &[u8]) -> Result<Value> {
    let (key_end, tag) = check_frame(frame)?;
    decode_value(frame, key_end, tag)
}

/// Validate the frame structure and return (offset just past the key, tag).
fn check_frame(frame: &[u8]) -> Result<(usize, TypeTag)> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(Error::CorruptedFrame(format!(
            "frame of {} bytes is shorter than the {} byte minimum",
            frame.len(),
            MIN_FRAME_LEN
        )));
    }

    let size = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
    if size != frame.len() {
        return Err(Error::CorruptedFrame(format!(
            "declared size {} does not match {} bytes read",
            size,
            frame.len()
        )));
    }

    let kl = u32::from_le_bytes(frame[4..8].try_into().unwrap()) as usize;
    let key_end = 8 + kl;
    if key_end + 1 > frame.len() {
        return Err(Error::CorruptedFrame(format!(
            "key length {} overruns frame of {} bytes",
            kl,
            frame.len()
        )));
    }

    let tag_byte = frame[key_end];
    let tag = TypeTag::from_byte(tag_byte)
        .ok_or_else(|| Error::CorruptedFrame(format!("unknown type tag {tag_byte:#04x}")))?;

    // The declared total size must agree with the tag-specific layout.
    let expected = match tag {
        TypeTag::Str => {
            if key_end + 5 > frame.len() {
                return Err(Error::CorruptedFrame(
                    "frame too short for string length header".into(),
                ));
            }
            let vl =
                u32::from_le_bytes(frame[key_end + 1..key_end + 5].try_into().unwrap()) as usize;
            kl + vl + 13
        }
        TypeTag::Int64 => kl + 21,
    };
    if expected != frame.len() {
        return Err(Error::CorruptedFrame(format!(
            "{tag} payload implies {expected} bytes but frame has {}",
            frame.len()
        )));
    }

    Ok((key_end, tag))
}

fn decode_value(frame: &[u8], key_end: usize, tag: TypeTag) -> Result<Value> {
    match tag {
        TypeTag::Str => {
            let value = std::str::from_utf8(&frame[key_end + 5..])
                .map_err(|_| Error::CorruptedFrame("string value is not valid UTF-8".into()))?;
            Ok(Value::Str(value.to_string()))
        }
        TypeTag::Int64 => {
            let bytes: [u8; 8] = frame[key_end + 1..key_end + 9].try_into().unwrap();
            Ok(Value::Int64(i64::from_le_bytes(bytes)))
        }
    }
}
