//! Varint serialisation for property snapshots.
//!
//! Unsigned integers use LEB128 (base-128 little-endian, MSB as the
//! continuation flag). Signed integers are zig-zag folded first so small
//! magnitudes stay short. Identifiers are stored as raw 4-byte
//! little-endian words. Strings and blobs are length-prefixed byte runs
//! with no terminator. The byte-stream framing is endian-neutral.
//!
//! A property is marshalled as `kind:u8 ‖ id:u32_le ‖ payload`, with the
//! payload encoding chosen by the kind.

use thiserror::Error;

use crate::id::PropId;
use crate::pool::PoolSet;
use crate::propdb::{kind, PropEntry, PropValue};

/// Encoding failures. `Overflow` carries the space the caller must
/// provide to retry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("output buffer too small, {needed} bytes required")]
    Overflow { needed: usize },
    #[error("value kind cannot be serialised")]
    Unencodable,
}

/// Decoding failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input truncated")]
    Truncated,
    #[error("varint exceeds 32 bits")]
    TooWide,
    #[error("unknown property kind {0}")]
    UnknownKind(u8),
    #[error("string payload is not UTF-8")]
    BadString,
    #[error("no pool block available for payload of {0} bytes")]
    PoolExhausted(usize),
}

/// Number of bytes `varint_encode` will produce for `n`.
#[must_use]
pub const fn varint_encoded_len(n: u32) -> usize {
    if n == 0 {
        1
    } else {
        ((32 - n.leading_zeros() as usize) + 6) / 7
    }
}

/// LEB128-encode `n` into `buf`. Returns bytes written.
pub fn varint_encode(mut n: u32, buf: &mut [u8]) -> Result<usize, EncodeError> {
    let needed = varint_encoded_len(n);
    if buf.len() < needed {
        return Err(EncodeError::Overflow { needed });
    }

    let mut ix = 0;
    while n & !0x7F != 0 {
        buf[ix] = (n as u8) | 0x80;
        n >>= 7;
        ix += 1;
    }
    buf[ix] = n as u8;

    Ok(needed)
}

/// Decode a LEB128 value. Returns the value and bytes consumed.
pub fn varint_decode(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut val: u32 = 0;
    let mut shift = 0;

    for (ix, &b) in buf.iter().enumerate() {
        if shift >= 32 {
            return Err(DecodeError::TooWide);
        }
        val |= u32::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok((val, ix + 1));
        }
        shift += 7;
    }

    Err(DecodeError::Truncated)
}

/// Zig-zag fold a signed value into an unsigned one.
#[must_use]
pub const fn zigzag_encode(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

/// Invert [`zigzag_encode`].
#[must_use]
pub const fn zigzag_decode(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// Raw 4-byte little-endian encoding used for identifiers.
pub fn uint32_encode(n: u32, buf: &mut [u8]) -> Result<usize, EncodeError> {
    if buf.len() < 4 {
        return Err(EncodeError::Overflow { needed: 4 });
    }
    buf[..4].copy_from_slice(&n.to_le_bytes());
    Ok(4)
}

/// Decode a raw 4-byte little-endian word.
pub fn uint32_decode(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let bytes: [u8; 4] = buf
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(DecodeError::Truncated)?;
    Ok((u32::from_le_bytes(bytes), 4))
}

/// `varint(len) ‖ bytes(len)`, shared by strings and blobs.
pub fn bytes_encode(data: &[u8], buf: &mut [u8]) -> Result<usize, EncodeError> {
    let needed = varint_encoded_len(data.len() as u32) + data.len();
    if buf.len() < needed {
        return Err(EncodeError::Overflow { needed });
    }

    let mut pos = varint_encode(data.len() as u32, buf)?;
    buf[pos..pos + data.len()].copy_from_slice(data);
    pos += data.len();
    Ok(pos)
}

/// Decode a length-prefixed byte run, borrowing from the input.
pub fn bytes_decode(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let (len, consumed) = varint_decode(buf)?;
    let len = len as usize;
    let data = buf
        .get(consumed..consumed + len)
        .ok_or(DecodeError::Truncated)?;
    Ok((data, consumed + len))
}

/// Encode a string as `varint(len) ‖ bytes`; no trailing NUL.
pub fn string_encode(s: &str, buf: &mut [u8]) -> Result<usize, EncodeError> {
    bytes_encode(s.as_bytes(), buf)
}

/// Decode a length-prefixed string, validating UTF-8.
pub fn string_decode(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (data, consumed) = bytes_decode(buf)?;
    let s = core::str::from_utf8(data).map_err(|_| DecodeError::BadString)?;
    Ok((s, consumed))
}

/// Bytes `prop_encode` will produce for one entry.
#[must_use]
pub fn prop_encoded_len(entry: &PropEntry) -> usize {
    let payload = match &entry.value {
        PropValue::Uint(v) => varint_encoded_len(*v),
        PropValue::Int(v) => varint_encoded_len(zigzag_encode(*v)),
        PropValue::Str(s) => varint_encoded_len(s.len() as u32) + s.len(),
        PropValue::Blob(b) => varint_encoded_len(b.len() as u32) + b.len(),
        PropValue::None => 0,
    };
    1 + 4 + payload // kind + id + payload
}

/// Marshal one property into `buf`. Returns bytes written.
pub fn prop_encode(id: PropId, entry: &PropEntry, buf: &mut [u8]) -> Result<usize, EncodeError> {
    let needed = prop_encoded_len(entry);
    if buf.len() < needed {
        return Err(EncodeError::Overflow { needed });
    }

    buf[0] = entry.value.kind();
    let mut pos = 1;
    pos += uint32_encode(id.0, &mut buf[pos..])?;

    pos += match &entry.value {
        PropValue::Uint(v) => varint_encode(*v, &mut buf[pos..])?,
        PropValue::Int(v) => varint_encode(zigzag_encode(*v), &mut buf[pos..])?,
        PropValue::Str(s) => bytes_encode(s, &mut buf[pos..])?,
        PropValue::Blob(b) => bytes_encode(b, &mut buf[pos..])?,
        PropValue::None => 0,
    };

    Ok(pos)
}

/// One decoded property.
#[derive(Debug)]
pub struct DecodedProp {
    pub id: PropId,
    pub entry: PropEntry,
    pub consumed: usize,
}

/// Unmarshal one property. String and blob payloads are copied into
/// pool blocks. Restored entries arrive persistable and writable; blob
/// payloads additionally arrive protected since they are system data.
pub fn prop_decode(buf: &[u8], pools: &PoolSet) -> Result<DecodedProp, DecodeError> {
    let kind_byte = *buf.first().ok_or(DecodeError::Truncated)?;
    let mut pos = 1;

    let (raw_id, n) = uint32_decode(&buf[pos..])?;
    pos += n;

    let mut entry = PropEntry::default();
    entry.persist = true;
    entry.readonly = false;

    entry.value = match kind_byte {
        kind::NONE => PropValue::None,
        kind::UINT => {
            let (v, n) = varint_decode(&buf[pos..])?;
            pos += n;
            PropValue::Uint(v)
        }
        kind::INT => {
            let (v, n) = varint_decode(&buf[pos..])?;
            pos += n;
            PropValue::Int(zigzag_decode(v))
        }
        kind::STRING => {
            let (data, n) = bytes_decode(&buf[pos..])?;
            pos += n;
            core::str::from_utf8(data).map_err(|_| DecodeError::BadString)?;
            let shared = pools
                .alloc_shared_from(data)
                .ok_or(DecodeError::PoolExhausted(data.len()))?;
            PropValue::Str(shared)
        }
        kind::BLOB => {
            let (data, n) = bytes_decode(&buf[pos..])?;
            pos += n;
            let shared = pools
                .alloc_shared_from(data)
                .ok_or(DecodeError::PoolExhausted(data.len()))?;
            entry.protect = true;
            PropValue::Blob(shared)
        }
        // Function-valued properties lose their target across a reboot
        kind::FUNC => PropValue::None,
        other => return Err(DecodeError::UnknownKind(other)),
    };

    Ok(DecodedProp {
        id: PropId(raw_id),
        entry,
        consumed: pos,
    })
}
