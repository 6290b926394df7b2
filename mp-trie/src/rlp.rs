//! Canonical RLP encoding and decoding.
//!
//! Trie nodes and all sync wire messages share this codec, so the decoder is
//! strict: every buffer has exactly one canonical encoding and anything else
//! (padded lengths, non-minimal integers, truncated payloads) is rejected.

use std::fmt;

pub type RlpResult<T> = Result<T, RlpError>;

/// The encoding of an empty byte string (and of an absent trie child).
pub const EMPTY_STRING_CODE: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RlpError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("non-canonical size prefix")]
    NonCanonicalSize,
    #[error("non-canonical integer (leading zero bytes)")]
    NonCanonicalInteger,
    #[error("expected byte string, found list")]
    ExpectedBytes,
    #[error("expected list, found byte string")]
    ExpectedList,
    #[error("unexpected trailing bytes")]
    TrailingBytes,
    #[error("payload has an unexpected length")]
    UnexpectedLength,
    #[error("integer does not fit the target width")]
    UintOverflow,
}

/// The two wire-level kinds. Single bytes below 0x80 count as byte strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Bytes,
    List,
}

/// Splits `buf` into the kind and payload of its first item, plus whatever
/// follows that item. This is the primitive every decoder here builds on.
pub fn split(buf: &[u8]) -> RlpResult<(Kind, &[u8], &[u8])> {
    let &tag = buf.first().ok_or(RlpError::UnexpectedEof)?;
    match tag {
        0x00..=0x7f => Ok((Kind::Bytes, &buf[..1], &buf[1..])),
        0x80..=0xb7 => {
            let size = (tag - 0x80) as usize;
            let (payload, rest) = take(&buf[1..], size)?;
            // A single byte below 0x80 must encode as itself.
            if size == 1 && payload[0] < 0x80 {
                return Err(RlpError::NonCanonicalSize);
            }
            Ok((Kind::Bytes, payload, rest))
        }
        0xb8..=0xbf => {
            let (size, after) = long_size(buf, tag - 0xb7)?;
            let (payload, rest) = take(after, size)?;
            Ok((Kind::Bytes, payload, rest))
        }
        0xc0..=0xf7 => {
            let size = (tag - 0xc0) as usize;
            let (payload, rest) = take(&buf[1..], size)?;
            Ok((Kind::List, payload, rest))
        }
        0xf8..=0xff => {
            let (size, after) = long_size(buf, tag - 0xf7)?;
            let (payload, rest) = take(after, size)?;
            Ok((Kind::List, payload, rest))
        }
    }
}

/// Splits off a byte string, rejecting lists.
pub fn split_bytes(buf: &[u8]) -> RlpResult<(&[u8], &[u8])> {
    match split(buf)? {
        (Kind::Bytes, payload, rest) => Ok((payload, rest)),
        (Kind::List, ..) => Err(RlpError::ExpectedBytes),
    }
}

/// Splits off a list, returning its payload.
pub fn split_list(buf: &[u8]) -> RlpResult<(&[u8], &[u8])> {
    match split(buf)? {
        (Kind::List, payload, rest) => Ok((payload, rest)),
        (Kind::Bytes, ..) => Err(RlpError::ExpectedList),
    }
}

/// Splits off a canonical unsigned integer: big-endian, no leading zeroes.
pub fn split_u64(buf: &[u8]) -> RlpResult<(u64, &[u8])> {
    let (v, rest) = split_u128(buf)?;
    Ok((u64::try_from(v).map_err(|_| RlpError::UintOverflow)?, rest))
}

pub fn split_u128(buf: &[u8]) -> RlpResult<(u128, &[u8])> {
    let (payload, rest) = split_bytes(buf)?;
    if payload.len() > 16 {
        return Err(RlpError::UintOverflow);
    }
    if payload.first() == Some(&0) {
        return Err(RlpError::NonCanonicalInteger);
    }
    let mut v = 0u128;
    for &b in payload {
        v = (v << 8) | b as u128;
    }
    Ok((v, rest))
}

/// Counts the items in a list payload (as returned by [`split_list`]).
pub fn count_values(mut payload: &[u8]) -> RlpResult<usize> {
    let mut count = 0;
    while !payload.is_empty() {
        let (_, _, rest) = split(payload)?;
        payload = rest;
        count += 1;
    }
    Ok(count)
}

fn take(buf: &[u8], size: usize) -> RlpResult<(&[u8], &[u8])> {
    if buf.len() < size {
        return Err(RlpError::UnexpectedEof);
    }
    Ok(buf.split_at(size))
}

/// Reads a multi-byte size field. Sizes below 56 must use the short form and
/// the size bytes themselves must not start with zero.
fn long_size(buf: &[u8], size_len: u8) -> RlpResult<(usize, &[u8])> {
    let size_len = size_len as usize;
    if buf.len() < 1 + size_len {
        return Err(RlpError::UnexpectedEof);
    }
    let size_bytes = &buf[1..1 + size_len];
    if size_bytes[0] == 0 {
        return Err(RlpError::NonCanonicalSize);
    }
    let mut size = 0usize;
    for &b in size_bytes {
        size = size.checked_mul(256).ok_or(RlpError::UintOverflow)? + b as usize;
    }
    if size < 56 {
        return Err(RlpError::NonCanonicalSize);
    }
    Ok((size, &buf[1 + size_len..]))
}

/// Appends the encoding of a byte string.
pub fn append_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        out.push(bytes[0]);
    } else {
        append_size(out, bytes.len(), 0x80);
        out.extend_from_slice(bytes);
    }
}

/// Appends the encoding of an unsigned integer (minimal big-endian).
pub fn append_u64(out: &mut Vec<u8>, v: u64) {
    append_u128(out, v as u128)
}

pub fn append_u128(out: &mut Vec<u8>, v: u128) {
    let bytes = v.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    append_bytes(out, &bytes[start..]);
}

/// Appends a list header for a payload of `payload_len` bytes. The caller
/// appends the payload afterwards.
pub fn append_list_header(out: &mut Vec<u8>, payload_len: usize) {
    append_size(out, payload_len, 0xc0)
}

/// Builds a list: the closure fills the payload, the header is prepended.
pub fn append_list(out: &mut Vec<u8>, fill: impl FnOnce(&mut Vec<u8>)) {
    let mut payload = Vec::new();
    fill(&mut payload);
    append_list_header(out, payload.len());
    out.extend_from_slice(&payload);
}

fn append_size(out: &mut Vec<u8>, size: usize, offset: u8) {
    if size <= 55 {
        out.push(offset + size as u8);
    } else {
        let bytes = size.to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        out.push(offset + 55 + (bytes.len() - start) as u8);
        out.extend_from_slice(&bytes[start..]);
    }
}

pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 4);
    append_bytes(&mut out, bytes);
    out
}

/// A decoded RLP tree, for callers that want the generic shape rather than a
/// typed decoder.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bytes(b) => append_bytes(out, b),
            Value::List(items) => append_list(out, |payload| {
                for item in items {
                    item.encode(payload);
                }
            }),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Decodes exactly one value; trailing bytes are an error.
    pub fn decode(buf: &[u8]) -> RlpResult<Value> {
        let (value, rest) = Self::decode_prefix(buf)?;
        if !rest.is_empty() {
            return Err(RlpError::TrailingBytes);
        }
        Ok(value)
    }

    fn decode_prefix(buf: &[u8]) -> RlpResult<(Value, &[u8])> {
        match split(buf)? {
            (Kind::Bytes, payload, rest) => Ok((Value::Bytes(payload.to_vec()), rest)),
            (Kind::List, mut payload, rest) => {
                let mut items = Vec::new();
                while !payload.is_empty() {
                    let (item, next) = Self::decode_prefix(payload)?;
                    items.push(item);
                    payload = next;
                }
                Ok((Value::List(items), rest))
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::List(items) => f.debug_list().entries(items).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(v: &Value) -> Vec<u8> {
        v.to_vec()
    }

    #[test]
    fn encode_basics() {
        assert_eq!(enc(&Value::Bytes(b"dog".to_vec())), hex::decode("83646f67").unwrap());
        assert_eq!(enc(&Value::Bytes(vec![])), vec![0x80]);
        assert_eq!(enc(&Value::Bytes(vec![0x00])), vec![0x00]);
        assert_eq!(enc(&Value::Bytes(vec![0x7f])), vec![0x7f]);
        assert_eq!(enc(&Value::List(vec![])), vec![0xc0]);

        let cat_dog = Value::List(vec![
            Value::Bytes(b"cat".to_vec()),
            Value::Bytes(b"dog".to_vec()),
        ]);
        assert_eq!(enc(&cat_dog), hex::decode("c88363617483646f67").unwrap());
    }

    #[test]
    fn encode_long_string() {
        let s = b"Lorem ipsum dolor sit amet, consectetur adipisicing elit".to_vec();
        let mut expected = vec![0xb8, s.len() as u8];
        expected.extend_from_slice(&s);
        assert_eq!(enc(&Value::Bytes(s)), expected);
    }

    #[test]
    fn integers_are_minimal() {
        let mut out = Vec::new();
        append_u64(&mut out, 0);
        assert_eq!(out, vec![0x80]);

        let mut out = Vec::new();
        append_u64(&mut out, 15);
        assert_eq!(out, vec![0x0f]);

        let mut out = Vec::new();
        append_u64(&mut out, 1024);
        assert_eq!(out, vec![0x82, 0x04, 0x00]);

        assert_eq!(split_u64(&[0x82, 0x04, 0x00]).unwrap(), (1024, &[][..]));
        assert_eq!(
            split_u64(&[0x82, 0x00, 0x64]),
            Err(RlpError::NonCanonicalInteger)
        );
    }

    #[test]
    fn round_trip_decode_encode() {
        for input in [
            "80",
            "00",
            "7f",
            "83646f67",
            "c88363617483646f67",
            "c7c0c1c0c3c0c1c0",
        ] {
            let bytes = hex::decode(input).unwrap();
            let value = Value::decode(&bytes).unwrap();
            assert_eq!(value.to_vec(), bytes, "round trip of {input}");
        }
    }

    #[test]
    fn reject_non_canonical() {
        // 0x00 wrapped in a one-byte string prefix.
        assert_eq!(Value::decode(&[0x81, 0x00]), Err(RlpError::NonCanonicalSize));
        // Short payload in long form.
        assert_eq!(
            Value::decode(&[0xb8, 0x02, 0x61, 0x62]),
            Err(RlpError::NonCanonicalSize)
        );
        // Length-of-length with a leading zero.
        let mut buf = vec![0xb9, 0x00, 0x38];
        buf.extend_from_slice(&[0x61; 56]);
        assert_eq!(Value::decode(&buf), Err(RlpError::NonCanonicalSize));
    }

    #[test]
    fn reject_truncation() {
        assert_eq!(Value::decode(&[]), Err(RlpError::UnexpectedEof));
        assert_eq!(Value::decode(&[0x83, 0x64]), Err(RlpError::UnexpectedEof));
        assert_eq!(Value::decode(&[0xc8, 0x83]), Err(RlpError::UnexpectedEof));
        // Trailing garbage after a complete item.
        assert_eq!(Value::decode(&[0x80, 0x00]), Err(RlpError::TrailingBytes));
    }

    #[test]
    fn split_surfaces() {
        let buf = hex::decode("c88363617483646f67").unwrap();
        let (kind, payload, rest) = split(&buf).unwrap();
        assert_eq!(kind, Kind::List);
        assert!(rest.is_empty());
        assert_eq!(count_values(payload).unwrap(), 2);

        let (cat, rest) = split_bytes(payload).unwrap();
        assert_eq!(cat, b"cat");
        let (dog, rest) = split_bytes(rest).unwrap();
        assert_eq!(dog, b"dog");
        assert!(rest.is_empty());

        assert_eq!(split_list(&buf[1..]), Err(RlpError::ExpectedList));
        assert_eq!(split_bytes(&buf), Err(RlpError::ExpectedBytes));
    }
}
