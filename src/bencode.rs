//! Bencode parser
//!
//! A small hand-rolled bencode decoder that keeps raw byte access, which the
//! metainfo layer needs to hash the exact `info` dictionary bytes.
//!
//! Bencode format:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;

use crate::error::{ClientError, Result};

/// Upper bound for a single bencode string (100 MiB). Keeps a hostile
/// length prefix from turning into an allocation.
const MAX_STRING_LEN: usize = 100 * 1024 * 1024;

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer (may be negative)
    Integer(i64),
    /// Byte string (not necessarily UTF-8)
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary keyed by byte strings, sorted
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

fn parse_err(message: impl Into<String>) -> ClientError {
    ClientError::config(format!("bencode: {}", message.into()))
}

impl BencodeValue {
    /// Decode one value, returning it together with the unconsumed tail.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8])> {
        match data.first() {
            None => Err(parse_err("empty input")),
            Some(b'i') => Self::parse_integer(data),
            Some(b'l') => Self::parse_list(data),
            Some(b'd') => Self::parse_dict(data),
            Some(b'0'..=b'9') => Self::parse_string(data),
            Some(&c) => Err(parse_err(format!("invalid type marker {:?}", c as char))),
        }
    }

    /// Decode a complete document, rejecting trailing bytes.
    pub fn parse_exact(data: &[u8]) -> Result<Self> {
        let (value, rest) = Self::parse(data)?;
        if !rest.is_empty() {
            return Err(parse_err(format!("{} trailing bytes", rest.len())));
        }
        Ok(value)
    }

    fn parse_integer(data: &[u8]) -> Result<(Self, &[u8])> {
        let end = 1 + data[1..]
            .iter()
            .position(|&c| c == b'e')
            .ok_or_else(|| parse_err("unterminated integer"))?;

        let digits = std::str::from_utf8(&data[1..end])
            .map_err(|_| parse_err("non-ASCII integer"))?;

        // "0" is fine, "03", "-0" and "-03" are not
        if (digits.len() > 1 && digits.starts_with('0')) || digits.starts_with("-0") {
            return Err(parse_err(format!("malformed integer {:?}", digits)));
        }

        let value = digits
            .parse::<i64>()
            .map_err(|_| parse_err(format!("integer out of range: {:?}", digits)))?;

        Ok((Self::Integer(value), &data[end + 1..]))
    }

    fn parse_string(data: &[u8]) -> Result<(Self, &[u8])> {
        let colon = data
            .iter()
            .position(|&c| c == b':')
            .ok_or_else(|| parse_err("missing colon in string"))?;

        let len = std::str::from_utf8(&data[..colon])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| parse_err("bad string length"))?;

        if len > MAX_STRING_LEN {
            return Err(parse_err(format!("string length {} over limit", len)));
        }

        let start = colon + 1;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| parse_err("string length past end of input"))?;

        Ok((Self::Bytes(data[start..end].to_vec()), &data[end..]))
    }

    fn parse_list(data: &[u8]) -> Result<(Self, &[u8])> {
        let mut items = Vec::new();
        let mut rest = &data[1..];

        loop {
            match rest.first() {
                None => return Err(parse_err("unterminated list")),
                Some(b'e') => return Ok((Self::List(items), &rest[1..])),
                Some(_) => {
                    let (item, tail) = Self::parse(rest)?;
                    items.push(item);
                    rest = tail;
                }
            }
        }
    }

    fn parse_dict(data: &[u8]) -> Result<(Self, &[u8])> {
        let mut entries = BTreeMap::new();
        let mut rest = &data[1..];
        let mut last_key: Option<Vec<u8>> = None;

        loop {
            match rest.first() {
                None => return Err(parse_err("unterminated dict")),
                Some(b'e') => return Ok((Self::Dict(entries), &rest[1..])),
                Some(_) => {
                    let (key_value, tail) = Self::parse_string(rest)?;
                    let key = match key_value {
                        Self::Bytes(k) => k,
                        _ => unreachable!("parse_string only yields Bytes"),
                    };

                    // BEP 3 requires keys in sorted order
                    if last_key.as_ref().is_some_and(|lk| &key <= lk) {
                        return Err(parse_err("dict keys out of order"));
                    }
                    last_key = Some(key.clone());

                    let (value, tail) = Self::parse(tail)?;
                    entries.insert(key, value);
                    rest = tail;
                }
            }
        }
    }

    /// Encode back to bencode bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => {
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(b);
            }
            Self::List(items) => {
                buf.push(b'l');
                for item in items {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(entries) => {
                buf.push(b'd');
                for (key, value) in entries {
                    buf.extend_from_slice(key.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(key);
                    value.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    /// Get as UTF-8 string
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as non-negative integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as raw bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dict
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a dict entry by key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

/// Locate the raw bytes of the top-level `info` dictionary.
///
/// The info hash is the SHA-1 of exactly these bytes, so they must be
/// sliced out of the original input rather than re-encoded.
pub fn find_info_dict_bytes(data: &[u8]) -> Result<&[u8]> {
    let root = BencodeValue::parse_exact(data)?;
    let dict = root
        .as_dict()
        .ok_or_else(|| parse_err("root is not a dict"))?;
    if !dict.contains_key(b"info".as_slice()) {
        return Err(parse_err("missing 'info' key"));
    }

    // Scan for "4:info" immediately followed by a dict, then re-parse from
    // there to find where that dict ends.
    let marker = b"4:info";
    for pos in 0..data.len() {
        if !data[pos..].starts_with(marker) {
            continue;
        }
        let start = pos + marker.len();
        if data.get(start) != Some(&b'd') {
            continue;
        }
        let (_, rest) = BencodeValue::parse(&data[start..])?;
        let end = data.len() - rest.len();
        return Ok(&data[start..end]);
    }

    Err(parse_err("could not locate info dict bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer() {
        let (value, rest) = BencodeValue::parse(b"i42e").unwrap();
        assert_eq!(value, BencodeValue::Integer(42));
        assert!(rest.is_empty());

        let (value, _) = BencodeValue::parse(b"i-42e").unwrap();
        assert_eq!(value, BencodeValue::Integer(-42));

        let (value, _) = BencodeValue::parse(b"i0e").unwrap();
        assert_eq!(value, BencodeValue::Integer(0));

        assert!(BencodeValue::parse(b"i03e").is_err());
        assert!(BencodeValue::parse(b"i-0e").is_err());
        assert!(BencodeValue::parse(b"i12").is_err());
    }

    #[test]
    fn test_parse_string() {
        let (value, rest) = BencodeValue::parse(b"4:spam").unwrap();
        assert_eq!(value, BencodeValue::Bytes(b"spam".to_vec()));
        assert!(rest.is_empty());

        let (value, _) = BencodeValue::parse(b"0:").unwrap();
        assert_eq!(value, BencodeValue::Bytes(vec![]));

        // binary content is allowed
        let (value, _) = BencodeValue::parse(b"5:\x00\x01\x02\x03\x04").unwrap();
        assert_eq!(value, BencodeValue::Bytes(vec![0, 1, 2, 3, 4]));

        // declared length runs past the input
        assert!(BencodeValue::parse(b"9:spam").is_err());
    }

    #[test]
    fn test_parse_list() {
        let (value, _) = BencodeValue::parse(b"l4:spami42ee").unwrap();
        let items = value.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], BencodeValue::Bytes(b"spam".to_vec()));
        assert_eq!(items[1], BencodeValue::Integer(42));

        let (value, _) = BencodeValue::parse(b"le").unwrap();
        assert_eq!(value, BencodeValue::List(vec![]));

        assert!(BencodeValue::parse(b"l4:spam").is_err());
    }

    #[test]
    fn test_parse_dict() {
        let (value, _) = BencodeValue::parse(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(
            value.get("cow"),
            Some(&BencodeValue::Bytes(b"moo".to_vec()))
        );
        assert_eq!(
            value.get("spam"),
            Some(&BencodeValue::Bytes(b"eggs".to_vec()))
        );

        // keys must be sorted
        assert!(BencodeValue::parse(b"d4:spam4:eggs3:cow3:mooe").is_err());
    }

    #[test]
    fn test_encode_roundtrip() {
        let original: &[u8] = b"d5:itemsli1ei2ei3ee4:name4:test5:valuei42ee";
        let value = BencodeValue::parse_exact(original).unwrap();
        assert_eq!(value.encode(), original);

        assert_eq!(value.get("name").and_then(|v| v.as_string()), Some("test"));
        assert_eq!(value.get("value").and_then(|v| v.as_int()), Some(42));
        assert_eq!(
            value.get("items").and_then(|v| v.as_list()).map(|l| l.len()),
            Some(3)
        );
    }

    #[test]
    fn test_parse_exact_rejects_trailing() {
        assert!(BencodeValue::parse_exact(b"i42ei43e").is_err());
    }

    #[test]
    fn test_find_info_dict_bytes() {
        let data = b"d8:announce9:udp://t:14:infod6:lengthi5e4:name1:xee";
        let info = find_info_dict_bytes(data).unwrap();
        assert_eq!(info, b"d6:lengthi5e4:name1:xe");

        assert!(find_info_dict_bytes(b"d8:announce9:udp://t:1e").is_err());
    }
}
