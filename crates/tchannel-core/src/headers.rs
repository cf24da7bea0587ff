//! Transport header maps and their two wire encodings.
//!
//! Init frames carry a u16 pair count with u16 length prefixes; call frames
//! carry a u8 pair count with u8 length prefixes. Both are sequences of
//! UTF-8 key/value strings, order-preserving.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{get_str_u8, get_str_u16, get_u8, get_u16, put_str_u8, put_str_u16};
use crate::error::ProtocolError;

/// An order-preserving string→string header map.
///
/// Maps are small (a handful of entries), so lookups scan linearly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair, replacing any existing entry with the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &str) -> bool) {
        self.entries.retain(|(k, v)| keep(k, v));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Encoded size of the call-frame (u8-prefixed) form, including the count.
pub(crate) fn call_encoded_len(headers: &Headers) -> usize {
    1 + headers
        .iter()
        .map(|(k, v)| 2 + k.len() + v.len())
        .sum::<usize>()
}

pub(crate) fn encode_call_headers(
    headers: &Headers,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if headers.len() > u8::MAX as usize {
        return Err(ProtocolError::StringTooLong {
            field: "nh",
            len: headers.len(),
            max: u8::MAX as usize,
        });
    }
    buf.put_u8(headers.len() as u8);
    for (key, value) in headers.iter() {
        put_str_u8(key, "header key", buf)?;
        put_str_u8(value, "header value", buf)?;
    }
    Ok(())
}

pub(crate) fn decode_call_headers(buf: &mut Bytes) -> Result<Headers, ProtocolError> {
    let count = get_u8(buf, "nh")?;
    let mut headers = Headers::new();
    for _ in 0..count {
        let key = get_str_u8(buf, "header key")?;
        let value = get_str_u8(buf, "header value")?;
        headers.insert(key, value);
    }
    Ok(headers)
}

pub(crate) fn encode_init_headers(
    headers: &Headers,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if headers.len() > u16::MAX as usize {
        return Err(ProtocolError::StringTooLong {
            field: "nh",
            len: headers.len(),
            max: u16::MAX as usize,
        });
    }
    buf.put_u16(headers.len() as u16);
    for (key, value) in headers.iter() {
        put_str_u16(key, "init header key", buf)?;
        put_str_u16(value, "init header value", buf)?;
    }
    Ok(())
}

pub(crate) fn decode_init_headers(buf: &mut Bytes) -> Result<Headers, ProtocolError> {
    let count = get_u16(buf, "nh")?;
    let mut headers = Headers::new();
    for _ in 0..count {
        let key = get_str_u16(buf, "init header key")?;
        let value = get_str_u16(buf, "init header value")?;
        headers.insert(key, value);
    }
    Ok(headers)
}
