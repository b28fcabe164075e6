//! Cache entry header record
//!
//! Every stored entry is laid out as `[MessagePack header][raw body]`. The header is a
//! named-field map tagged with a format version, so older records can be recognised and
//! rejected instead of misread.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use hyper::StatusCode;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::{self, Cursor};

use super::{BodyStream, CacheEntry, CacheError};

/// Current on-disk header format
pub const FORMAT_VERSION: u32 = 1;

/// Upper bound on the encoded header; anything larger is treated as corruption
pub const MAX_HEADER_BYTES: usize = 1024 * 1024;

// ============================================================================
// Header fields
// ============================================================================

/// Response header fields in insertion order.
///
/// Names keep the case they were given with. A name may carry several values, and the order
/// of those values is preserved. Lookups with [`HeaderFields::get`] ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    fields: Vec<(String, Vec<String>)>,
}

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, merging into an existing field with exactly the same name
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, values)) => values.push(value),
            None => self.fields.push((name, vec![value])),
        }
    }

    /// Replace all values of a field, keeping its position if it already exists
    pub fn set(&mut self, name: impl Into<String>, values: Vec<String>) {
        let name = name.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, existing)) => *existing = values,
            None => self.fields.push((name, values)),
        }
    }

    /// All values of the first field whose name matches, ignoring ASCII case
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.fields
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    /// First value of a field, ignoring ASCII case
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderFields {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut fields = HeaderFields::new();
        for (name, value) in iter {
            fields.add(name, value);
        }
        fields
    }
}

impl Serialize for HeaderFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, values) in &self.fields {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldsVisitor;

        impl<'de> Visitor<'de> for FieldsVisitor {
            type Value = HeaderFields;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of header names to value lists")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut fields = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, values)) = access.next_entry::<String, Vec<String>>()? {
                    fields.push((name, values));
                }
                Ok(HeaderFields { fields })
            }
        }

        deserializer.deserialize_map(FieldsVisitor)
    }
}

// ============================================================================
// Entry header
// ============================================================================

/// Structured record stored ahead of the body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub version: u32,
    pub status: u16,
    pub headers: HeaderFields,
    /// `None` when the upstream did not declare a length
    pub content_length: Option<u64>,
}

impl EntryHeader {
    pub fn new(status: StatusCode, headers: HeaderFields, content_length: Option<u64>) -> Self {
        Self {
            version: FORMAT_VERSION,
            status: status.as_u16(),
            headers,
            content_length,
        }
    }

    /// Header describing an entry about to be written
    pub fn for_entry(entry: &CacheEntry) -> Self {
        Self::new(entry.status, entry.headers.clone(), entry.content_length)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Try to decode a header from the front of `buf`.
    ///
    /// Returns the header and the number of bytes it occupied, or `None` when `buf` ends
    /// before the header does.
    pub fn decode_prefix(buf: &[u8]) -> Result<Option<(Self, usize)>, CacheError> {
        let mut cursor = Cursor::new(buf);
        let decoded = {
            let mut deserializer = rmp_serde::Deserializer::new(&mut cursor);
            EntryHeader::deserialize(&mut deserializer)
        };

        match decoded {
            Ok(header) => {
                if header.version != FORMAT_VERSION {
                    return Err(CacheError::UnsupportedVersion(header.version));
                }
                Ok(Some((header, cursor.position() as usize)))
            }
            Err(err) if ends_early(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn ends_early(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Decode a stored record into an entry.
///
/// Chunks are pulled from `source` until the header decodes. The decoder usually overshoots
/// into the body, so the body handed back is the leftover bytes of that buffer followed by
/// the rest of `source`.
pub async fn decode_entry(mut source: BodyStream) -> Result<CacheEntry, CacheError> {
    let mut buf = BytesMut::new();

    loop {
        if let Some((header, consumed)) = EntryHeader::decode_prefix(&buf)? {
            let status = StatusCode::from_u16(header.status)
                .map_err(|_| CacheError::InvalidStatus(header.status))?;
            let leftover = buf.split_off(consumed).freeze();
            let body = if leftover.is_empty() {
                source
            } else {
                stream::once(async move { Ok::<Bytes, io::Error>(leftover) })
                    .chain(source)
                    .boxed()
            };

            return Ok(CacheEntry {
                status,
                headers: header.headers,
                content_length: header.content_length,
                body,
            });
        }

        if buf.len() > MAX_HEADER_BYTES {
            return Err(CacheError::HeaderTooLarge(buf.len()));
        }

        match source.next().await {
            Some(chunk) => buf.extend_from_slice(&chunk?),
            None => return Err(CacheError::Truncated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{collect_body, full_body};

    fn sample_header() -> EntryHeader {
        let mut headers = HeaderFields::new();
        headers.add("Content-Type", "text/html");
        headers.add("Set-Cookie", "a=1");
        headers.add("Set-Cookie", "b=2");
        EntryHeader::new(StatusCode::OK, headers, Some(11))
    }

    /// Split a byte slice into a stream of tiny chunks to exercise partial decoding
    fn chunked(data: Vec<u8>, size: usize) -> BodyStream {
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks).boxed()
    }

    #[test]
    fn test_header_fields_preserve_order_and_case() {
        let mut fields = HeaderFields::new();
        fields.add("X-B", "1");
        fields.add("x-a", "2");
        fields.add("X-B", "3");

        let names: Vec<&str> = fields.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["X-B", "x-a"]);
        assert_eq!(fields.get("x-b"), Some(&["1".to_string(), "3".to_string()][..]));
        assert_eq!(fields.first("X-A"), Some("2"));
        assert!(fields.get("missing").is_none());
    }

    #[test]
    fn test_header_fields_set_replaces_values() {
        let mut fields: HeaderFields = [("Accept", "a"), ("Accept", "b")].into_iter().collect();
        fields.set("Accept", vec!["c".to_string()]);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.first("accept"), Some("c"));
    }

    #[test]
    fn test_decode_prefix_reports_consumed_length() {
        let header = sample_header();
        let mut bytes = header.encode().unwrap();
        let header_len = bytes.len();
        bytes.extend_from_slice(b"hello world");

        let (decoded, consumed) = EntryHeader::decode_prefix(&bytes).unwrap().unwrap();
        assert_eq!(decoded, header);
        assert_eq!(consumed, header_len);
    }

    #[test]
    fn test_decode_prefix_incomplete() {
        let bytes = sample_header().encode().unwrap();
        for cut in [0, 1, bytes.len() / 2, bytes.len() - 1] {
            assert!(EntryHeader::decode_prefix(&bytes[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn test_decode_prefix_rejects_unknown_version() {
        let mut header = sample_header();
        header.version = 99;
        let bytes = rmp_serde::to_vec_named(&header).unwrap();
        assert!(matches!(
            EntryHeader::decode_prefix(&bytes),
            Err(CacheError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_decode_prefix_rejects_garbage() {
        // A bare integer is a complete MessagePack value but not a header map
        assert!(EntryHeader::decode_prefix(&[0x05, 0x01, 0x02]).is_err());
    }

    #[tokio::test]
    async fn test_decode_entry_keeps_buffered_body_bytes() {
        let mut bytes = sample_header().encode().unwrap();
        bytes.extend_from_slice(b"hello world");

        // 7-byte chunks guarantee the header and body share a chunk
        let entry = decode_entry(chunked(bytes, 7)).await.unwrap();
        assert_eq!(entry.status, StatusCode::OK);
        assert_eq!(entry.content_length, Some(11));
        assert_eq!(entry.headers.get("set-cookie").unwrap().len(), 2);

        let body = collect_body(entry.body).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_decode_entry_single_chunk() {
        let mut bytes = sample_header().encode().unwrap();
        bytes.extend_from_slice(b"hello world");

        let entry = decode_entry(full_body(bytes)).await.unwrap();
        let body = collect_body(entry.body).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_decode_entry_truncated_header() {
        let bytes = sample_header().encode().unwrap();
        let cut = bytes[..bytes.len() - 3].to_vec();
        assert!(matches!(
            decode_entry(chunked(cut, 4)).await,
            Err(CacheError::Truncated)
        ));
    }
}
