use std::collections::HashMap;

use thiserror::Error;

use crate::message::Message;

/// Required header naming the body byte count.
pub const CONTENT_LENGTH_HEADER: &str = "Content-Length";
/// Optional header naming the body mime type.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
/// Optional header naming a body transform.
pub const CONTENT_ENCODING_HEADER: &str = "Content-Encoding";
/// Mime type assumed when no `Content-Type` header is present.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json; charset=utf-8";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const BUFFER_QUANTUM: usize = 8192;

/// Error produced while parsing a header block.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("header block is not valid ASCII")]
    NonAsciiHeader,
}

/// Error produced by a content-type codec or content encoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message body: {0}")]
    Encode(String),
    #[error("failed to decode message body: {0}")]
    Decode(String),
}

/// Growable byte buffer holding at most one in-progress message.
///
/// Capacity grows in 8 KiB quanta with one spare quantum of headroom, so a
/// stream of similarly-sized messages settles on a stable allocation.
#[derive(Debug, Default)]
pub struct FramingBuffer {
    data: Vec<u8>,
}

impl FramingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Copies `chunk` into the buffer, growing capacity quantum-wise.
    pub fn append(&mut self, chunk: &[u8]) {
        let required = self.data.len() + chunk.len();
        if required > self.data.capacity() {
            let capacity = required.div_ceil(BUFFER_QUANTUM) * BUFFER_QUANTUM + BUFFER_QUANTUM;
            self.data.reserve_exact(capacity - self.data.len());
        }
        self.data.extend_from_slice(chunk);
    }

    /// Scans for a complete `\r\n\r\n`-terminated header block.
    ///
    /// On success the block is consumed and returned as a key/value map.
    /// `Ok(None)` means more bytes are needed.
    pub fn try_read_headers(&mut self) -> Result<Option<HashMap<String, String>>, FramingError> {
        let Some(end) = self
            .data
            .windows(HEADER_TERMINATOR.len())
            .position(|window| window == HEADER_TERMINATOR)
        else {
            return Ok(None);
        };

        let block = std::str::from_utf8(&self.data[..end])
            .map_err(|_| FramingError::NonAsciiHeader)?;

        let mut headers = HashMap::new();
        for line in block.split("\r\n") {
            let Some(colon) = line.find(':') else {
                return Err(FramingError::MalformedHeader(line.to_string()));
            };
            let key = line[..colon].to_string();
            let value = line[colon + 1..].trim().to_string();
            headers.insert(key, value);
        }

        self.data.drain(..end + HEADER_TERMINATOR.len());
        Ok(Some(headers))
    }

    /// Takes the next `length` body bytes if they are all buffered.
    pub fn try_read_body(&mut self, length: usize) -> Option<Vec<u8>> {
        if self.data.len() < length {
            return None;
        }
        Some(self.data.drain(..length).collect())
    }
}

/// Case-insensitive header lookup.
pub fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Emits the ASCII header block for a body of `length` bytes.
///
/// `Content-Type` is only written when it differs from the default, matching
/// what peers assume for an absent header.
pub fn write_frame_headers(
    out: &mut Vec<u8>,
    length: usize,
    content_type: Option<&str>,
    content_encoding: Option<&str>,
) {
    out.extend_from_slice(format!("{CONTENT_LENGTH_HEADER}: {length}\r\n").as_bytes());
    if let Some(content_type) = content_type {
        out.extend_from_slice(format!("{CONTENT_TYPE_HEADER}: {content_type}\r\n").as_bytes());
    }
    if let Some(encoding) = content_encoding {
        out.extend_from_slice(format!("{CONTENT_ENCODING_HEADER}: {encoding}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
}

/// Whether a received `Content-Type` is compatible with the expected one.
///
/// Mime types are compared case-insensitively ignoring parameters; a charset
/// parameter, when present, must be UTF-8.
pub fn content_type_matches(received: &str, expected: &str) -> bool {
    let mime = |value: &str| {
        value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    };
    if mime(received) != mime(expected) {
        return false;
    }
    for parameter in received.split(';').skip(1) {
        if let Some(charset) = parameter.trim().strip_prefix("charset=") {
            if !charset.trim().eq_ignore_ascii_case("utf-8") {
                return false;
            }
        }
    }
    true
}

/// Encodes and decodes message bodies for one mime type.
pub trait ContentTypeCodec: Send + Sync {
    /// Mime type announced in `Content-Type`.
    fn content_type(&self) -> &str;
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, body: &[u8]) -> Result<Message, CodecError>;
}

/// The `application/json; charset=utf-8` codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonContentCodec;

impl ContentTypeCodec for JsonContentCodec {
    fn content_type(&self) -> &str {
        DEFAULT_CONTENT_TYPE
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&message.to_value()).map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode(&self, body: &[u8]) -> Result<Message, CodecError> {
        let value = serde_json::from_slice(body).map_err(|err| CodecError::Decode(err.to_string()))?;
        Ok(Message::from_value(value))
    }
}

/// Body transform applied after content-type encoding and before decoding.
pub trait ContentEncoding: Send + Sync {
    /// Name carried in `Content-Encoding`.
    fn name(&self) -> &str;
    fn encode(&self, body: Vec<u8>) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, body: Vec<u8>) -> Result<Vec<u8>, CodecError>;
}

/// Builds an accept-encoding value with descending q-values.
///
/// The first (most preferred) encoding is emitted bare (`q=1`); the rest
/// interpolate across `[1, 0]` as `q = ⌊10·(n−1−i)/(n−1)⌋/10`, so the least
/// preferred entry is pinned to exactly `q=0` for every list length.
pub fn accept_encoding_value(encodings: &[&str]) -> String {
    let n = encodings.len();
    encodings
        .iter()
        .enumerate()
        .map(|(i, name)| {
            if i == 0 {
                (*name).to_string()
            } else {
                let tenths = (10 * (n - 1 - i)) / (n - 1);
                if tenths == 0 {
                    format!("{name};q=0")
                } else {
                    format!("{name};q=0.{tenths}")
                }
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
