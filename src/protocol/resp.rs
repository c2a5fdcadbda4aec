/// Redis RESP2 (Redis Serialization Protocol) parsing and generation

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::str;

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n)
    BulkString(Option<Bytes>), // None represents NULL
    /// Array (*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n)
    Array(Option<Vec<RespValue>>), // None represents NULL array
}

/// Largest bulk string accepted, matching the server's `proto-max-bulk-len`
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest element count accepted for a single array
pub const MAX_ARRAY_LEN: i64 = 1 << 24;

/// Arrays nested deeper than this are rejected instead of recursed into
pub const MAX_NESTING_DEPTH: usize = 32;

/// Longest type/length header line; beyond this without a CRLF the stream
/// is not RESP
const MAX_HEADER_LEN: usize = 64 * 1024;

/// RESP parser for reading replies off a connection buffer
pub struct RespParser;

/// RESP encoder for writing commands
pub struct RespEncoder;

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum RespParseError {
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Invalid integer: {0}")]
    InvalidInteger(String),
}

impl RespValue {
    pub fn bulk<B: Into<Bytes>>(data: B) -> Self {
        RespValue::BulkString(Some(data.into()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }

    /// View a string-like reply as text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(Some(b)) => str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            RespValue::BulkString(Some(b)) => btoi::btoi(b).ok(),
            _ => None,
        }
    }

    /// Consume a string-like reply into raw bytes
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            RespValue::SimpleString(s) => Some(Bytes::from(s)),
            RespValue::BulkString(b) => b,
            _ => None,
        }
    }

    /// Consume an array reply; a NULL array becomes empty
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(Some(items)) => Some(items),
            RespValue::Array(None) => Some(Vec::new()),
            _ => None,
        }
    }

    /// Interpret a flat `[field, value, field, value, ...]` array, as
    /// returned by HGETALL and the SENTINEL info commands
    pub fn into_field_map(self) -> Option<HashMap<String, Bytes>> {
        let items = self.into_array()?;
        if items.len() % 2 != 0 {
            return None;
        }

        let mut map = HashMap::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            let field = field.into_bytes()?;
            let field = String::from_utf8(field.to_vec()).ok()?;
            map.insert(field, value.into_bytes()?);
        }
        Some(map)
    }
}

impl RespParser {
    /// Parse one complete RESP value from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the value is not
    /// complete yet, so the caller can read more bytes and try again.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        match Self::decode(&buf[..])? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Decode a value from a byte slice without consuming it, returning the
    /// value and the number of bytes it spans
    pub fn decode(data: &[u8]) -> Result<Option<(RespValue, usize)>, RespParseError> {
        Self::decode_nested(data, 0)
    }

    fn decode_nested(data: &[u8], depth: usize) -> Result<Option<(RespValue, usize)>, RespParseError> {
        if data.is_empty() {
            return Ok(None);
        }
        if depth > MAX_NESTING_DEPTH {
            return Err(RespParseError::InvalidFormat(format!(
                "nesting deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }

        let Some(line_end) = find_crlf(data) else {
            if data.len() > MAX_HEADER_LEN {
                return Err(RespParseError::InvalidFormat(format!(
                    "no line terminator within {} bytes",
                    MAX_HEADER_LEN
                )));
            }
            return Ok(None);
        };
        if line_end == 0 {
            return Err(RespParseError::InvalidFormat("empty frame header".to_string()));
        }
        let line = &data[1..line_end];
        let header_len = line_end + 2;

        match data[0] {
            b'+' => Ok(Some((
                RespValue::SimpleString(str::from_utf8(line)?.to_string()),
                header_len,
            ))),
            b'-' => Ok(Some((
                RespValue::Error(str::from_utf8(line)?.to_string()),
                header_len,
            ))),
            b':' => Ok(Some((RespValue::Integer(parse_int(line)?), header_len))),
            b'$' => {
                let size = parse_int(line)?;
                if size == -1 {
                    return Ok(Some((RespValue::BulkString(None), header_len)));
                }
                if size < 0 || size > MAX_BULK_LEN {
                    return Err(RespParseError::InvalidFormat(format!(
                        "Invalid bulk string size {}",
                        size
                    )));
                }

                let size = size as usize;
                let total = header_len + size + 2;
                if data.len() < total {
                    return Ok(None);
                }
                if &data[header_len + size..total] != b"\r\n" {
                    return Err(RespParseError::InvalidFormat(
                        "Missing \\r\\n after bulk string".to_string(),
                    ));
                }

                let content = Bytes::copy_from_slice(&data[header_len..header_len + size]);
                Ok(Some((RespValue::BulkString(Some(content)), total)))
            }
            b'*' => {
                let size = parse_int(line)?;
                if size == -1 {
                    return Ok(Some((RespValue::Array(None), header_len)));
                }
                if size < 0 || size > MAX_ARRAY_LEN {
                    return Err(RespParseError::InvalidFormat(format!(
                        "Invalid array size {}",
                        size
                    )));
                }

                let mut offset = header_len;
                let mut elements = Vec::with_capacity((size as usize).min(1024));
                for _ in 0..size {
                    match Self::decode_nested(&data[offset..], depth + 1)? {
                        Some((element, used)) => {
                            elements.push(element);
                            offset += used;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((RespValue::Array(Some(elements)), offset)))
            }
            other => Err(RespParseError::InvalidFormat(format!(
                "Unknown RESP type: {}",
                other as char
            ))),
        }
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn parse_int(line: &[u8]) -> Result<i64, RespParseError> {
    btoi::btoi::<i64>(line)
        .map_err(|_| RespParseError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))
}

impl RespEncoder {
    /// Encode a RESP value to bytes
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, value);
        buf.freeze()
    }

    /// Encode a RESP value into an existing buffer
    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
        }
    }

    /// Encode a command as an array of bulk strings, the only request form
    /// Redis accepts from clients
    pub fn encode_command_into(buf: &mut BytesMut, args: &[Bytes]) {
        buf.put_u8(b'*');
        buf.extend_from_slice(args.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        for arg in args {
            buf.put_u8(b'$');
            buf.extend_from_slice(arg.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            buf.extend_from_slice(arg);
            buf.put_slice(b"\r\n");
        }
    }
}
