//! RESP2 command encoding and incremental reply parsing.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

const CRLF: &[u8] = b"\r\n";

/// Errors raised when a reply buffer cannot be a valid RESP frame.
///
/// An incomplete buffer is not an error; see [`try_parse_reply`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RespError {
    #[error("unknown reply type byte 0x{0:02x}")]
    UnknownType(u8),
    #[error("invalid length or integer: {0:?}")]
    InvalidNumber(String),
    #[error("bulk string is not terminated by CRLF")]
    MissingTerminator,
}

/// A decoded reply from the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`
    SimpleString(String),
    /// `-ERR ...`, a server-side error rather than a transport failure.
    Error(String),
    /// `:42`
    Integer(i64),
    /// `$3\r\nfoo`, possibly empty.
    BulkString(Bytes),
    /// `$-1` or `*-1`
    Null,
    /// `*2\r\n...`, elements may be of mixed kinds.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Returns the integer payload, if this is an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

/// Encode a command as an array of bulk strings.
pub fn encode_command<S: AsRef<[u8]>>(parts: &[S]) -> Bytes {
    let payload: usize = parts.iter().map(|p| p.as_ref().len() + 16).sum();
    let mut buf = BytesMut::with_capacity(16 + payload);
    buf.put_u8(b'*');
    buf.put_slice(parts.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    for part in parts {
        let part = part.as_ref();
        buf.put_u8(b'$');
        buf.put_slice(part.len().to_string().as_bytes());
        buf.put_slice(CRLF);
        buf.put_slice(part);
        buf.put_slice(CRLF);
    }
    buf.freeze()
}

/// Try to parse one reply from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, so the
/// caller can read more bytes and retry. On success returns the value and the
/// number of bytes it occupied.
pub fn try_parse_reply(buf: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
    parse_at(buf, 0)
}

fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some(&kind) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, after_line)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };

    match kind {
        b'+' => Ok(Some((RespValue::SimpleString(lossy(line)), after_line))),
        b'-' => Ok(Some((RespValue::Error(lossy(line)), after_line))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), after_line))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Null, after_line)));
            }
            let len = len as usize;
            let end = after_line + len;
            if buf.len() < end + CRLF.len() {
                return Ok(None);
            }
            if &buf[end..end + CRLF.len()] != CRLF {
                return Err(RespError::MissingTerminator);
            }
            let data = Bytes::copy_from_slice(&buf[after_line..end]);
            Ok(Some((RespValue::BulkString(data), end + CRLF.len())))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((RespValue::Null, after_line)));
            }
            let mut items = Vec::with_capacity(count.min(64) as usize);
            let mut cursor = after_line;
            for _ in 0..count {
                match parse_at(buf, cursor)? {
                    Some((item, next)) => {
                        items.push(item);
                        cursor = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), cursor)))
        }
        other => Err(RespError::UnknownType(other)),
    }
}

/// Find the CRLF-terminated line starting at `start`.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let idx = rest.windows(2).position(|w| w == CRLF)?;
    Some((&rest[..idx], start + idx + CRLF.len()))
}

fn parse_int(line: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| RespError::InvalidNumber(lossy(line)))
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let encoded = encode_command(&["AUTH", "secret"]);
        assert_eq!(&encoded[..], b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n");
    }

    #[test]
    fn test_encode_empty_part() {
        let encoded = encode_command(&["ECHO", ""]);
        assert_eq!(&encoded[..], b"*2\r\n$4\r\nECHO\r\n$0\r\n\r\n");
    }

    #[test]
    fn test_parse_simple_kinds() {
        assert_eq!(
            try_parse_reply(b"+OK\r\n").unwrap(),
            Some((RespValue::SimpleString("OK".into()), 5))
        );
        assert_eq!(
            try_parse_reply(b"-ERR wrong\r\n").unwrap(),
            Some((RespValue::Error("ERR wrong".into()), 12))
        );
        assert_eq!(
            try_parse_reply(b":-7\r\n").unwrap(),
            Some((RespValue::Integer(-7), 5))
        );
    }

    #[test]
    fn test_parse_bulk_strings() {
        let (value, used) = try_parse_reply(b"$5\r\nhello\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::BulkString(Bytes::from_static(b"hello")));
        assert_eq!(used, 11);

        let (value, used) = try_parse_reply(b"$0\r\n\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::BulkString(Bytes::new()));
        assert_eq!(used, 6);

        let (value, used) = try_parse_reply(b"$-1\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Null);
        assert_eq!(used, 5);
    }

    #[test]
    fn test_parse_nested_mixed_array() {
        let frame = b"*3\r\n:1\r\n*2\r\n+a\r\n$1\r\nb\r\n-no\r\n";
        let (value, used) = try_parse_reply(frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![
                    RespValue::SimpleString("a".into()),
                    RespValue::BulkString(Bytes::from_static(b"b")),
                ]),
                RespValue::Error("no".into()),
            ])
        );
    }

    #[test]
    fn test_incomplete_frames() {
        let frame = b"*2\r\n:3\r\n:59000\r\n";
        // Every strict prefix must report "incomplete", never an error.
        for cut in 0..frame.len() {
            assert_eq!(try_parse_reply(&frame[..cut]).unwrap(), None, "prefix {}", cut);
        }
        assert!(try_parse_reply(frame).unwrap().is_some());
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let (value, used) = try_parse_reply(b"+OK\r\n:1\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::SimpleString("OK".into()));
        assert_eq!(used, 5);
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(try_parse_reply(b"?what\r\n"), Err(RespError::UnknownType(b'?')));
        assert!(matches!(try_parse_reply(b":abc\r\n"), Err(RespError::InvalidNumber(_))));
        assert_eq!(try_parse_reply(b"$2\r\nabcd\r\n"), Err(RespError::MissingTerminator));
    }
}
