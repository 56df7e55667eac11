//! RESP (REdis Serialization Protocol) framing: decode bytes off the wire
//! into [`Frame`] values and encode [`Frame`] values back into bytes.
//! Bulk strings carry [`Bytes`] rather than `String` so they survive
//! arbitrary binary payloads byte-exactly.

use bytes::Bytes;

use crate::error::FramingError;

/// A single RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

impl Frame {
    pub fn simple(s: impl Into<String>) -> Self {
        Frame::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Frame::Error(s.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(data.into())
    }

    pub fn array(items: Vec<Frame>) -> Self {
        Frame::Array(items)
    }

    /// Returns the payload as a byte slice for frames that carry one (bulk
    /// and simple strings); used when pulling command arguments out of a
    /// decoded array.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Bulk(b) => Some(b),
            Frame::Simple(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Error(s) => {
                buf.push(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                buf.extend_from_slice(format!(":{n}\r\n").as_bytes());
            }
            Frame::Bulk(data) => {
                buf.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Null => buf.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                buf.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode_into(buf);
                }
            }
        }
    }
}

/// Finds the offset of the first `\r\n` in `buf[start..]`, if any.
fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
    if start >= buf.len() {
        return None;
    }
    buf[start..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| p + start)
}

fn parse_line_i64(line: &[u8]) -> Result<i64, FramingError> {
    std::str::from_utf8(line)
        .map_err(|_| FramingError::InvalidInteger)?
        .parse::<i64>()
        .map_err(|_| FramingError::InvalidInteger)
}

/// Attempts to decode one complete frame from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` holds an incomplete frame (the caller
/// should read more bytes and retry), `Ok(Some((frame, consumed)))` on
/// success, and `Err` for a frame that can never become well-formed no
/// matter how many more bytes arrive.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FramingError> {
    decode_at(buf, 0)
}

fn decode_at(buf: &[u8], pos: usize) -> Result<Option<(Frame, usize)>, FramingError> {
    if pos >= buf.len() {
        return Ok(None);
    }
    let type_byte = buf[pos];
    match type_byte {
        b'+' => decode_line(buf, pos + 1, Frame::Simple as fn(String) -> Frame),
        b'-' => decode_line(buf, pos + 1, Frame::Error as fn(String) -> Frame),
        b':' => decode_integer(buf, pos + 1),
        b'$' => decode_bulk(buf, pos + 1),
        b'*' => decode_array(buf, pos + 1),
        other => Err(FramingError::UnknownType(other)),
    }
}

fn decode_line(
    buf: &[u8],
    start: usize,
    wrap: fn(String) -> Frame,
) -> Result<Option<(Frame, usize)>, FramingError> {
    match find_crlf(buf, start) {
        None => Ok(None),
        Some(end) => {
            let s = std::str::from_utf8(&buf[start..end])
                .map_err(|_| FramingError::InvalidUtf8)?
                .to_string();
            Ok(Some((wrap(s), end + 2)))
        }
    }
}

fn decode_integer(buf: &[u8], start: usize) -> Result<Option<(Frame, usize)>, FramingError> {
    match find_crlf(buf, start) {
        None => Ok(None),
        Some(end) => {
            let n = parse_line_i64(&buf[start..end])?;
            Ok(Some((Frame::Integer(n), end + 2)))
        }
    }
}

fn decode_bulk(buf: &[u8], start: usize) -> Result<Option<(Frame, usize)>, FramingError> {
    let len_end = match find_crlf(buf, start) {
        None => return Ok(None),
        Some(end) => end,
    };
    let len = parse_line_i64(&buf[start..len_end])?;
    if len == -1 {
        return Ok(Some((Frame::Null, len_end + 2)));
    }
    if len < -1 {
        return Err(FramingError::InvalidLength(len));
    }
    let data_start = len_end + 2;
    let data_end = data_start + len as usize;
    if buf.len() < data_end + 2 {
        return Ok(None);
    }
    if &buf[data_end..data_end + 2] != b"\r\n" {
        return Err(FramingError::MissingTerminator);
    }
    let data = Bytes::copy_from_slice(&buf[data_start..data_end]);
    Ok(Some((Frame::Bulk(data), data_end + 2)))
}

fn decode_array(buf: &[u8], start: usize) -> Result<Option<(Frame, usize)>, FramingError> {
    let len_end = match find_crlf(buf, start) {
        None => return Ok(None),
        Some(end) => end,
    };
    let count = parse_line_i64(&buf[start..len_end])?;
    if count < 0 {
        return Ok(Some((Frame::Array(Vec::new()), len_end + 2)));
    }
    let mut pos = len_end + 2;
    let mut items = Vec::new();
    for _ in 0..count {
        match decode_at(buf, pos)? {
            None => return Ok(None),
            Some((frame, consumed)) => {
                items.push(frame);
                pos = consumed;
            }
        }
    }
    Ok(Some((Frame::Array(items), pos)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_simple_string() {
        let (frame, used) = decode(b"+OK\r\n").unwrap().unwrap();
        assert_eq!(frame, Frame::Simple("OK".into()));
        assert_eq!(used, 5);
    }

    #[test]
    fn decode_error() {
        let (frame, used) = decode(b"-ERR broken\r\n").unwrap().unwrap();
        assert_eq!(frame, Frame::Error("ERR broken".into()));
        assert_eq!(used, 13);
    }

    #[test]
    fn decode_integer_roundtrip() {
        for n in [0_i64, 1000, -1, -2300123] {
            let encoded = Frame::Integer(n).encode();
            let (frame, used) = decode(&encoded).unwrap().unwrap();
            assert_eq!(frame, Frame::Integer(n));
            assert_eq!(used, encoded.len());
        }
    }

    #[test]
    fn decode_bulk_string_binary_safe() {
        let payload = b"he\x00lo";
        let encoded = Frame::bulk(Bytes::copy_from_slice(payload)).encode();
        let (frame, used) = decode(&encoded).unwrap().unwrap();
        assert_eq!(frame, Frame::Bulk(Bytes::copy_from_slice(payload)));
        assert_eq!(used, encoded.len());
    }

    #[test]
    fn decode_empty_bulk_string() {
        let (frame, used) = decode(b"$0\r\n\r\n").unwrap().unwrap();
        assert_eq!(frame, Frame::Bulk(Bytes::new()));
        assert_eq!(used, 6);
    }

    #[test]
    fn decode_null_bulk_string() {
        let (frame, used) = decode(b"$-1\r\n").unwrap().unwrap();
        assert_eq!(frame, Frame::Null);
        assert_eq!(used, 5);
    }

    #[test]
    fn decode_empty_array() {
        let (frame, used) = decode(b"*0\r\n").unwrap().unwrap();
        assert_eq!(frame, Frame::Array(vec![]));
        assert_eq!(used, 4);
    }

    #[test]
    fn decode_nested_array() {
        let orig = b"*2\r\n*3\r\n:1\r\n:2\r\n:3\r\n*2\r\n+Hello\r\n-World\r\n";
        let (frame, used) = decode(orig).unwrap().unwrap();
        assert_eq!(used, orig.len());
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Array(vec![
                    Frame::Integer(1),
                    Frame::Integer(2),
                    Frame::Integer(3),
                ]),
                Frame::Array(vec![Frame::Simple("Hello".into()), Frame::Error("World".into())]),
            ])
        );
    }

    #[test]
    fn decode_needs_more_bytes() {
        assert!(decode(b"*2\r\n$3\r\nfoo\r\n").unwrap().is_none());
        assert!(decode(b"$5\r\nhel").unwrap().is_none());
        assert!(decode(b"+OK\r").unwrap().is_none());
    }

    #[test]
    fn decode_missing_terminator_is_an_error() {
        let err = decode(b"$3\r\nfooXX").unwrap_err();
        assert!(matches!(err, FramingError::MissingTerminator));
    }

    #[test]
    fn decode_is_inverse_of_encode_for_commands() {
        let set_cmd = Frame::Array(vec![
            Frame::bulk(Bytes::from_static(b"SET")),
            Frame::bulk(Bytes::from_static(b"foo")),
            Frame::bulk(Bytes::from_static(b"bar")),
        ]);
        let encoded = set_cmd.encode();
        let (decoded, used) = decode(&encoded).unwrap().unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded, set_cmd);
    }
}
