//! RESP codec: translates between wire bytes and [`Message`] values.
//!
//! Decoding never hands out a partially built message. A buffer that ends
//! mid-message yields `Ok(None)` so the caller can read more bytes, and a
//! stream that closes while a message is pending is reported as
//! [`DecodeError::Truncated`] by the connection layer.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

const CRLF: &[u8] = b"\r\n";

/// One RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    /// `$-1\r\n`, used for "key not found".
    NullBulkString,
    Array(Vec<Message>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("protocol error: unknown type byte 0x{0:02x}")]
    UnknownType(u8),
    #[error("protocol error: invalid number {0:?}")]
    BadNumber(String),
    #[error("protocol error: negative length {0}")]
    NegativeLength(i64),
    #[error("protocol error: expected CRLF")]
    MissingCrlf,
    #[error("protocol error: line is not valid UTF-8")]
    InvalidUtf8,
    #[error("protocol error: stream ended mid-message")]
    Truncated,
    #[error("protocol error: arrays nested deeper than {0} levels")]
    TooDeep(usize),
}

/// How a top-level bulk payload may end when the buffer runs out right after it.
#[derive(Clone, Copy, PartialEq, Eq)]
enum PayloadEnd {
    /// Wait for more bytes: a CRLF may still be on its way.
    Framed,
    /// The payload is complete as is. Only the snapshot blob is sent this way.
    Unterminated,
}

impl Message {
    pub fn simple(s: impl Into<String>) -> Self {
        Message::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Message::Error(s.into())
    }

    pub fn bulk(b: impl Into<Bytes>) -> Self {
        Message::BulkString(b.into())
    }

    /// Builds a command frame: an array of bulk strings.
    pub fn command<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Message::Array(parts.into_iter().map(|p| Message::BulkString(p.into())).collect())
    }

    /// The payload of a string-typed message (simple or bulk).
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Message::SimpleString(s) => Some(s.as_bytes()),
            Message::BulkString(b) => Some(b),
            _ => None,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Message::SimpleString(s) => write_line(out, b'+', s.as_bytes()),
            Message::Error(s) => write_line(out, b'-', s.as_bytes()),
            Message::Integer(i) => write_line(out, b':', i.to_string().as_bytes()),
            Message::BulkString(b) => {
                write_line(out, b'$', b.len().to_string().as_bytes());
                out.extend_from_slice(b);
                out.extend_from_slice(CRLF);
            }
            Message::NullBulkString => out.extend_from_slice(b"$-1\r\n"),
            Message::Array(items) => {
                write_line(out, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }
}

fn write_line(out: &mut BytesMut, tag: u8, body: &[u8]) {
    out.reserve(body.len() + 3);
    out.extend_from_slice(&[tag]);
    out.extend_from_slice(body);
    out.extend_from_slice(CRLF);
}

/// Encodes the opaque snapshot blob: length-prefixed, with no trailing CRLF.
pub fn encode_snapshot(payload: &[u8], out: &mut BytesMut) {
    write_line(out, b'$', payload.len().to_string().as_bytes());
    out.extend_from_slice(payload);
}

/// Deepest array nesting accepted from the wire.
pub const MAX_DEPTH: usize = 64;

enum Parsed {
    /// The message and the index just past it.
    Complete(Message, usize),
    /// Nothing can complete until the buffer holds at least this many bytes.
    Incomplete(usize),
}

/// Decodes one message from the front of `buf`.
///
/// Returns the message and the number of bytes it occupied, or `Ok(None)`
/// when `buf` holds only a prefix of a message.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, DecodeError> {
    Ok(complete(parse(buf, 0, PayloadEnd::Framed, 0)?))
}

/// Like [`decode`], but a bulk payload that reaches the end of `buf` is taken
/// as complete. Used while waiting for the snapshot, which carries no CRLF.
pub fn decode_snapshot(buf: &[u8]) -> Result<Option<(Message, usize)>, DecodeError> {
    Ok(complete(parse(buf, 0, PayloadEnd::Unterminated, 0)?))
}

fn complete(parsed: Parsed) -> Option<(Message, usize)> {
    match parsed {
        Parsed::Complete(message, used) => Some((message, used)),
        Parsed::Incomplete(_) => None,
    }
}

/// Incremental decoder for one connection's byte stream.
///
/// A top-level array that arrives in pieces is consumed element by element,
/// so bytes already decoded are not parsed again on the next read.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    partial: Option<PartialArray>,
    need: usize,
    skip_crlf: bool,
}

#[derive(Debug)]
struct PartialArray {
    remaining: usize,
    items: Vec<Message>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder for the replication link: one CRLF trailing the snapshot is
    /// skipped, even when it arrives after the snapshot itself.
    pub fn after_snapshot() -> Self {
        Self {
            skip_crlf: true,
            ..Self::default()
        }
    }

    /// `false` while a message is half consumed from earlier reads.
    pub fn is_idle(&self) -> bool {
        self.partial.is_none()
    }

    /// Takes the next complete message off the front of `buf`.
    pub fn decode_next(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
        if buf.len() < self.need {
            return Ok(None);
        }
        self.need = 0;

        if self.skip_crlf && !buf.is_empty() {
            if &buf[..] == b"\r" {
                self.need = 2;
                return Ok(None);
            }
            if buf.starts_with(CRLF) {
                buf.advance(2);
            }
            self.skip_crlf = false;
        }

        if self.partial.is_none() {
            if buf.first() != Some(&b'*') {
                let parsed = parse(&buf[..], 0, PayloadEnd::Framed, 0)?;
                return Ok(self.finish(parsed, buf));
            }
            let Some((line, next)) = read_line(&buf[..], 1)? else {
                self.need = buf.len() + 1;
                return Ok(None);
            };
            let count = array_len(line, 0)?;
            buf.advance(next);
            self.partial = Some(PartialArray {
                remaining: count,
                items: Vec::with_capacity(count.min(64)),
            });
        }

        while let Some(partial) = self.partial.as_mut() {
            if partial.remaining == 0 {
                let items = self.partial.take().map(|p| p.items).unwrap_or_default();
                return Ok(Some(Message::Array(items)));
            }
            match parse(&buf[..], 0, PayloadEnd::Framed, 1)? {
                Parsed::Complete(item, used) => {
                    buf.advance(used);
                    partial.items.push(item);
                    partial.remaining -= 1;
                }
                Parsed::Incomplete(need) => {
                    self.need = need;
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    /// Drains every complete message from `buf` into `out`.
    pub fn decode_many(&mut self, buf: &mut BytesMut, out: &mut Vec<Message>) -> Result<(), DecodeError> {
        while let Some(message) = self.decode_next(buf)? {
            out.push(message);
        }
        Ok(())
    }

    fn finish(&mut self, parsed: Parsed, buf: &mut BytesMut) -> Option<Message> {
        match parsed {
            Parsed::Complete(message, used) => {
                buf.advance(used);
                Some(message)
            }
            Parsed::Incomplete(need) => {
                self.need = need;
                None
            }
        }
    }
}

fn parse(buf: &[u8], pos: usize, end: PayloadEnd, depth: usize) -> Result<Parsed, DecodeError> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(Parsed::Incomplete(pos + 1));
    };
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(Parsed::Incomplete(buf.len() + 1));
    };
    match tag {
        b'+' => Ok(Parsed::Complete(Message::SimpleString(utf8(line)?), next)),
        b'-' => Ok(Parsed::Complete(Message::Error(utf8(line)?), next)),
        b':' => Ok(Parsed::Complete(Message::Integer(parse_int(line)?), next)),
        b'$' => parse_bulk(buf, parse_int(line)?, next, end),
        b'*' => {
            let count = array_len(line, depth)?;
            let mut items = Vec::with_capacity(count.min(64));
            let mut cursor = next;
            for _ in 0..count {
                match parse(buf, cursor, PayloadEnd::Framed, depth + 1)? {
                    Parsed::Complete(item, after) => {
                        items.push(item);
                        cursor = after;
                    }
                    incomplete => return Ok(incomplete),
                }
            }
            Ok(Parsed::Complete(Message::Array(items), cursor))
        }
        other => Err(DecodeError::UnknownType(other)),
    }
}

/// Element count of an array header found at nesting level `depth`.
fn array_len(line: &[u8], depth: usize) -> Result<usize, DecodeError> {
    let count = parse_int(line)?;
    if count < 0 {
        return Err(DecodeError::NegativeLength(count));
    }
    if depth >= MAX_DEPTH {
        return Err(DecodeError::TooDeep(MAX_DEPTH));
    }
    usize::try_from(count).map_err(|_| DecodeError::BadNumber(count.to_string()))
}

fn parse_bulk(buf: &[u8], len: i64, start: usize, end: PayloadEnd) -> Result<Parsed, DecodeError> {
    if len == -1 {
        return Ok(Parsed::Complete(Message::NullBulkString, start));
    }
    if len < 0 {
        return Err(DecodeError::NegativeLength(len));
    }
    let payload_end = usize::try_from(len)
        .ok()
        .and_then(|len| start.checked_add(len))
        .ok_or_else(|| DecodeError::BadNumber(len.to_string()))?;
    if buf.len() < payload_end {
        let need = match end {
            PayloadEnd::Framed => payload_end + 1,
            PayloadEnd::Unterminated => payload_end,
        };
        return Ok(Parsed::Incomplete(need));
    }

    // The CRLF after a payload is consumed only when it is actually there.
    let consumed = match buf.get(payload_end) {
        Some(b'\r') => match buf.get(payload_end + 1) {
            Some(b'\n') => payload_end + 2,
            Some(_) => return Err(DecodeError::MissingCrlf),
            None => return Ok(Parsed::Incomplete(payload_end + 2)),
        },
        Some(_) => payload_end,
        None if end == PayloadEnd::Unterminated => payload_end,
        None => return Ok(Parsed::Incomplete(payload_end + 1)),
    };
    let payload = Bytes::copy_from_slice(&buf[start..payload_end]);
    Ok(Parsed::Complete(Message::BulkString(payload), consumed))
}

/// Returns the bytes up to the next CRLF and the index just past it.
fn read_line(buf: &[u8], pos: usize) -> Result<Option<(&[u8], usize)>, DecodeError> {
    let rest = buf.get(pos..).unwrap_or_default();
    let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    if nl == 0 || rest[nl - 1] != b'\r' {
        return Err(DecodeError::MissingCrlf);
    }
    Ok(Some((&rest[..nl - 1], pos + nl + 1)))
}

fn utf8(line: &[u8]) -> Result<String, DecodeError> {
    std::str::from_utf8(line)
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidUtf8)
}

fn parse_int(line: &[u8]) -> Result<i64, DecodeError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| DecodeError::BadNumber(String::from_utf8_lossy(line).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Message, usize) {
        decode(input).unwrap().expect("complete message")
    }

    #[test]
    fn decodes_each_scalar_type() {
        assert_eq!(decode_all(b"+PONG\r\n"), (Message::simple("PONG"), 7));
        assert_eq!(decode_all(b"-ERR boom\r\n"), (Message::error("ERR boom"), 11));
        assert_eq!(decode_all(b":-42\r\n"), (Message::Integer(-42), 6));
        assert_eq!(decode_all(b"$3\r\nfoo\r\n"), (Message::bulk("foo"), 9));
        assert_eq!(decode_all(b"$0\r\n\r\n"), (Message::bulk(""), 6));
        assert_eq!(decode_all(b"$-1\r\n"), (Message::NullBulkString, 5));
    }

    #[test]
    fn decodes_command_array() {
        let (msg, used) = decode_all(b"*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n");
        assert_eq!(msg, Message::command(["ECHO", "hi"]));
        assert_eq!(used, 22);
        assert_eq!(decode_all(b"*0\r\n"), (Message::Array(vec![]), 4));
    }

    #[test]
    fn partial_input_needs_more_bytes() {
        let full = b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n";
        for cut in 0..full.len() {
            assert_eq!(decode(&full[..cut]).unwrap(), None, "cut at {cut}");
        }
        assert!(decode(full).unwrap().is_some());
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert_eq!(decode(b"?x\r\n"), Err(DecodeError::UnknownType(b'?')));
        assert!(matches!(decode(b"$abc\r\n"), Err(DecodeError::BadNumber(_))));
        assert_eq!(decode(b"$-2\r\n"), Err(DecodeError::NegativeLength(-2)));
        assert_eq!(decode(b"*-1\r\n"), Err(DecodeError::NegativeLength(-1)));
        assert_eq!(decode(b"+OK\n"), Err(DecodeError::MissingCrlf));
        assert_eq!(decode(b"$2\r\nab\rx"), Err(DecodeError::MissingCrlf));
    }

    #[test]
    fn bulk_without_trailing_crlf_is_tolerated_when_followed_by_data() {
        let mut input = b"$3\r\nabc".to_vec();
        input.extend_from_slice(b"+OK\r\n");
        let (msg, used) = decode_all(&input);
        assert_eq!(msg, Message::bulk("abc"));
        assert_eq!(used, 7);
        assert_eq!(decode_all(&input[used..]).0, Message::simple("OK"));
    }

    #[test]
    fn snapshot_decoder_completes_at_end_of_buffer() {
        let mut out = BytesMut::new();
        encode_snapshot(b"REDIS0011", &mut out);
        assert_eq!(&out[..], b"$9\r\nREDIS0011");

        // The framed decoder cannot tell whether a CRLF is still coming.
        assert_eq!(decode(&out).unwrap(), None);
        let (msg, used) = decode_snapshot(&out).unwrap().unwrap();
        assert_eq!(msg, Message::bulk("REDIS0011"));
        assert_eq!(used, out.len());

        // A CRLF, if the sender added one, is still consumed.
        out.extend_from_slice(CRLF);
        assert_eq!(decode_snapshot(&out).unwrap().unwrap().1, out.len());
    }

    #[test]
    fn encodes_wire_format() {
        assert_eq!(&Message::simple("OK").to_bytes()[..], b"+OK\r\n");
        assert_eq!(&Message::error("ERR x").to_bytes()[..], b"-ERR x\r\n");
        assert_eq!(&Message::Integer(7).to_bytes()[..], b":7\r\n");
        assert_eq!(&Message::NullBulkString.to_bytes()[..], b"$-1\r\n");
        assert_eq!(
            &Message::command(["REPLCONF", "ACK", "0"]).to_bytes()[..],
            b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$1\r\n0\r\n"
        );
    }

    #[test]
    fn array_with_non_string_elements_encodes_every_element() {
        // Older encoders dropped integer and nested elements from the body while
        // still declaring the full count. Every element must be written.
        let msg = Message::Array(vec![
            Message::bulk("a"),
            Message::Integer(1),
            Message::Array(vec![Message::NullBulkString]),
            Message::error("ERR e"),
        ]);
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[..], b"*4\r\n$1\r\na\r\n:1\r\n*1\r\n$-1\r\n-ERR e\r\n");
        assert_eq!(decode_all(&bytes), (msg, bytes.len()));
    }

    #[test]
    fn round_trips_binary_bulk() {
        let msg = Message::Array(vec![
            Message::bulk(&b"\x00\r\n\xff"[..]),
            Message::simple("FULLRESYNC abc 0"),
        ]);
        let bytes = msg.to_bytes();
        assert_eq!(decode_all(&bytes), (msg, bytes.len()));
    }

    #[test]
    fn stream_decoder_drains_pipelined_commands() {
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n*2\r\n$4"[..]);
        let mut decoder = StreamDecoder::new();
        let mut out = Vec::new();
        decoder.decode_many(&mut buf, &mut out).unwrap();
        assert_eq!(out, vec![Message::command(["PING"]), Message::command(["PING"])]);
        assert!(!decoder.is_idle());

        buf.extend_from_slice(b"\r\nECHO\r\n$2\r\nhi\r\n");
        decoder.decode_many(&mut buf, &mut out).unwrap();
        assert_eq!(out[2], Message::command(["ECHO", "hi"]));
        assert!(decoder.is_idle());
        assert!(buf.is_empty());
    }

    #[test]
    fn stream_decoder_handles_byte_at_a_time_input() {
        let mut wire = BytesMut::new();
        let keys: Vec<String> = (0..50).map(|i| format!("key:{i}")).collect();
        let del = Message::command(std::iter::once("DEL".to_string()).chain(keys.iter().cloned()));
        del.encode(&mut wire);
        Message::simple("OK").encode(&mut wire);
        Message::bulk("tail").encode(&mut wire);

        let mut decoder = StreamDecoder::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for byte in wire.iter() {
            buf.extend_from_slice(&[*byte]);
            decoder.decode_many(&mut buf, &mut out).unwrap();
        }
        assert_eq!(out, vec![del, Message::simple("OK"), Message::bulk("tail")]);
        assert!(decoder.is_idle());
        assert!(buf.is_empty());
    }

    #[test]
    fn stream_decoder_waits_for_large_bulk_payloads() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$10\r\n0123"[..]);
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.decode_next(&mut buf).unwrap(), None);
        // The hint keeps short reads from being parsed at all.
        buf.extend_from_slice(b"45");
        assert_eq!(decoder.decode_next(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"$10\r\n012345");
        buf.extend_from_slice(b"6789\r\n");
        assert_eq!(decoder.decode_next(&mut buf).unwrap(), Some(Message::command(["GET", "0123456789"])));
    }

    #[test]
    fn deep_nesting_is_rejected_not_recursed() {
        let nested = |levels: usize| {
            let mut input = b"*1\r\n".repeat(levels);
            input.extend_from_slice(b"+x\r\n");
            input
        };
        assert!(decode(&nested(MAX_DEPTH)).unwrap().is_some());
        assert_eq!(decode(&nested(MAX_DEPTH + 1)), Err(DecodeError::TooDeep(MAX_DEPTH)));

        let hostile = nested(200_000);
        assert_eq!(decode(&hostile), Err(DecodeError::TooDeep(MAX_DEPTH)));
        // Rejected before the rest of the message has even arrived.
        assert_eq!(decode(&hostile[..4 * 100]), Err(DecodeError::TooDeep(MAX_DEPTH)));

        let mut buf = BytesMut::from(&hostile[..]);
        let mut out = Vec::new();
        assert_eq!(
            StreamDecoder::new().decode_many(&mut buf, &mut out),
            Err(DecodeError::TooDeep(MAX_DEPTH))
        );
    }

    #[test]
    fn link_decoder_skips_snapshot_crlf_arriving_late() {
        let mut decoder = StreamDecoder::after_snapshot();
        let mut buf = BytesMut::from(&b"\r"[..]);
        let mut out = Vec::new();
        decoder.decode_many(&mut buf, &mut out).unwrap();
        assert!(out.is_empty());

        buf.extend_from_slice(b"\n*1\r\n$4\r\nPING\r\n");
        decoder.decode_many(&mut buf, &mut out).unwrap();
        assert_eq!(out, vec![Message::command(["PING"])]);

        // Only once: a later stray CRLF is still a protocol error.
        buf.extend_from_slice(b"\r\n");
        assert!(decoder.decode_many(&mut buf, &mut out).is_err());
    }

    #[test]
    fn client_decoder_does_not_skip_crlf() {
        let mut buf = BytesMut::from(&b"\r\n"[..]);
        let mut out = Vec::new();
        assert!(StreamDecoder::new().decode_many(&mut buf, &mut out).is_err());
    }
}
