//! Redis RESP3 value model, parser, and serializer.
//!
//! The parser is a recursive reader driven by the leading type byte; the
//! serializer is its inverse on every type the parser accepts, so recorded
//! values replay byte-faithfully.

use crate::error::ProxyError;
use crate::framing::hex_preview;
use serde::{Deserialize, Serialize};

/// A parsed RESP3 value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `None` is the nil bulk string (`$-1`).
    BulkString(Option<Vec<u8>>),
    Array(Vec<RespValue>),
    Map(Vec<(RespValue, RespValue)>),
    Set(Vec<RespValue>),
    Boolean(bool),
    Double(f64),
    BigNumber(String),
    VerbatimString { format: String, text: String },
    Push(Vec<RespValue>),
}

/// Parses every complete value in `buf`. Returns the values and the number
/// of bytes consumed; a trailing incomplete value is left in the buffer for
/// the next read.
pub fn parse_all(buf: &[u8]) -> Result<(Vec<RespValue>, usize), ProxyError> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        match parse_value(buf, pos)? {
            Some((value, next)) => {
                values.push(value);
                pos = next;
            }
            None => break,
        }
    }
    Ok((values, pos))
}

/// Parses one value starting at `pos`. `Ok(None)` means the buffer ends
/// mid-value.
fn parse_value(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, ProxyError> {
    if pos >= buf.len() {
        return Ok(None);
    }
    let kind = buf[pos];
    let body = pos + 1;
    match kind {
        b'+' => Ok(read_line(buf, body)?
            .map(|(line, next)| (RespValue::SimpleString(line.to_string()), next))),
        b'-' => {
            Ok(read_line(buf, body)?.map(|(line, next)| (RespValue::Error(line.to_string()), next)))
        }
        b':' => match read_line(buf, body)? {
            Some((line, next)) => {
                let n = line
                    .parse::<i64>()
                    .map_err(|_| violation("integer", buf, pos))?;
                Ok(Some((RespValue::Integer(n), next)))
            }
            None => Ok(None),
        },
        b'$' => parse_bulk(buf, pos, body),
        b'=' => parse_verbatim(buf, pos, body),
        b'*' => Ok(parse_aggregate(buf, pos, body)?.map(|(items, next)| {
            (RespValue::Array(items), next)
        })),
        b'~' => {
            Ok(parse_aggregate(buf, pos, body)?
                .map(|(items, next)| (RespValue::Set(items), next)))
        }
        b'>' => Ok(parse_aggregate(buf, pos, body)?
            .map(|(items, next)| (RespValue::Push(items), next))),
        b'%' => parse_map(buf, pos, body),
        b'#' => match read_line(buf, body)? {
            Some((line, next)) => match line {
                "t" => Ok(Some((RespValue::Boolean(true), next))),
                "f" => Ok(Some((RespValue::Boolean(false), next))),
                _ => Err(violation("boolean", buf, pos)),
            },
            None => Ok(None),
        },
        b',' => match read_line(buf, body)? {
            Some((line, next)) => {
                let d = match line {
                    "inf" => f64::INFINITY,
                    "-inf" => f64::NEG_INFINITY,
                    "nan" => f64::NAN,
                    other => other
                        .parse::<f64>()
                        .map_err(|_| violation("double", buf, pos))?,
                };
                Ok(Some((RespValue::Double(d), next)))
            }
            None => Ok(None),
        },
        b'(' => Ok(read_line(buf, body)?
            .map(|(line, next)| (RespValue::BigNumber(line.to_string()), next))),
        b'!' => match parse_length_payload(buf, pos, body)? {
            Some((payload, next)) => {
                let text =
                    String::from_utf8(payload).map_err(|_| violation("blob error", buf, pos))?;
                Ok(Some((RespValue::Error(text), next)))
            }
            None => Ok(None),
        },
        _ => Err(violation("type byte", buf, pos)),
    }
}

fn parse_bulk(buf: &[u8], start: usize, body: usize) -> Result<Option<(RespValue, usize)>, ProxyError> {
    match read_line(buf, body)? {
        Some((line, next)) => {
            let len = line
                .parse::<i64>()
                .map_err(|_| violation("bulk length", buf, start))?;
            if len < 0 {
                return Ok(Some((RespValue::BulkString(None), next)));
            }
            read_payload(buf, next, len as usize)
                .map(|opt| opt.map(|(data, end)| (RespValue::BulkString(Some(data)), end)))
        }
        None => Ok(None),
    }
}

fn parse_verbatim(
    buf: &[u8],
    start: usize,
    body: usize,
) -> Result<Option<(RespValue, usize)>, ProxyError> {
    match parse_length_payload(buf, start, body)? {
        Some((payload, next)) => {
            // Payload is `fmt:text`, three format chars and a colon.
            if payload.len() < 4 || payload[3] != b':' {
                return Err(violation("verbatim string", buf, start));
            }
            let format = String::from_utf8(payload[..3].to_vec())
                .map_err(|_| violation("verbatim format", buf, start))?;
            let text = String::from_utf8(payload[4..].to_vec())
                .map_err(|_| violation("verbatim text", buf, start))?;
            Ok(Some((RespValue::VerbatimString { format, text }, next)))
        }
        None => Ok(None),
    }
}

fn parse_length_payload(
    buf: &[u8],
    start: usize,
    body: usize,
) -> Result<Option<(Vec<u8>, usize)>, ProxyError> {
    match read_line(buf, body)? {
        Some((line, next)) => {
            let len = line
                .parse::<usize>()
                .map_err(|_| violation("length", buf, start))?;
            read_payload(buf, next, len)
        }
        None => Ok(None),
    }
}

fn parse_aggregate(
    buf: &[u8],
    start: usize,
    body: usize,
) -> Result<Option<(Vec<RespValue>, usize)>, ProxyError> {
    match read_line(buf, body)? {
        Some((line, next)) => {
            let count = line
                .parse::<i64>()
                .map_err(|_| violation("aggregate length", buf, start))?;
            if count < 0 {
                // Nil array, kept as an empty aggregate.
                return Ok(Some((Vec::new(), next)));
            }
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            let mut pos = next;
            for _ in 0..count {
                match parse_value(buf, pos)? {
                    Some((value, after)) => {
                        items.push(value);
                        pos = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((items, pos)))
        }
        None => Ok(None),
    }
}

fn parse_map(buf: &[u8], start: usize, body: usize) -> Result<Option<(RespValue, usize)>, ProxyError> {
    match read_line(buf, body)? {
        Some((line, next)) => {
            let count = line
                .parse::<usize>()
                .map_err(|_| violation("map length", buf, start))?;
            let mut pairs = Vec::with_capacity(count.min(1024));
            let mut pos = next;
            for _ in 0..count {
                let (key, after_key) = match parse_value(buf, pos)? {
                    Some(v) => v,
                    None => return Ok(None),
                };
                let (value, after_value) = match parse_value(buf, after_key)? {
                    Some(v) => v,
                    None => return Ok(None),
                };
                pairs.push((key, value));
                pos = after_value;
            }
            Ok(Some((RespValue::Map(pairs), pos)))
        }
        None => Ok(None),
    }
}

/// One decimal-ASCII-until-CRLF line. `Ok(None)` when the terminator has not
/// arrived yet.
fn read_line(buf: &[u8], pos: usize) -> Result<Option<(&str, usize)>, ProxyError> {
    match buf[pos..].windows(2).position(|w| w == b"\r\n") {
        Some(rel) => {
            let line = std::str::from_utf8(&buf[pos..pos + rel])
                .map_err(|_| violation("line", buf, pos))?;
            Ok(Some((line, pos + rel + 2)))
        }
        None => Ok(None),
    }
}

fn read_payload(
    buf: &[u8],
    pos: usize,
    len: usize,
) -> Result<Option<(Vec<u8>, usize)>, ProxyError> {
    if buf.len() < pos + len + 2 {
        return Ok(None);
    }
    if &buf[pos + len..pos + len + 2] != b"\r\n" {
        return Err(violation("payload terminator", buf, pos));
    }
    Ok(Some((buf[pos..pos + len].to_vec(), pos + len + 2)))
}

fn violation(what: &str, buf: &[u8], pos: usize) -> ProxyError {
    ProxyError::ProtocolViolation(format!(
        "RESP {} at offset {}: {}",
        what,
        pos,
        hex_preview(&buf[pos..], 16)
    ))
}

/// Serializes a value back to RESP3 wire bytes. Inverse of the parser on
/// everything the parser accepts.
pub fn serialize(value: &RespValue) -> Vec<u8> {
    let mut out = Vec::new();
    serialize_into(value, &mut out);
    out
}

fn serialize_into(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::SimpleString(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(n) => {
            out.extend_from_slice(format!(":{}\r\n", n).as_bytes());
        }
        RespValue::BulkString(None) => out.extend_from_slice(b"$-1\r\n"),
        RespValue::BulkString(Some(data)) => {
            out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Array(items) => serialize_aggregate(b'*', items, out),
        RespValue::Set(items) => serialize_aggregate(b'~', items, out),
        RespValue::Push(items) => serialize_aggregate(b'>', items, out),
        RespValue::Map(pairs) => {
            out.extend_from_slice(format!("%{}\r\n", pairs.len()).as_bytes());
            for (key, value) in pairs {
                serialize_into(key, out);
                serialize_into(value, out);
            }
        }
        RespValue::Boolean(b) => {
            out.extend_from_slice(if *b { b"#t\r\n" } else { b"#f\r\n" });
        }
        RespValue::Double(d) => {
            let repr = if d.is_nan() {
                "nan".to_string()
            } else if d.is_infinite() {
                if *d > 0.0 { "inf".to_string() } else { "-inf".to_string() }
            } else {
                format!("{}", d)
            };
            out.extend_from_slice(format!(",{}\r\n", repr).as_bytes());
        }
        RespValue::BigNumber(s) => {
            out.push(b'(');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::VerbatimString { format, text } => {
            out.extend_from_slice(format!("={}\r\n", format.len() + 1 + text.len()).as_bytes());
            out.extend_from_slice(format.as_bytes());
            out.push(b':');
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

fn serialize_aggregate(prefix: u8, items: &[RespValue], out: &mut Vec<u8>) {
    out.push(prefix);
    out.extend_from_slice(format!("{}\r\n", items.len()).as_bytes());
    for item in items {
        serialize_into(item, out);
    }
}

/// Structural equality on parsed value trees, ignoring incidental
/// serialization differences: bulk and simple strings compare by content,
/// maps and sets compare unordered.
pub fn structurally_equal(a: &RespValue, b: &RespValue) -> bool {
    match (a, b) {
        (RespValue::Array(x), RespValue::Array(y)) | (RespValue::Push(x), RespValue::Push(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| structurally_equal(l, r))
        }
        (RespValue::Set(x), RespValue::Set(y)) => unordered_equal(x, y),
        (RespValue::Map(x), RespValue::Map(y)) => {
            if x.len() != y.len() {
                return false;
            }
            let mut unclaimed: Vec<&(RespValue, RespValue)> = y.iter().collect();
            x.iter().all(|(xk, xv)| {
                match unclaimed.iter().position(|(yk, yv)| {
                    structurally_equal(xk, yk) && structurally_equal(xv, yv)
                }) {
                    Some(i) => {
                        unclaimed.swap_remove(i);
                        true
                    }
                    None => false,
                }
            })
        }
        _ => match (string_bytes(a), string_bytes(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

fn unordered_equal(x: &[RespValue], y: &[RespValue]) -> bool {
    if x.len() != y.len() {
        return false;
    }
    let mut unclaimed: Vec<&RespValue> = y.iter().collect();
    x.iter().all(|item| {
        match unclaimed.iter().position(|c| structurally_equal(item, c)) {
            Some(i) => {
                unclaimed.swap_remove(i);
                true
            }
            None => false,
        }
    })
}

fn string_bytes(value: &RespValue) -> Option<&[u8]> {
    match value {
        RespValue::SimpleString(s) => Some(s.as_bytes()),
        RespValue::BulkString(Some(data)) => Some(data),
        _ => None,
    }
}

/// Protocol-version detection on the first request of a connection: `ping`
/// means RESP2, `hello N` means version `N`.
pub fn detect_protocol_version(requests: &[RespValue]) -> u8 {
    for request in requests {
        if let RespValue::Array(items) = request {
            let mut words = items.iter().filter_map(string_bytes);
            match words.next() {
                Some(cmd) if cmd.eq_ignore_ascii_case(b"ping") => return 2,
                Some(cmd) if cmd.eq_ignore_ascii_case(b"hello") => {
                    if let Some(arg) = words.next() {
                        if let Ok(text) = std::str::from_utf8(arg) {
                            if let Ok(version) = text.parse::<u8>() {
                                return version;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> RespValue {
        RespValue::BulkString(Some(s.as_bytes().to_vec()))
    }

    #[test]
    fn parse_get_command() {
        let (values, consumed) = parse_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").unwrap();
        assert_eq!(consumed, 20);
        assert_eq!(values, vec![RespValue::Array(vec![bulk("GET"), bulk("k")])]);
    }

    #[test]
    fn parse_simple_types() {
        let (values, _) = parse_all(b"+OK\r\n-ERR nope\r\n:42\r\n#t\r\n").unwrap();
        assert_eq!(
            values,
            vec![
                RespValue::SimpleString("OK".into()),
                RespValue::Error("ERR nope".into()),
                RespValue::Integer(42),
                RespValue::Boolean(true),
            ]
        );
    }

    #[test]
    fn parse_nil_bulk() {
        let (values, _) = parse_all(b"$-1\r\n").unwrap();
        assert_eq!(values, vec![RespValue::BulkString(None)]);
    }

    #[test]
    fn parse_nested_map() {
        let wire = b"%2\r\n+first\r\n:1\r\n+second\r\n*2\r\n:1\r\n:2\r\n";
        let (values, consumed) = parse_all(wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(
            values,
            vec![RespValue::Map(vec![
                (RespValue::SimpleString("first".into()), RespValue::Integer(1)),
                (
                    RespValue::SimpleString("second".into()),
                    RespValue::Array(vec![RespValue::Integer(1), RespValue::Integer(2)]),
                ),
            ])]
        );
    }

    #[test]
    fn parse_verbatim_and_bignum() {
        let (values, _) = parse_all(b"=15\r\ntxt:Some string\r\n(3492890328409238509\r\n").unwrap();
        assert_eq!(
            values,
            vec![
                RespValue::VerbatimString {
                    format: "txt".into(),
                    text: "Some string".into(),
                },
                RespValue::BigNumber("3492890328409238509".into()),
            ]
        );
    }

    #[test]
    fn incomplete_value_left_in_buffer() {
        let (values, consumed) = parse_all(b"+OK\r\n$5\r\nhel").unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn malformed_type_byte_rejected() {
        assert!(matches!(
            parse_all(b"@oops\r\n"),
            Err(ProxyError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn round_trip_identity() {
        let values = vec![
            RespValue::SimpleString("PONG".into()),
            RespValue::Error("ERR unknown".into()),
            RespValue::Integer(-7),
            RespValue::BulkString(None),
            bulk("payload"),
            RespValue::Boolean(false),
            RespValue::Double(3.25),
            RespValue::Double(f64::INFINITY),
            RespValue::BigNumber("123456789012345678901234567890".into()),
            RespValue::VerbatimString {
                format: "mkd".into(),
                text: "# title".into(),
            },
            RespValue::Set(vec![RespValue::Integer(1), bulk("x")]),
            RespValue::Push(vec![bulk("pubsub"), bulk("ch")]),
            RespValue::Map(vec![
                (bulk("k"), RespValue::Array(vec![RespValue::Integer(9)])),
                (
                    bulk("nested"),
                    RespValue::Map(vec![(bulk("inner"), RespValue::Boolean(true))]),
                ),
            ]),
        ];
        for value in values {
            let wire = serialize(&value);
            let (parsed, consumed) = parse_all(&wire).unwrap();
            assert_eq!(consumed, wire.len());
            assert_eq!(parsed, vec![value]);
        }
    }

    #[test]
    fn nested_array_serialization_sizes() {
        let value = RespValue::Array(vec![
            RespValue::Integer(1),
            RespValue::Array(vec![bulk("abc"), RespValue::Integer(2)]),
        ]);
        assert_eq!(
            serialize(&value),
            b"*2\r\n:1\r\n*2\r\n$3\r\nabc\r\n:2\r\n".to_vec()
        );
    }

    #[test]
    fn structural_equality_normalizes_containers() {
        let a = RespValue::Map(vec![
            (bulk("a"), RespValue::Integer(1)),
            (bulk("b"), RespValue::Integer(2)),
        ]);
        let b = RespValue::Map(vec![
            (bulk("b"), RespValue::Integer(2)),
            (RespValue::SimpleString("a".into()), RespValue::Integer(1)),
        ]);
        assert!(structurally_equal(&a, &b));

        let x = RespValue::Set(vec![bulk("1"), bulk("2")]);
        let y = RespValue::Set(vec![bulk("2"), bulk("1")]);
        assert!(structurally_equal(&x, &y));

        assert!(!structurally_equal(
            &RespValue::Array(vec![bulk("1"), bulk("2")]),
            &RespValue::Array(vec![bulk("2"), bulk("1")]),
        ));
    }

    #[test]
    fn version_detection() {
        let ping = vec![RespValue::Array(vec![bulk("PING")])];
        assert_eq!(detect_protocol_version(&ping), 2);

        let hello3 = vec![RespValue::Array(vec![bulk("HELLO"), bulk("3")])];
        assert_eq!(detect_protocol_version(&hello3), 3);

        let get = vec![RespValue::Array(vec![bulk("GET"), bulk("k")])];
        assert_eq!(detect_protocol_version(&get), 2);
    }
}
