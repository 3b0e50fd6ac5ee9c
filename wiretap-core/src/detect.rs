//! Application-protocol detection on the first decrypted/cleartext bytes.

/// The 24-byte HTTP/2 connection preface.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const HTTP_METHODS: [&[u8]; 8] = [
    b"GET ",
    b"POST ",
    b"HEAD ",
    b"PUT ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
    b"TRACE ",
];

/// RESP type prefixes: simple string, error, integer, bulk string, array,
/// map, set, boolean, double, big number, blob error, verbatim string, push.
const RESP_PREFIXES: &[u8] = b"+-:$*%~#,(!=>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    Redis,
    Opaque,
}

impl Protocol {
    /// String form for metrics and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http1",
            Protocol::Http2 => "http2",
            Protocol::Redis => "redis",
            Protocol::Opaque => "opaque",
        }
    }
}

/// Classification outcome: either a decision, or a request for more bytes
/// when the buffer is still an ambiguous prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Decided(Protocol),
    NeedMore,
}

/// Classifies the first client bytes. Decisions are monotone: feeding a
/// longer buffer never flips an earlier `Decided`.
pub fn detect(bytes: &[u8]) -> Detection {
    if bytes.is_empty() {
        return Detection::NeedMore;
    }

    // The HTTP/2 preface is checked first; its prefix "PRI " would
    // otherwise never collide with the method table, but being explicit
    // keeps the preface bytes from reaching the HTTP/1 parser.
    if bytes.len() >= HTTP2_PREFACE.len() {
        if bytes.starts_with(HTTP2_PREFACE) {
            return Detection::Decided(Protocol::Http2);
        }
    } else if HTTP2_PREFACE.starts_with(bytes) {
        return Detection::NeedMore;
    }

    for method in &HTTP_METHODS {
        if bytes.starts_with(method) {
            return Detection::Decided(Protocol::Http1);
        }
        if method.starts_with(bytes) {
            return Detection::NeedMore;
        }
    }

    if RESP_PREFIXES.contains(&bytes[0]) {
        return Detection::Decided(Protocol::Redis);
    }

    Detection::Decided(Protocol::Opaque)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_http2_preface() {
        assert_eq!(
            detect(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"),
            Detection::Decided(Protocol::Http2)
        );
        assert_eq!(
            detect(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n\x00\x00"),
            Detection::Decided(Protocol::Http2)
        );
    }

    #[test]
    fn partial_preface_needs_more() {
        assert_eq!(detect(b"PRI * HT"), Detection::NeedMore);
        assert_eq!(detect(b"P"), Detection::NeedMore);
    }

    #[test]
    fn detects_http1_methods() {
        assert_eq!(
            detect(b"GET /x HTTP/1.1\r\n"),
            Detection::Decided(Protocol::Http1)
        );
        assert_eq!(
            detect(b"DELETE /y HTTP/1.1\r\n"),
            Detection::Decided(Protocol::Http1)
        );
        assert_eq!(detect(b"DEL"), Detection::NeedMore);
    }

    #[test]
    fn detects_resp_lead_bytes() {
        for prefix in RESP_PREFIXES {
            assert_eq!(detect(&[*prefix]), Detection::Decided(Protocol::Redis));
        }
        assert_eq!(
            detect(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"),
            Detection::Decided(Protocol::Redis)
        );
    }

    #[test]
    fn unknown_bytes_are_opaque() {
        assert_eq!(detect(&[0x00, 0x01, 0x02]), Detection::Decided(Protocol::Opaque));
        assert_eq!(detect(b"SSH-2.0-x"), Detection::Decided(Protocol::Opaque));
    }

    #[test]
    fn empty_needs_more() {
        assert_eq!(detect(b""), Detection::NeedMore);
    }
}
