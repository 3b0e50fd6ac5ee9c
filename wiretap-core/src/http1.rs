//! HTTP/1.1 engine: assembles one complete message at a time, drives either
//! record or replay, and reuses the connection for the next request on the
//! same TCP flow.

use crate::encoding::{decode_body, encode_body};
use crate::error::ProxyError;
use crate::framing::{find_crlf, find_double_crlf, hex_preview, read_some};
use crate::matcher::{Fingerprint, Matcher};
use crate::mock::{Headers, HttpRequest, HttpResponse, HttpSpec, Mock, MockKind, MockSpec};
use crate::persist::MockSink;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Duration;
use tracing::{debug, warn};

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const BAD_GATEWAY_RESPONSE: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n";
const MAX_HEAD_SIZE: usize = 65536;

#[derive(Clone)]
pub struct Http1Config {
    /// Refreshed between reads while assembling a sized body.
    pub body_deadline: Duration,
    /// Deadline while assembling a chunked body.
    pub chunked_deadline: Duration,
    /// On a replay miss, pass the request through to the origin.
    pub fallback_on_miss: bool,
    /// Header keys excluded from matching.
    pub noise: Vec<String>,
}

impl Default for Http1Config {
    fn default() -> Self {
        Self {
            body_deadline: Duration::from_secs(20),
            chunked_deadline: Duration::from_secs(5),
            fallback_on_miss: false,
            noise: Vec::new(),
        }
    }
}

/// A fully assembled request: the parsed, decoded form for matching and
/// recording, and the raw bytes for forwarding.
pub struct AssembledRequest {
    pub request: HttpRequest,
    pub raw: Vec<u8>,
}

pub struct AssembledResponse {
    pub response: HttpResponse,
    pub raw: Vec<u8>,
}

/// Parsed head plus what the body assembly phase needs. Splitting head and
/// body lets the caller write the `100 Continue` interim response between
/// the two phases.
pub struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Headers,
    head_len: usize,
    pub expects_continue: bool,
}

#[derive(Clone, Copy)]
enum BodyKind {
    None,
    Length(usize),
    Chunked,
    UntilEof,
}

/// Incremental reader over one direction of an HTTP/1.1 flow. Keeps the
/// unconsumed tail between messages so pipelined bytes are never lost.
pub struct Http1Reader<R> {
    reader: R,
    buf: Vec<u8>,
    cfg: Http1Config,
}

impl<R: AsyncRead + Unpin> Http1Reader<R> {
    pub fn new(reader: R, cfg: Http1Config) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(16384),
            cfg,
        }
    }

    /// Seeds the buffer with bytes consumed by an earlier phase (protocol
    /// detection).
    pub fn with_prefix(reader: R, prefix: Vec<u8>, cfg: Http1Config) -> Self {
        Self {
            reader,
            buf: prefix,
            cfg,
        }
    }

    /// Reads until the head is complete. `Ok(None)` is a clean EOF between
    /// requests; EOF mid-head is a short read.
    pub async fn read_request_head(&mut self) -> Result<Option<RequestHead>, ProxyError> {
        let head_len = match self.fill_until_head().await? {
            Some(len) => len,
            None => return Ok(None),
        };
        let (method, target, version, headers) = parse_request_line(&self.buf[..head_len - 4])?;
        let expects_continue = headers
            .get("expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false);
        Ok(Some(RequestHead {
            method,
            target,
            version,
            headers,
            head_len,
            expects_continue,
        }))
    }

    /// Assembles the body for a previously read head and consumes the whole
    /// message from the buffer.
    pub async fn read_request_body(
        &mut self,
        head: RequestHead,
    ) -> Result<AssembledRequest, ProxyError> {
        let kind = request_body_kind(&head.headers)?;
        let (raw, raw_body) = self.finish_body(head.head_len, kind).await?;
        let body = decoded_body(&head.headers, &raw_body)?;
        Ok(AssembledRequest {
            request: HttpRequest {
                method: head.method,
                url: head.target,
                version: head.version,
                headers: head.headers,
                body,
            },
            raw,
        })
    }

    /// Reads one full response. Interim `100 Continue` responses are
    /// swallowed; the final status is returned. Half-close before the status
    /// line surfaces as a short read.
    pub async fn read_response(&mut self) -> Result<AssembledResponse, ProxyError> {
        loop {
            let head_len = match self.fill_until_head().await? {
                Some(len) => len,
                None => return Err(ProxyError::ShortRead),
            };
            let (status, reason, version, headers) =
                parse_status_line(&self.buf[..head_len - 4])?;

            if status == 100 {
                self.buf.drain(..head_len);
                continue;
            }

            let kind = response_body_kind(&headers, status)?;
            let (raw, raw_body) = self.finish_body(head_len, kind).await?;
            let body = decoded_body(&headers, &raw_body)?;
            return Ok(AssembledResponse {
                response: HttpResponse {
                    status,
                    reason,
                    version,
                    headers,
                    body,
                },
                raw,
            });
        }
    }

    async fn fill_until_head(&mut self) -> Result<Option<usize>, ProxyError> {
        loop {
            if let Some(len) = find_double_crlf(&self.buf) {
                return Ok(Some(len));
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(ProxyError::ProtocolViolation(format!(
                    "oversized header block: {}",
                    hex_preview(&self.buf, 16)
                )));
            }
            let n = read_some(&mut self.reader, &mut self.buf, self.cfg.body_deadline).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ProxyError::ShortRead)
                };
            }
        }
    }

    /// Completes the message in `buf` and drains it. Returns the full raw
    /// message and the raw body slice.
    async fn finish_body(
        &mut self,
        head_len: usize,
        kind: BodyKind,
    ) -> Result<(Vec<u8>, Vec<u8>), ProxyError> {
        let total = match kind {
            BodyKind::None => head_len,
            BodyKind::Length(length) => {
                while self.buf.len() < head_len + length {
                    let n =
                        read_some(&mut self.reader, &mut self.buf, self.cfg.body_deadline).await?;
                    if n == 0 {
                        return Err(ProxyError::ShortRead);
                    }
                }
                head_len + length
            }
            BodyKind::Chunked => loop {
                if let Some(len) = chunked_len(&self.buf[head_len..])? {
                    break head_len + len;
                }
                let n =
                    read_some(&mut self.reader, &mut self.buf, self.cfg.chunked_deadline).await?;
                if n == 0 {
                    return Err(ProxyError::ShortRead);
                }
            },
            BodyKind::UntilEof => loop {
                let n = read_some(&mut self.reader, &mut self.buf, self.cfg.body_deadline).await?;
                if n == 0 {
                    break self.buf.len();
                }
            },
        };

        let raw: Vec<u8> = self.buf.drain(..total).collect();
        let raw_body = match kind {
            BodyKind::Chunked => dechunk(&raw[head_len..])?,
            _ => raw[head_len..].to_vec(),
        };
        Ok((raw, raw_body))
    }
}

fn request_body_kind(headers: &Headers) -> Result<BodyKind, ProxyError> {
    if let Some(value) = headers.get("content-length") {
        let length = value
            .trim()
            .parse::<usize>()
            .map_err(|_| ProxyError::ProtocolViolation(format!("content-length {:?}", value)))?;
        return Ok(BodyKind::Length(length));
    }
    if headers
        .all("transfer-encoding")
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return Ok(BodyKind::Chunked);
    }
    Ok(BodyKind::None)
}

fn response_body_kind(headers: &Headers, status: u16) -> Result<BodyKind, ProxyError> {
    if status == 204 || status == 304 || (100..200).contains(&status) {
        return Ok(BodyKind::None);
    }
    match request_body_kind(headers)? {
        BodyKind::None => Ok(BodyKind::UntilEof),
        sized => Ok(sized),
    }
}

fn decoded_body(headers: &Headers, raw_body: &[u8]) -> Result<Vec<u8>, ProxyError> {
    match headers.get("content-encoding") {
        Some(encoding) => decode_body(encoding, raw_body).map_err(|e| {
            ProxyError::ProtocolViolation(format!("content-encoding decode: {}", e))
        }),
        None => Ok(raw_body.to_vec()),
    }
}

fn parse_request_line(head: &[u8]) -> Result<(String, String, String, Headers), ProxyError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::ProtocolViolation(format!("head: {}", hex_preview(head, 24))))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version))
            if !method.is_empty() && version.starts_with("HTTP/1") =>
        {
            Ok((
                method.to_string(),
                target.to_string(),
                version.to_string(),
                parse_header_lines(lines)?,
            ))
        }
        _ => Err(ProxyError::ProtocolViolation(format!(
            "request line {:?}",
            request_line
        ))),
    }
}

fn parse_status_line(head: &[u8]) -> Result<(u16, String, String, Headers), ProxyError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::ProtocolViolation(format!("head: {}", hex_preview(head, 24))))?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            ProxyError::ProtocolViolation(format!("status line {:?}", status_line))
        })?;
    if !version.starts_with("HTTP/1") {
        return Err(ProxyError::ProtocolViolation(format!(
            "status line {:?}",
            status_line
        )));
    }
    let reason = parts.next().unwrap_or_default().to_string();
    Ok((status, reason, version.to_string(), parse_header_lines(lines)?))
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Headers, ProxyError> {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) => headers.push(key.trim(), value.trim()),
            None => {
                return Err(ProxyError::ProtocolViolation(format!(
                    "header line {:?}",
                    line
                )));
            }
        }
    }
    Ok(headers)
}

/// Length of a complete chunked body (including the final terminator and
/// any trailers) at the start of `buf`, or `None` if it is still arriving.
fn chunked_len(buf: &[u8]) -> Result<Option<usize>, ProxyError> {
    let mut pos = 0;
    loop {
        let line_end = match find_crlf(&buf[pos..]) {
            Some(rel) => pos + rel,
            None => return Ok(None),
        };
        let size_line = std::str::from_utf8(&buf[pos..line_end])
            .map_err(|_| ProxyError::ProtocolViolation("chunk size line".into()))?;
        // Chunk extensions after ';' are forwarded but do not affect the
        // size.
        let size_str = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::ProtocolViolation(format!("chunk size {:?}", size_str)))?;
        pos = line_end + 2;

        if size == 0 {
            // Trailer section ends with an empty line.
            let mut trailer_pos = pos;
            loop {
                let line_end = match find_crlf(&buf[trailer_pos..]) {
                    Some(rel) => trailer_pos + rel,
                    None => return Ok(None),
                };
                if line_end == trailer_pos {
                    return Ok(Some(line_end + 2));
                }
                trailer_pos = line_end + 2;
            }
        }

        if buf.len() < pos + size + 2 {
            return Ok(None);
        }
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(ProxyError::ProtocolViolation("chunk terminator".into()));
        }
        pos += size + 2;
    }
}

/// Concatenated chunk payloads of a complete chunked body.
fn dechunk(raw: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = find_crlf(&raw[pos..])
            .map(|rel| pos + rel)
            .ok_or(ProxyError::ShortRead)?;
        let size_line = std::str::from_utf8(&raw[pos..line_end])
            .map_err(|_| ProxyError::ProtocolViolation("chunk size line".into()))?;
        let size_str = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::ProtocolViolation(format!("chunk size {:?}", size_str)))?;
        pos = line_end + 2;
        if size == 0 {
            return Ok(out);
        }
        out.extend_from_slice(
            raw.get(pos..pos + size)
                .ok_or(ProxyError::ShortRead)?,
        );
        pos += size + 2;
    }
}

/// Serializes a recorded response for the wire: the body is re-encoded when
/// the mock carried a `Content-Encoding`, `Content-Length` is rewritten to
/// the encoded size, and chunked responses are re-framed as a single chunk.
pub fn serialize_response(response: &HttpResponse) -> Result<Vec<u8>, ProxyError> {
    let body = match response.headers.get("content-encoding") {
        Some(encoding) => encode_body(encoding, &response.body)
            .map_err(|e| ProxyError::ProtocolViolation(format!("re-encode: {}", e)))?,
        None => response.body.clone(),
    };
    let chunked = response
        .headers
        .all("transfer-encoding")
        .any(|v| v.to_ascii_lowercase().contains("chunked"));

    let mut headers = response.headers.clone();
    if !chunked {
        headers.set("Content-Length", body.len().to_string());
    }

    let mut out = Vec::with_capacity(body.len() + 256);
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            response.version, response.status, response.reason
        )
        .trim_end()
        .as_bytes(),
    );
    out.extend_from_slice(b"\r\n");
    for (key, value) in headers.iter() {
        out.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");

    if chunked {
        if !body.is_empty() {
            out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
            out.extend_from_slice(&body);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
    } else {
        out.extend_from_slice(&body);
    }
    Ok(out)
}

/// Record path: forward each request to the origin, read its response the
/// same way, emit a mock, and return to the head-assembly state. EOF from
/// the client with no buffered bytes ends the loop without error.
pub async fn record<C, O>(
    client: C,
    client_prefix: Vec<u8>,
    origin: O,
    sink: &dyn MockSink,
    cfg: &Http1Config,
    seq: &AtomicI64,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, mut client_write) = tokio::io::split(client);
    let (origin_read, mut origin_write) = tokio::io::split(origin);
    let mut client_reader = Http1Reader::with_prefix(client_read, client_prefix, cfg.clone());
    let mut origin_reader = Http1Reader::new(origin_read, cfg.clone());

    loop {
        let head = match client_reader.read_request_head().await? {
            Some(head) => head,
            None => return Ok(()),
        };
        if head.expects_continue {
            client_write.write_all(CONTINUE_RESPONSE).await?;
        }
        let request = client_reader.read_request_body(head).await?;
        let request_at = OffsetDateTime::now_utc();

        origin_write.write_all(&request.raw).await?;
        origin_write.flush().await?;

        let response = origin_reader.read_response().await?;
        let response_at = OffsetDateTime::now_utc();

        client_write.write_all(&response.raw).await?;
        client_write.flush().await?;

        let order = seq.fetch_add(1, Ordering::SeqCst);
        sink.emit(Mock::new(
            MockKind::Http,
            format!("mock-{}", order),
            MockSpec::Http(HttpSpec {
                request: request.request,
                response: response.response,
                request_at,
                response_at,
            }),
            order,
        ))?;
        debug!(order, "Recorded HTTP exchange");
    }
}

/// Replay path: fingerprint, match, synthesize. On a miss, either pass
/// through to the origin (when configured) or answer `502` and surface
/// `NoMatch`.
pub async fn replay<C, O>(
    client: C,
    client_prefix: Vec<u8>,
    origin: Option<O>,
    matcher: &Matcher,
    cfg: &Http1Config,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, mut client_write) = tokio::io::split(client);
    let mut client_reader = Http1Reader::with_prefix(client_read, client_prefix, cfg.clone());
    let mut origin_parts = origin.map(|o| {
        let (read, write) = tokio::io::split(o);
        (Http1Reader::new(read, cfg.clone()), write)
    });

    loop {
        let head = match client_reader.read_request_head().await? {
            Some(head) => head,
            None => return Ok(()),
        };
        if head.expects_continue {
            client_write.write_all(CONTINUE_RESPONSE).await?;
        }
        let request = client_reader.read_request_body(head).await?;
        let fingerprint = Fingerprint::from_http(&request.request, &cfg.noise);

        match matcher.match_request(&fingerprint, MockKind::Http) {
            Some(mock) => {
                let response = match &mock.spec {
                    MockSpec::Http(spec) => serialize_response(&spec.response)?,
                    _ => return Err(ProxyError::NoMatch),
                };
                let delivered = async {
                    client_write.write_all(&response).await?;
                    client_write.flush().await
                }
                .await;
                if let Err(e) = delivered {
                    // The client is gone; the consumed mock goes back to
                    // the candidates.
                    matcher.restore(&mock);
                    return Err(e.into());
                }
            }
            None if cfg.fallback_on_miss && origin_parts.is_some() => {
                let (origin_reader, origin_write) = origin_parts.as_mut().unwrap();
                warn!(path = %fingerprint.path, "Replay miss, passing through to origin");
                origin_write.write_all(&request.raw).await?;
                origin_write.flush().await?;
                let response = origin_reader.read_response().await?;
                client_write.write_all(&response.raw).await?;
                client_write.flush().await?;
            }
            None => {
                warn!(path = %fingerprint.path, "Replay miss");
                client_write.write_all(BAD_GATEWAY_RESPONSE).await?;
                client_write.flush().await?;
                return Err(ProxyError::NoMatch);
            }
        }
    }
}

/// Pipelined replay: ingestion and egress run as two cooperative tasks over
/// a FIFO of in-flight requests. Responses are paired to requests in
/// enqueue order, preserving HTTP/1.1 semantics.
pub async fn replay_pipelined<S>(
    stream: S,
    client_prefix: Vec<u8>,
    matcher: Arc<Matcher>,
    cfg: Http1Config,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(stream);
    let client_write = Arc::new(Mutex::new(client_write));
    let (queue_tx, mut queue_rx) = mpsc::channel::<AssembledRequest>(32);

    let ingest_write = client_write.clone();
    let ingest_cfg = cfg.clone();
    let ingest = async move {
        let mut reader = Http1Reader::with_prefix(client_read, client_prefix, ingest_cfg);
        loop {
            let head = match reader.read_request_head().await? {
                Some(head) => head,
                None => return Ok::<_, ProxyError>(()),
            };
            if head.expects_continue {
                ingest_write
                    .lock()
                    .await
                    .write_all(CONTINUE_RESPONSE)
                    .await?;
            }
            let request = reader.read_request_body(head).await?;
            if queue_tx.send(request).await.is_err() {
                return Ok(());
            }
        }
    };

    let egress = async move {
        while let Some(request) = queue_rx.recv().await {
            let fingerprint = Fingerprint::from_http(&request.request, &cfg.noise);
            let response = match matcher.match_request(&fingerprint, MockKind::Http) {
                Some(mock) => match &mock.spec {
                    MockSpec::Http(spec) => serialize_response(&spec.response)?,
                    _ => return Err(ProxyError::NoMatch),
                },
                None => {
                    let mut write = client_write.lock().await;
                    write.write_all(BAD_GATEWAY_RESPONSE).await?;
                    write.flush().await?;
                    return Err(ProxyError::NoMatch);
                }
            };
            let mut write = client_write.lock().await;
            write.write_all(&response).await?;
            write.flush().await?;
        }
        Ok(())
    };

    tokio::try_join!(ingest, egress)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemorySink;
    use crate::store::MockStore;
    use tokio::io::AsyncReadExt;

    fn cfg() -> Http1Config {
        Http1Config {
            body_deadline: Duration::from_secs(1),
            chunked_deadline: Duration::from_secs(1),
            ..Default::default()
        }
    }

    async fn assemble(raw: &[u8]) -> AssembledRequest {
        let (mut tx, rx) = tokio::io::duplex(65536);
        tx.write_all(raw).await.unwrap();
        drop(tx);
        let mut reader = Http1Reader::new(rx, cfg());
        let head = reader.read_request_head().await.unwrap().unwrap();
        reader.read_request_body(head).await.unwrap()
    }

    #[tokio::test]
    async fn parses_content_length_request() {
        let raw = b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nabcd";
        let assembled = assemble(raw).await;
        assert_eq!(assembled.request.method, "POST");
        assert_eq!(assembled.request.url, "/u");
        assert_eq!(assembled.request.body, b"abcd");
        assert_eq!(assembled.raw, raw.to_vec());
    }

    #[tokio::test]
    async fn parses_chunked_request_and_preserves_raw() {
        let raw =
            b"POST /c HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n1\r\n!\r\n0\r\n\r\n";
        let assembled = assemble(raw).await;
        assert_eq!(assembled.request.body, b"hello!");
        // Chunk extensions survive in the raw form for forwarding.
        assert_eq!(assembled.raw, raw.to_vec());
    }

    #[tokio::test]
    async fn gzip_body_is_stored_decoded() {
        let body = encode_body("gzip", b"payload").unwrap();
        let mut raw = format!(
            "POST /z HTTP/1.1\r\nHost: a\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(&body);

        let assembled = assemble(&raw).await;
        assert_eq!(assembled.request.body, b"payload");
        assert_eq!(assembled.raw, raw);
    }

    #[tokio::test]
    async fn clean_eof_between_requests_is_none() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut reader = Http1Reader::new(rx, cfg());
        assert!(reader.read_request_head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_head_is_short_read() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"GET / HTTP/1.1\r\nHost").await.unwrap();
        drop(tx);
        let mut reader = Http1Reader::new(rx, cfg());
        assert!(matches!(
            reader.read_request_head().await,
            Err(ProxyError::ShortRead)
        ));
    }

    #[tokio::test]
    async fn response_until_eof() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"HTTP/1.1 200 OK\r\n\r\nstreamed").await.unwrap();
        drop(tx);
        let mut reader = Http1Reader::new(rx, cfg());
        let response = reader.read_response().await.unwrap();
        assert_eq!(response.response.status, 200);
        assert_eq!(response.response.body, b"streamed");
    }

    #[tokio::test]
    async fn interim_continue_is_swallowed() {
        let (mut tx, rx) = tokio::io::duplex(256);
        tx.write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        drop(tx);
        let mut reader = Http1Reader::new(rx, cfg());
        let response = reader.read_response().await.unwrap();
        assert_eq!(response.response.status, 200);
        assert_eq!(response.response.body, b"ok");
    }

    #[tokio::test]
    async fn record_half_close_before_headers_is_error() {
        // The origin half-closes before sending any response bytes; the
        // exchange is an error and no mock is emitted.
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"").await.unwrap();
        drop(tx);
        let mut reader = Http1Reader::new(rx, cfg());
        assert!(matches!(
            reader.read_response().await,
            Err(ProxyError::ShortRead)
        ));
    }

    #[test]
    fn chunked_len_tracks_partial_bodies() {
        assert_eq!(chunked_len(b"5\r\nhello\r\n0\r\n\r\n").unwrap(), Some(15));
        assert_eq!(chunked_len(b"5\r\nhel").unwrap(), None);
        assert_eq!(chunked_len(b"5\r\nhello\r\n0\r\n").unwrap(), None);
        // Trailers after the last chunk are part of the body.
        assert_eq!(
            chunked_len(b"1\r\nx\r\n0\r\nX-Sum: 1\r\n\r\nNEXT").unwrap(),
            Some(21)
        );
        assert!(chunked_len(b"zz\r\n").is_err());
    }

    #[test]
    fn serialize_rewrites_content_length() {
        let mut headers = Headers::new();
        headers.push("Content-Length", "999");
        headers.push("Content-Type", "text/plain");
        let response = HttpResponse {
            status: 200,
            reason: "OK".into(),
            version: "HTTP/1.1".into(),
            headers,
            body: b"four".to_vec(),
        };
        let wire = serialize_response(&response).unwrap();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\nfour"));
    }

    #[test]
    fn serialize_reframes_chunked_response() {
        let mut headers = Headers::new();
        headers.push("Transfer-Encoding", "chunked");
        let response = HttpResponse {
            status: 200,
            reason: "OK".into(),
            version: "HTTP/1.1".into(),
            headers,
            body: b"hello".to_vec(),
        };
        let wire = serialize_response(&response).unwrap();
        assert_eq!(
            wire,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn serialize_reencodes_gzip_body() {
        let mut headers = Headers::new();
        headers.push("Content-Encoding", "gzip");
        let response = HttpResponse {
            status: 200,
            reason: "OK".into(),
            version: "HTTP/1.1".into(),
            headers,
            body: b"decoded payload".to_vec(),
        };
        let wire = serialize_response(&response).unwrap();
        let head_end = find_double_crlf(&wire).unwrap();
        let body = &wire[head_end..];
        assert_eq!(decode_body("gzip", body).unwrap(), b"decoded payload");
        let text = String::from_utf8_lossy(&wire[..head_end]);
        assert!(text.contains(&format!("Content-Length: {}", body.len())));
    }

    #[tokio::test]
    async fn record_emits_mock_and_forwards() {
        let (client_near, client_far) = tokio::io::duplex(65536);
        let (origin_near, origin_far) = tokio::io::duplex(65536);
        let sink = MemorySink::new();
        let seq = AtomicI64::new(0);

        let config = cfg();
        let proxy = record(client_far, Vec::new(), origin_near, &sink, &config, &seq);

        let driver = async {
            let (mut client_read, mut client_write) = tokio::io::split(client_near);
            let (mut origin_read, mut origin_write) = tokio::io::split(origin_far);

            client_write
                .write_all(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n")
                .await
                .unwrap();

            // Origin sees the request verbatim, then answers.
            let mut seen = vec![0u8; 28];
            origin_read.read_exact(&mut seen).await.unwrap();
            assert_eq!(&seen, b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n");
            origin_write
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();

            let mut got = vec![0u8; 43];
            client_read.read_exact(&mut got).await.unwrap();
            assert!(got.ends_with(b"hello"));

            drop(client_write);
            drop(origin_write);
            drop(origin_read);
            let _ = client_read.read_to_end(&mut Vec::new()).await;
        };

        let (record_result, _) = tokio::join!(proxy, driver);
        record_result.unwrap();

        let mocks = sink.take();
        assert_eq!(mocks.len(), 1);
        match &mocks[0].spec {
            MockSpec::Http(spec) => {
                assert_eq!(spec.request.url, "/x");
                assert_eq!(spec.response.status, 200);
                assert_eq!(spec.response.body, b"hello");
            }
            other => panic!("unexpected spec: {:?}", other),
        }
    }

    fn chunked_mock() -> Mock {
        let mut response_headers = Headers::new();
        response_headers.push("Transfer-Encoding", "chunked");
        Mock::new(
            MockKind::Http,
            "mock-0",
            MockSpec::Http(HttpSpec {
                request: HttpRequest {
                    method: "GET".into(),
                    url: "/x".into(),
                    version: "HTTP/1.1".into(),
                    headers: [("Host", "a")].into_iter().collect(),
                    body: Vec::new(),
                },
                response: HttpResponse {
                    status: 200,
                    reason: "OK".into(),
                    version: "HTTP/1.1".into(),
                    headers: response_headers,
                    body: b"hello".to_vec(),
                },
                request_at: OffsetDateTime::UNIX_EPOCH,
                response_at: OffsetDateTime::UNIX_EPOCH,
            }),
            0,
        )
    }

    #[tokio::test]
    async fn replay_chunked_keeps_connection_open() {
        let store = Arc::new(MockStore::new());
        store.load_all(vec![chunked_mock()]);
        let matcher = Matcher::new(store, Vec::new());

        let (client_near, client_far) = tokio::io::duplex(65536);
        let config = cfg();
        let proxy = replay(
            client_far,
            Vec::new(),
            None::<tokio::io::DuplexStream>,
            &matcher,
            &config,
        );

        let driver = async {
            let (mut read, mut write) = tokio::io::split(client_near);
            write
                .write_all(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n")
                .await
                .unwrap();

            let expected: &[u8] =
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
            let mut got = vec![0u8; expected.len()];
            read.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);

            // The connection stays open for the next request; closing our
            // write half ends the session cleanly.
            drop(write);
            let mut rest = Vec::new();
            read.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        };

        let (replay_result, _) = tokio::join!(proxy, driver);
        replay_result.unwrap();
    }

    #[tokio::test]
    async fn replay_expect_continue_flow() {
        let mut mock = chunked_mock();
        if let MockSpec::Http(spec) = &mut mock.spec {
            spec.request.method = "POST".into();
            spec.request.url = "/u".into();
            spec.request.body = b"abcd".to_vec();
            spec.response.headers = Headers::new();
            spec.response.body = b"done".to_vec();
        }
        let store = Arc::new(MockStore::new());
        store.load_all(vec![mock]);
        let matcher = Matcher::new(store, Vec::new());

        let (client_near, client_far) = tokio::io::duplex(65536);
        let config = cfg();
        let proxy = replay(
            client_far,
            Vec::new(),
            None::<tokio::io::DuplexStream>,
            &matcher,
            &config,
        );

        let driver = async {
            let (mut read, mut write) = tokio::io::split(client_near);
            write
                .write_all(
                    b"POST /u HTTP/1.1\r\nHost: a\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n",
                )
                .await
                .unwrap();

            let mut interim = vec![0u8; CONTINUE_RESPONSE.len()];
            read.read_exact(&mut interim).await.unwrap();
            assert_eq!(interim, CONTINUE_RESPONSE);

            write.write_all(b"abcd").await.unwrap();

            let mut head = vec![0u8; 17];
            read.read_exact(&mut head).await.unwrap();
            assert_eq!(&head, b"HTTP/1.1 200 OK\r\n");
            drop(write);
            let mut rest = Vec::new();
            read.read_to_end(&mut rest).await.unwrap();
            assert!(String::from_utf8_lossy(&rest).ends_with("done"));
        };

        let (replay_result, _) = tokio::join!(proxy, driver);
        replay_result.unwrap();
    }

    #[tokio::test]
    async fn replay_miss_answers_502() {
        let matcher = Matcher::new(Arc::new(MockStore::new()), Vec::new());
        let (client_near, client_far) = tokio::io::duplex(65536);
        let config = cfg();
        let proxy = replay(
            client_far,
            Vec::new(),
            None::<tokio::io::DuplexStream>,
            &matcher,
            &config,
        );

        let driver = async {
            let (mut read, mut write) = tokio::io::split(client_near);
            write
                .write_all(b"GET /missing HTTP/1.1\r\nHost: a\r\n\r\n")
                .await
                .unwrap();
            drop(write);
            let mut got = Vec::new();
            read.read_to_end(&mut got).await.unwrap();
            assert!(got.starts_with(b"HTTP/1.1 502"));
        };

        let (replay_result, _) = tokio::join!(proxy, driver);
        assert!(matches!(replay_result, Err(ProxyError::NoMatch)));
    }

    #[tokio::test]
    async fn pipelined_replay_preserves_order() {
        let mut first = chunked_mock();
        if let MockSpec::Http(spec) = &mut first.spec {
            spec.request.url = "/one".into();
            spec.response.headers = Headers::new();
            spec.response.body = b"first".to_vec();
        }
        let mut second = chunked_mock();
        second.name = "mock-1".into();
        if let MockSpec::Http(spec) = &mut second.spec {
            spec.request.url = "/two".into();
            spec.response.headers = Headers::new();
            spec.response.body = b"second".to_vec();
        }

        let store = Arc::new(MockStore::new());
        store.load_all(vec![first, second]);
        let matcher = Arc::new(Matcher::new(store, Vec::new()));

        let (client_near, client_far) = tokio::io::duplex(65536);
        let proxy = replay_pipelined(client_far, Vec::new(), matcher, cfg());

        let driver = async {
            let (mut read, mut write) = tokio::io::split(client_near);
            // Both requests before reading a single response.
            write
                .write_all(
                    b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: a\r\n\r\n",
                )
                .await
                .unwrap();
            drop(write);

            let mut all = Vec::new();
            read.read_to_end(&mut all).await.unwrap();
            let text = String::from_utf8(all).unwrap();
            let first_pos = text.find("first").expect("first response present");
            let second_pos = text.find("second").expect("second response present");
            assert!(first_pos < second_pos);
        };

        let (replay_result, _) = tokio::join!(proxy, driver);
        replay_result.unwrap();
    }
}
