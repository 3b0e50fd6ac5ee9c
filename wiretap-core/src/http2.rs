//! HTTP/2 engine: raw framer, per-direction HPACK decoding, per-stream
//! state machine, and the record/replay connection loops for gRPC traffic.

use crate::detect::HTTP2_PREFACE;
use crate::error::ProxyError;
use crate::framing::{hex_preview, read_some};
use crate::grpc;
use crate::matcher::{Fingerprint, Matcher};
use crate::mock::{GrpcSpec, Headers, Mock, MockKind, MockSpec};
use crate::persist::MockSink;
use fluke_hpack::{Decoder, Encoder};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Duration;
use tracing::{debug, warn};

pub const FRAME_HEADER_LEN: usize = 9;
const MAX_FRAME_LEN: u32 = (1 << 24) - 1;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    Goaway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        match value {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::Goaway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }
}

impl FrameType {
    fn code(self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::Goaway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(code) => code,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    pub fn end_headers(&self) -> bool {
        self.flags & FLAG_END_HEADERS != 0
    }

    pub fn ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }
}

/// Incremental frame reader over one direction. Incomplete frames stay
/// buffered until the rest arrives.
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: Vec<u8>) -> Self {
        Self { buf: prefix }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Pops the next complete frame, if any.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProxyError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([0, self.buf[0], self.buf[1], self.buf[2]]);
        if length > MAX_FRAME_LEN {
            return Err(ProxyError::ProtocolViolation(format!(
                "frame length {}: {}",
                length,
                hex_preview(&self.buf, 9)
            )));
        }
        let total = FRAME_HEADER_LEN + length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame_type = FrameType::from(self.buf[3]);
        let flags = self.buf[4];
        let stream_id =
            u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]) & 0x7fff_ffff;
        let payload = self.buf[FRAME_HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(Frame {
            frame_type,
            flags,
            stream_id,
            payload,
        }))
    }
}

pub fn encode_frame(frame_type: FrameType, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    let len = payload.len() as u32;
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.push(frame_type.code());
    out.push(flags);
    out.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Strips padding (and, for HEADERS, the priority block) from a frame
/// payload, yielding the header-block fragment or data content.
fn frame_content(frame: &Frame) -> Result<&[u8], ProxyError> {
    let mut content = frame.payload.as_slice();
    let mut pad_len = 0usize;
    if frame.flags & FLAG_PADDED != 0 {
        pad_len = *content.first().ok_or_else(|| {
            ProxyError::ProtocolViolation("padded frame without pad length".into())
        })? as usize;
        content = &content[1..];
    }
    if frame.frame_type == FrameType::Headers && frame.flags & FLAG_PRIORITY != 0 {
        content = content.get(5..).ok_or_else(|| {
            ProxyError::ProtocolViolation("HEADERS priority block truncated".into())
        })?;
    }
    content
        .len()
        .checked_sub(pad_len)
        .map(|keep| &content[..keep])
        .ok_or_else(|| ProxyError::ProtocolViolation("padding exceeds frame".into()))
}

/// One direction of one stream.
#[derive(Default)]
pub struct StreamSide {
    header_block: Vec<u8>,
    pub headers: Option<Headers>,
    pub trailers: Option<Headers>,
    pub body: Vec<u8>,
    pub headers_received: bool,
    pub trailers_received: bool,
    pub end_stream: bool,
    continuation_expected: bool,
}

/// Request and response sides of one stream progress independently.
#[derive(Default)]
pub struct StreamPair {
    pub request: StreamSide,
    pub response: StreamSide,
    pub request_done_at: Option<OffsetDateTime>,
}

impl StreamPair {
    /// Complete means: request side saw END_STREAM, and the response side
    /// has headers, trailers, and END_STREAM.
    pub fn is_complete(&self) -> bool {
        self.request.end_stream
            && self.request.headers_received
            && self.response.end_stream
            && self.response.headers_received
            && self.response.trailers_received
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Per-connection stream table, keyed by stream id. Stream id 0 is
/// connection-scoped and never produces a message.
#[derive(Default)]
pub struct StreamTable {
    streams: HashMap<u32, StreamPair>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one frame to the table with the given direction's HPACK
    /// decoder. Returns the id of a stream whose request side just reached
    /// END_STREAM, for replay dispatch.
    pub fn apply(
        &mut self,
        direction: Direction,
        frame: &Frame,
        decoder: &mut Decoder,
    ) -> Result<Option<u32>, ProxyError> {
        if frame.stream_id == 0 {
            return Ok(None);
        }
        match frame.frame_type {
            FrameType::RstStream => {
                self.streams.remove(&frame.stream_id);
                return Ok(None);
            }
            FrameType::Headers | FrameType::Continuation | FrameType::Data => {}
            _ => return Ok(None),
        }
        let pair = self.streams.entry(frame.stream_id).or_default();
        let side = match direction {
            Direction::Request => &mut pair.request,
            Direction::Response => &mut pair.response,
        };

        match frame.frame_type {
            FrameType::Headers => {
                side.header_block = frame_content(frame)?.to_vec();
                side.continuation_expected = !frame.end_headers();
                if frame.end_stream() {
                    side.end_stream = true;
                }
                if frame.end_headers() {
                    decode_block(side, decoder)?;
                }
            }
            FrameType::Continuation => {
                if !side.continuation_expected {
                    return Err(ProxyError::ProtocolViolation(
                        "CONTINUATION without open header block".into(),
                    ));
                }
                side.header_block.extend_from_slice(&frame.payload);
                if frame.end_headers() {
                    side.continuation_expected = false;
                    decode_block(side, decoder)?;
                }
            }
            FrameType::Data => {
                side.body.extend_from_slice(frame_content(frame)?);
                if frame.end_stream() {
                    side.end_stream = true;
                }
            }
            _ => return Ok(None),
        }

        if direction == Direction::Request
            && side.end_stream
            && side.headers_received
            && pair.request_done_at.is_none()
        {
            pair.request_done_at = Some(OffsetDateTime::now_utc());
            return Ok(Some(frame.stream_id));
        }
        Ok(None)
    }

    /// Removes and returns a completed stream pair.
    pub fn take_complete(&mut self) -> Option<(u32, StreamPair)> {
        let id = self
            .streams
            .iter()
            .find(|(_, pair)| pair.is_complete())
            .map(|(id, _)| *id)?;
        self.streams.remove(&id).map(|pair| (id, pair))
    }

    pub fn take(&mut self, id: u32) -> Option<StreamPair> {
        self.streams.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

fn decode_block(side: &mut StreamSide, decoder: &mut Decoder) -> Result<(), ProxyError> {
    let block = std::mem::take(&mut side.header_block);
    let decoded = decoder
        .decode(&block)
        .map_err(|e| ProxyError::ProtocolViolation(format!("HPACK: {:?}", e)))?;
    let headers: Headers = decoded
        .into_iter()
        .map(|(key, value)| {
            (
                String::from_utf8_lossy(&key).to_string(),
                String::from_utf8_lossy(&value).to_string(),
            )
        })
        .collect();

    if !side.headers_received {
        side.headers = Some(headers);
        side.headers_received = true;
    } else {
        side.trailers = Some(headers);
        side.trailers_received = true;
    }
    Ok(())
}

/// Builds the mock for a completed stream pair.
fn pair_to_spec(pair: StreamPair) -> Result<GrpcSpec, ProxyError> {
    let request_done_at = pair.request_done_at.unwrap_or_else(OffsetDateTime::now_utc);
    Ok(GrpcSpec {
        request_headers: pair.request.headers.unwrap_or_default(),
        response_headers: pair.response.headers.unwrap_or_default(),
        trailers: pair.response.trailers.unwrap_or_default(),
        request_messages: grpc::parse_messages(&pair.request.body)?,
        response_messages: grpc::parse_messages(&pair.response.body)?,
        request_at: request_done_at,
        response_at: OffsetDateTime::now_utc(),
    })
}

/// Record mode: ingestion (client to origin) and egress (origin to client)
/// run as two cooperative tasks sharing the stream table under a mutex.
/// Each direction owns its HPACK decoder; the dynamic tables never mix.
pub async fn record<C, O>(
    client: C,
    client_prefix: Vec<u8>,
    origin: O,
    sink: &dyn MockSink,
    idle: Duration,
    seq: &AtomicI64,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin);
    let table = Mutex::new(StreamTable::new());
    let emit = |table: &Mutex<StreamTable>| -> Result<(), ProxyError> {
        let mut table = table.lock().unwrap();
        while let Some((stream_id, pair)) = table.take_complete() {
            let order = seq.fetch_add(1, Ordering::SeqCst);
            sink.emit(Mock::new(
                MockKind::Grpc,
                format!("mock-{}", order),
                MockSpec::Grpc(pair_to_spec(pair)?),
                order,
            ))?;
            debug!(stream_id, order, "Recorded gRPC exchange");
        }
        Ok(())
    };

    let ingest = async {
        let mut reader = FrameReader::with_prefix(client_prefix);
        let mut decoder = Decoder::new();
        // The preface is not a frame; consume it before parsing starts and
        // forward it with whatever arrived alongside.
        while reader.buffer_mut().len() < HTTP2_PREFACE.len() {
            let buffer = reader.buffer_mut();
            let n = read_some(&mut client_read, buffer, idle).await?;
            if n == 0 {
                return Err(ProxyError::ShortRead);
            }
        }
        if !reader.buffer_mut().starts_with(HTTP2_PREFACE) {
            return Err(ProxyError::ProtocolViolation(format!(
                "bad HTTP/2 preface: {}",
                hex_preview(reader.buffer_mut(), 24)
            )));
        }
        let buffered = reader.buffer_mut().clone();
        origin_write.write_all(&buffered).await?;
        origin_write.flush().await?;
        reader.buffer_mut().drain(..HTTP2_PREFACE.len());
        loop {
            while let Some(frame) = reader.next_frame()? {
                let mut table = table.lock().unwrap();
                table.apply(Direction::Request, &frame, &mut decoder)?;
            }
            let mut chunk = Vec::new();
            let n = read_some(&mut client_read, &mut chunk, idle).await?;
            if n == 0 {
                origin_write.shutdown().await?;
                return Ok::<_, ProxyError>(());
            }
            origin_write.write_all(&chunk).await?;
            origin_write.flush().await?;
            reader.push(&chunk);
        }
    };

    let egress = async {
        let mut reader = FrameReader::new();
        let mut decoder = Decoder::new();
        loop {
            while let Some(frame) = reader.next_frame()? {
                {
                    let mut table = table.lock().unwrap();
                    table.apply(Direction::Response, &frame, &mut decoder)?;
                }
                emit(&table)?;
            }
            let mut chunk = Vec::new();
            let n = read_some(&mut origin_read, &mut chunk, idle).await?;
            if n == 0 {
                client_write.shutdown().await?;
                return Ok::<_, ProxyError>(());
            }
            client_write.write_all(&chunk).await?;
            client_write.flush().await?;
            reader.push(&chunk);
        }
    };

    tokio::try_join!(ingest, egress)?;
    emit(&table)
}

/// Replay mode: serve recorded gRPC exchanges to an HTTP/2 client without
/// touching the origin. Misses answer a trailers-only response with
/// `grpc-status: 14`.
pub async fn replay<C>(
    client: C,
    client_prefix: Vec<u8>,
    matcher: &Matcher,
    noise: &[String],
    idle: Duration,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let mut reader = FrameReader::with_prefix(client_prefix);
    let mut request_decoder = Decoder::new();
    let mut response_encoder = Encoder::new();
    let mut table = StreamTable::new();

    // Consume the connection preface, then advertise our settings.
    while reader.buffer_mut().len() < HTTP2_PREFACE.len() {
        let buffer = reader.buffer_mut();
        let n = read_some(&mut client_read, buffer, idle).await?;
        if n == 0 {
            return Err(ProxyError::ShortRead);
        }
    }
    if !reader.buffer_mut().starts_with(HTTP2_PREFACE) {
        return Err(ProxyError::ProtocolViolation(format!(
            "bad HTTP/2 preface: {}",
            hex_preview(reader.buffer_mut(), 24)
        )));
    }
    reader.buffer_mut().drain(..HTTP2_PREFACE.len());
    client_write
        .write_all(&encode_frame(FrameType::Settings, 0, 0, &[]))
        .await?;
    client_write.flush().await?;

    loop {
        while let Some(frame) = reader.next_frame()? {
            match frame.frame_type {
                FrameType::Settings if !frame.ack() => {
                    client_write
                        .write_all(&encode_frame(FrameType::Settings, FLAG_ACK, 0, &[]))
                        .await?;
                }
                FrameType::Ping if !frame.ack() => {
                    client_write
                        .write_all(&encode_frame(FrameType::Ping, FLAG_ACK, 0, &frame.payload))
                        .await?;
                }
                FrameType::Goaway => return Ok(()),
                _ => {
                    if let Some(stream_id) =
                        table.apply(Direction::Request, &frame, &mut request_decoder)?
                    {
                        let pair = table.take(stream_id).unwrap_or_default();
                        serve_stream(
                            &mut client_write,
                            &mut response_encoder,
                            stream_id,
                            pair,
                            matcher,
                            noise,
                        )
                        .await?;
                    }
                }
            }
        }
        let buffer = reader.buffer_mut();
        let n = read_some(&mut client_read, buffer, idle).await?;
        if n == 0 {
            return Ok(());
        }
    }
}

async fn serve_stream<W>(
    client_write: &mut W,
    encoder: &mut Encoder<'_>,
    stream_id: u32,
    pair: StreamPair,
    matcher: &Matcher,
    noise: &[String],
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let request_headers = pair.request.headers.clone().unwrap_or_default();
    let messages = grpc::parse_messages(&pair.request.body)?;
    let body = messages
        .first()
        .map(|m| m.data.clone())
        .unwrap_or_default();
    let fingerprint = Fingerprint::from_grpc(&request_headers, body, noise);

    match matcher.match_request(&fingerprint, MockKind::Grpc) {
        Some(mock) => {
            let spec = match &mock.spec {
                MockSpec::Grpc(spec) => spec.clone(),
                _ => return Err(ProxyError::NoMatch),
            };
            let delivered = async {
                write_headers(client_write, encoder, stream_id, &spec.response_headers, 0)
                    .await?;
                let data = grpc::encode_messages(&spec.response_messages);
                if !data.is_empty() {
                    client_write
                        .write_all(&encode_frame(FrameType::Data, 0, stream_id, &data))
                        .await?;
                }
                write_headers(
                    client_write,
                    encoder,
                    stream_id,
                    &spec.trailers,
                    FLAG_END_STREAM,
                )
                .await
            }
            .await;
            if let Err(e) = delivered {
                matcher.restore(&mock);
                return Err(e);
            }
            debug!(stream_id, mock = %mock.name, "Replayed gRPC stream");
        }
        None => {
            warn!(stream_id, path = %fingerprint.path, "gRPC replay miss");
            let mut trailers = Headers::new();
            trailers.push(":status", "200");
            trailers.push("content-type", "application/grpc");
            trailers.push("grpc-status", "14");
            trailers.push("grpc-message", "no matching mock");
            write_headers(client_write, encoder, stream_id, &trailers, FLAG_END_STREAM).await?;
        }
    }
    client_write.flush().await?;
    Ok(())
}

pub async fn write_headers<W>(
    writer: &mut W,
    encoder: &mut Encoder<'_>,
    stream_id: u32,
    headers: &Headers,
    extra_flags: u8,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let block = encoder.encode(
        headers
            .iter()
            .map(|(key, value)| (key.as_bytes(), value.as_bytes())),
    );
    writer
        .write_all(&encode_frame(
            FrameType::Headers,
            FLAG_END_HEADERS | extra_flags,
            stream_id,
            &block,
        ))
        .await?;
    Ok(())
}
