//! gRPC support: length-prefixed message framing, a schemaless protobuf
//! wire-format text rendering, and the client-mode replayer that reissues a
//! recorded call against a live server.

use crate::detect::HTTP2_PREFACE;
use crate::error::ProxyError;
use crate::framing::read_some;
use crate::http2::{
    FLAG_END_STREAM, Frame, FrameReader, FrameType, encode_frame, write_headers,
};
use crate::mock::{GrpcMessage, GrpcSpec, Headers};
use fluke_hpack::{Decoder, Encoder};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, lookup_host};
use tokio::time::{Duration, timeout};
use tracing::debug;

/// Parses gRPC length-prefixed messages: `{u8 compression flag, u32 BE
/// length, payload}`, repeated.
pub fn parse_messages(body: &[u8]) -> Result<Vec<GrpcMessage>, ProxyError> {
    let mut messages = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let header = body.get(pos..pos + 5).ok_or(ProxyError::ShortRead)?;
        let compression_flag = header[0];
        let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let data = body
            .get(pos + 5..pos + 5 + length)
            .ok_or(ProxyError::ShortRead)?
            .to_vec();
        let text = proto_to_text(&data);
        messages.push(GrpcMessage {
            compression_flag,
            data,
            text,
        });
        pos += 5 + length;
    }
    Ok(messages)
}

/// Inverse of `parse_messages`.
pub fn encode_messages(messages: &[GrpcMessage]) -> Vec<u8> {
    let mut out = Vec::new();
    for message in messages {
        out.push(message.compression_flag);
        out.extend_from_slice(&(message.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&message.data);
    }
    out
}

/// Renders protobuf wire bytes as text without a schema: field numbers with
/// varint/fixed values, nested messages in braces, strings quoted, other
/// length-delimited payloads hex-dumped. Unparseable input falls back to a
/// hex dump of the whole payload.
pub fn proto_to_text(data: &[u8]) -> String {
    match walk_message(data, 0) {
        Some(rendered) => rendered,
        None => format!("raw:{}", hex_string(data)),
    }
}

const MAX_NESTING: usize = 16;

fn walk_message(data: &[u8], depth: usize) -> Option<String> {
    if depth > MAX_NESTING {
        return None;
    }
    let mut fields = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (tag, next) = read_varint(data, pos)?;
        let field_number = tag >> 3;
        let wire_type = tag & 0x7;
        if field_number == 0 {
            return None;
        }
        pos = next;
        match wire_type {
            0 => {
                let (value, next) = read_varint(data, pos)?;
                fields.push(format!("{}:{}", field_number, value));
                pos = next;
            }
            1 => {
                let bytes = data.get(pos..pos + 8)?;
                let value = u64::from_le_bytes(bytes.try_into().ok()?);
                fields.push(format!("{}:{}", field_number, value));
                pos += 8;
            }
            2 => {
                let (length, next) = read_varint(data, pos)?;
                pos = next;
                let payload = data.get(pos..pos + length as usize)?;
                pos += length as usize;
                fields.push(format!(
                    "{}:{}",
                    field_number,
                    render_length_delimited(payload, depth)
                ));
            }
            5 => {
                let bytes = data.get(pos..pos + 4)?;
                let value = u32::from_le_bytes(bytes.try_into().ok()?);
                fields.push(format!("{}:{}", field_number, value));
                pos += 4;
            }
            _ => return None,
        }
    }
    Some(format!("{{{}}}", fields.join(" ")))
}

fn render_length_delimited(payload: &[u8], depth: usize) -> String {
    // Printable text wins over the nested-message reading; short ASCII
    // payloads are usually both.
    if let Ok(text) = std::str::from_utf8(payload) {
        if text.chars().all(|c| !c.is_control()) {
            return format!("{:?}", text);
        }
    }
    if let Some(nested) = walk_message(payload, depth + 1) {
        return nested;
    }
    format!("0x{}", hex_string(payload))
}

fn read_varint(data: &[u8], mut pos: usize) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(pos)?;
        pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, pos));
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Result of reissuing a recorded call against a live server.
#[derive(Debug)]
pub struct GrpcCallResult {
    pub headers: Headers,
    pub messages: Vec<GrpcMessage>,
    pub trailers: Headers,
}

const PSEUDO_ORDER: [&str; 4] = [":method", ":scheme", ":authority", ":path"];

/// Request headers in wire order: pseudo-headers first, in the canonical
/// order, then everything else as recorded.
fn ordered_request_headers(recorded: &Headers) -> Headers {
    let mut ordered = Headers::new();
    for key in PSEUDO_ORDER {
        if let Some(value) = recorded.get(key) {
            ordered.push(key, value);
        }
    }
    for (key, value) in recorded.iter() {
        if !key.starts_with(':') {
            ordered.push(key, value);
        }
    }
    ordered
}

/// Client-mode replay of one recorded unary call: open TCP, send the
/// preface, exchange SETTINGS, issue HEADERS + DATA with END_STREAM, then a
/// WINDOW_UPDATE on stream 0 and a PING, and read until the response stream
/// ends. Absent trailers are synthesized as `grpc-status: 0`.
pub async fn replay_call(
    addr: &str,
    spec: &GrpcSpec,
    deadline: Duration,
) -> Result<GrpcCallResult, ProxyError> {
    let resolved = lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| ProxyError::Io(std::io::Error::other("failed to resolve target")))?;
    let mut stream = timeout(deadline, TcpStream::connect(resolved)).await??;
    debug!(addr, "Replaying gRPC call");

    stream.write_all(HTTP2_PREFACE).await?;
    stream
        .write_all(&encode_frame(FrameType::Settings, 0, 0, &[]))
        .await?;

    let mut reader = FrameReader::new();
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    // Wait for the server settings before opening the stream.
    let server_settings = read_frame(&mut stream, &mut reader, deadline).await?;
    if server_settings.frame_type != FrameType::Settings {
        return Err(ProxyError::ProtocolViolation(format!(
            "expected SETTINGS, got {:?}",
            server_settings.frame_type
        )));
    }
    stream
        .write_all(&encode_frame(FrameType::Settings, 0x1, 0, &[]))
        .await?;

    let stream_id = 1;
    write_headers(
        &mut stream,
        &mut encoder,
        stream_id,
        &ordered_request_headers(&spec.request_headers),
        0,
    )
    .await?;
    stream
        .write_all(&encode_frame(
            FrameType::Data,
            FLAG_END_STREAM,
            stream_id,
            &encode_messages(&spec.request_messages),
        ))
        .await?;
    stream
        .write_all(&encode_frame(
            FrameType::WindowUpdate,
            0,
            0,
            &0x0001_0000u32.to_be_bytes(),
        ))
        .await?;
    stream
        .write_all(&encode_frame(FrameType::Ping, 0, 0, &[0u8; 8]))
        .await?;
    stream.flush().await?;

    let mut headers: Option<Headers> = None;
    let mut trailers: Option<Headers> = None;
    let mut body = Vec::new();

    loop {
        let frame = read_frame(&mut stream, &mut reader, deadline).await?;
        match frame.frame_type {
            FrameType::Headers if frame.stream_id == stream_id => {
                let decoded = decoder
                    .decode(&frame.payload)
                    .map_err(|e| ProxyError::ProtocolViolation(format!("HPACK: {:?}", e)))?;
                let block: Headers = decoded
                    .into_iter()
                    .map(|(key, value)| {
                        (
                            String::from_utf8_lossy(&key).to_string(),
                            String::from_utf8_lossy(&value).to_string(),
                        )
                    })
                    .collect();
                if headers.is_none() {
                    headers = Some(block);
                } else {
                    trailers = Some(block);
                }
                if frame.end_stream() {
                    break;
                }
            }
            FrameType::Data if frame.stream_id == stream_id => {
                body.extend_from_slice(&frame.payload);
                if frame.end_stream() {
                    break;
                }
            }
            FrameType::Goaway => {
                return Err(ProxyError::ProtocolViolation("GOAWAY before response".into()));
            }
            _ => {}
        }
    }

    let trailers = trailers.unwrap_or_else(|| {
        let mut synthesized = Headers::new();
        synthesized.push("grpc-status", "0");
        synthesized.push("grpc-message", "");
        synthesized
    });

    Ok(GrpcCallResult {
        headers: headers.unwrap_or_default(),
        messages: parse_messages(&body)?,
        trailers,
    })
}

async fn read_frame(
    stream: &mut TcpStream,
    reader: &mut FrameReader,
    deadline: Duration,
) -> Result<Frame, ProxyError> {
    loop {
        if let Some(frame) = reader.next_frame()? {
            return Ok(frame);
        }
        let n = read_some(stream, reader.buffer_mut(), deadline).await?;
        if n == 0 {
            return Err(ProxyError::ShortRead);
        }
    }
}
