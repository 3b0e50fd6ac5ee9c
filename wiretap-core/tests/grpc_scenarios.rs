//! gRPC unary scenarios over in-process streams: frame-level record and
//! replay against the HTTP/2 engine.

use fluke_hpack::{Decoder, Encoder};
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Duration;
use wiretap_core::detect::HTTP2_PREFACE;
use wiretap_core::http2::{
    self, FLAG_ACK, FLAG_END_HEADERS, FLAG_END_STREAM, Frame, FrameReader, FrameType,
    encode_frame,
};
use wiretap_core::matcher::Matcher;
use wiretap_core::mock::{GrpcMessage, GrpcSpec, Headers, Mock, MockKind, MockSpec};
use wiretap_core::persist::MemorySink;
use wiretap_core::store::MockStore;

const REQUEST_PAYLOAD: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0x03, 0x08, 0x2a, 0x10];
const RESPONSE_PAYLOAD: [u8; 7] = [0x00, 0x00, 0x00, 0x00, 0x02, 0x08, 0x01];

fn headers_block(encoder: &mut Encoder<'_>, headers: &[(&str, &str)]) -> Vec<u8> {
    encoder.encode(headers.iter().map(|(k, v)| (k.as_bytes(), v.as_bytes())))
}

fn request_headers() -> Vec<(&'static str, &'static str)> {
    vec![
        (":method", "POST"),
        (":scheme", "http"),
        (":authority", "svc"),
        (":path", "/svc/M"),
        ("content-type", "application/grpc"),
    ]
}

async fn read_frames<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    parser: &mut FrameReader,
    count: usize,
) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut chunk = [0u8; 4096];
    while frames.len() < count {
        while let Some(frame) = parser.next_frame().unwrap() {
            frames.push(frame);
            if frames.len() == count {
                return frames;
            }
        }
        let n = reader.read(&mut chunk).await.unwrap();
        assert!(n > 0, "stream ended before {} frames", count);
        parser.push(&chunk[..n]);
    }
    frames
}

fn unary_mock() -> Mock {
    let request_headers: Headers = request_headers().into_iter().collect();
    let mut response_headers = Headers::new();
    response_headers.push(":status", "200");
    response_headers.push("content-type", "application/grpc");
    let mut trailers = Headers::new();
    trailers.push("grpc-status", "0");

    Mock::new(
        MockKind::Grpc,
        "grpc-0",
        MockSpec::Grpc(GrpcSpec {
            request_headers,
            response_headers,
            trailers,
            request_messages: vec![GrpcMessage {
                compression_flag: 0,
                data: REQUEST_PAYLOAD[5..].to_vec(),
                text: String::new(),
            }],
            response_messages: vec![GrpcMessage {
                compression_flag: 0,
                data: RESPONSE_PAYLOAD[5..].to_vec(),
                text: String::new(),
            }],
            request_at: time::OffsetDateTime::UNIX_EPOCH,
            response_at: time::OffsetDateTime::UNIX_EPOCH,
        }),
        0,
    )
}

/// A unary exchange recorded from interleaved client and origin frames
/// produces one complete mock with headers, message payloads, and trailers.
#[tokio::test]
async fn record_captures_unary_exchange() {
    let (client_near, client_far) = tokio::io::duplex(65536);
    let (origin_near, origin_far) = tokio::io::duplex(65536);
    let sink = MemorySink::new();
    let seq = AtomicI64::new(0);

    let proxy = http2::record(
        client_far,
        Vec::new(),
        origin_near,
        &sink,
        Duration::from_secs(1),
        &seq,
    );

    let driver = async {
        let (mut client_read, mut client_write) = tokio::io::split(client_near);
        let (mut origin_read, mut origin_write) = tokio::io::split(origin_far);
        let mut request_encoder = Encoder::new();
        let mut response_encoder = Encoder::new();

        // Client side: preface, then the request stream.
        client_write.write_all(HTTP2_PREFACE).await.unwrap();
        let block = headers_block(&mut request_encoder, &request_headers());
        client_write
            .write_all(&encode_frame(FrameType::Headers, FLAG_END_HEADERS, 1, &block))
            .await
            .unwrap();
        client_write
            .write_all(&encode_frame(
                FrameType::Data,
                FLAG_END_STREAM,
                1,
                &REQUEST_PAYLOAD,
            ))
            .await
            .unwrap();

        // Origin answers: HEADERS, DATA, trailers.
        let block = headers_block(
            &mut response_encoder,
            &[(":status", "200"), ("content-type", "application/grpc")],
        );
        origin_write
            .write_all(&encode_frame(FrameType::Headers, FLAG_END_HEADERS, 1, &block))
            .await
            .unwrap();
        origin_write
            .write_all(&encode_frame(FrameType::Data, 0, 1, &RESPONSE_PAYLOAD))
            .await
            .unwrap();
        let block = headers_block(&mut response_encoder, &[("grpc-status", "0")]);
        origin_write
            .write_all(&encode_frame(
                FrameType::Headers,
                FLAG_END_HEADERS | FLAG_END_STREAM,
                1,
                &block,
            ))
            .await
            .unwrap();

        // Both directions pass through the proxy unchanged; drain them.
        drop(client_write);
        drop(origin_write);
        let mut forwarded = Vec::new();
        origin_read.read_to_end(&mut forwarded).await.unwrap();
        assert!(forwarded.starts_with(HTTP2_PREFACE));
        let mut returned = Vec::new();
        client_read.read_to_end(&mut returned).await.unwrap();
        assert!(!returned.is_empty());
    };

    let (result, _) = tokio::join!(proxy, driver);
    result.unwrap();

    let mocks = sink.take();
    assert_eq!(mocks.len(), 1);
    match &mocks[0].spec {
        MockSpec::Grpc(spec) => {
            assert_eq!(spec.request_headers.get(":path"), Some("/svc/M"));
            assert_eq!(spec.request_messages.len(), 1);
            assert_eq!(spec.request_messages[0].data, REQUEST_PAYLOAD[5..].to_vec());
            assert_eq!(spec.response_messages[0].data, RESPONSE_PAYLOAD[5..].to_vec());
            assert_eq!(spec.trailers.get("grpc-status"), Some("0"));
        }
        other => panic!("unexpected spec: {:?}", other),
    }
}

/// Replay serves the recorded HEADERS + DATA + trailers sequence for a
/// matching stream.
#[tokio::test]
async fn replay_issues_headers_data_trailers() {
    let store = Arc::new(MockStore::new());
    store.load_all(vec![unary_mock()]);
    let matcher = Matcher::new(store, Vec::new());

    let (client_near, client_far) = tokio::io::duplex(65536);
    let proxy = http2::replay(
        client_far,
        Vec::new(),
        &matcher,
        &[],
        Duration::from_secs(1),
    );

    let driver = async {
        let (mut read, mut write) = tokio::io::split(client_near);
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut parser = FrameReader::new();

        write.write_all(HTTP2_PREFACE).await.unwrap();
        write
            .write_all(&encode_frame(FrameType::Settings, 0, 0, &[]))
            .await
            .unwrap();
        let block = headers_block(&mut encoder, &request_headers());
        write
            .write_all(&encode_frame(FrameType::Headers, FLAG_END_HEADERS, 1, &block))
            .await
            .unwrap();
        write
            .write_all(&encode_frame(
                FrameType::Data,
                FLAG_END_STREAM,
                1,
                &REQUEST_PAYLOAD,
            ))
            .await
            .unwrap();

        // Server settings, our settings ack, response headers, data,
        // trailers.
        let frames = read_frames(&mut read, &mut parser, 5).await;
        assert_eq!(frames[0].frame_type, FrameType::Settings);
        assert_eq!(frames[1].frame_type, FrameType::Settings);
        assert!(frames[1].flags & FLAG_ACK != 0);

        assert_eq!(frames[2].frame_type, FrameType::Headers);
        let headers = decoder.decode(&frames[2].payload).unwrap();
        assert_eq!(headers[0], (b":status".to_vec(), b"200".to_vec()));

        assert_eq!(frames[3].frame_type, FrameType::Data);
        assert_eq!(frames[3].payload, RESPONSE_PAYLOAD.to_vec());
        assert!(!frames[3].end_stream());

        assert_eq!(frames[4].frame_type, FrameType::Headers);
        assert!(frames[4].end_stream());
        let trailers = decoder.decode(&frames[4].payload).unwrap();
        assert!(
            trailers
                .iter()
                .any(|(k, v)| k == b"grpc-status" && v == b"0")
        );

        drop(write);
    };

    let (result, _) = tokio::join!(proxy, driver);
    result.unwrap();
}

/// A stream with no matching mock is answered with a trailers-only
/// `grpc-status: 14` response; the connection survives.
#[tokio::test]
async fn replay_miss_sends_grpc_unavailable() {
    let matcher = Matcher::new(Arc::new(MockStore::new()), Vec::new());

    let (client_near, client_far) = tokio::io::duplex(65536);
    let proxy = http2::replay(
        client_far,
        Vec::new(),
        &matcher,
        &[],
        Duration::from_secs(1),
    );

    let driver = async {
        let (mut read, mut write) = tokio::io::split(client_near);
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut parser = FrameReader::new();

        write.write_all(HTTP2_PREFACE).await.unwrap();
        let block = headers_block(&mut encoder, &request_headers());
        write
            .write_all(&encode_frame(
                FrameType::Headers,
                FLAG_END_HEADERS | FLAG_END_STREAM,
                1,
                &block,
            ))
            .await
            .unwrap();

        // Server settings, then the trailers-only miss response.
        let frames = read_frames(&mut read, &mut parser, 2).await;
        assert_eq!(frames[0].frame_type, FrameType::Settings);
        assert_eq!(frames[1].frame_type, FrameType::Headers);
        assert!(frames[1].end_stream());
        let trailers = decoder.decode(&frames[1].payload).unwrap();
        assert!(
            trailers
                .iter()
                .any(|(k, v)| k == b"grpc-status" && v == b"14")
        );

        drop(write);
    };

    let (result, _) = tokio::join!(proxy, driver);
    result.unwrap();
}
