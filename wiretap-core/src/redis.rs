//! Redis engine: drives record or replay over one RESP connection.
//!
//! Commands and replies travel in batches: one batch of parsed values per
//! read burst on the request side, and one reply per command on the
//! response side.

use crate::error::ProxyError;
use crate::framing::read_some;
use crate::matcher::Matcher;
use crate::mock::{Mock, MockKind, MockSpec, RedisSpec};
use crate::persist::MockSink;
use crate::resp::{RespValue, detect_protocol_version, parse_all, serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Duration;
use tracing::{debug, warn};

const NO_MATCH_REPLY: &[u8] = b"-ERR no mock\r\n";

#[derive(Clone)]
pub struct RedisConfig {
    /// Deadline for the first read of a batch.
    pub idle: Duration,
    /// Opportunistic deadline while waiting for the rest of a reply batch.
    pub opportunistic: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(300),
            opportunistic: Duration::from_secs(1),
        }
    }
}

/// One parsed batch plus the raw bytes it consumed.
struct Batch {
    values: Vec<RespValue>,
    raw: Vec<u8>,
}

/// Reads from `reader` until at least `min_values` complete values parse.
/// `Ok(None)` is a clean EOF on an empty buffer.
async fn read_batch<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    min_values: usize,
    deadline: Duration,
) -> Result<Option<Batch>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let (values, consumed) = parse_all(buf)?;
        if !values.is_empty() && values.len() >= min_values {
            let raw: Vec<u8> = buf.drain(..consumed).collect();
            return Ok(Some(Batch { values, raw }));
        }
        let n = read_some(reader, buf, deadline).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(ProxyError::ShortRead)
            };
        }
    }
}

/// Record path: parse both directions, forward raw bytes unchanged, and
/// emit one mock per request/reply batch.
pub async fn record<C, O>(
    client: C,
    client_prefix: Vec<u8>,
    origin: O,
    sink: &dyn MockSink,
    cfg: &RedisConfig,
    seq: &AtomicI64,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin);
    let mut client_buf = client_prefix;
    let mut origin_buf = Vec::new();
    let mut protocol_version: Option<u8> = None;

    loop {
        let requests =
            match read_batch(&mut client_read, &mut client_buf, 1, cfg.idle).await? {
                Some(batch) => batch,
                None => return Ok(()),
            };
        let request_at = OffsetDateTime::now_utc();
        let version =
            *protocol_version.get_or_insert_with(|| detect_protocol_version(&requests.values));

        origin_write.write_all(&requests.raw).await?;
        origin_write.flush().await?;

        // One reply per command.
        let responses = match read_batch(
            &mut origin_read,
            &mut origin_buf,
            requests.values.len(),
            cfg.opportunistic,
        )
        .await?
        {
            Some(batch) => batch,
            None => return Err(ProxyError::ShortRead),
        };
        let response_at = OffsetDateTime::now_utc();

        client_write.write_all(&responses.raw).await?;
        client_write.flush().await?;

        let order = seq.fetch_add(1, Ordering::SeqCst);
        sink.emit(Mock::new(
            MockKind::Redis,
            format!("mock-{}", order),
            MockSpec::Redis(RedisSpec {
                protocol_version: version,
                requests: requests.values,
                responses: responses.values,
                request_at,
                response_at,
            }),
            order,
        ))?;
        debug!(order, version, "Recorded Redis exchange");
    }
}

/// Replay path: structural match against recorded request trees, then
/// serialize the recorded replies back to wire bytes.
pub async fn replay<C>(
    client: C,
    client_prefix: Vec<u8>,
    matcher: &Matcher,
    cfg: &RedisConfig,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let mut client_buf = client_prefix;

    loop {
        let requests =
            match read_batch(&mut client_read, &mut client_buf, 1, cfg.idle).await? {
                Some(batch) => batch,
                None => return Ok(()),
            };

        match matcher.match_redis(&requests.values) {
            Some(mock) => {
                let spec = match &mock.spec {
                    MockSpec::Redis(spec) => spec,
                    _ => return Err(ProxyError::NoMatch),
                };
                let mut wire = Vec::new();
                for value in &spec.responses {
                    wire.extend_from_slice(&serialize(value));
                }
                let delivered = async {
                    client_write.write_all(&wire).await?;
                    client_write.flush().await
                }
                .await;
                if let Err(e) = delivered {
                    matcher.restore(&mock);
                    return Err(e.into());
                }
            }
            None => {
                warn!("Redis replay miss");
                client_write.write_all(NO_MATCH_REPLY).await?;
                client_write.flush().await?;
                return Err(ProxyError::NoMatch);
            }
        }
    }
}
