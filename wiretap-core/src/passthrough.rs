//! Opaque passthrough for traffic no parser claims. Record tees both
//! directions into a generic mock; replay has nothing to match against and
//! fails with `NoMatch` at the dispatcher.

use crate::error::ProxyError;
use crate::framing::read_some;
use crate::mock::{GenericSpec, Mock, MockKind, MockSpec};
use crate::persist::MockSink;
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Duration;
use tracing::debug;

/// Copies client to origin and origin to client until both sides close,
/// capturing each direction. Emits a single generic mock for the whole
/// flow.
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
    let request_at = OffsetDateTime::now_utc();
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin);

    let upstream = async {
        let mut captured = client_prefix;
        if !captured.is_empty() {
            origin_write.write_all(&captured).await?;
        }
        loop {
            let start = captured.len();
            let n = read_some(&mut client_read, &mut captured, idle).await?;
            if n == 0 {
                origin_write.shutdown().await?;
                return Ok::<_, ProxyError>(captured);
            }
            origin_write.write_all(&captured[start..]).await?;
        }
    };

    let downstream = async {
        let mut captured = Vec::new();
        loop {
            let start = captured.len();
            let n = read_some(&mut origin_read, &mut captured, idle).await?;
            if n == 0 {
                client_write.shutdown().await?;
                return Ok::<_, ProxyError>(captured);
            }
            client_write.write_all(&captured[start..]).await?;
        }
    };

    let (request, response) = tokio::try_join!(upstream, downstream)?;
    let order = seq.fetch_add(1, Ordering::SeqCst);
    debug!(
        order,
        request_bytes = request.len(),
        response_bytes = response.len(),
        "Recorded opaque flow"
    );
    sink.emit(Mock::new(
        MockKind::Generic,
        format!("mock-{}", order),
        MockSpec::Generic(GenericSpec {
            request,
            response,
            request_at,
            response_at: OffsetDateTime::now_utc(),
        }),
        order,
    ))
}
