pub mod cert;
pub mod detect;
pub mod encoding;
pub mod error;
pub mod framing;
pub mod grpc;
pub mod http1;
pub mod http2;
pub mod matcher;
pub mod mock;
pub mod passthrough;
pub mod persist;
pub mod redirect;
pub mod redis;
pub mod resp;
pub mod store;
pub mod tls;

use crate::cert::CertificateAuthority;
use crate::detect::{Detection, Protocol};
use crate::error::ProxyError;
use crate::framing::{Rewind, read_some};
use crate::matcher::Matcher;
use crate::persist::{MockSink, MockSource, YamlMockFile};
use crate::redirect::{DestinationLookup, NetworkAddress, PortMap};
use crate::store::MockStore;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};
use wiretap_config::{Config, Mode};

/// Runs the proxy until the shutdown channel fires. One task per accepted
/// connection; a panicking connection task is isolated by its task boundary
/// and never reaches siblings.
pub async fn run_proxy(
    config: Config,
    registry: Option<Registry>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let handler = Arc::new(ConnectionHandler::new(config.clone(), registry.as_ref())?);

    let mut listeners: Vec<TcpListener> = Vec::new();
    for addr_str in &config.listen_addrs {
        let addr: SocketAddr = addr_str.parse()?;
        info!("Starting listener on {}", addr);
        listeners.push(TcpListener::bind(addr).await?);
    }

    info!(
        mode = ?config.mode,
        ca_cert = %handler.ca.ca_cert_path().display(),
        "Proxy started, waiting for connections..."
    );

    loop {
        let mut accepts = FuturesUnordered::new();
        for listener in &listeners {
            accepts.push(listener.accept());
        }

        let accepted = tokio::select! {
            _ = shutdown_rx.recv() => None,
            Some(result) = accepts.next() => Some(result),
        };
        drop(accepts);

        match accepted {
            None => {
                info!("Received shutdown signal");
                break;
            }
            Some(Ok((socket, addr))) => {
                let handler = handler.clone();
                let shutdown = shutdown_rx.resubscribe();
                tokio::spawn(async move {
                    handler.handle_connection(socket, addr, shutdown).await;
                });
            }
            Some(Err(e)) => {
                error!("Accept error: {}", e);
            }
        }
    }

    info!("Shutting down proxy");
    Ok(())
}

struct ProxyMetrics {
    connections_total: IntCounterVec,
    connections_active: IntGauge,
    mocks_recorded: IntCounter,
    replay_misses: IntCounter,
}

impl ProxyMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections_total = IntCounterVec::new(
            Opts::new(
                "wiretap_connections_total",
                "Total number of connections handled",
            ),
            &["protocol", "status"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = IntGauge::new(
            "wiretap_connections_active",
            "Number of currently active connections",
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let mocks_recorded = IntCounter::new(
            "wiretap_mocks_recorded_total",
            "Total number of mocks emitted by the recorder",
        )?;
        registry.register(Box::new(mocks_recorded.clone()))?;

        let replay_misses = IntCounter::new(
            "wiretap_replay_misses_total",
            "Total number of replay requests with no matching mock",
        )?;
        registry.register(Box::new(replay_misses.clone()))?;

        Ok(Self {
            connections_total,
            connections_active,
            mocks_recorded,
            replay_misses,
        })
    }
}

/// Counts every emitted mock, then forwards to the real sink.
struct CountingSink {
    inner: Arc<dyn MockSink>,
    counter: Option<IntCounter>,
}

impl MockSink for CountingSink {
    fn emit(&self, mock: crate::mock::Mock) -> Result<(), ProxyError> {
        if let Some(counter) = &self.counter {
            counter.inc();
        }
        self.inner.emit(mock)
    }
}

pub struct ConnectionHandler {
    config: Arc<Config>,
    ca: CertificateAuthority,
    store: Arc<MockStore>,
    matcher: Arc<Matcher>,
    sink: CountingSink,
    lookup: Arc<PortMap>,
    metrics: Option<Arc<ProxyMetrics>>,
    seq: AtomicI64,
}

impl ConnectionHandler {
    pub fn new(config: Arc<Config>, registry: Option<&Registry>) -> Result<Self, ProxyError> {
        let metrics = match registry {
            Some(registry) => Some(Arc::new(ProxyMetrics::new(registry).map_err(|e| {
                ProxyError::Io(io::Error::other(e))
            })?)),
            None => None,
        };

        let ca = CertificateAuthority::load_or_generate(&config.cert_dir, config.backdate)?;
        let store = Arc::new(MockStore::new());
        let file = Arc::new(YamlMockFile::new(&config.mock_file));

        if config.mode == Mode::Replay {
            store.load_all(file.load_mocks()?);
            info!(filtered = store.filtered_len(), "Replay session ready");
        }

        let matcher = Arc::new(Matcher::new(store.clone(), config.header_noise.clone()));
        let sink = CountingSink {
            inner: file,
            counter: metrics.as_ref().map(|m| m.mocks_recorded.clone()),
        };

        Ok(Self {
            config,
            ca,
            store,
            matcher,
            sink,
            lookup: Arc::new(PortMap::new()),
            metrics,
            seq: AtomicI64::new(0),
        })
    }

    /// The collaborator-facing lookup map; the redirection mechanism
    /// inserts the original destination keyed by the client's local port
    /// before the redirected connection arrives.
    pub fn destination_lookup(&self) -> Arc<PortMap> {
        self.lookup.clone()
    }

    pub fn store(&self) -> Arc<MockStore> {
        self.store.clone()
    }

    pub async fn handle_connection(
        &self,
        client: TcpStream,
        client_addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let peer = client_addr.to_string();
        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.inc();
        }
        info!(peer, "New connection");

        let source_port = client_addr.port();
        let result = tokio::select! {
            result = self.process_connection(client, client_addr) => result,
            _ = shutdown.recv() => Err(ProxyError::Canceled),
        };
        self.lookup.release_original_dest(source_port);

        let protocol = match &result {
            Ok(protocol) => protocol.as_str(),
            Err(_) => "unknown",
        };
        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();
            let status = if result.is_ok() { "success" } else { "failure" };
            metrics
                .connections_total
                .with_label_values(&[protocol, status])
                .inc();
            if matches!(result, Err(ProxyError::NoMatch)) {
                metrics.replay_misses.inc();
            }
        }

        match result {
            Ok(_) => info!(peer, protocol, "Connection completed"),
            Err(ProxyError::Canceled) => debug!(peer, "Connection canceled by shutdown"),
            Err(e) if e.is_peer_error() => {
                debug!(peer, error = %e, "Client connection ended abnormally")
            }
            Err(e) => error!(peer, error = %e, "Connection error"),
        }
    }

    async fn process_connection(
        &self,
        client: TcpStream,
        client_addr: SocketAddr,
    ) -> Result<Protocol, ProxyError> {
        let timeouts = &self.config.timeouts;
        let hello_deadline = Duration::from_secs(timeouts.client_hello);

        let destination = self
            .lookup
            .lookup_original_dest(client_addr.port())
            .or_else(|| redirect::original_dst(&client));

        // Five-byte peek decides TLS without consuming; the parsers inherit
        // every byte.
        let mut peek_buf = [0u8; 5];
        let n = timeout(hello_deadline, client.peek(&mut peek_buf)).await??;
        if n == 0 {
            return Err(ProxyError::ShortRead);
        }

        let mut tls_meta: Option<TlsMeta> = None;
        let mut stream = if tls::looks_like_tls(&peek_buf[..n]) {
            let terminated = tls::terminate(client, &self.ca, hello_deadline).await?;
            debug!(
                sni = terminated.info.sni.as_deref().unwrap_or(tls::FALLBACK_HOSTNAME),
                alpn = ?terminated.negotiated_alpn.as_deref().map(String::from_utf8_lossy),
                client_cert = terminated.client_cert_presented,
                "TLS terminated"
            );
            tls_meta = Some(TlsMeta {
                sni: terminated
                    .info
                    .sni
                    .clone()
                    .unwrap_or_else(|| tls::FALLBACK_HOSTNAME.to_string()),
                alpn: terminated.negotiated_alpn.clone(),
            });
            ClientStream::Tls(Box::new(terminated.stream))
        } else {
            ClientStream::Plain(client)
        };

        // Consume bytes until the detector decides; the chosen engine gets
        // them back as its prefix.
        let mut prefix = Vec::new();
        let protocol = loop {
            match detect::detect(&prefix) {
                Detection::Decided(protocol) => break protocol,
                Detection::NeedMore => {
                    let n = read_some(&mut stream, &mut prefix, hello_deadline).await?;
                    if n == 0 {
                        if prefix.is_empty() {
                            return Err(ProxyError::ShortRead);
                        }
                        break Protocol::Opaque;
                    }
                }
            }
        };
        debug!(protocol = protocol.as_str(), "Detected protocol");

        match self.config.mode {
            Mode::Record => {
                let destination = destination.ok_or_else(|| {
                    ProxyError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        "no original destination for redirected connection",
                    ))
                })?;
                let origin = self.dial_origin(destination, tls_meta.as_ref()).await?;
                self.record(protocol, stream, prefix, origin).await?;
            }
            Mode::Replay => {
                let origin = if self.config.fallback_on_miss && protocol == Protocol::Http1 {
                    match destination {
                        Some(destination) => {
                            Some(self.dial_origin(destination, tls_meta.as_ref()).await?)
                        }
                        None => None,
                    }
                } else {
                    None
                };
                self.replay(protocol, stream, prefix, origin).await?;
            }
        }
        Ok(protocol)
    }

    async fn record(
        &self,
        protocol: Protocol,
        stream: ClientStream,
        prefix: Vec<u8>,
        origin: OriginStream,
    ) -> Result<(), ProxyError> {
        let idle = Duration::from_secs(self.config.timeouts.idle);
        match protocol {
            Protocol::Http1 => {
                http1::record(
                    stream,
                    prefix,
                    origin,
                    &self.sink,
                    &self.http1_config(),
                    &self.seq,
                )
                .await
            }
            Protocol::Http2 => {
                http2::record(stream, prefix, origin, &self.sink, idle, &self.seq).await
            }
            Protocol::Redis => {
                redis::record(
                    stream,
                    prefix,
                    origin,
                    &self.sink,
                    &self.redis_config(),
                    &self.seq,
                )
                .await
            }
            Protocol::Opaque => {
                passthrough::record(stream, prefix, origin, &self.sink, idle, &self.seq).await
            }
        }
    }

    async fn replay(
        &self,
        protocol: Protocol,
        stream: ClientStream,
        prefix: Vec<u8>,
        origin: Option<OriginStream>,
    ) -> Result<(), ProxyError> {
        let idle = Duration::from_secs(self.config.timeouts.idle);
        match protocol {
            Protocol::Http1 => {
                if self.config.pipelining {
                    http1::replay_pipelined(
                        stream,
                        prefix,
                        self.matcher.clone(),
                        self.http1_config(),
                    )
                    .await
                } else {
                    http1::replay(stream, prefix, origin, &self.matcher, &self.http1_config())
                        .await
                }
            }
            Protocol::Http2 => {
                http2::replay(
                    stream,
                    prefix,
                    &self.matcher,
                    &self.config.header_noise,
                    idle,
                )
                .await
            }
            Protocol::Redis => {
                redis::replay(stream, prefix, &self.matcher, &self.redis_config()).await
            }
            Protocol::Opaque => {
                warn!("Opaque traffic cannot be replayed");
                Err(ProxyError::NoMatch)
            }
        }
    }

    fn http1_config(&self) -> http1::Http1Config {
        http1::Http1Config {
            body_deadline: Duration::from_secs(self.config.timeouts.body_read),
            chunked_deadline: Duration::from_secs(self.config.timeouts.chunked_read),
            fallback_on_miss: self.config.fallback_on_miss,
            noise: self.config.header_noise.clone(),
        }
    }

    fn redis_config(&self) -> redis::RedisConfig {
        redis::RedisConfig {
            idle: Duration::from_secs(self.config.timeouts.idle),
            opportunistic: Duration::from_secs(self.config.timeouts.replay_read),
        }
    }

    /// Dials the original destination. When the client side was TLS, the
    /// origin side is TLS too, reusing the client's SNI and negotiated
    /// ALPN.
    async fn dial_origin(
        &self,
        destination: NetworkAddress,
        tls_meta: Option<&TlsMeta>,
    ) -> Result<OriginStream, ProxyError> {
        let connect_deadline = Duration::from_secs(self.config.timeouts.connect);
        let addr = destination.to_socket_addr();
        debug!(%addr, "Connecting to origin");
        let tcp = timeout(connect_deadline, TcpStream::connect(addr)).await??;

        match tls_meta {
            Some(meta) => {
                let alpn = meta.alpn.iter().cloned().collect();
                let connector = TlsConnector::from(cert::origin_client_config(alpn)?);
                let server_name = ServerName::try_from(meta.sni.clone()).map_err(|e| {
                    ProxyError::TlsHandshakeFailed(format!("origin SNI: {}", e))
                })?;
                let tls_stream = timeout(connect_deadline, connector.connect(server_name, tcp))
                    .await?
                    .map_err(|e| ProxyError::TlsHandshakeFailed(e.to_string()))?;
                Ok(OriginStream::Tls(Box::new(tls_stream)))
            }
            None => Ok(OriginStream::Plain(tcp)),
        }
    }
}

struct TlsMeta {
    sni: String,
    alpn: Option<Vec<u8>>,
}

/// Client-side stream after optional TLS termination.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<Rewind<TcpStream>>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Origin-side stream on the record path.
pub enum OriginStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for OriginStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            OriginStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            OriginStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OriginStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            OriginStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            OriginStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            OriginStream::Plain(s) => Pin::new(s).poll_flush(cx),
            OriginStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            OriginStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            OriginStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
