use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use wiretap_config::Config;
use wiretap_core::run_proxy;

pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("wiretap=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    let config = Config::from_file(config_path)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    // Ctrl-C feeds the same shutdown channel the proxy loop listens on.
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            let _ = ctrl_c_tx.send(());
        }
    });

    let (registry, metrics_handle) = if config.metrics.enabled {
        let registry = Registry::new();
        let handle = serve_metrics(
            registry.clone(),
            config.metrics.address.parse()?,
            shutdown_rx.resubscribe(),
        )
        .await?;
        (Some(registry), Some(handle))
    } else {
        (None, None)
    };

    let proxy_result = run_proxy(config, registry, shutdown_rx).await;

    let _ = shutdown_tx.send(());
    if let Some(handle) = metrics_handle {
        info!("Waiting for metrics server to shut down");
        let _ = handle.await;
    }

    proxy_result
}

/// Serves `/metrics` and `/health` on a dedicated listener until shutdown.
async fn serve_metrics(
    registry: Registry,
    addr: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>, Box<dyn Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Metrics server shutting down");
                    break;
                }
                result = listener.accept() => {
                    let Ok((stream, _)) = result else { continue };
                    let registry = registry.clone();
                    let io = TokioIo::new(stream);

                    tokio::spawn(async move {
                        let service = hyper::service::service_fn(
                            move |req: Request<hyper::body::Incoming>| {
                                let registry = registry.clone();
                                async move { respond(&registry, req.uri().path()) }
                            },
                        );
                        if let Err(err) =
                            http1::Builder::new().serve_connection(io, service).await
                        {
                            warn!("Metrics server connection error: {}", err);
                        }
                    });
                }
            }
        }
    }))
}

fn respond(registry: &Registry, path: &str) -> Result<Response<Full<bytes::Bytes>>, String> {
    let body = match path {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let mut buffer = vec![];
            encoder
                .encode(&registry.gather(), &mut buffer)
                .map_err(|e| format!("Metrics encoding error: {}", e))?;
            bytes::Bytes::from(buffer)
        }
        "/health" => bytes::Bytes::from(r#"{"status":"healthy","service":"wiretap"}"#),
        "/" => bytes::Bytes::from(r#"{"endpoints":["/health","/metrics"]}"#),
        _ => bytes::Bytes::from(r#"{"error":"not_found"}"#),
    };
    Ok(Response::new(Full::new(body)))
}
