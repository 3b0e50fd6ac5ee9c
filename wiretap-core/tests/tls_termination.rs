//! TLS termination end to end over in-process streams: ClientHello
//! pre-parse, leaf minting against a generated CA, ALPN choice, handshake,
//! and cleartext flow through the framed stream.

use rustls::pki_types::ServerName;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Duration;
use tokio_rustls::TlsConnector;
use wiretap_core::cert::{CertificateAuthority, origin_client_config};
use wiretap_core::tls;

fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "wiretap-tls-test-{}-{}",
        label,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[tokio::test]
async fn terminates_and_carries_cleartext() {
    let dir = temp_dir("terminate");
    let ca = CertificateAuthority::load_or_generate(&dir, None).unwrap();

    let (client_side, server_side) = tokio::io::duplex(65536);

    let server = async {
        let terminated = tls::terminate(server_side, &ca, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(terminated.info.sni.as_deref(), Some("svc.test"));
        assert_eq!(
            terminated.negotiated_alpn.as_deref(),
            Some(b"http/1.1".as_slice())
        );
        assert!(!terminated.client_cert_presented);

        let mut stream = terminated.stream;
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.unwrap();
        stream.flush().await.unwrap();
    };

    let client = async {
        // The proxy-side client config skips verification and offers both
        // protocols; the terminator must pick http/1.1.
        let config =
            origin_client_config(vec![b"h2".to_vec(), b"http/1.1".to_vec()]).unwrap();
        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from("svc.test").unwrap();
        let mut stream = connector.connect(server_name, client_side).await.unwrap();

        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    };

    tokio::join!(server, client);
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn h2_only_client_gets_h2() {
    let dir = temp_dir("h2");
    let ca = CertificateAuthority::load_or_generate(&dir, None).unwrap();

    let (client_side, server_side) = tokio::io::duplex(65536);

    let server = async {
        let terminated = tls::terminate(server_side, &ca, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            terminated.negotiated_alpn.as_deref(),
            Some(b"h2".as_slice())
        );
    };

    let client = async {
        let config = origin_client_config(vec![b"h2".to_vec()]).unwrap();
        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from("svc.test").unwrap();
        let _stream = connector.connect(server_name, client_side).await.unwrap();
    };

    tokio::join!(server, client);
    let _ = std::fs::remove_dir_all(&dir);
}
