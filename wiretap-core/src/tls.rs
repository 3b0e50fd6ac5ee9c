//! TLS termination: handshake sniffing, ClientHello pre-parse (SNI + ALPN
//! offer), and the rustls server handshake over a minted leaf.

use crate::cert::{CertificateAuthority, server_config};
use crate::error::ProxyError;
use crate::framing::{Rewind, read_at_least};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Duration, timeout};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::debug;

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_VERSION_MAJOR: u8 = 0x03;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const ALPN_EXTENSION: u16 = 0x0010;
const MAX_RECORD_SIZE: usize = 16384;

/// Hostname used when the client sends no SNI.
pub const FALLBACK_HOSTNAME: &str = "127.0.0.1";

/// TLS record sniff on the first peeked bytes:
/// `0x16 0x03 {0x00|0x01|0x02|0x03}`.
pub fn looks_like_tls(bytes: &[u8]) -> bool {
    bytes.len() >= 3
        && bytes[0] == TLS_HANDSHAKE
        && bytes[1] == TLS_VERSION_MAJOR
        && bytes[2] <= 0x03
}

/// What the ClientHello offered, before any handshake work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientHelloInfo {
    pub sni: Option<String>,
    pub alpn: Vec<String>,
}

impl ClientHelloInfo {
    /// The single ALPN the terminator offers back. A client that can speak
    /// `http/1.1` gets only that (safer for HTTP/2-unaware downstream
    /// parsing); a client offering only `h2` gets `h2`.
    pub fn chosen_alpn(&self) -> Vec<Vec<u8>> {
        if self.alpn.iter().any(|p| p == "http/1.1") {
            vec![b"http/1.1".to_vec()]
        } else if self.alpn.iter().any(|p| p == "h2") {
            vec![b"h2".to_vec()]
        } else {
            Vec::new()
        }
    }
}

/// A terminated connection: the framed stream and what the handshake told
/// us.
pub struct TerminatedTls<S> {
    pub stream: TlsStream<Rewind<S>>,
    pub info: ClientHelloInfo,
    pub negotiated_alpn: Option<Vec<u8>>,
    pub client_cert_presented: bool,
}

/// Reads the ClientHello record, mints a leaf for its SNI, and runs the
/// server handshake. The consumed record is replayed into the handshake via
/// a rewind wrapper.
pub async fn terminate<S>(
    mut stream: S,
    ca: &CertificateAuthority,
    hello_deadline: Duration,
) -> Result<TerminatedTls<S>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut record = Vec::with_capacity(1024);
    read_at_least(&mut stream, &mut record, 5, hello_deadline).await?;

    if !looks_like_tls(&record) {
        return Err(ProxyError::TlsHandshakeFailed(
            "first bytes are not a TLS handshake record".into(),
        ));
    }

    let record_length = u16::from_be_bytes([record[3], record[4]]) as usize;
    if !(4..=MAX_RECORD_SIZE).contains(&record_length) {
        return Err(ProxyError::TlsHandshakeFailed(format!(
            "implausible record length {}",
            record_length
        )));
    }
    read_at_least(&mut stream, &mut record, 5 + record_length, hello_deadline).await?;

    let info = parse_client_hello(&record)?;
    let hostname = info.sni.as_deref().unwrap_or(FALLBACK_HOSTNAME);
    debug!(sni = hostname, alpn = ?info.alpn, "Terminating TLS");

    let leaf = ca.mint_leaf(hostname)?;
    let config = server_config(&leaf, info.chosen_alpn())?;
    let acceptor = TlsAcceptor::from(config);

    let rewound = Rewind::new(record, stream);
    let tls_stream = timeout(hello_deadline, acceptor.accept(rewound))
        .await
        .map_err(|_| ProxyError::DeadlineExceeded)?
        .map_err(|e| ProxyError::TlsHandshakeFailed(e.to_string()))?;

    let (negotiated_alpn, client_cert_presented) = {
        let (_, conn) = tls_stream.get_ref();
        (
            conn.alpn_protocol().map(|p| p.to_vec()),
            conn.peer_certificates().is_some(),
        )
    };

    Ok(TerminatedTls {
        stream: tls_stream,
        info,
        negotiated_alpn,
        client_cert_presented,
    })
}

/// Walks a complete ClientHello record and collects the SNI hostname and
/// the offered ALPN list. Truncated input is a protocol violation; missing
/// extensions are not.
pub fn parse_client_hello(record: &[u8]) -> Result<ClientHelloInfo, ProxyError> {
    let truncated = || ProxyError::TlsHandshakeFailed("truncated ClientHello".into());

    if record.len() < 5 || record[0] != TLS_HANDSHAKE {
        return Err(ProxyError::TlsHandshakeFailed(
            "not a handshake record".into(),
        ));
    }
    let record_length = u16::from_be_bytes([record[3], record[4]]) as usize;
    let handshake = record.get(5..5 + record_length).ok_or_else(truncated)?;

    if handshake.first() != Some(&CLIENT_HELLO) {
        return Err(ProxyError::TlsHandshakeFailed("not a ClientHello".into()));
    }
    let hs_length = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
    let hello = handshake.get(4..4 + hs_length).ok_or_else(truncated)?;

    // Version (2) + random (32).
    let mut pos = 34;

    let session_id_length = *hello.get(pos).ok_or_else(truncated)? as usize;
    pos += 1 + session_id_length;

    let cipher_bytes = hello.get(pos..pos + 2).ok_or_else(truncated)?;
    let cipher_suites_length = u16::from_be_bytes([cipher_bytes[0], cipher_bytes[1]]) as usize;
    pos += 2 + cipher_suites_length;

    let compression_length = *hello.get(pos).ok_or_else(truncated)? as usize;
    pos += 1 + compression_length;

    let ext_bytes = hello.get(pos..pos + 2).ok_or_else(truncated)?;
    let extensions_length = u16::from_be_bytes([ext_bytes[0], ext_bytes[1]]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_length).min(hello.len());

    let mut info = ClientHelloInfo::default();
    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([hello[pos], hello[pos + 1]]);
        let ext_length = u16::from_be_bytes([hello[pos + 2], hello[pos + 3]]) as usize;
        pos += 4;
        let ext = hello
            .get(pos..pos + ext_length)
            .ok_or_else(truncated)?;

        match ext_type {
            SNI_EXTENSION => info.sni = parse_sni_extension(ext),
            ALPN_EXTENSION => info.alpn = parse_alpn_extension(ext),
            _ => {}
        }
        pos += ext_length;
    }

    Ok(info)
}

fn parse_sni_extension(ext: &[u8]) -> Option<String> {
    // server_name_list length (2), then entries of type (1) + length (2) +
    // name.
    if ext.len() < 2 {
        return None;
    }
    let mut pos = 2;
    while pos + 3 <= ext.len() {
        let name_type = ext[pos];
        let name_length = u16::from_be_bytes([ext[pos + 1], ext[pos + 2]]) as usize;
        pos += 3;
        let name = ext.get(pos..pos + name_length)?;
        if name_type == 0 {
            return std::str::from_utf8(name).ok().map(str::to_string);
        }
        pos += name_length;
    }
    None
}

fn parse_alpn_extension(ext: &[u8]) -> Vec<String> {
    // protocol_name_list length (2), then length-prefixed protocol names.
    let mut protocols = Vec::new();
    if ext.len() < 2 {
        return protocols;
    }
    let mut pos = 2;
    while pos < ext.len() {
        let len = ext[pos] as usize;
        pos += 1;
        match ext.get(pos..pos + len) {
            Some(name) => {
                if let Ok(name) = std::str::from_utf8(name) {
                    protocols.push(name.to_string());
                }
                pos += len;
            }
            None => break,
        }
    }
    protocols
}
