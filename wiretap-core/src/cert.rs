//! Certificate authority and on-the-fly leaf minting.
//!
//! The proxy terminates TLS with certificates it signs itself. The root key
//! lives on disk (generated on first run) so that outer tooling can point
//! trust-store environment variables at the PEM; leaves are minted per SNI
//! hostname and cached for the process lifetime.

use crate::error::ProxyError;
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, ServerConfig};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca-key.pem";
const CA_COMMON_NAME: &str = "Wiretap Root CA";
const CA_ORG_NAME: &str = "Wiretap";

/// A minted leaf, cached by SNI. The DER forms feed rustls directly.
pub struct MintedLeaf {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key_der: Vec<u8>,
}

pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    /// The DER of the distributed `ca.pem`, carried in every leaf chain so
    /// trust stores pointing at the file keep validating across restarts.
    ca_cert_der: CertificateDer<'static>,
    cert_path: PathBuf,
    key_path: PathBuf,
    /// Minted leaves keyed by SNI hostname. Append-only, never evicted
    /// within a process lifetime.
    leaf_cache: DashMap<String, Arc<MintedLeaf>>,
    /// Shifts leaf NotBefore so recorded tests stay valid under frozen
    /// clocks.
    backdate: Option<OffsetDateTime>,
}

impl CertificateAuthority {
    /// Loads the root key from `dir`, generating and persisting a fresh CA
    /// on first run.
    pub fn load_or_generate(
        dir: &Path,
        backdate: Option<OffsetDateTime>,
    ) -> Result<Self, ProxyError> {
        std::fs::create_dir_all(dir).map_err(ProxyError::Io)?;
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        let (ca_cert, ca_key, ca_cert_der) = if key_path.exists() {
            let key_pem = std::fs::read_to_string(&key_path).map_err(ProxyError::Io)?;
            let ca_key = KeyPair::from_pem(&key_pem)
                .map_err(|e| ProxyError::TlsHandshakeFailed(format!("CA key: {}", e)))?;
            // The key is what matters for signing; the signing certificate
            // is rebuilt around it, while leaf chains carry the original
            // on-disk certificate.
            let ca_cert = Self::ca_params()
                .self_signed(&ca_key)
                .map_err(|e| ProxyError::TlsHandshakeFailed(format!("CA cert: {}", e)))?;
            let pem = std::fs::read(&cert_path).map_err(ProxyError::Io)?;
            let ca_cert_der = rustls_pemfile::certs(&mut pem.as_slice())
                .next()
                .ok_or_else(|| {
                    ProxyError::TlsHandshakeFailed("ca.pem holds no certificate".into())
                })?
                .map_err(|e| ProxyError::TlsHandshakeFailed(format!("ca.pem: {}", e)))?;
            debug!(path = %key_path.display(), "Loaded existing CA key");
            (ca_cert, ca_key, ca_cert_der)
        } else {
            let ca_key = KeyPair::generate()
                .map_err(|e| ProxyError::TlsHandshakeFailed(format!("CA keygen: {}", e)))?;
            let ca_cert = Self::ca_params()
                .self_signed(&ca_key)
                .map_err(|e| ProxyError::TlsHandshakeFailed(format!("CA cert: {}", e)))?;
            std::fs::write(&cert_path, ca_cert.pem()).map_err(ProxyError::Io)?;
            std::fs::write(&key_path, ca_key.serialize_pem()).map_err(ProxyError::Io)?;
            info!(path = %cert_path.display(), "Generated new root CA");
            let ca_cert_der = CertificateDer::from(ca_cert.der().to_vec());
            (ca_cert, ca_key, ca_cert_der)
        };

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_der,
            cert_path,
            key_path,
            leaf_cache: DashMap::new(),
            backdate,
        })
    }

    fn ca_params() -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, CA_ORG_NAME);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(3650);
        params
    }

    /// Path of the CA certificate PEM, for outer tooling to point trust
    /// stores at.
    pub fn ca_cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn ca_key_path(&self) -> &Path {
        &self.key_path
    }

    /// Mints (or returns the cached) leaf for an SNI hostname. Validity is
    /// `[now - 1y, now + 1y]`; with a backdate, NotBefore shifts to
    /// `backdate - 1y`.
    pub fn mint_leaf(&self, hostname: &str) -> Result<Arc<MintedLeaf>, ProxyError> {
        if let Some(cached) = self.leaf_cache.get(hostname) {
            return Ok(cached.clone());
        }

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![match hostname.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(hostname.try_into().map_err(|e| {
                ProxyError::TlsHandshakeFailed(format!("SNI {:?}: {}", hostname, e))
            })?),
        }];

        let anchor = self.backdate.unwrap_or_else(OffsetDateTime::now_utc);
        params.not_before = anchor - Duration::days(365);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(365);

        let key_pair = KeyPair::generate()
            .map_err(|e| ProxyError::TlsHandshakeFailed(format!("leaf keygen: {}", e)))?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| ProxyError::TlsHandshakeFailed(format!("leaf signing: {}", e)))?;

        let leaf = Arc::new(MintedLeaf {
            cert_chain: vec![
                CertificateDer::from(cert.der().to_vec()),
                self.ca_cert_der.clone(),
            ],
            key_der: key_pair.serialize_der(),
        });
        debug!(hostname, "Minted leaf certificate");
        self.leaf_cache.insert(hostname.to_string(), leaf.clone());
        Ok(leaf)
    }

    pub fn cached_leaves(&self) -> usize {
        self.leaf_cache.len()
    }
}

/// Server config for a terminated connection: the minted leaf, the single
/// ALPN chosen from the client's offer, and a verifier that accepts any
/// client certificate (the proxy is transparent, not an authenticator).
pub fn server_config(
    leaf: &MintedLeaf,
    alpn: Vec<Vec<u8>>,
) -> Result<Arc<ServerConfig>, ProxyError> {
    let key = PrivateKeyDer::try_from(leaf.key_der.clone())
        .map_err(|e| ProxyError::TlsHandshakeFailed(format!("leaf key: {:?}", e)))?;
    let mut config = ServerConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|e| ProxyError::TlsHandshakeFailed(format!("protocol versions: {}", e)))?
    .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
    .with_single_cert(leaf.cert_chain.clone(), key)
    .map_err(|e| ProxyError::TlsHandshakeFailed(format!("server config: {}", e)))?;
    config.alpn_protocols = alpn;
    Ok(Arc::new(config))
}

/// Client config for origin dials on the record path. The proxy forwards
/// whatever the application trusted; it does not verify the origin chain.
pub fn origin_client_config(alpn: Vec<Vec<u8>>) -> Result<Arc<ClientConfig>, ProxyError> {
    let mut config = ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|e| ProxyError::TlsHandshakeFailed(format!("protocol versions: {}", e)))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoServerVerify))
    .with_no_client_auth();
    config.alpn_protocols = alpn;
    Ok(Arc::new(config))
}

/// Accepts any client certificate without verification, and does not require
/// one. The terminator only reports whether a certificate was presented.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl rustls::server::danger::ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Debug)]
struct NoServerVerify;

impl rustls::client::danger::ServerCertVerifier for NoServerVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wiretap-cert-test-{}-{}",
            label,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn generates_and_reloads_ca() {
        let dir = temp_dir("reload");
        let ca = CertificateAuthority::load_or_generate(&dir, None).unwrap();
        assert!(ca.ca_cert_path().exists());
        assert!(ca.ca_key_path().exists());

        // Second load reuses the persisted key.
        let first_key = std::fs::read_to_string(ca.ca_key_path()).unwrap();
        let _ca2 = CertificateAuthority::load_or_generate(&dir, None).unwrap();
        let second_key = std::fs::read_to_string(dir.join(CA_KEY_FILE)).unwrap();
        assert_eq!(first_key, second_key);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn leaf_cache_hits_for_repeated_sni() {
        let dir = temp_dir("cache");
        let ca = CertificateAuthority::load_or_generate(&dir, None).unwrap();

        let first = ca.mint_leaf("api.example.com").unwrap();
        let second = ca.mint_leaf("api.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ca.cached_leaves(), 1);

        ca.mint_leaf("other.example.com").unwrap();
        assert_eq!(ca.cached_leaves(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mints_for_ip_fallback_hostname() {
        let dir = temp_dir("ip");
        let ca = CertificateAuthority::load_or_generate(&dir, None).unwrap();
        let leaf = ca.mint_leaf("127.0.0.1").unwrap();
        assert_eq!(leaf.cert_chain.len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn leaf_builds_rustls_server_config() {
        let dir = temp_dir("rustls");
        let ca = CertificateAuthority::load_or_generate(&dir, None).unwrap();
        let leaf = ca.mint_leaf("svc.internal").unwrap();
        let config = server_config(&leaf, vec![b"http/1.1".to_vec()]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
