//! `Content-Encoding` codec support. Bodies are stored decoded in mocks and
//! recompressed on replay so the client sees what it saw at record time.

use flate2::Compression;
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use std::io::{Read, Write};
use tracing::debug;

/// Decodes a body according to the `Content-Encoding` header value. An
/// unknown codec leaves the bytes as-is; the mock then stores the raw form.
pub fn decode_body(encoding: &str, body: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "gzip" | "x-gzip" => {
            let mut out = Vec::new();
            GzDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        "deflate" => {
            let mut out = Vec::new();
            DeflateDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        "identity" | "" => Ok(body.to_vec()),
        other => {
            debug!(encoding = other, "Unknown content encoding, storing raw");
            Ok(body.to_vec())
        }
    }
}

/// Re-encodes a decoded body for the wire. Inverse of `decode_body` for the
/// codecs it knows.
pub fn encode_body(encoding: &str, body: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "gzip" | "x-gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
        "deflate" => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
        _ => Ok(body.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let body = b"a body worth compressing, a body worth compressing";
        let encoded = encode_body("gzip", body).unwrap();
        assert_ne!(encoded, body.to_vec());
        assert_eq!(decode_body("gzip", &encoded).unwrap(), body.to_vec());
    }

    #[test]
    fn deflate_round_trip() {
        let body = b"deflate me";
        let encoded = encode_body("deflate", body).unwrap();
        assert_eq!(decode_body("deflate", &encoded).unwrap(), body.to_vec());
    }

    #[test]
    fn identity_and_unknown_pass_through() {
        assert_eq!(decode_body("identity", b"x").unwrap(), b"x".to_vec());
        assert_eq!(decode_body("br", b"x").unwrap(), b"x".to_vec());
        assert_eq!(encode_body("", b"x").unwrap(), b"x".to_vec());
    }

    #[test]
    fn corrupt_gzip_is_an_error() {
        assert!(decode_body("gzip", b"not gzip at all").is_err());
    }
}
