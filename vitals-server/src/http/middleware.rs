//! Request/response pipeline steps.
//!
//! The HTTP surface buffers each request body, runs it through these steps
//! in order (decompress, subnet admission, signature check, decryption),
//! dispatches to a handler, then applies the response-side steps (signing,
//! compression). Signing and decryption attach only to the update
//! endpoints; the read surface gets the shared prefix of the pipeline.

use crate::http::handlers::ApiError;
use hyper::header::{HeaderMap, HeaderName, ACCEPT_ENCODING, CONTENT_ENCODING};
use hyper::StatusCode;
use ip_network::IpNetwork;
use rsa::RsaPrivateKey;
use std::net::IpAddr;
use tracing::warn;
use vitals_core::envelope;

pub static SIGNATURE_HEADER: HeaderName = HeaderName::from_static("hashsha256");
pub static REAL_IP_HEADER: HeaderName = HeaderName::from_static("x-real-ip");

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Reverse the request's gzip encoding when declared.
pub fn decompress_request(headers: &HeaderMap, body: Vec<u8>) -> Result<Vec<u8>, ApiError> {
    let is_gzip = header_str(headers, &CONTENT_ENCODING)
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);
    if !is_gzip {
        return Ok(body);
    }

    envelope::decompress(&body).map_err(|e| {
        ApiError::with_cause(StatusCode::INTERNAL_SERVER_ERROR, "decompression failed", e)
    })
}

/// Reject callers whose declared `X-Real-IP` is outside the trusted subnet.
pub fn admit_subnet(net: &IpNetwork, headers: &HeaderMap) -> Result<(), ApiError> {
    let ip: IpAddr = header_str(headers, &REAL_IP_HEADER)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| ApiError::new(StatusCode::FORBIDDEN, "access denied"))?;

    if net.contains(ip) {
        Ok(())
    } else {
        Err(ApiError::new(StatusCode::FORBIDDEN, "access denied"))
    }
}

/// Check the `HashSHA256` header against the (decompressed) body. Requests
/// without the header pass through; a present-but-wrong signature is
/// rejected.
pub fn verify_signature(key: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), ApiError> {
    let Some(header) = header_str(headers, &SIGNATURE_HEADER) else {
        warn!("HashSHA256 header is missing, accepting unsigned request");
        return Ok(());
    };

    envelope::verify(key, body, header)
        .map_err(|e| ApiError::with_cause(StatusCode::BAD_REQUEST, "invalid request", e))
}

/// Replace the body with the decrypted plaintext.
pub fn decrypt_request(private_key: &RsaPrivateKey, body: &[u8]) -> Result<Vec<u8>, ApiError> {
    envelope::open(private_key, body).map_err(|e| {
        ApiError::with_cause(StatusCode::INTERNAL_SERVER_ERROR, "internal server error", e)
    })
}

/// Signature header value for an outgoing response body.
pub fn sign_response(key: &str, body: &[u8]) -> Option<String> {
    envelope::sign(key, body).ok()
}

/// Responses are compressed only when the client accepts gzip and the
/// declared content type is JSON or HTML.
pub fn should_compress_response(request_headers: &HeaderMap, content_type: &str) -> bool {
    let accepts = header_str(request_headers, &ACCEPT_ENCODING)
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);
    accepts
        && (content_type.starts_with("application/json") || content_type.starts_with("text/html"))
}
