//! On-wire integrity envelope.
//!
//! The agent ships each report as `gzip( optional-hybrid-crypto( JSON ) )`
//! with an optional detached HMAC-SHA256 signature header computed over the
//! pre-compression bytes. The hybrid scheme seals the payload with a fresh
//! AES-256-GCM key and wraps that key with RSA-OAEP(SHA-256):
//!
//! ```text
//! envelope = rsa_oaep(aes_key)[256] || nonce[12] || gcm_ciphertext||tag
//! ```
//!
//! The 256-byte prefix is a codec constant tied to the 2048-bit RSA
//! modulus; key-size agility would have to be negotiated out-of-band.

use crate::error::{Result, VitalsError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::io::{Read, Write};
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Fresh symmetric key size (AES-256).
pub const AES_KEY_SIZE: usize = 32;

/// RSA-OAEP output size for the 2048-bit keys this codec is tied to.
pub const ENCRYPTED_KEY_SIZE: usize = 256;

/// AES-GCM nonce size.
pub const NONCE_SIZE: usize = 12;

/// Name of the signature header carried next to signed payloads.
pub const SIGNATURE_HEADER: &str = "HashSHA256";

/// Load an RSA public key from a PEM (SPKI) file.
pub fn read_public_key(path: impl AsRef<Path>) -> Result<RsaPublicKey> {
    let path = path.as_ref();
    let pem = std::fs::read_to_string(path)
        .map_err(|source| VitalsError::Io { path: path.to_path_buf(), source })?;
    RsaPublicKey::from_public_key_pem(&pem)
        .map_err(|e| VitalsError::Envelope { reason: format!("bad public key: {e}") })
}

/// Load an RSA private key from a PEM (PKCS#8) file.
pub fn read_private_key(path: impl AsRef<Path>) -> Result<RsaPrivateKey> {
    let path = path.as_ref();
    let pem = std::fs::read_to_string(path)
        .map_err(|source| VitalsError::Io { path: path.to_path_buf(), source })?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .map_err(|e| VitalsError::Envelope { reason: format!("bad private key: {e}") })
}

/// Seal `message` for the holder of `public_key`.
pub fn seal(public_key: &RsaPublicKey, message: &[u8]) -> Result<Vec<u8>> {
    let mut rng = rand::thread_rng();

    let mut aes_key = [0u8; AES_KEY_SIZE];
    rng.fill_bytes(&mut aes_key);
    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(&aes_key)
        .map_err(|_| VitalsError::Envelope { reason: "bad symmetric key length".to_string() })?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), message)
        .map_err(|_| VitalsError::Envelope { reason: "symmetric encryption failed".to_string() })?;

    let encrypted_key = public_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &aes_key)
        .map_err(|e| VitalsError::Envelope { reason: format!("key wrap failed: {e}") })?;

    let mut envelope = Vec::with_capacity(encrypted_key.len() + NONCE_SIZE + ciphertext.len());
    envelope.extend_from_slice(&encrypted_key);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Open an envelope produced by [`seal`]. A failed GCM tag check is a hard
/// error.
pub fn open(private_key: &RsaPrivateKey, envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() < ENCRYPTED_KEY_SIZE + NONCE_SIZE {
        return Err(VitalsError::Envelope { reason: "envelope too short".to_string() });
    }

    let (encrypted_key, rest) = envelope.split_at(ENCRYPTED_KEY_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    let aes_key = private_key
        .decrypt(Oaep::new::<Sha256>(), encrypted_key)
        .map_err(|e| VitalsError::Envelope { reason: format!("key unwrap failed: {e}") })?;

    let cipher = Aes256Gcm::new_from_slice(&aes_key)
        .map_err(|_| VitalsError::Envelope { reason: "bad symmetric key length".to_string() })?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| VitalsError::Envelope { reason: "authentication failed".to_string() })
}

/// HMAC-SHA256 signature over `payload`, base64url-encoded for the
/// `HashSHA256` header.
pub fn sign(key: &str, payload: &[u8]) -> Result<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| VitalsError::SignatureMismatch)?;
    mac.update(payload);
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

/// Verify a `HashSHA256` header value against `payload`.
pub fn verify(key: &str, payload: &[u8], header: &str) -> Result<()> {
    let expected = URL_SAFE.decode(header).map_err(|_| VitalsError::SignatureMismatch)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| VitalsError::SignatureMismatch)?;
    mac.update(payload);
    mac.verify_slice(&expected).map_err(|_| VitalsError::SignatureMismatch)
}

/// Gzip-compress at best speed (wire payloads are small and frequent).
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).map_err(VitalsError::Decompression)?;
    encoder.finish().map_err(VitalsError::Decompression)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(VitalsError::Decompression)?;
    Ok(out)
}
