//! Cryptographic operations for Tidepool
//!
//! Ed25519 signature verification over canonical JSON, hex key parsing,
//! and challenge nonce generation.
//!
//! Canonical form: compact JSON with object keys in lexicographic order at
//! every nesting level. `serde_json`'s default object representation is a
//! BTreeMap, so serializing a `Value` already yields sorted keys; the
//! `preserve_order` feature must stay off or every signature breaks.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Crypto operation errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid signature format: {0}")]
    InvalidSignature(String),
    #[error("Signature verification failed")]
    VerificationFailed,
    #[error("Hex decode error: {0}")]
    HexError(String),
    #[error("Canonicalization error: {0}")]
    Canonicalize(String),
}

/// Parse a hex-encoded Ed25519 public key (32 bytes / 64 hex chars)
pub fn parse_public_key(hex_key: &str) -> CryptoResult<VerifyingKey> {
    let key_bytes = hex::decode(hex_key.trim()).map_err(|e| CryptoError::HexError(e.to_string()))?;

    let key_array: [u8; 32] = key_bytes.try_into().map_err(|v: Vec<u8>| {
        CryptoError::InvalidPublicKey(format!("Ed25519 key must be 32 bytes, got {}", v.len()))
    })?;

    VerifyingKey::from_bytes(&key_array).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Verify a hex-encoded detached signature against a message
pub fn verify_signature(
    public_key: &VerifyingKey,
    message: &[u8],
    signature_hex: &str,
) -> CryptoResult<()> {
    let sig_bytes = hex::decode(signature_hex).map_err(|e| CryptoError::HexError(e.to_string()))?;

    let sig_array: [u8; 64] = sig_bytes.try_into().map_err(|v: Vec<u8>| {
        CryptoError::InvalidSignature(format!("Ed25519 signature must be 64 bytes, got {}", v.len()))
    })?;
    let signature = Signature::from_bytes(&sig_array);

    public_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::VerificationFailed)
}

/// Build the exact bytes a device signed for a request envelope.
///
/// The map is `{payload, timestamp, hardware_hash}` plus `nonce` when one
/// was supplied; omitted entirely otherwise. Both signer and verifier must
/// produce these bytes bit for bit.
pub fn canonical_envelope_bytes(
    payload: &serde_json::Value,
    timestamp: i64,
    hardware_hash: &str,
    nonce: Option<&str>,
) -> CryptoResult<Vec<u8>> {
    let mut map = serde_json::Map::new();
    map.insert("payload".into(), payload.clone());
    map.insert("timestamp".into(), serde_json::json!(timestamp));
    map.insert("hardware_hash".into(), serde_json::json!(hardware_hash));
    if let Some(nonce) = nonce {
        map.insert("nonce".into(), serde_json::json!(nonce));
    }

    let json = serde_json::to_string(&serde_json::Value::Object(map))
        .map_err(|e| CryptoError::Canonicalize(e.to_string()))?;
    Ok(json.into_bytes())
}

/// Generate a random challenge nonce (32 bytes, hex encoded)
pub fn generate_nonce() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}
