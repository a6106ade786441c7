//! Request admission for Tidepool
//!
//! No accounts, no API keys: a device proves who it is by signing the
//! request body with its Ed25519 private key. The gate checks timestamp
//! freshness, then the signature over the canonical bytes, then consumes
//! the challenge nonce if one was supplied. Ban and quota checks happen
//! later, after the device record is resolved.

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::crypto::{canonical_envelope_bytes, generate_nonce, parse_public_key, verify_signature};
use crate::error::{ApiError, ApiResult};
use crate::types::{ChallengeNonce, SignedEnvelope};

/// What a successful admission hands to downstream components
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub public_key: String,
    pub hardware_hash: String,
}

/// Store of outstanding single-use challenge nonces
pub struct NonceStore {
    nonces: DashMap<String, ChallengeNonce>,
    ttl: Duration,
}

impl NonceStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            nonces: DashMap::new(),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Issue a fresh nonce, optionally bound to one public key
    pub fn issue(&self, bound_public_key: Option<String>) -> (String, DateTime<Utc>) {
        let now = Utc::now();

        // Sweep expired nonces while we are here
        self.nonces.retain(|_, n| n.expires_at > now);

        let value = generate_nonce();
        let expires_at = now + self.ttl;
        self.nonces.insert(
            value.clone(),
            ChallengeNonce {
                bound_public_key,
                created_at: now,
                expires_at,
            },
        );
        (value, expires_at)
    }

    /// Consume a nonce: succeeds at most once per issued value.
    ///
    /// `remove_if` holds the shard lock across check and removal, so two
    /// concurrent consumers of the same nonce cannot both observe it
    /// unconsumed.
    pub fn consume(&self, value: &str, public_key: &str) -> bool {
        let now = Utc::now();
        self.nonces
            .remove_if(value, |_, n| {
                n.expires_at > now
                    && n.bound_public_key
                        .as_deref()
                        .map(|k| k.eq_ignore_ascii_case(public_key))
                        .unwrap_or(true)
            })
            .is_some()
    }

    /// Outstanding nonce count (for stats)
    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

/// Verify a signed envelope and return the caller's identity.
///
/// Check order matters: freshness first (cheap, bounds the replay window),
/// signature second, nonce consumption last so an attacker cannot burn a
/// victim's nonce with a garbage signature.
pub fn authenticate(
    envelope: &SignedEnvelope,
    nonce_store: &NonceStore,
    max_clock_skew: u64,
) -> ApiResult<AuthContext> {
    // 1. Timestamp freshness
    let now_ms = Utc::now().timestamp_millis();
    let skew_ms = (max_clock_skew as i64) * 1000;
    if (now_ms - envelope.timestamp).abs() > skew_ms {
        return Err(ApiError::AuthExpired);
    }

    // 2. Signature over canonical bytes
    let message = canonical_envelope_bytes(
        &envelope.payload,
        envelope.timestamp,
        &envelope.hardware_hash,
        envelope.nonce.as_deref(),
    )
    .map_err(|e| ApiError::AuthInvalidSignature(e.to_string()))?;

    let key = parse_public_key(&envelope.public_key)
        .map_err(|e| ApiError::AuthInvalidSignature(e.to_string()))?;

    verify_signature(&key, &message, &envelope.signature)
        .map_err(|e| ApiError::AuthInvalidSignature(e.to_string()))?;

    // 3. Nonce consumption (when supplied)
    if let Some(ref nonce) = envelope.nonce {
        if !nonce_store.consume(nonce, &envelope.public_key) {
            return Err(ApiError::AuthInvalidNonce);
        }
    }

    Ok(AuthContext {
        public_key: envelope.public_key.to_lowercase(),
        hardware_hash: envelope.hardware_hash.clone(),
    })
}

/// Fixed-window per-IP limiter for the unauthenticated challenge endpoint
pub struct ChallengeLimiter {
    windows: DashMap<IpAddr, (DateTime<Utc>, u32)>,
    per_minute: u32,
}

impl ChallengeLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            windows: DashMap::new(),
            per_minute,
        }
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Utc::now())
    }

    fn check_at(&self, ip: IpAddr, now: DateTime<Utc>) -> bool {
        // Sweep lapsed windows first, like the nonce store does on issue;
        // every surviving entry is within the current minute
        self.windows
            .retain(|_, (start, _)| now - *start < Duration::seconds(60));

        let mut entry = self.windows.entry(ip).or_insert((now, 0));
        let (start, count) = *entry;
        if count >= self.per_minute {
            return false;
        }
        *entry = (start, count + 1);
        true
    }
}
