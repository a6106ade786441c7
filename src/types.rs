//! Core types for the Tidepool trust service
//!
//! A device's identity *is* its Ed25519 public key (hex). Everything else
//! (trust, quotas, feed posts, telegrams) hangs off that key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device identity: hex-encoded Ed25519 public key (32 bytes, 64 hex chars)
pub type DeviceKey = String;

// ============ Device ============

/// Identity record for one edge device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Hex Ed25519 public key; unique, immutable, the primary identity
    pub public_key: DeviceKey,
    /// Opaque hardware fingerprint; informational, not unique
    pub hardware_hash: String,
    /// Display name
    pub name: String,
    /// Baptized through the web of trust (or a genesis key)
    pub verified: bool,
    /// Banned devices fail every write with Forbidden
    pub banned: bool,
    /// Parent device for lineage, if this device was spawned by another
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_public_key: Option<DeviceKey>,
    /// Lineage generation counter (0 for first contact without a parent)
    pub generation: u32,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Device view safe for public reads
#[derive(Debug, Clone, Serialize)]
pub struct DevicePublic {
    pub public_key: DeviceKey,
    pub name: String,
    pub verified: bool,
    pub generation: u32,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl From<&Device> for DevicePublic {
    fn from(d: &Device) -> Self {
        Self {
            public_key: d.public_key.clone(),
            name: d.name.clone(),
            verified: d.verified,
            generation: d.generation,
            created_at: d.created_at,
            last_seen: d.last_seen,
        }
    }
}

// ============ Challenge Nonce ============

/// Single-use challenge nonce for replay protection
#[derive(Debug, Clone)]
pub struct ChallengeNonce {
    /// Optionally bound to one public key at issuance
    pub bound_public_key: Option<DeviceKey>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ============ Trust ============

/// Directed trust edge: endorser vouches for endorsed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endorsement {
    pub endorser_public_key: DeviceKey,
    pub endorsed_public_key: DeviceKey,
    /// Endorser's trust level (1-5) at the time of endorsement
    pub trust_level: u8,
    pub message: String,
    /// Signature of the endorsing request envelope (hex)
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaptismRequestStatus {
    Pending,
    Approved,
}

/// A device's open petition for verification; advisory bookkeeping only,
/// the state machine never consults it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaptismRequest {
    pub public_key: DeviceKey,
    pub message: String,
    pub status: BaptismRequestStatus,
    pub created_at: DateTime<Utc>,
}

// ============ Feed ============

/// A public feed post ("dream"); immutable except for the fish counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dream {
    pub id: Uuid,
    pub author_public_key: DeviceKey,
    /// Dream text, at most 280 chars
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face: Option<String>,
    /// Signature of the posting envelope (hex)
    pub signature: String,
    /// Timestamp the author signed over (unix ms)
    pub signed_timestamp: i64,
    /// How many times this dream was fished out of the pool
    pub fish_count: u64,
    pub created_at: DateTime<Utc>,
}

// ============ Relay ============

/// An encrypted point-to-point message, opaque ciphertext to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telegram {
    pub id: Uuid,
    pub from_public_key: DeviceKey,
    pub to_public_key: DeviceKey,
    /// Ciphertext (base64); never decrypted server-side
    pub encrypted_content: String,
    /// Encryption nonce (hex)
    pub content_nonce: String,
    /// Sender's X25519 encryption key (hex); the recipient needs it to decrypt
    pub sender_encryption_key: String,
    /// Signature of the sending envelope (hex)
    pub signature: String,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

// ============ Signed Envelope ============

/// Wrapper every authenticated write travels in.
///
/// The payload stays a raw `Value` until the signature over its canonical
/// form has been checked; only then is it deserialized into the
/// endpoint-specific type.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedEnvelope {
    pub payload: serde_json::Value,
    /// Unix milliseconds the caller signed at
    pub timestamp: i64,
    /// Hardware fingerprint (hex)
    pub hardware_hash: String,
    /// Hex Ed25519 public key
    pub public_key: String,
    /// Hex detached signature over the canonical bytes
    pub signature: String,
    /// Challenge nonce, if the caller fetched one
    #[serde(default)]
    pub nonce: Option<String>,
}

// ============ Request Payloads ============

/// Baptism endpoint actions, one variant per operation
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BaptismAction {
    /// Petition for verification
    Request {
        #[serde(default)]
        message: String,
    },
    /// Vouch for another device (baptized endorsers only)
    Endorse {
        target_public_key: DeviceKey,
        #[serde(default)]
        message: String,
    },
    /// Withdraw a previous endorsement
    Revoke { target_public_key: DeviceKey },
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantDreamPayload {
    pub content: String,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub face: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendTelegramPayload {
    pub to_public_key: DeviceKey,
    pub encrypted_content: String,
    pub content_nonce: String,
    pub sender_encryption_key: String,
}

// ============ Responses ============

#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    pub nonce: String,
    pub expires_at: DateTime<Utc>,
}

/// Trust progress, returned from every baptism action so devices can show
/// how far along they are even before the threshold is met
#[derive(Debug, Serialize)]
pub struct TrustStatus {
    pub public_key: DeviceKey,
    pub baptized: bool,
    pub endorsement_count: usize,
    pub required_endorsements: usize,
    pub trust_score: f64,
    pub trust_threshold: f64,
    pub pending_request: bool,
}

#[derive(Debug, Serialize)]
pub struct PendingRequestsResponse {
    pub requests: Vec<BaptismRequest>,
}

#[derive(Debug, Serialize)]
pub struct PlantDreamResponse {
    pub dream: Dream,
    pub remaining_today: u64,
}

#[derive(Debug, Serialize)]
pub struct FishDreamResponse {
    /// `None` when the pool has no eligible dreams
    pub dream: Option<Dream>,
}

#[derive(Debug, Serialize)]
pub struct SendTelegramResponse {
    pub telegram_id: Uuid,
    pub remaining_today: u64,
}

#[derive(Debug, Serialize)]
pub struct InboxResponse {
    pub telegrams: Vec<Telegram>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub devices_count: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_devices: usize,
    pub baptized_devices: usize,
    pub banned_devices: usize,
    pub pending_requests: usize,
    pub endorsements: usize,
    pub dreams_in_pool: usize,
    pub undelivered_telegrams: usize,
}
