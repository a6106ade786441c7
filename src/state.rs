//! Application state for Tidepool
//!
//! One `Arc<AppState>` composes the device registry, nonce store, rate
//! limiter, trust graph, dream pool, and telegram relay. Nothing here
//! caches derived facts: trust scores are recomputed per query, and every
//! mutation goes straight to the owning collection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::interval;
use uuid::Uuid;

use crate::auth::{authenticate, AuthContext, ChallengeLimiter, NonceStore};
use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::feed::{DreamPool, MAX_DREAM_LEN};
use crate::rate_limit::{DayCounters, QuotaClass, RateLimiter};
use crate::relay::TelegramRelay;
use crate::trust::{TrustGraph, TrustSnapshot};
use crate::types::*;

/// Global application state
pub struct AppState {
    /// All devices indexed by lowercase hex public key
    pub devices: DashMap<DeviceKey, Device>,
    /// Outstanding challenge nonces
    pub nonces: NonceStore,
    /// Per-IP limiter for the unauthenticated challenge endpoint
    pub challenge_limiter: ChallengeLimiter,
    /// Per-device daily quotas
    pub rate_limiter: RateLimiter,
    /// Endorsement edges and baptism requests
    pub trust: TrustGraph,
    /// Public dream feed
    pub pool: DreamPool,
    /// Encrypted telegram store-and-forward
    pub relay: TelegramRelay,
    /// Configuration
    pub config: Config,
    /// Start time for uptime calculation
    pub start_time: Instant,
    /// Persistence dirty flag
    dirty: AtomicBool,
    /// Notify for immediate save
    persist_notify: Notify,
    /// Shutdown flag
    shutdown: AtomicBool,
    /// Last persist time
    pub last_persist: std::sync::RwLock<Option<DateTime<Utc>>>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            devices: DashMap::new(),
            nonces: NonceStore::new(config.nonce_expiry),
            challenge_limiter: ChallengeLimiter::new(config.challenge_rate_limit),
            rate_limiter: RateLimiter::new(),
            trust: TrustGraph::new(config.min_endorsements, config.trust_threshold),
            pool: DreamPool::new(config.feed_sample_window),
            relay: TelegramRelay::new(),
            config,
            start_time: Instant::now(),
            dirty: AtomicBool::new(false),
            persist_notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            last_persist: std::sync::RwLock::new(None),
        })
    }

    // ============ Persistence ============

    /// Load state from disk
    pub async fn load_from_disk(self: &Arc<Self>) -> anyhow::Result<()> {
        let path = self.config.state_file_path();

        if path.exists() {
            let json = tokio::fs::read_to_string(&path).await?;
            let snapshot: StateSnapshot = serde_json::from_str(&json)?;

            for device in snapshot.devices {
                self.devices.insert(device.public_key.clone(), device);
            }
            self.trust.restore(snapshot.trust);
            self.pool.restore(snapshot.dreams);
            self.relay.restore(snapshot.telegrams);
            self.rate_limiter.restore(snapshot.counters);

            tracing::info!(
                "Loaded state: {} devices, {} endorsements, {} dreams",
                self.devices.len(),
                self.trust.endorsement_count_total(),
                self.pool.len()
            );
        } else {
            tracing::info!("No existing state file, starting fresh");
        }

        Ok(())
    }

    /// Start background persistence worker
    pub fn spawn_persister(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        let persist_interval = state.config.persist_interval;

        tokio::spawn(async move {
            let mut ticker = interval(persist_interval);

            loop {
                if state.shutdown.load(Ordering::SeqCst) {
                    tracing::info!("Persister shutting down, final save...");
                    if let Err(e) = state.save_to_disk().await {
                        tracing::error!("Failed final persist: {}", e);
                    }
                    break;
                }

                tokio::select! {
                    _ = ticker.tick() => {
                        if state.dirty.swap(false, Ordering::SeqCst) {
                            if let Err(e) = state.save_to_disk().await {
                                tracing::error!("Failed to persist state: {}", e);
                            }
                        }
                    }
                    _ = state.persist_notify.notified() => {
                        state.dirty.store(false, Ordering::SeqCst);
                        if let Err(e) = state.save_to_disk().await {
                            tracing::error!("Failed to persist state: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Signal shutdown
    pub fn signal_shutdown(&self) {
        tracing::info!("Shutdown signaled");
        self.shutdown.store(true, Ordering::SeqCst);
        self.persist_notify.notify_one();
    }

    /// Save state to disk (tmp write + rename so a crash never leaves a
    /// half-written snapshot)
    async fn save_to_disk(&self) -> anyhow::Result<()> {
        // Counter rows for past days are dead weight; drop them so neither
        // memory nor the snapshot grows a row per device per day forever
        self.rate_limiter.prune();

        let snapshot = StateSnapshot {
            devices: self.devices.iter().map(|r| r.value().clone()).collect(),
            trust: self.trust.snapshot(),
            dreams: self.pool.snapshot(),
            telegrams: self.relay.snapshot(),
            counters: self.rate_limiter.snapshot(),
            saved_at: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::create_dir_all(&self.config.data_dir).await?;

        let path = self.config.state_file_path();
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        *self.last_persist.write().unwrap() = Some(Utc::now());
        tracing::debug!("State persisted: {} devices", snapshot.devices.len());
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    // ============ Device Registry ============

    /// Look up by public key, creating an unverified record on first
    /// contact. The entry API makes the upsert race-safe: two concurrent
    /// first contacts from the same key both land on one row.
    pub fn resolve_or_register(&self, public_key: &str, hardware_hash: &str) -> Device {
        let key = public_key.to_lowercase();
        let now = Utc::now();

        let mut entry = self.devices.entry(key.clone()).or_insert_with(|| {
            let verified = self.config.is_genesis_key(&key);
            if verified {
                tracing::info!("Genesis device registered: {}", &key[..key.len().min(16)]);
            }
            Device {
                public_key: key.clone(),
                hardware_hash: hardware_hash.to_string(),
                name: format!("inkling-{}", &key[..key.len().min(8)]),
                verified,
                banned: false,
                parent_public_key: None,
                generation: 0,
                created_at: now,
                last_seen: now,
                metadata: serde_json::Value::Null,
            }
        });
        entry.last_seen = now;
        let device = entry.clone();
        drop(entry);

        self.mark_dirty();
        device
    }

    /// Read-only lookup by public key
    pub fn get_device(&self, public_key: &str) -> ApiResult<Device> {
        self.devices
            .get(&public_key.to_lowercase())
            .map(|r| r.value().clone())
            .ok_or_else(|| ApiError::NotFound("Device not found".into()))
    }

    pub fn is_banned(&self, public_key: &str) -> bool {
        self.devices
            .get(&public_key.to_lowercase())
            .map(|d| d.banned)
            .unwrap_or(false)
    }

    /// Full admission for an authenticated write: signature gate, then
    /// device resolution, then ban check. Every mutating endpoint goes
    /// through here before touching domain state.
    pub fn admit(&self, envelope: &SignedEnvelope) -> ApiResult<(AuthContext, Device)> {
        let ctx = authenticate(envelope, &self.nonces, self.config.max_clock_skew)?;
        let device = self.resolve_or_register(&ctx.public_key, &ctx.hardware_hash);
        if device.banned {
            return Err(ApiError::Forbidden("Device is banned".into()));
        }
        Ok((ctx, device))
    }

    // ============ Baptism ============

    /// Open a baptism petition. Already-baptized devices and devices with
    /// an existing request get their current status back, unchanged.
    pub fn request_baptism(&self, device: &Device, message: String) -> TrustStatus {
        if !device.verified && self.trust.open_request(&device.public_key, message) {
            tracing::info!("Baptism requested by {}", short(&device.public_key));
            self.mark_dirty();
        }
        self.trust.status(&device.public_key, device.verified)
    }

    /// Record an endorsement and recompute the target's standing.
    pub fn endorse(
        &self,
        endorser: &Device,
        target_public_key: &str,
        message: String,
        signature: String,
    ) -> ApiResult<TrustStatus> {
        if !endorser.verified {
            return Err(ApiError::Forbidden(
                "Only baptized devices may endorse".into(),
            ));
        }

        let target_key = target_public_key.to_lowercase();
        if target_key == endorser.public_key {
            return Err(ApiError::validation("Cannot endorse yourself"));
        }
        if !self.devices.contains_key(&target_key) {
            return Err(ApiError::NotFound("Target device not found".into()));
        }

        // Genesis endorsers carry the max level; without this the first
        // cohort (zero incoming edges, level 1) could never push anyone
        // over the score threshold and the web would stay empty.
        let level = if self.config.is_genesis_key(&endorser.public_key) {
            crate::trust::MAX_TRUST_LEVEL
        } else {
            self.trust.endorser_level(&endorser.public_key)
        };
        let inserted = self.trust.add_edge(Endorsement {
            endorser_public_key: endorser.public_key.clone(),
            endorsed_public_key: target_key.clone(),
            trust_level: level,
            message,
            signature,
            created_at: Utc::now(),
        });

        if inserted {
            self.apply_trust_evaluation(&target_key);
            self.mark_dirty();
            tracing::info!(
                "Endorsement: {} -> {} (level {})",
                short(&endorser.public_key),
                short(&target_key),
                level
            );
        }

        let baptized = self.get_device(&target_key)?.verified;
        Ok(self.trust.status(&target_key, baptized))
    }

    /// Withdraw an endorsement and recompute the target's standing.
    pub fn revoke(&self, revoker: &Device, target_public_key: &str) -> ApiResult<TrustStatus> {
        if !revoker.verified {
            return Err(ApiError::Forbidden(
                "Only baptized devices may revoke endorsements".into(),
            ));
        }

        let target_key = target_public_key.to_lowercase();
        if !self.devices.contains_key(&target_key) {
            return Err(ApiError::NotFound("Target device not found".into()));
        }

        if self.trust.remove_edge(&revoker.public_key, &target_key) {
            self.apply_trust_evaluation(&target_key);
            self.mark_dirty();
            tracing::info!(
                "Endorsement revoked: {} -> {}",
                short(&revoker.public_key),
                short(&target_key)
            );
        }

        let baptized = self.get_device(&target_key)?.verified;
        Ok(self.trust.status(&target_key, baptized))
    }

    /// Flip the verified flag to match a freshly recomputed evaluation.
    /// Idempotent: concurrent endorsements may both run this and both land
    /// on the same flag value. Genesis devices never lose verification.
    fn apply_trust_evaluation(&self, public_key: &str) {
        let eval = self.trust.evaluate(public_key);

        if let Some(mut device) = self.devices.get_mut(public_key) {
            if eval.eligible && !device.verified {
                device.verified = true;
                self.trust.approve_request(public_key);
                tracing::info!("Device baptized: {}", short(public_key));
            } else if !eval.eligible
                && device.verified
                && !self.config.is_genesis_key(public_key)
            {
                device.verified = false;
                tracing::info!("Baptism lapsed: {}", short(public_key));
            }
        }
    }

    /// Public trust status read
    pub fn trust_status(&self, public_key: &str) -> ApiResult<TrustStatus> {
        let device = self.get_device(public_key)?;
        Ok(self.trust.status(&device.public_key, device.verified))
    }

    // ============ Dream Pool ============

    /// Plant a dream into the pool (quota: dreams/day)
    pub fn plant_dream(
        &self,
        device: &Device,
        payload: PlantDreamPayload,
        signature: String,
        signed_timestamp: i64,
    ) -> ApiResult<PlantDreamResponse> {
        if payload.content.is_empty() {
            return Err(ApiError::validation("Dream content cannot be empty"));
        }
        if payload.content.chars().count() > MAX_DREAM_LEN {
            return Err(ApiError::validation(format!(
                "Dream content must be at most {MAX_DREAM_LEN} characters"
            )));
        }

        self.rate_limiter.check_and_increment(
            &device.public_key,
            QuotaClass::Dreams,
            1,
            self.config.daily_dreams,
        )?;

        let dream = Dream {
            id: Uuid::new_v4(),
            author_public_key: device.public_key.clone(),
            content: payload.content,
            mood: payload.mood,
            face: payload.face,
            signature,
            signed_timestamp,
            fish_count: 0,
            created_at: Utc::now(),
        };
        self.pool.plant(dream.clone());
        self.mark_dirty();

        Ok(PlantDreamResponse {
            dream,
            remaining_today: self.rate_limiter.remaining_today(
                &device.public_key,
                QuotaClass::Dreams,
                self.config.daily_dreams,
            ),
        })
    }

    /// Fish a random dream out of the pool
    pub fn fish_dream(&self, excluding: Option<&str>) -> FishDreamResponse {
        let excluding = excluding.map(|k| k.to_lowercase());
        let dream = self.pool.fish(excluding.as_deref());
        if dream.is_some() {
            self.mark_dirty();
        }
        FishDreamResponse { dream }
    }

    // ============ Telegram Relay ============

    /// Relay an encrypted telegram (quota: telegrams/day)
    pub fn send_telegram(
        &self,
        sender: &Device,
        payload: SendTelegramPayload,
        signature: String,
    ) -> ApiResult<SendTelegramResponse> {
        let recipient_key = payload.to_public_key.to_lowercase();
        if recipient_key == sender.public_key {
            return Err(ApiError::validation("Cannot send a telegram to yourself"));
        }
        if !self.devices.contains_key(&recipient_key) {
            return Err(ApiError::NotFound("Recipient device not found".into()));
        }

        self.rate_limiter.check_and_increment(
            &sender.public_key,
            QuotaClass::Telegrams,
            1,
            self.config.daily_telegrams,
        )?;

        let now = Utc::now();
        let telegram = Telegram {
            id: Uuid::new_v4(),
            from_public_key: sender.public_key.clone(),
            to_public_key: recipient_key,
            encrypted_content: payload.encrypted_content,
            content_nonce: payload.content_nonce,
            sender_encryption_key: payload.sender_encryption_key,
            signature,
            delivered: false,
            delivered_at: None,
            created_at: now,
            expires_at: Some(
                now + Duration::seconds(self.config.telegram_expiry.as_secs() as i64),
            ),
        };
        let id = telegram.id;
        self.relay.deposit(telegram);
        self.mark_dirty();

        Ok(SendTelegramResponse {
            telegram_id: id,
            remaining_today: self.rate_limiter.remaining_today(
                &sender.public_key,
                QuotaClass::Telegrams,
                self.config.daily_telegrams,
            ),
        })
    }

    /// Poll the inbox and mark the returned telegrams delivered. The read
    /// is gated only on device existence and ban state: contents are
    /// ciphertext, so a forged poll learns nothing. Sweeps expired
    /// telegrams on the way.
    pub fn poll_inbox(&self, public_key: &str, limit: usize) -> ApiResult<InboxResponse> {
        let device = self.get_device(public_key)?;
        if device.banned {
            return Err(ApiError::Forbidden("Device is banned".into()));
        }

        self.relay.cleanup_expired(Utc::now());
        let telegrams = self.relay.poll_inbox(&device.public_key, limit);
        if !telegrams.is_empty() {
            self.mark_dirty();
        }
        Ok(InboxResponse { telegrams })
    }

    // ============ Ops ============

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy".into(),
            version: self.config.version.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            devices_count: self.devices.len(),
        }
    }

    pub fn stats(&self) -> StatsResponse {
        let baptized = self.devices.iter().filter(|r| r.value().verified).count();
        let banned = self.devices.iter().filter(|r| r.value().banned).count();

        StatsResponse {
            total_devices: self.devices.len(),
            baptized_devices: baptized,
            banned_devices: banned,
            pending_requests: self.trust.pending_request_count(),
            endorsements: self.trust.endorsement_count_total(),
            dreams_in_pool: self.pool.len(),
            undelivered_telegrams: self.relay.undelivered_count(),
        }
    }
}

fn short(public_key: &str) -> &str {
    &public_key[..public_key.len().min(16)]
}

#[derive(Serialize, Deserialize)]
struct StateSnapshot {
    devices: Vec<Device>,
    trust: TrustSnapshot,
    dreams: Vec<Dream>,
    telegrams: Vec<Telegram>,
    #[serde(default)]
    counters: Vec<((String, String), DayCounters)>,
    saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(genesis: &[&str]) -> Arc<AppState> {
        let config = Config {
            genesis_keys: genesis.iter().map(|k| k.to_string()).collect(),
            data_dir: std::env::temp_dir().join("tidepool-test"),
            ..Config::from_env()
        };
        AppState::new(config)
    }

    fn key(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    #[test]
    fn test_first_contact_creates_unverified_device() {
        let state = test_state(&[]);
        let device = state.resolve_or_register(&key(1), "hw");

        assert!(!device.verified);
        assert!(!device.banned);
        assert_eq!(device.public_key, key(1));
        assert!(device.name.starts_with("inkling-"));
    }

    #[test]
    fn test_resolution_is_upsert() {
        let state = test_state(&[]);
        let first = state.resolve_or_register(&key(1), "hw");
        let second = state.resolve_or_register(&key(1), "hw");

        assert_eq!(first.public_key, second.public_key);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(state.devices.len(), 1);
    }

    #[test]
    fn test_key_lookup_case_insensitive() {
        let state = test_state(&[]);
        state.resolve_or_register(&key(0xAB).to_uppercase(), "hw");
        assert!(state.get_device(&key(0xAB)).is_ok());
        assert_eq!(state.devices.len(), 1);
    }

    #[test]
    fn test_genesis_key_auto_verified() {
        let genesis = key(1);
        let state = test_state(&[&genesis]);

        let device = state.resolve_or_register(&genesis, "hw");
        assert!(device.verified);

        let normal = state.resolve_or_register(&key(2), "hw");
        assert!(!normal.verified);
    }

    #[test]
    fn test_unbaptized_cannot_endorse() {
        let state = test_state(&[]);
        let endorser = state.resolve_or_register(&key(1), "hw");
        state.resolve_or_register(&key(2), "hw");

        let err = state
            .endorse(&endorser, &key(2), String::new(), "sig".into())
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[test]
    fn test_self_endorsement_rejected() {
        let genesis = key(1);
        let state = test_state(&[&genesis]);
        let endorser = state.resolve_or_register(&genesis, "hw");

        let err = state
            .endorse(&endorser, &genesis, String::new(), "sig".into())
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(state.trust.endorsement_count_total(), 0);
    }

    #[test]
    fn test_endorsing_unknown_target_rejected() {
        let genesis = key(1);
        let state = test_state(&[&genesis]);
        let endorser = state.resolve_or_register(&genesis, "hw");

        let err = state
            .endorse(&endorser, &key(9), String::new(), "sig".into())
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn test_baptism_flow_and_reversal() {
        let g1 = key(1);
        let g2 = key(2);
        let state = test_state(&[&g1, &g2]);
        let e1 = state.resolve_or_register(&g1, "hw");
        let e2 = state.resolve_or_register(&g2, "hw");
        let target = state.resolve_or_register(&key(3), "hw");

        let status = state.request_baptism(&target, "please".into());
        assert!(status.pending_request);
        assert!(!status.baptized);

        // First endorsement: below the edge minimum
        let status = state.endorse(&e1, &key(3), String::new(), "s1".into()).unwrap();
        assert_eq!(status.endorsement_count, 1);
        assert!(!status.baptized);

        // Second endorsement crosses both thresholds
        let status = state.endorse(&e2, &key(3), String::new(), "s2".into()).unwrap();
        assert_eq!(status.endorsement_count, 2);
        assert!(status.baptized);
        assert!(!status.pending_request); // request marked approved
        assert!(state.get_device(&key(3)).unwrap().verified);

        // Revoking one edge drops below the minimum: baptism lapses even
        // though the remaining single score may clear the threshold
        let status = state.revoke(&e1, &key(3)).unwrap();
        assert_eq!(status.endorsement_count, 1);
        assert!(!status.baptized);
        assert!(!state.get_device(&key(3)).unwrap().verified);
    }

    #[test]
    fn test_trust_propagates_past_genesis() {
        let g1 = key(1);
        let g2 = key(2);
        let state = test_state(&[&g1, &g2]);
        let e1 = state.resolve_or_register(&g1, "hw");
        let e2 = state.resolve_or_register(&g2, "hw");

        // Genesis cohort baptizes two second-generation devices
        for target in [key(3), key(4)] {
            state.resolve_or_register(&target, "hw");
            state.endorse(&e1, &target, String::new(), "s".into()).unwrap();
            state.endorse(&e2, &target, String::new(), "s".into()).unwrap();
            assert!(state.get_device(&target).unwrap().verified);
        }

        // Second generation carries level 2 (two incoming edges each):
        // 2/1.0 + 2/1.3 ≈ 3.54 clears the threshold without genesis help
        let a = state.get_device(&key(3)).unwrap();
        let b = state.get_device(&key(4)).unwrap();
        let newcomer = state.resolve_or_register(&key(5), "hw");

        state.endorse(&a, &key(5), String::new(), "s".into()).unwrap();
        let status = state.endorse(&b, &key(5), String::new(), "s".into()).unwrap();
        assert!(status.trust_score > 3.5 && status.trust_score < 3.6);
        assert!(status.baptized);
        assert!(!newcomer.verified); // stale copy from before the flip
    }

    #[test]
    fn test_endorsement_idempotent() {
        let g1 = key(1);
        let state = test_state(&[&g1]);
        let e1 = state.resolve_or_register(&g1, "hw");
        state.resolve_or_register(&key(3), "hw");

        let first = state.endorse(&e1, &key(3), String::new(), "s".into()).unwrap();
        let second = state.endorse(&e1, &key(3), String::new(), "s".into()).unwrap();

        assert_eq!(first.endorsement_count, 1);
        assert_eq!(second.endorsement_count, 1);
        assert_eq!(first.trust_score, second.trust_score);
    }

    #[test]
    fn test_revoke_missing_edge_is_noop() {
        let g1 = key(1);
        let state = test_state(&[&g1]);
        let e1 = state.resolve_or_register(&g1, "hw");
        state.resolve_or_register(&key(3), "hw");

        let status = state.revoke(&e1, &key(3)).unwrap();
        assert_eq!(status.endorsement_count, 0);
    }

    #[test]
    fn test_genesis_never_loses_verification() {
        let g1 = key(1);
        let g2 = key(2);
        let state = test_state(&[&g1, &g2]);
        let e1 = state.resolve_or_register(&g1, "hw");
        let g2_dev = state.resolve_or_register(&g2, "hw");

        // Endorse a genesis device, then withdraw: it stays verified
        state.endorse(&e1, &g2, String::new(), "s".into()).unwrap();
        state.revoke(&e1, &g2).unwrap();
        assert!(state.get_device(&g2_dev.public_key).unwrap().verified);
    }

    #[test]
    fn test_request_baptism_noop_when_baptized() {
        let g1 = key(1);
        let state = test_state(&[&g1]);
        let dev = state.resolve_or_register(&g1, "hw");

        let status = state.request_baptism(&dev, "already in".into());
        assert!(status.baptized);
        assert!(!status.pending_request);
    }

    #[test]
    fn test_plant_rejects_oversize_content() {
        let state = test_state(&[]);
        let dev = state.resolve_or_register(&key(1), "hw");

        let payload = PlantDreamPayload {
            content: "a".repeat(281),
            mood: None,
            face: None,
        };
        let err = state.plant_dream(&dev, payload, "sig".into(), 0).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert!(state.pool.is_empty());
    }

    #[test]
    fn test_plant_and_fish() {
        let state = test_state(&[]);
        let author = state.resolve_or_register(&key(1), "hw");

        let payload = PlantDreamPayload {
            content: "I dreamed of the tide".into(),
            mood: Some("calm".into()),
            face: None,
        };
        let resp = state.plant_dream(&author, payload, "sig".into(), 42).unwrap();
        assert_eq!(resp.dream.fish_count, 0);
        assert_eq!(resp.remaining_today, state.config.daily_dreams - 1);

        // Author's own dream is invisible to them
        assert!(state.fish_dream(Some(&key(1))).dream.is_none());
        let caught = state.fish_dream(Some(&key(2))).dream.unwrap();
        assert_eq!(caught.fish_count, 1);
    }

    #[test]
    fn test_self_telegram_rejected() {
        let state = test_state(&[]);
        let dev = state.resolve_or_register(&key(1), "hw");

        let payload = SendTelegramPayload {
            to_public_key: key(1),
            encrypted_content: "c".into(),
            content_nonce: "n".into(),
            sender_encryption_key: "k".into(),
        };
        let err = state.send_telegram(&dev, payload, "sig".into()).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(state.relay.undelivered_count(), 0);
    }

    #[test]
    fn test_telegram_to_unknown_recipient_rejected() {
        let state = test_state(&[]);
        let dev = state.resolve_or_register(&key(1), "hw");

        let payload = SendTelegramPayload {
            to_public_key: key(9),
            encrypted_content: "c".into(),
            content_nonce: "n".into(),
            sender_encryption_key: "k".into(),
        };
        let err = state.send_telegram(&dev, payload, "sig".into()).unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn test_telegram_roundtrip() {
        let state = test_state(&[]);
        let sender = state.resolve_or_register(&key(1), "hw");
        state.resolve_or_register(&key(2), "hw");

        let payload = SendTelegramPayload {
            to_public_key: key(2),
            encrypted_content: "ciphertext".into(),
            content_nonce: "nonce".into(),
            sender_encryption_key: "ephemeral".into(),
        };
        let resp = state.send_telegram(&sender, payload, "sig".into()).unwrap();
        assert_eq!(resp.remaining_today, state.config.daily_telegrams - 1);

        let inbox = state.poll_inbox(&key(2), 50).unwrap();
        assert_eq!(inbox.telegrams.len(), 1);
        assert_eq!(inbox.telegrams[0].from_public_key, key(1));
        assert!(inbox.telegrams[0].delivered);

        // Drained on the second poll
        assert!(state.poll_inbox(&key(2), 50).unwrap().telegrams.is_empty());
    }

    #[test]
    fn test_poll_inbox_unknown_device() {
        let state = test_state(&[]);
        assert!(matches!(
            state.poll_inbox(&key(9), 50),
            Err(ApiError::NotFound(_))
        ));
    }
}
