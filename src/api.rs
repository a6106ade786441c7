//! HTTP API for Tidepool
//!
//! Thin axum layer: handlers deserialize, call into `AppState`, and map the
//! result to JSON. All policy lives in state and the domain modules.
//!
//! Writes arrive as a `SignedEnvelope`; the payload is only deserialized
//! into its endpoint type after the signature over the canonical bytes has
//! been verified, so the checked bytes and the executed request cannot
//! diverge.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::types::*;

/// Maximum telegrams returned per inbox poll
const MAX_INBOX_POLL: usize = 50;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // ============ Challenge ============
        .route("/challenge", get(get_challenge))
        // ============ Baptism ============
        .route("/baptism", post(post_baptism).get(get_baptism))
        // ============ Dreams ============
        .route("/dreams", post(post_dream))
        .route("/dreams/sample", get(get_dream_sample))
        // ============ Telegrams ============
        .route("/telegrams", post(post_telegram).get(get_inbox))
        // ============ Devices / Ops ============
        .route("/devices/:public_key", get(get_device))
        .route("/health", get(get_health))
        .route("/stats", get(get_stats))
        .with_state(state)
}

/// Real client address: trust proxy headers first, fall back to the socket
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    let from_header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };
    from_header("x-forwarded-for")
        .or_else(|| from_header("x-real-ip"))
        .unwrap_or_else(|| addr.ip())
}

/// Deserialize a verified envelope payload into its endpoint type
fn typed_payload<T: serde::de::DeserializeOwned>(envelope: &SignedEnvelope) -> ApiResult<T> {
    serde_json::from_value(envelope.payload.clone())
        .map_err(|e| ApiError::validation(format!("Malformed payload: {e}")))
}

// ============ Challenge ============

#[derive(Deserialize)]
struct ChallengeQuery {
    /// Bind the nonce to one public key so nobody else can spend it
    public_key: Option<String>,
}

async fn get_challenge(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ChallengeQuery>,
) -> ApiResult<Json<ChallengeResponse>> {
    let ip = client_ip(&headers, addr);
    if !state.challenge_limiter.check(ip) {
        return Err(ApiError::RateLimited {
            counter: "challenges",
            limit: state.config.challenge_rate_limit as u64,
            current: state.config.challenge_rate_limit as u64,
        });
    }

    let bound = query.public_key.map(|k| k.to_lowercase());
    let (nonce, expires_at) = state.nonces.issue(bound);
    Ok(Json(ChallengeResponse { nonce, expires_at }))
}

// ============ Baptism ============

async fn post_baptism(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<SignedEnvelope>,
) -> ApiResult<Json<TrustStatus>> {
    let (_, device) = state.admit(&envelope)?;
    let action: BaptismAction = typed_payload(&envelope)?;

    let status = match action {
        BaptismAction::Request { message } => state.request_baptism(&device, message),
        BaptismAction::Endorse {
            target_public_key,
            message,
        } => state.endorse(&device, &target_public_key, message, envelope.signature)?,
        BaptismAction::Revoke { target_public_key } => {
            state.revoke(&device, &target_public_key)?
        }
    };
    Ok(Json(status))
}

#[derive(Deserialize)]
struct BaptismQuery {
    public_key: Option<String>,
    #[serde(default)]
    pending: bool,
}

async fn get_baptism(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BaptismQuery>,
) -> ApiResult<impl IntoResponse> {
    if query.pending {
        return Ok(Json(serde_json::json!(PendingRequestsResponse {
            requests: state.trust.pending_requests(),
        })));
    }

    let public_key = query
        .public_key
        .ok_or_else(|| ApiError::validation("public_key query parameter required"))?;
    let status = state.trust_status(&public_key)?;
    Ok(Json(serde_json::json!(status)))
}

// ============ Dreams ============

async fn post_dream(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<SignedEnvelope>,
) -> ApiResult<Json<PlantDreamResponse>> {
    let (_, device) = state.admit(&envelope)?;
    let payload: PlantDreamPayload = typed_payload(&envelope)?;

    let response = state.plant_dream(&device, payload, envelope.signature, envelope.timestamp)?;
    Ok(Json(response))
}

#[derive(Deserialize)]
struct FishQuery {
    /// Fisher's key; their own dreams are skipped
    public_key: Option<String>,
}

async fn get_dream_sample(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FishQuery>,
) -> Json<FishDreamResponse> {
    Json(state.fish_dream(query.public_key.as_deref()))
}

// ============ Telegrams ============

async fn post_telegram(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<SignedEnvelope>,
) -> ApiResult<Json<SendTelegramResponse>> {
    let (_, device) = state.admit(&envelope)?;
    let payload: SendTelegramPayload = typed_payload(&envelope)?;

    let response = state.send_telegram(&device, payload, envelope.signature)?;
    Ok(Json(response))
}

#[derive(Deserialize)]
struct InboxQuery {
    public_key: String,
    limit: Option<usize>,
}

async fn get_inbox(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InboxQuery>,
) -> ApiResult<Json<InboxResponse>> {
    let limit = query.limit.unwrap_or(MAX_INBOX_POLL).min(MAX_INBOX_POLL);
    let response = state.poll_inbox(&query.public_key, limit)?;
    Ok(Json(response))
}

// ============ Devices / Ops ============

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(public_key): Path<String>,
) -> ApiResult<Json<DevicePublic>> {
    let device = state.get_device(&public_key)?;
    Ok(Json(DevicePublic::from(&device)))
}

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(state.health())
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(state.stats())
}
