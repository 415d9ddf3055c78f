//! HTTP handlers (spec.md §6). Thin translation layer only: parse the body,
//! authenticate, call into the core (`dg-gateway`/`dg-auth`), translate the
//! result back into the external wire shapes.

use std::time::{SystemTime, UNIX_EPOCH};

use alloy::signers::SignerSync;
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use dg_auth::verify_aad;
use dg_errors::GatewayError;
use dg_gateway::parse_log_filter;
use dg_types::{
    event::Event,
    http::{HealthMetrics, HealthReport, VersionInfo},
};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    error::ApiError,
    extract::{parse_address, parse_bytes, read_json},
    state::AppState,
};

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<dg_auth::AuthContext, ApiError> {
    state.auth.authenticate(headers).await.map_err(ApiError::from)
}

/// A token that cancels itself once `state.request_timeout` elapses
/// (spec.md §4.1/§5 "every operation accepts a cancellation token"), handed
/// to the executor so a stuck backend call doesn't run forever.
fn request_deadline(state: &AppState) -> CancellationToken {
    let cancel = CancellationToken::new();
    let timeout = state.request_timeout;
    let child = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        child.cancel();
    });
    cancel
}

#[derive(Deserialize)]
pub struct DeployRequest {
    data: String,
}

#[derive(Serialize)]
pub struct IdResponse {
    id: u64,
}

pub async fn deploy(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<IdResponse>, ApiError> {
    let context = authenticate(&state, &headers).await?;
    if !context.allows_deploy {
        return Err(GatewayError::AuthenticationFailed("deploy is not permitted for this identity".into()).into());
    }
    let request: DeployRequest = read_json(&headers, &body, state.max_body_bytes)?;
    let data = parse_bytes(&request.data)?;
    verify_aad(&data, &context.expected_aad)?;

    let cancel = request_deadline(&state);
    let id = state
        .request_manager
        .deploy(&context.session_key, data, cancel)
        .await?;
    Ok(Json(IdResponse { id }))
}

#[derive(Deserialize)]
pub struct ExecuteRequest {
    address: String,
    data: String,
}

pub async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<IdResponse>, ApiError> {
    let context = authenticate(&state, &headers).await?;
    let request: ExecuteRequest = read_json(&headers, &body, state.max_body_bytes)?;
    let address = parse_address(&request.address)?;
    let data = parse_bytes(&request.data)?;
    verify_aad(&data, &context.expected_aad)?;

    let cancel = request_deadline(&state);
    let id = state
        .request_manager
        .execute(&context.session_key, address, data, cancel)
        .await?;
    Ok(Json(IdResponse { id }))
}

#[derive(Deserialize)]
pub struct PollRequest {
    offset: u64,
    #[serde(default)]
    count: u32,
    #[serde(default, rename = "discardPrevious")]
    discard_previous: bool,
}

#[derive(Serialize)]
pub struct PollResponse {
    offset: u64,
    events: Vec<Event>,
}

pub async fn poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<PollResponse>, ApiError> {
    let context = authenticate(&state, &headers).await?;
    let request: PollRequest = read_json(&headers, &body, state.max_body_bytes)?;

    let page = state
        .request_manager
        .poll(
            &context.session_key,
            request.offset,
            request.count,
            request.discard_previous,
        )
        .await?;
    Ok(Json(PollResponse {
        offset: page.start_offset,
        events: page.events,
    }))
}

#[derive(Deserialize)]
pub struct SubscribeRequest {
    events: Vec<String>,
    filter: String,
}

pub async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<IdResponse>, ApiError> {
    let context = authenticate(&state, &headers).await?;
    let request: SubscribeRequest = read_json(&headers, &body, state.max_body_bytes)?;

    if request.events != ["logs"] {
        return Err(GatewayError::UnknownSubscriptionType(request.events.join(",")).into());
    }
    let filter = parse_log_filter(&request.filter)?;

    let subscription_id = state
        .request_manager
        .subscribe(&context.session_key, filter)
        .await?;
    Ok(Json(IdResponse { id: subscription_id }))
}

#[derive(Deserialize)]
pub struct UnsubscribeRequest {
    id: u64,
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(), ApiError> {
    let context = authenticate(&state, &headers).await?;
    let request: UnsubscribeRequest = read_json(&headers, &body, state.max_body_bytes)?;
    state
        .request_manager
        .unsubscribe(&context.session_key, request.id)
        .await?;
    Ok(())
}

#[derive(Deserialize)]
pub struct EventPollRequest {
    id: u64,
    offset: u64,
    #[serde(default)]
    count: u32,
    #[serde(default, rename = "discardPrevious")]
    discard_previous: bool,
}

pub async fn poll_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<PollResponse>, ApiError> {
    let context = authenticate(&state, &headers).await?;
    let request: EventPollRequest = read_json(&headers, &body, state.max_body_bytes)?;

    let page = state
        .request_manager
        .poll_subscription(
            &context.session_key,
            request.id,
            request.offset,
            request.count,
            request.discard_previous,
        )
        .await?;
    Ok(Json(PollResponse {
        offset: page.start_offset,
        events: page.events,
    }))
}

#[derive(Deserialize)]
pub struct GetPublicKeyQuery {
    address: String,
}

#[derive(Serialize)]
pub struct GetPublicKeyResponse {
    timestamp: i64,
    address: String,
    #[serde(rename = "publicKey")]
    public_key: String,
    signature: String,
}

/// Self-signed proof of which public key a signer address corresponds to.
/// Not tied to any one of C1–C7: it reads straight out of the signer pool
/// the binary built at startup (spec.md §6).
pub async fn get_public_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<GetPublicKeyQuery>,
) -> Result<Json<GetPublicKeyResponse>, ApiError> {
    authenticate(&state, &headers).await?;
    let address = parse_address(&query.address)?;
    let signer = state
        .signer_wallets
        .get(&address)
        .ok_or_else(|| GatewayError::InvalidAddress(query.address.clone()))?;

    let verifying_key = signer.credential().verifying_key();
    let public_key = const_hex::encode_prefixed(verifying_key.to_encoded_point(false).as_bytes());

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let message = format!("{timestamp}:{:#x}:{public_key}", address);
    let signature = signer
        .sign_message_sync(message.as_bytes())
        .map_err(|e| GatewayError::UnexpectedRpcFailure(format!("self-sign failed: {e}")))?;
    let mut sig_bytes = Vec::with_capacity(65);
    sig_bytes.extend_from_slice(&signature.r().to_be_bytes::<32>());
    sig_bytes.extend_from_slice(&signature.s().to_be_bytes::<32>());
    sig_bytes.push(signature.v() as u8);

    Ok(Json(GetPublicKeyResponse {
        timestamp,
        address: format!("{address:#x}"),
        public_key,
        signature: const_hex::encode_prefixed(sig_bytes),
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let metrics = state.subscriptions.metrics();
    Json(HealthReport {
        health: "ok",
        metrics: HealthMetrics {
            subscriptions_current: metrics.current,
            subscriptions_lifetime_total: metrics.lifetime_total,
        },
    })
}

pub async fn version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
    })
}
