use std::net::SocketAddr;
use std::time::{Duration, UNIX_EPOCH};

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::{
    issuance::IssueError,
    redemption::RedeemError,
    store::{now_millis, AuditEntry, AuditFilter, LinkEvent, Outcome, StoreError},
    AppState,
};

// ── Error reasons ────────────────────────────────────────────────────────────

pub const REASON_INVALID_REQUEST: &str = "invalid_request";
pub const REASON_NOT_FOUND: &str = "not_found";
pub const REASON_ALREADY_ACCESSED: &str = "already_accessed";
pub const REASON_EXPIRED: &str = "expired";
pub const REASON_SERVER_ERROR: &str = "server_error";

fn error_response(status: StatusCode, reason: &str, message: &str) -> Response {
    (status, Json(json!({"error": message, "reason": reason}))).into_response()
}

// ── IP extraction ────────────────────────────────────────────────────────────

fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    addr.ip().to_string()
}

/// Format unix milliseconds as RFC 3339 UTC, e.g. `2026-10-18T12:00:00.000Z`.
pub fn format_timestamp(unix_ms: i64) -> String {
    let at = UNIX_EPOCH + Duration::from_millis(unix_ms.max(0) as u64);
    humantime::format_rfc3339_millis(at).to_string()
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkRequest {
    pub content: Option<String>,
    pub expires_in_minutes: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkResponse {
    pub success: bool,
    pub access_token: String,
    pub expires_at: String,
}

pub async fn create_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<CreateLinkRequest>, JsonRejection>,
) -> Response {
    let ip = extract_ip(&headers, &addr);

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                REASON_INVALID_REQUEST,
                &format!("invalid request body: {}", rejection.body_text()),
            );
        }
    };
    let (Some(content), Some(ttl_minutes)) = (body.content, body.expires_in_minutes) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            REASON_INVALID_REQUEST,
            "content and expiresInMinutes are required",
        );
    };
    let content = Zeroizing::new(content);

    match state.issuer.issue(&content, ttl_minutes).await {
        Ok(link) => {
            info!(id = %link.record_id, ttl_minutes, "link created");
            state
                .audit(
                    AuditEntry::new(LinkEvent::Create, Outcome::Ok, ip)
                        .record(link.record_id.as_str())
                        .note(format!("ttl_minutes={ttl_minutes}")),
                )
                .await;
            Json(CreateLinkResponse {
                success: true,
                access_token: link.access_token,
                expires_at: format_timestamp(link.expires_at),
            })
            .into_response()
        }
        Err(IssueError::Validation(msg)) => {
            error_response(StatusCode::BAD_REQUEST, REASON_INVALID_REQUEST, &msg)
        }
        Err(IssueError::Crypto(e)) => {
            error!(error = %e, "failed to encrypt link content");
            state
                .audit(
                    AuditEntry::new(LinkEvent::Create, Outcome::ServerError, ip)
                        .note("encryption failed"),
                )
                .await;
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                REASON_SERVER_ERROR,
                "failed to create secure link",
            )
        }
        // The store is what failed; auditing would only wait on it again.
        Err(IssueError::Store(e)) => {
            error!(error = %e, "failed to store link");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                REASON_SERVER_ERROR,
                "failed to create secure link",
            )
        }
    }
}

// ── Redeem ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RedeemQuery {
    pub token: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemLinkResponse {
    pub success: bool,
    pub content: String,
    pub created_at: String,
}

/// `GET /links/{token}`
pub async fn redeem_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    redeem(&state, ip, &token).await
}

/// `GET /links?token=...`
pub async fn redeem_link_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<RedeemQuery>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    redeem(&state, ip, query.token.as_deref().unwrap_or_default()).await
}

async fn redeem(state: &AppState, ip: String, token: &str) -> Response {
    let entry = |outcome: Outcome| AuditEntry::new(LinkEvent::Redeem, outcome, ip.as_str());

    let (audit, response) = match state.redeemer.redeem(token).await {
        Ok(secret) => {
            info!(id = %secret.record_id, "link redeemed");
            let response = (
                [(header::CACHE_CONTROL, "no-store")],
                Json(RedeemLinkResponse {
                    success: true,
                    content: secret.content.as_str().to_owned(),
                    created_at: format_timestamp(secret.created_at),
                }),
            )
                .into_response();
            (entry(Outcome::Ok).record(secret.record_id.as_str()), response)
        }
        Err(RedeemError::Validation(msg)) => {
            return error_response(StatusCode::BAD_REQUEST, REASON_INVALID_REQUEST, &msg);
        }
        Err(RedeemError::NotFound) => (
            entry(Outcome::NotFound),
            error_response(
                StatusCode::NOT_FOUND,
                REASON_NOT_FOUND,
                "link not found or has been deleted",
            ),
        ),
        Err(RedeemError::AlreadyAccessed { record_id }) => {
            info!(id = %record_id, "redeem refused: already accessed");
            (
                entry(Outcome::AlreadyAccessed).record(record_id),
                error_response(
                    StatusCode::GONE,
                    REASON_ALREADY_ACCESSED,
                    "link already accessed and is no longer available",
                ),
            )
        }
        Err(RedeemError::Expired { record_id }) => {
            info!(id = %record_id, "redeem refused: expired");
            (
                entry(Outcome::Expired).record(record_id),
                error_response(
                    StatusCode::GONE,
                    REASON_EXPIRED,
                    "link has expired and is no longer available",
                ),
            )
        }
        Err(RedeemError::Crypto { record_id, source }) => {
            error!(id = %record_id, error = %source, "failed to decrypt claimed link");
            (
                entry(Outcome::ServerError)
                    .record(record_id)
                    .note("decryption failed"),
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    REASON_SERVER_ERROR,
                    "failed to decrypt content",
                ),
            )
        }
        Err(RedeemError::Store(e)) => return internal_error(e),
    };

    state.audit(audit).await;
    response
}

// ── Admin ────────────────────────────────────────────────────────────────────

/// `GET /audit` query. `since` and `until` are inclusive unix milliseconds.
#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub event: Option<LinkEvent>,
    pub record: Option<String>,
    pub limit: Option<usize>,
}

pub async fn audit_events(
    State(state): State<AppState>,
    Query(params): Query<AuditQueryParams>,
) -> Response {
    let filter = AuditFilter {
        since: params.since,
        until: params.until,
        event: params.event,
        record_id: params.record,
        limit: params.limit.unwrap_or(100).min(1000),
    };
    match state.with_store(move |s| s.list_audit(&filter)).await {
        Ok(entries) => Json(json!({ "entries": entries })).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn prune_links(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    match state.with_store(|s| s.prune(now_millis())).await {
        Ok(pruned) => {
            let n = pruned.len();
            info!(pruned = n, "expired links pruned");
            state
                .audit(
                    AuditEntry::new(LinkEvent::Prune, Outcome::Ok, ip).note(format!("pruned={n}")),
                )
                .await;
            Json(json!({"pruned": n})).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn internal_error(e: StoreError) -> Response {
    error!(error = %e, "store call failed");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        REASON_SERVER_ERROR,
        "internal server error",
    )
}
