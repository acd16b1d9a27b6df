//! Slack events webhook: signature verification, payload normalization,
//! dedup-key derivation, and outcome-to-status mapping.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::rate_limit::RateLimited;
use crate::repository::ThreadRef;
use crate::router::{self, DedupKey, InboundEvent, RouterOutcome};
use crate::AppState;

/// Reject webhook timestamps older than this to blunt replay attacks.
const MAX_TIMESTAMP_SKEW_SECS: i64 = 5 * 60;

#[derive(Clone)]
pub struct CorrelationId(pub String);

#[derive(Debug, Deserialize)]
pub struct SlackEnvelope {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub challenge: Option<String>,
    pub event_id: Option<String>,
    pub event_time: Option<i64>,
    pub event: Option<SlackEvent>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackEvent {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub subtype: Option<String>,
    pub bot_id: Option<String>,
    pub user: Option<String>,
    pub text: Option<String>,
    pub ts: Option<String>,
    pub thread_ts: Option<String>,
    pub client_msg_id: Option<String>,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

type HmacSha256 = Hmac<Sha256>;

/// Verify Slack's `v0=` request signature: HMAC-SHA256 of
/// `v0:{timestamp}:{body}` with the signing secret.
fn verify_slack_signature(secret: &str, timestamp: &str, payload: &[u8], signature: &str) -> bool {
    if !signature.starts_with("v0=") {
        return false;
    }

    let signature_hex = &signature[3..];

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(payload);

    // Constant-time verification.
    mac.verify_slice(&signature_bytes).is_ok()
}

fn timestamp_is_fresh(timestamp: &str, now_secs: i64) -> bool {
    match timestamp.parse::<i64>() {
        Ok(ts) => (now_secs - ts).abs() <= MAX_TIMESTAMP_SKEW_SECS,
        Err(_) => false,
    }
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let correlation_id = CorrelationId(Uuid::new_v4().to_string());

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = header_str(&parts.headers, "x-slack-signature").ok_or(StatusCode::UNAUTHORIZED)?;
    let timestamp =
        header_str(&parts.headers, "x-slack-request-timestamp").ok_or(StatusCode::UNAUTHORIZED)?;

    if !timestamp_is_fresh(&timestamp, chrono::Utc::now().timestamp()) {
        warn!("Rejecting webhook with stale timestamp {}", timestamp);
        return Err(StatusCode::UNAUTHORIZED);
    }

    if !verify_slack_signature(&state.signing_secret, &timestamp, &bytes, &signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let mut new_request = Request::from_parts(parts, axum::body::Body::from(bytes));
    new_request.extensions_mut().insert(correlation_id);

    Ok(next.run(new_request).await)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Derive the deduplication key from the first available signal.
///
/// `NonIdempotent` means none was present; the event is processed without
/// dedup bookkeeping and logged as a warning by the router.
pub fn derive_dedup_key(
    event_id: Option<&str>,
    client_msg_id: Option<&str>,
    ts: Option<&str>,
    user: Option<&str>,
    event_time: Option<i64>,
    event_type: &str,
) -> DedupKey {
    fn nonempty(value: Option<&str>) -> Option<&str> {
        value.filter(|s| !s.is_empty())
    }

    if let Some(id) = nonempty(event_id) {
        return DedupKey::Key(id.to_string());
    }
    if let Some(id) = nonempty(client_msg_id) {
        return DedupKey::Key(format!("msg:{}", id));
    }
    if let (Some(ts), Some(user)) = (nonempty(ts), nonempty(user)) {
        return DedupKey::Key(format!("ts:{}:{}", ts, user));
    }
    if let Some(event_time) = event_time {
        return DedupKey::Key(format!("evt:{}:{}", event_time, event_type));
    }
    DedupKey::NonIdempotent
}

fn describe(outcome: &RouterOutcome) -> &'static str {
    match outcome {
        RouterOutcome::Duplicate => "already handled",
        RouterOutcome::Ignored => "ignored",
        RouterOutcome::ThemeSet => "theme updated",
        RouterOutcome::ThemeCleared => "theme cleared",
        RouterOutcome::ThemeRejected => "theme rejected",
        RouterOutcome::MarkedKnown { .. } => "marked known",
        RouterOutcome::TutorReplied => "tutor replied",
        RouterOutcome::RedirectedToPending => "redirected to pending word",
        RouterOutcome::NewWordRequested { .. } => "new word requested",
    }
}

fn ack(message: &str) -> Response {
    (
        StatusCode::OK,
        Json(WebhookResponse {
            message: message.to_string(),
        }),
    )
        .into_response()
}

pub async fn slack_events_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Response {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let (_parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let envelope: SlackEnvelope = match serde_json::from_slice(&bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("[{}] Unparseable webhook payload: {}", correlation_id, e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    // Slack's endpoint-setup handshake.
    if envelope.kind.as_deref() == Some("url_verification") {
        info!("[{}] Handling Slack URL verification challenge", correlation_id);
        return Json(serde_json::json!({
            "challenge": envelope.challenge.unwrap_or_default()
        }))
        .into_response();
    }

    let Some(event) = envelope.event else {
        return ack("no event");
    };

    // Our own posts echo back as events; dropping them prevents loops.
    if event.bot_id.is_some() || event.subtype.as_deref() == Some("bot_message") {
        return ack("ignoring bot message");
    }

    if event.kind.as_deref() != Some("message") {
        return ack("not a message event");
    }

    let (Some(user), Some(text)) = (event.user.clone(), event.text.clone()) else {
        return ack("missing user or text");
    };

    let event_type = event.kind.clone().unwrap_or_else(|| "message".to_string());
    let dedup_key = derive_dedup_key(
        envelope.event_id.as_deref(),
        event.client_msg_id.as_deref(),
        event.ts.as_deref(),
        event.user.as_deref(),
        envelope.event_time,
        &event_type,
    );

    let thread_ref = event
        .thread_ts
        .clone()
        .or_else(|| event.ts.clone())
        .map(ThreadRef);

    let inbound = InboundEvent {
        thread_ref,
        user_id: user,
        text,
        event_type,
        dedup_key,
    };

    info!(
        "[{}] Processing message from user {} in thread {:?}",
        correlation_id,
        inbound.user_id,
        inbound.thread_ref.as_ref().map(|t| t.0.as_str())
    );

    match router::handle_inbound(&state, inbound).await {
        Ok(outcome) => ack(describe(&outcome)),
        Err(e) => {
            if let Some(limited) = e.chain().find_map(|c| c.downcast_ref::<RateLimited>()) {
                // The event was not marked processed; asking the platform to
                // retry later lets a legitimate redelivery succeed.
                info!("[{}] Rate limited: {}", correlation_id, limited);
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(
                        axum::http::header::RETRY_AFTER,
                        limited.retry_after.as_secs().max(1).to_string(),
                    )],
                    Json(WebhookResponse {
                        message: "rate limited, retry later".to_string(),
                    }),
                )
                    .into_response();
            }

            // Ack upstream to avoid redelivery storms; the event claim was
            // already released so a later manual retry can still succeed.
            error!("[{}] Failed to handle event: {:#}", correlation_id, e);
            ack("error processed")
        }
    }
}

pub fn webhook_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/slack/events", post(slack_events_handler))
        .layer(middleware::from_fn_with_state(
            state,
            verify_webhook_signature,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_verifies() {
        let signature = sign("secret", "1700000000", b"payload");
        assert!(verify_slack_signature(
            "secret",
            "1700000000",
            b"payload",
            &signature
        ));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let signature = sign("secret", "1700000000", b"payload");
        assert!(!verify_slack_signature(
            "secret",
            "1700000000",
            b"tampered",
            &signature
        ));
        assert!(!verify_slack_signature(
            "other-secret",
            "1700000000",
            b"payload",
            &signature
        ));
        assert!(!verify_slack_signature(
            "secret",
            "1700000000",
            b"payload",
            "sha256=deadbeef"
        ));
    }

    #[test]
    fn stale_timestamps_are_rejected() {
        let now = 1_700_000_000;
        assert!(timestamp_is_fresh("1700000000", now));
        assert!(timestamp_is_fresh("1699999800", now));
        assert!(!timestamp_is_fresh("1699990000", now));
        assert!(!timestamp_is_fresh("not-a-number", now));
    }

    #[test]
    fn dedup_key_prefers_event_id() {
        let key = derive_dedup_key(
            Some("Ev123"),
            Some("c-1"),
            Some("1.0"),
            Some("U1"),
            Some(1700000000),
            "message",
        );
        assert_eq!(key, DedupKey::Key("Ev123".to_string()));
    }

    #[test]
    fn dedup_key_falls_back_in_order() {
        assert_eq!(
            derive_dedup_key(None, Some("c-1"), Some("1.0"), Some("U1"), None, "message"),
            DedupKey::Key("msg:c-1".to_string())
        );
        assert_eq!(
            derive_dedup_key(None, None, Some("1.0"), Some("U1"), None, "message"),
            DedupKey::Key("ts:1.0:U1".to_string())
        );
        assert_eq!(
            derive_dedup_key(None, None, None, None, Some(1700000000), "message"),
            DedupKey::Key("evt:1700000000:message".to_string())
        );
        assert_eq!(
            derive_dedup_key(None, None, None, None, None, "message"),
            DedupKey::NonIdempotent
        );
    }

    #[test]
    fn envelope_parses_challenge_payload() {
        let raw = r#"{"type": "url_verification", "challenge": "abc123"}"#;
        let envelope: SlackEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind.as_deref(), Some("url_verification"));
        assert_eq!(envelope.challenge.as_deref(), Some("abc123"));
    }

    proptest! {
        /// Key derivation is deterministic and an explicit event id always
        /// wins over every fallback signal.
        #[test]
        fn event_id_dominates_derivation(
            event_id in "[a-zA-Z0-9]{1,16}",
            client_msg_id in proptest::option::of("[a-z0-9-]{1,16}"),
            ts in proptest::option::of("[0-9]{1,10}\\.[0-9]{1,6}"),
            user in proptest::option::of("[A-Z0-9]{1,10}"),
            event_time in proptest::option::of(0i64..2_000_000_000),
        ) {
            let key = derive_dedup_key(
                Some(&event_id),
                client_msg_id.as_deref(),
                ts.as_deref(),
                user.as_deref(),
                event_time,
                "message",
            );
            prop_assert_eq!(key, DedupKey::Key(event_id));
        }
    }
}
