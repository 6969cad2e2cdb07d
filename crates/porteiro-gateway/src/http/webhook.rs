//! Webhook ingress endpoint — POST /webhook.
//!
//! Authenticates the request according to `[webhook].auth_mode`, parses the
//! body, and hands it to the ingress rules. Always answers quickly: the
//! pipeline runs later on the flush workers.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use porteiro_core::config::{WebhookAuthMode, WebhookConfig};
use porteiro_core::events::{self, Event};

use crate::app::AppState;
use crate::ingress::{self, IngressOutcome};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const AUTH_HEADER: &str = "authorization";

/// Why an inbound webhook request failed authentication. Every variant maps
/// to 401; the variant names the first check that failed.
#[derive(Debug, Error)]
pub enum WebhookAuthError {
    #[error("auth mode {mode} has no secret configured")]
    MissingSecret { mode: &'static str },

    #[error("missing {header} header")]
    MissingHeader { header: &'static str },

    #[error("malformed {header} header")]
    MalformedHeader { header: &'static str },

    #[error("HMAC key rejected")]
    InvalidKey,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("bearer token mismatch")]
    TokenMismatch,
}

/// POST /webhook
///
/// Returns 200 with the ingress outcome for every well-formed request,
/// 401 on auth failure, 400 on a body that is not JSON.
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    authenticate(&state.config.webhook, &headers, &body).map_err(auth_error)?;

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            state
                .sink
                .emit(&Event::new(events::WEBHOOK, "error").field("reason", "invalid_json"));
            let outcome = IngressOutcome::Error {
                error: format!("invalid JSON body: {e}"),
            };
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::to_value(&outcome).unwrap_or_else(|_| json!({"status": "error"}))),
            ));
        }
    };

    let outcome = ingress::handle_event(&state, &payload).await;
    Ok(Json(
        serde_json::to_value(&outcome).unwrap_or_else(|_| json!({"status": "error"})),
    ))
}

/// Check the request against the configured auth mode.
fn authenticate(
    config: &WebhookConfig,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), WebhookAuthError> {
    match config.auth_mode {
        // No authentication — operator explicitly opted out.
        WebhookAuthMode::None => Ok(()),
        WebhookAuthMode::HmacSha256 => {
            let secret = required_secret(config, "hmac-sha256")?;
            let claimed = claimed_signature(headers)?;
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|_| WebhookAuthError::InvalidKey)?;
            mac.update(body);
            mac.verify_slice(&claimed)
                .map_err(|_| WebhookAuthError::SignatureMismatch)
        }
        WebhookAuthMode::BearerToken => {
            let secret = required_secret(config, "bearer-token")?;
            let value = header_str(headers, AUTH_HEADER)?;
            match value.strip_prefix("Bearer ") {
                Some(token) if token == secret => Ok(()),
                Some(_) => Err(WebhookAuthError::TokenMismatch),
                None => Err(WebhookAuthError::MalformedHeader {
                    header: AUTH_HEADER,
                }),
            }
        }
    }
}

fn required_secret<'a>(
    config: &'a WebhookConfig,
    mode: &'static str,
) -> Result<&'a str, WebhookAuthError> {
    config
        .secret
        .as_deref()
        .ok_or(WebhookAuthError::MissingSecret { mode })
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    header: &'static str,
) -> Result<&'a str, WebhookAuthError> {
    let value = headers
        .get(header)
        .ok_or(WebhookAuthError::MissingHeader { header })?;
    value
        .to_str()
        .map_err(|_| WebhookAuthError::MalformedHeader { header })
}

/// Decode the `sha256=<hex>` signature the sender claims for the body.
fn claimed_signature(headers: &HeaderMap) -> Result<Vec<u8>, WebhookAuthError> {
    let value = header_str(headers, SIGNATURE_HEADER)?;
    let hex_digest = value
        .strip_prefix("sha256=")
        .ok_or(WebhookAuthError::MalformedHeader {
            header: SIGNATURE_HEADER,
        })?;
    hex::decode(hex_digest).map_err(|_| WebhookAuthError::MalformedHeader {
        header: SIGNATURE_HEADER,
    })
}

fn auth_error(e: WebhookAuthError) -> (StatusCode, Json<Value>) {
    warn!(error = %e, "webhook authentication failed");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "authentication failed", "reason": e.to_string()})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(auth_mode: WebhookAuthMode, secret: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            auth_mode,
            secret: secret.map(String::from),
            default_instance: "main".to_string(),
        }
    }

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
        headers
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn none_mode_accepts_anything() {
        let cfg = config(WebhookAuthMode::None, None);
        assert!(authenticate(&cfg, &HeaderMap::new(), b"{}").is_ok());
    }

    #[test]
    fn bearer_token_accepts_only_the_configured_secret() {
        let cfg = config(WebhookAuthMode::BearerToken, Some("s3cret"));
        let ok = headers_with(AUTH_HEADER, "Bearer s3cret");
        assert!(authenticate(&cfg, &ok, b"{}").is_ok());

        let wrong = headers_with(AUTH_HEADER, "Bearer other");
        assert!(matches!(
            authenticate(&cfg, &wrong, b"{}"),
            Err(WebhookAuthError::TokenMismatch)
        ));
        assert!(matches!(
            authenticate(&cfg, &HeaderMap::new(), b"{}"),
            Err(WebhookAuthError::MissingHeader { .. })
        ));
        let basic = headers_with(AUTH_HEADER, "Basic s3cret");
        assert!(matches!(
            authenticate(&cfg, &basic, b"{}"),
            Err(WebhookAuthError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn bearer_without_secret_is_a_config_error() {
        let cfg = config(WebhookAuthMode::BearerToken, None);
        let headers = headers_with(AUTH_HEADER, "Bearer anything");
        assert!(matches!(
            authenticate(&cfg, &headers, b"{}"),
            Err(WebhookAuthError::MissingSecret { .. })
        ));
    }

    #[test]
    fn hmac_verifies_a_correct_signature() {
        let body = br#"{"instance":"k"}"#;
        let cfg = config(WebhookAuthMode::HmacSha256, Some("secret"));
        let headers = headers_with(SIGNATURE_HEADER, &sign("secret", body));
        assert!(authenticate(&cfg, &headers, body).is_ok());

        let wrong = config(WebhookAuthMode::HmacSha256, Some("other"));
        assert!(matches!(
            authenticate(&wrong, &headers, body),
            Err(WebhookAuthError::SignatureMismatch)
        ));
        // signature over a different body fails too
        assert!(matches!(
            authenticate(&cfg, &headers, b"tampered"),
            Err(WebhookAuthError::SignatureMismatch)
        ));
    }

    #[test]
    fn hmac_rejects_malformed_headers() {
        let cfg = config(WebhookAuthMode::HmacSha256, Some("secret"));
        let unprefixed = headers_with(SIGNATURE_HEADER, "deadbeef");
        assert!(matches!(
            authenticate(&cfg, &unprefixed, b"{}"),
            Err(WebhookAuthError::MalformedHeader { .. })
        ));
        let not_hex = headers_with(SIGNATURE_HEADER, "sha256=zzzz");
        assert!(matches!(
            authenticate(&cfg, &not_hex, b"{}"),
            Err(WebhookAuthError::MalformedHeader { .. })
        ));
        assert!(matches!(
            authenticate(&cfg, &HeaderMap::new(), b"{}"),
            Err(WebhookAuthError::MissingHeader { .. })
        ));
    }
}
