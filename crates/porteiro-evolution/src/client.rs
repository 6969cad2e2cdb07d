//! Outbound Evolution API client.
//!
//! `POST {base_url}/message/sendText/{instance}` with the instance API key.
//! Implements [`OutboundGateway`]; the delivery worker's idempotency
//! machinery sits above this, so repeated sends of the same content are
//! safe here.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use porteiro_core::config::EvolutionConfig;
use porteiro_core::types::MessagePayload;
use porteiro_delivery::{GatewayError, OutboundGateway, SendReceipt};

pub struct EvolutionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    instance: String,
}

impl EvolutionClient {
    pub fn new(config: &EvolutionConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.send_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            instance: config.instance.clone(),
        }
    }

    fn send_url(&self) -> String {
        format!("{}/message/sendText/{}", self.base_url, self.instance)
    }
}

/// HTTP status → retry boundary. 408/429 and every 5xx are worth retrying;
/// any other non-success status means the request itself is wrong.
fn classify_status(status: reqwest::StatusCode) -> Option<GatewayError> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    if code == 408 || code == 429 || status.is_server_error() {
        Some(GatewayError::Transient(format!("http {code}")))
    } else {
        Some(GatewayError::Permanent(format!("http {code}")))
    }
}

/// Pull the provider message id out of a send response.
fn provider_message_id(body: &Value) -> String {
    body.pointer("/key/id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait]
impl OutboundGateway for EvolutionClient {
    async fn send(&self, payload: &MessagePayload) -> Result<SendReceipt, GatewayError> {
        let url = self.send_url();
        let body = json!({
            "number": payload.recipient,
            "text": payload.text,
        });

        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "evolution send request failed");
                GatewayError::Transient(e.to_string())
            })?;

        if let Some(err) = classify_status(response.status()) {
            warn!(status = %response.status(), "evolution send rejected");
            return Err(err);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(format!("invalid response body: {e}")))?;
        let id = provider_message_id(&body);
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("sent")
            .to_string();
        debug!(provider_message_id = %id, status = %status, "evolution send accepted");

        Ok(SendReceipt {
            provider_message_id: id,
            status,
        })
    }
}
