//! Outbound gateway seam.

use async_trait::async_trait;
use thiserror::Error;

use porteiro_core::types::MessagePayload;

/// Result of a successful gateway send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Message id assigned by the provider.
    pub provider_message_id: String,
    /// Provider-reported status string (e.g. "PENDING", "sent").
    pub status: String,
}

/// Gateway failures, split along the retry boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network trouble, timeout, 408/429/5xx. Halts the turn; the item
    /// stays pending and is retried on the next trigger.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// Recipient invalid, payload rejected, auth failure. Retrying the same
    /// item cannot succeed; delivery records the failure and moves on.
    #[error("permanent gateway error: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            GatewayError::Transient(r) | GatewayError::Permanent(r) => r,
        }
    }
}

/// Something that can push a message to the user. Must be safe to call
/// repeatedly with the same content — the delivery worker's idempotency
/// machinery, not the gateway, guarantees at-most-once.
#[async_trait]
pub trait OutboundGateway: Send + Sync {
    async fn send(&self, payload: &MessagePayload) -> std::result::Result<SendReceipt, GatewayError>;
}
