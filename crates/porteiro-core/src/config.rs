use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Pipeline constants. Overridable via config; these are the contract defaults.
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEBOUNCE_MS: i64 = 1200; // quiet window before a buffer becomes a turn
pub const BUFFER_TTL_SECS: u64 = 60; // turn buffer lifetime
pub const LOCK_TTL_SECS: u64 = 15; // turn lock safety TTL
pub const MSG_DEDUP_TTL_SECS: u64 = 60; // duplicate-webhook window
pub const IDEM_TTL_SECS: u64 = 86_400; // delivered idempotency keys, 24h
pub const RECURSION_LIMIT: u32 = 8;
pub const RECURSION_TTL_SECS: u64 = 300;
pub const GREETING_COOLDOWN_SECS: u64 = 30;
pub const MAX_TEXT_CHARS: usize = 1000;
pub const RATE_LIMIT_PER_MINUTE: usize = 50;
pub const DELIVERY_DEADLINE_SECS: u64 = 30;

/// Top-level config (porteiro.toml + PORTEIRO_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PorteiroConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub contact: ContactConfig,
    #[serde(default)]
    pub flags: FlagsConfig,
}

/// Human escalation target, quoted in canned responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactConfig {
    #[serde(default = "default_human_phone")]
    pub human_phone: String,
}

impl Default for ContactConfig {
    fn default() -> Self {
        Self {
            human_phone: default_human_phone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Authentication mode for the inbound webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookAuthMode {
    /// HMAC-SHA256 over the raw request body (X-Hub-Signature-256 header).
    HmacSha256,
    /// Static bearer token in the Authorization header.
    BearerToken,
    /// No authentication — only for internal/trusted networks.
    #[default]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    #[serde(default)]
    pub auth_mode: WebhookAuthMode,
    /// HMAC signing secret or bearer token value.
    pub secret: Option<String>,
    /// Instance name assumed when the payload omits one.
    #[serde(default = "default_instance")]
    pub default_instance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: i64,
    #[serde(default = "default_buffer_ttl_secs")]
    pub buffer_ttl_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEBOUNCE_MS,
            buffer_ttl_secs: BUFFER_TTL_SECS,
            lock_ttl_secs: LOCK_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Duplicate-webhook window for message ids.
    #[serde(default = "default_msg_dedup_ttl_secs")]
    pub message_ttl_secs: u64,
    /// Lifetime of delivered idempotency keys. Must stay ≥ 24h.
    #[serde(default = "default_idem_ttl_secs")]
    pub idempotency_ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            message_ttl_secs: MSG_DEDUP_TTL_SECS,
            idempotency_ttl_secs: IDEM_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_rate_per_minute")]
    pub messages_per_minute: usize,
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: u32,
    #[serde(default = "default_recursion_ttl_secs")]
    pub recursion_ttl_secs: u64,
    #[serde(default = "default_greeting_cooldown_secs")]
    pub greeting_cooldown_secs: u64,
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            messages_per_minute: RATE_LIMIT_PER_MINUTE,
            recursion_limit: RECURSION_LIMIT,
            recursion_ttl_secs: RECURSION_TTL_SECS,
            greeting_cooldown_secs: GREETING_COOLDOWN_SECS,
            max_text_chars: MAX_TEXT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Per-turn delivery deadline; items left over stay queued for retry.
    #[serde(default = "default_delivery_deadline_secs")]
    pub deadline_secs: u64,
    /// Number of flush workers consuming the deferred-flush queue.
    #[serde(default = "default_flush_workers")]
    pub flush_workers: usize,
    /// Capacity of the deferred-flush queue.
    #[serde(default = "default_flush_queue_depth")]
    pub flush_queue_depth: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            deadline_secs: DELIVERY_DEADLINE_SECS,
            flush_workers: default_flush_workers(),
            flush_queue_depth: default_flush_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_recovery_secs")]
    pub recovery_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_threshold(),
            recovery_secs: default_breaker_recovery_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the authoritative outbox SQLite database.
    #[serde(default = "default_outbox_path")]
    pub outbox_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            outbox_path: default_outbox_path(),
        }
    }
}

/// Outbound Evolution API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    #[serde(default = "default_evolution_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_instance")]
    pub instance: String,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            base_url: default_evolution_base_url(),
            api_key: String::new(),
            instance: default_instance(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

/// Startup values for the runtime feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagsConfig {
    #[serde(default = "bool_true")]
    pub pipeline_enabled: bool,
    #[serde(default = "bool_true")]
    pub delivery_enabled: bool,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            pipeline_enabled: true,
            delivery_enabled: true,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_instance() -> String {
    "main".to_string()
}
fn default_debounce_ms() -> i64 {
    DEBOUNCE_MS
}
fn default_buffer_ttl_secs() -> u64 {
    BUFFER_TTL_SECS
}
fn default_lock_ttl_secs() -> u64 {
    LOCK_TTL_SECS
}
fn default_msg_dedup_ttl_secs() -> u64 {
    MSG_DEDUP_TTL_SECS
}
fn default_idem_ttl_secs() -> u64 {
    IDEM_TTL_SECS
}
fn default_rate_per_minute() -> usize {
    RATE_LIMIT_PER_MINUTE
}
fn default_recursion_limit() -> u32 {
    RECURSION_LIMIT
}
fn default_recursion_ttl_secs() -> u64 {
    RECURSION_TTL_SECS
}
fn default_greeting_cooldown_secs() -> u64 {
    GREETING_COOLDOWN_SECS
}
fn default_max_text_chars() -> usize {
    MAX_TEXT_CHARS
}
fn default_delivery_deadline_secs() -> u64 {
    DELIVERY_DEADLINE_SECS
}
fn default_flush_workers() -> usize {
    4
}
fn default_flush_queue_depth() -> usize {
    1024
}
fn default_breaker_threshold() -> u32 {
    2
}
fn default_breaker_recovery_secs() -> u64 {
    15
}
fn default_outbox_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.porteiro/outbox.db", home)
}
fn default_human_phone() -> String {
    "5511940000000".to_string()
}
fn default_evolution_base_url() -> String {
    "http://localhost:8084".to_string()
}
fn default_send_timeout_secs() -> u64 {
    30
}
fn bool_true() -> bool {
    true
}

impl PorteiroConfig {
    /// Load config from a TOML file with PORTEIRO_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.porteiro/porteiro.toml
    ///
    /// Every field has a serde default, so a missing or empty file is valid.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: PorteiroConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("PORTEIRO_").split("__"))
            .extract()
            .map_err(|e| crate::error::PorteiroError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.porteiro/porteiro.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_contract() {
        let cfg = PorteiroConfig::default();
        assert_eq!(cfg.turn.debounce_ms, 1200);
        assert_eq!(cfg.turn.buffer_ttl_secs, 60);
        assert_eq!(cfg.turn.lock_ttl_secs, 15);
        assert_eq!(cfg.dedup.message_ttl_secs, 60);
        assert_eq!(cfg.dedup.idempotency_ttl_secs, 86_400);
        assert_eq!(cfg.limits.recursion_limit, 8);
        assert_eq!(cfg.limits.greeting_cooldown_secs, 30);
        assert_eq!(cfg.delivery.deadline_secs, 30);
        assert!(cfg.flags.pipeline_enabled);
    }

    #[test]
    fn webhook_auth_defaults_to_none() {
        let cfg = PorteiroConfig::default();
        assert_eq!(cfg.webhook.auth_mode, WebhookAuthMode::None);
        assert!(cfg.webhook.secret.is_none());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: PorteiroConfig = Figment::new()
            .merge(figment::providers::Toml::string(
                r#"
                [turn]
                debounce_ms = 500

                [evolution]
                api_key = "k"
                "#,
            ))
            .extract()
            .unwrap();
        assert_eq!(cfg.turn.debounce_ms, 500);
        assert_eq!(cfg.turn.buffer_ttl_secs, 60);
        assert_eq!(cfg.evolution.api_key, "k");
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
    }
}
