use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Prefix for environment overrides, e.g. `CHATDESK__WEBHOOK__VERIFY_TOKEN`.
pub const ENV_PREFIX: &str = "CHATDESK";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    pub relay: Option<RelayConfig>,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token for the monitoring endpoints. Without one the gateway
    /// only listens on loopback.
    pub auth_token: Option<String>,
    #[serde(default = "default_ws_heartbeat_secs")]
    pub ws_heartbeat_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            auth_token: None,
            ws_heartbeat_secs: default_ws_heartbeat_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct WebhookConfig {
    /// Token echoed back by the provider during the subscription handshake.
    pub verify_token: Option<String>,
    /// Shared secret for `X-Hub-Signature-256`. Unset disables verification.
    pub app_secret: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayConfig {
    pub url: String,
    pub token: Option<String>,
    #[serde(default = "default_relay_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_dedup_sweep_threshold")]
    pub dedup_sweep_threshold: usize,
    #[serde(default = "default_lane_idle_secs")]
    pub lane_idle_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
            dedup_sweep_threshold: default_dedup_sweep_threshold(),
            lane_idle_secs: default_lane_idle_secs(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_ws_heartbeat_secs() -> u64 {
    15
}

fn default_database_url() -> String {
    "sqlite://chatdesk.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_relay_timeout_secs() -> u64 {
    60
}

fn default_dedup_window_secs() -> u64 {
    30
}

fn default_dedup_sweep_threshold() -> usize {
    500
}

fn default_lane_idle_secs() -> u64 {
    60
}

impl AppConfig {
    /// Load from an optional file layered under `CHATDESK__*` environment variables.
    ///
    /// A missing file is not an error; every field has a default except the
    /// relay section, which stays disabled unless configured.
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config_path = custom_path.unwrap_or_else(Self::default_path);

        let s = Config::builder()
            .add_source(File::from(config_path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chatdesk")
            .join("config.toml")
    }

    /// Relay section, ignoring entries with a blank URL.
    pub fn active_relay(&self) -> Option<&RelayConfig> {
        self.relay.as_ref().filter(|r| !r.url.trim().is_empty())
    }
}

/// Mask a secret value for safe display in logs.
/// Shows first 4 and last 4 chars, the rest as `****`.
pub fn mask_secret(value: &str) -> String {
    if value.chars().count() <= 8 {
        "****".to_string()
    } else {
        let head: String = value.chars().take(4).collect();
        let tail: String = value
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("{}****{}", head, tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret("sk-1234567890abcdef"), "sk-1****cdef");
    }

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = AppConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.ingest.dedup_window_secs, 30);
        assert_eq!(cfg.ingest.dedup_sweep_threshold, 500);
        assert_eq!(cfg.ingest.lane_idle_secs, 60);
        assert!(cfg.webhook.app_secret.is_none());
        assert!(cfg.active_relay().is_none());
    }

    #[test]
    fn relay_section_gets_default_timeout() {
        let cfg = AppConfig::from_toml_str(
            r#"
            [webhook]
            verify_token = "hub-secret"

            [relay]
            url = "http://localhost:5678/webhook/bot"
            "#,
        )
        .unwrap();

        let relay = cfg.active_relay().unwrap();
        assert_eq!(relay.timeout_secs, 60);
        assert!(relay.token.is_none());
        assert_eq!(cfg.webhook.verify_token.as_deref(), Some("hub-secret"));
    }

    #[test]
    fn environment_overrides_file_values() {
        let path = std::env::temp_dir().join(format!(
            "chatdesk-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "[server]\nport = 4000\n\n[webhook]\nverify_token = \"from-file\"\n",
        )
        .unwrap();
        std::env::set_var("CHATDESK__WEBHOOK__VERIFY_TOKEN", "from-env");
        std::env::set_var("CHATDESK__INGEST__LANE_IDLE_SECS", "5");

        let loaded = AppConfig::load(Some(path.clone()));

        std::env::remove_var("CHATDESK__WEBHOOK__VERIFY_TOKEN");
        std::env::remove_var("CHATDESK__INGEST__LANE_IDLE_SECS");
        let _ = std::fs::remove_file(&path);

        let cfg = loaded.unwrap();
        assert_eq!(cfg.webhook.verify_token.as_deref(), Some("from-env"));
        assert_eq!(cfg.ingest.lane_idle_secs, 5);
        assert_eq!(cfg.server.port, 4000);
        assert_eq!(cfg.ingest.dedup_window_secs, 30);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let cfg = AppConfig::load(Some(PathBuf::from("/nonexistent/chatdesk.toml"))).unwrap();
        assert_eq!(cfg.database.max_connections, 5);
    }

    #[test]
    fn blank_relay_url_counts_as_disabled() {
        let cfg = AppConfig::from_toml_str("[relay]\nurl = \"  \"\n").unwrap();
        assert!(cfg.active_relay().is_none());
    }
}
