//! deskbot configuration loader.
//!
//! Values come from a TOML file, then environment overrides. Everything is fixed at
//! process start.

use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "deskbot.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeskbotConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub support: SupportConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Long-poll timeout for `getUpdates`.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_poll_timeout_secs() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupportConfig {
    /// Forum-enabled supergroup where ticket threads are opened.
    #[serde(default)]
    pub group_id: i64,
    /// Invite link shown to users next to ticket confirmations.
    #[serde(default)]
    pub group_link: Option<String>,
    #[serde(default = "default_ticket_list_limit")]
    pub ticket_list_limit: usize,
}

fn default_ticket_list_limit() -> usize {
    10
}

impl Default for SupportConfig {
    fn default() -> Self {
        Self {
            group_id: 0,
            group_link: None,
            ticket_list_limit: default_ticket_list_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Maximum number of history rows kept before oldest-first pruning.
    #[serde(default = "default_retention_cap")]
    pub retention_cap: u64,
    /// Seconds between retention sweeps. 0 sweeps only at startup.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_database_path() -> String {
    "support.db".to_string()
}

fn default_retention_cap() -> u64 {
    4000
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            retention_cap: default_retention_cap(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Inbound events handled concurrently.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
    64
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl DeskbotConfig {
    /// Load from `path`, or from `./deskbot.toml` when no path is given. A missing
    /// default file is not an error; an explicitly named one is.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(config_path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        Ok((cfg, path))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Some(v) = var("DESKBOT_GROUP_ID") {
            self.support.group_id = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("DESKBOT_GROUP_ID={v:?} is not an integer: {e}"))?;
        }
        if let Some(v) = var("DESKBOT_GROUP_LINK") {
            self.support.group_link = Some(v);
        }
        if let Some(v) = var("DESKBOT_DB_PATH") {
            self.storage.database_path = v;
        }
        if let Some(v) = var("DESKBOT_RETENTION_CAP") {
            self.storage.retention_cap = v.trim().parse().map_err(|e| {
                anyhow::anyhow!("DESKBOT_RETENTION_CAP={v:?} is not a positive integer: {e}")
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token is required (or set TELEGRAM_BOT_TOKEN)"
            ));
        }
        if self.support.group_id == 0 {
            return Err(anyhow::anyhow!(
                "support.group_id is required (or set DESKBOT_GROUP_ID)"
            ));
        }
        if self.support.ticket_list_limit == 0 {
            return Err(anyhow::anyhow!("support.ticket_list_limit must be > 0"));
        }
        if self.runtime.max_in_flight == 0 {
            return Err(anyhow::anyhow!("runtime.max_in_flight must be > 0"));
        }
        self.validate_storage()
    }

    /// Checks needed by commands that only touch the database.
    pub fn validate_storage(&self) -> anyhow::Result<()> {
        if self.storage.database_path.trim().is_empty() {
            return Err(anyhow::anyhow!("storage.database_path must not be empty"));
        }
        if self.storage.retention_cap == 0 {
            return Err(anyhow::anyhow!("storage.retention_cap must be > 0"));
        }
        Ok(())
    }

    pub fn group_link(&self) -> Option<String> {
        self.support
            .group_link
            .as_deref()
            .map(str::trim)
            .filter(|link| !link.is_empty())
            .map(str::to_string)
    }
}

pub fn default_config_path() -> PathBuf {
    Path::new(".").join(DEFAULT_CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> DeskbotConfig {
        DeskbotConfig::from_toml(
            r#"
            [telegram]
            bot_token = "123:abc"

            [support]
            group_id = -1001234567890
            "#,
        )
        .expect("parse")
    }

    #[test]
    fn missing_sections_take_defaults() {
        let cfg = valid();
        assert_eq!(cfg.telegram.poll_timeout_secs, 30);
        assert_eq!(cfg.support.ticket_list_limit, 10);
        assert_eq!(cfg.storage.database_path, "support.db");
        assert_eq!(cfg.storage.retention_cap, 4000);
        assert_eq!(cfg.storage.sweep_interval_secs, 3600);
        assert_eq!(cfg.runtime.max_in_flight, 64);
        cfg.validate().expect("valid");
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut cfg = valid();
        let env: HashMap<&str, &str> = HashMap::from([
            ("TELEGRAM_BOT_TOKEN", "999:zzz"),
            ("DESKBOT_GROUP_ID", " -100777 "),
            ("DESKBOT_GROUP_LINK", "https://t.me/+desk"),
            ("DESKBOT_DB_PATH", "/var/lib/deskbot/support.db"),
            ("DESKBOT_RETENTION_CAP", "250"),
        ]);
        cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("overrides");

        assert_eq!(cfg.telegram.bot_token, "999:zzz");
        assert_eq!(cfg.support.group_id, -100777);
        assert_eq!(cfg.group_link().as_deref(), Some("https://t.me/+desk"));
        assert_eq!(cfg.storage.database_path, "/var/lib/deskbot/support.db");
        assert_eq!(cfg.storage.retention_cap, 250);
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut cfg = valid();
        cfg.apply_overrides(|_| Some("  ".to_string()))
            .expect("overrides");
        assert_eq!(cfg.telegram.bot_token, "123:abc");
    }

    #[test]
    fn malformed_numeric_env_names_the_variable() {
        let mut cfg = valid();
        let err = cfg
            .apply_overrides(|key| (key == "DESKBOT_GROUP_ID").then(|| "support".to_string()))
            .expect_err("not a number");
        assert!(err.to_string().contains("DESKBOT_GROUP_ID"));
    }

    #[test]
    fn validation_names_the_offending_key() {
        let cases: [(&str, fn(&mut DeskbotConfig)); 5] = [
            ("telegram.bot_token", |c| c.telegram.bot_token.clear()),
            ("support.group_id", |c| c.support.group_id = 0),
            ("support.ticket_list_limit", |c| c.support.ticket_list_limit = 0),
            ("storage.retention_cap", |c| c.storage.retention_cap = 0),
            ("runtime.max_in_flight", |c| c.runtime.max_in_flight = 0),
        ];
        for (key, break_it) in cases {
            let mut cfg = valid();
            break_it(&mut cfg);
            let err = cfg.validate().expect_err(key);
            assert!(err.to_string().contains(key), "{err} should mention {key}");
        }
    }

    #[test]
    fn storage_only_validation_does_not_need_a_token() {
        let cfg = DeskbotConfig::default();
        assert!(cfg.validate().is_err());
        cfg.validate_storage().expect("defaults are a valid store config");
    }

    #[test]
    fn empty_group_link_is_treated_as_absent() {
        let mut cfg = valid();
        cfg.support.group_link = Some("   ".to_string());
        assert_eq!(cfg.group_link(), None);
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let err = DeskbotConfig::load_with_path(Some(PathBuf::from(
            "/nonexistent/deskbot-test/deskbot.toml",
        )))
        .await
        .expect_err("missing explicit config");
        assert!(err.to_string().contains("read config"));
    }
}
