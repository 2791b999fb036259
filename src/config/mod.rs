use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub attachments: AttachmentsConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./instance")
}

/// Bootstrap administrator created on first start when no admin exists
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdminConfig {
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Run the background jobs (mail poll, watchdog, scheduled tickets, backups)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// IANA timezone used for scheduled tickets and the nightly backup
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Seconds between mailbox polls when POLL_INTERVAL_SECONDS is not set
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds between stale-lock watchdog runs
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            timezone: default_timezone(),
            poll_interval_secs: default_poll_interval(),
            watchdog_interval_secs: default_watchdog_interval(),
        }
    }
}

impl SchedulerConfig {
    /// Parsed timezone, falling back to America/Chicago on a bad name
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::America::Chicago)
    }
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "America/Chicago".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_watchdog_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentsConfig {
    /// Root directory; defaults to the data directory
    pub root: Option<PathBuf>,
    #[serde(default = "default_attachments_subdir")]
    pub subdir: String,
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            root: None,
            subdir: default_attachments_subdir(),
        }
    }
}

fn default_attachments_subdir() -> String {
    "attachments".to_string()
}

/// SMTP relay used when the Graph mailbox is not configured
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: Option<String>,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_true")]
    pub tls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_smtp_port(),
            username: None,
            password: None,
            from_address: None,
            from_name: default_from_name(),
            tls: default_true(),
        }
    }
}

impl SmtpConfig {
    pub fn is_configured(&self) -> bool {
        self.host.is_some() && self.from_address.is_some()
    }
}

fn default_smtp_port() -> u16 {
    587
}

fn default_from_name() -> String {
    "Help Desk".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    /// Secret used to derive the key for encrypted settings.
    /// Without it, sensitive settings are stored as plain text.
    pub secret_key: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            info!("Config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables win over the file for bootstrap and toggles
    fn apply_env_overrides(&mut self) {
        if let Ok(email) = std::env::var("ADMIN_EMAIL") {
            if !email.trim().is_empty() {
                self.admin.email = Some(email);
            }
        }
        if let Ok(password) = std::env::var("ADMIN_PASSWORD") {
            if !password.is_empty() {
                self.admin.password = Some(password);
            }
        }
        if std::env::var("DISABLE_SCHEDULER").as_deref() == Ok("1") {
            self.scheduler.enabled = false;
        }
        if let Ok(secret) = std::env::var("SECRET_KEY") {
            if !secret.is_empty() {
                self.security.secret_key = Some(secret);
            }
        }
    }

    /// Directory holding `<subdir>/<ticket_id>/` attachment folders
    pub fn attachments_root(&self) -> PathBuf {
        self.attachments
            .root
            .clone()
            .unwrap_or_else(|| self.server.data_dir.clone())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
            scheduler: SchedulerConfig::default(),
            attachments: AttachmentsConfig::default(),
            smtp: SmtpConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: Config = toml::from_str("[server]\nport = 8081\n").unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.poll_interval_secs, 60);
        assert_eq!(config.attachments.subdir, "attachments");
        assert!(!config.smtp.is_configured());
    }

    #[test]
    fn test_timezone_fallback() {
        let mut scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.tz(), chrono_tz::America::Chicago);
        scheduler.timezone = "Europe/Berlin".to_string();
        assert_eq!(scheduler.tz(), chrono_tz::Europe::Berlin);
        scheduler.timezone = "Not/AZone".to_string();
        assert_eq!(scheduler.tz(), chrono_tz::America::Chicago);
    }

    #[test]
    fn test_attachments_root_defaults_to_data_dir() {
        let config = Config::default();
        assert_eq!(config.attachments_root(), PathBuf::from("./instance"));
    }
}
