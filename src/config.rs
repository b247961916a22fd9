//! Configuration loader and validator for the appointment mailer.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Invalid schedule '{expr}': {reason}")]
    Schedule { expr: String, reason: String },
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    #[serde(default)]
    pub log: Log,
    pub database: Database,
    #[serde(default)]
    pub collector: Collector,
    pub mail: Mail,
}

/// Service-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct General {
    /// Cron expression; 5-field expressions are accepted and run at second 0.
    pub schedule: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub pretty: bool,
    #[serde(default)]
    pub colored: bool,
    /// Log file name, relative to `general.data_dir`. Logs go to stdout when unset.
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            pretty: false,
            colored: false,
            file: None,
        }
    }
}

/// Appointment store connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Database {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// When the collector's watermark moves past a batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Advance as soon as the batch is read. A batch the mailer refuses is lost.
    #[default]
    OnFetch,
    /// Advance only after the notification was queued.
    OnEnqueue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Collector {
    /// Watermark file name, relative to `general.data_dir`. In-memory only when unset.
    #[serde(default)]
    pub watermark_file: Option<String>,
    #[serde(default)]
    pub ack: AckPolicy,
    /// Upper bound on rows reported per tick.
    #[serde(default)]
    pub max_batch: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    #[default]
    Starttls,
    Tls,
    None,
}

/// SMTP settings and message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: TlsMode,
    pub from: String,
    pub to: Vec<String>,
    /// Supports `{count}`, `{booked}` and `{cancelled}` placeholders.
    pub subject: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// How long an idle SMTP connection is kept for reuse.
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,
    #[serde(default = "default_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "default_true")]
    pub verify_on_startup: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    2
}

fn default_smtp_port() -> u16 {
    587
}

fn default_timeout_seconds() -> u64 {
    10
}

fn default_idle_seconds() -> u64 {
    60
}

fn default_grace_seconds() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Ensure required directories exist (creates `general.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.general.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.resolved_data_dir())
    }

    /// `general.data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log
            .file
            .as_deref()
            .map(|f| self.resolved_data_dir().join(f))
    }

    pub fn watermark_path(&self) -> Option<PathBuf> {
        self.collector
            .watermark_file
            .as_deref()
            .map(|f| self.resolved_data_dir().join(f))
    }

    pub fn schedule(&self) -> Result<cron::Schedule, ConfigError> {
        parse_schedule(&self.general.schedule)
    }

    /// `DATABASE_URL` and `SMTP_PASSWORD` take precedence over the file.
    /// `SMTP_PASSWORD` is only applied when `mail.user` is set; without a user
    /// the server is used unauthenticated and the variable is ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("DATABASE_URL") {
            if !url.trim().is_empty() {
                self.database.url = url;
            }
        }
        if self.mail.user.is_some() {
            if let Some(password) = var("SMTP_PASSWORD") {
                self.mail.password = Some(password);
            }
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse a cron expression. Classic 5-field expressions (minute granularity)
/// get a leading seconds field of `0`.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, ConfigError> {
    let trimmed = expr.trim();
    let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| ConfigError::Schedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Load configuration from a YAML file, apply environment overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.general.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("general.data_dir must be non-empty"));
    }
    if cfg.general.schedule.trim().is_empty() {
        return Err(ConfigError::Invalid("general.schedule must be non-empty"));
    }
    parse_schedule(&cfg.general.schedule)?;

    if cfg.log.level.trim().is_empty() {
        return Err(ConfigError::Invalid("log.level must be non-empty"));
    }

    if cfg.database.url.trim().is_empty() {
        return Err(ConfigError::Invalid("database.url must be non-empty"));
    }
    if cfg.database.max_connections == 0 {
        return Err(ConfigError::Invalid("database.max_connections must be > 0"));
    }

    if matches!(cfg.collector.max_batch, Some(0)) {
        return Err(ConfigError::Invalid("collector.max_batch must be > 0"));
    }

    if cfg.mail.server.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.server must be non-empty"));
    }
    if cfg.mail.port == 0 {
        return Err(ConfigError::Invalid("mail.port must be > 0"));
    }
    if cfg.mail.user.is_some() != cfg.mail.password.is_some() {
        return Err(ConfigError::Invalid("mail.user and mail.password must be set together"));
    }
    if cfg.mail.from.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.from must be non-empty"));
    }
    if cfg.mail.to.is_empty() || cfg.mail.to.iter().any(|t| t.trim().is_empty()) {
        return Err(ConfigError::Invalid("mail.to must list at least one non-empty address"));
    }
    if cfg.mail.subject.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.subject must be non-empty"));
    }
    if cfg.mail.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("mail.timeout_seconds must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML configuration.
pub fn example() -> &'static str {
    r#"general:
  # sec min hour day-of-month month day-of-week; 5-field expressions also work
  schedule: "0 */5 * * * *"
  data_dir: "./data"

log:
  level: "info"
  pretty: false
  colored: false
  file: "emed-mailer.log"

database:
  url: "sqlite://./data/appointments.db?mode=ro"
  max_connections: 2

collector:
  watermark_file: "watermark.json"
  ack: on_fetch

mail:
  server: "smtp.example.com"
  port: 587
  user: "mailer@example.com"
  password: "CHANGE_ME"
  tls: starttls
  from: "eMedical Appointments <mailer@example.com>"
  to:
    - "frontdesk@example.com"
  subject: "Appointments: {booked} booked, {cancelled} cancelled"
  timeout_seconds: 10
  idle_seconds: 60
  shutdown_grace_seconds: 15
  verify_on_startup: true
"#
}
