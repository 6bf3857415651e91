//! Server configuration.
//!
//! Loaded from a JSON file; every field has a default, and `PORT` / `LOG_LEVEL`
//! from the environment (or `.env`) override the file.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mysql_user: String,
    pub mysql_password: String,
    pub mysql_host: String,
    pub mysql_port: u16,
    /// MySQL data directory handed to xtrabackup
    pub mysql_datadir: PathBuf,
    /// xtrabackup `--parallel` and `--compress-threads`
    pub parallel: u32,
    /// Number of non-archived full backups kept on local disk
    pub local_backup_count: usize,
    pub default_rclone_remote: String,
    pub rclone_config: PathBuf,

    pub backup_dir: PathBuf,
    pub download_dir: PathBuf,
    pub db_path: PathBuf,

    pub port: u16,
    pub log_level: String,

    #[serde(with = "humantime_serde")]
    pub full_backup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub incremental_backup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub rclone_upload_interval: Duration,

    /// Attempts made by a background upload before leaving it to the sync job
    pub upload_max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub upload_retry_delay: Duration,
    pub max_concurrent_transfers: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mysql_user: "backup".into(),
            mysql_password: "password".into(),
            mysql_host: "localhost".into(),
            mysql_port: 3306,
            mysql_datadir: PathBuf::from("/var/lib/mysql"),
            parallel: 4,
            local_backup_count: 3,
            default_rclone_remote: "onedrive:".into(),
            rclone_config: PathBuf::from("rclone.conf"),
            backup_dir: PathBuf::from("/backup/"),
            download_dir: PathBuf::from("/downloaded_backup/"),
            db_path: PathBuf::from("/data/data.db"),
            port: 32400,
            log_level: "info".into(),
            full_backup_interval: Duration::from_secs(12 * 60 * 60),
            incremental_backup_interval: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            rclone_upload_interval: Duration::from_secs(15 * 60),
            upload_max_attempts: 3,
            upload_retry_delay: Duration::from_secs(30),
            max_concurrent_transfers: 2,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    /// Load configuration.
    ///
    /// An explicit path (argument, then `CONFIG_PATH`) must exist. Without one,
    /// `config.json` in the working directory is used when present, otherwise
    /// the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let env_path = std::env::var_os("CONFIG_PATH").map(PathBuf::from);
        // from_file normalizes; the defaults already are
        let mut config = match path.or(env_path.as_deref()) {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_json::from_str(content)?;
        config.normalize()
    }

    /// Blank or zero values fall back to their defaults; zero intervals are rejected.
    fn normalize(mut self) -> anyhow::Result<Self> {
        let defaults = Self::default();

        if self.mysql_user.is_empty() {
            self.mysql_user = defaults.mysql_user;
        }
        if self.mysql_password.is_empty() {
            self.mysql_password = defaults.mysql_password;
        }
        if self.mysql_host.is_empty() {
            self.mysql_host = defaults.mysql_host;
        }
        if self.mysql_port == 0 {
            self.mysql_port = defaults.mysql_port;
        }
        if self.parallel == 0 {
            self.parallel = defaults.parallel;
        }
        if self.local_backup_count == 0 {
            self.local_backup_count = defaults.local_backup_count;
        }
        if self.default_rclone_remote.is_empty() {
            self.default_rclone_remote = defaults.default_rclone_remote;
        }
        if self.port == 0 {
            self.port = defaults.port;
        }
        if self.upload_max_attempts == 0 {
            self.upload_max_attempts = 1;
        }
        if self.max_concurrent_transfers == 0 {
            self.max_concurrent_transfers = defaults.max_concurrent_transfers;
        }

        for (name, interval) in [
            ("full_backup_interval", self.full_backup_interval),
            ("incremental_backup_interval", self.incremental_backup_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("rclone_upload_interval", self.rclone_upload_interval),
        ] {
            if interval.is_zero() {
                anyhow::bail!("invalid {name}: interval must be greater than zero");
            }
        }

        Ok(self)
    }

    fn apply_env(&mut self) {
        if let Some(port) = std::env::var("PORT").ok().and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            if !level.is_empty() {
                self.log_level = level;
            }
        }
    }
}
