//! Tool settings
//!
//! Optional TOML file with a `[receiver]` and a `[sender]` table. Every key
//! may be omitted; command-line flags take precedence over the file.

use crate::protocol::{ARCHIVE_NAME, CHUNK_SIZE};
use crate::storage::expand_home;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log file written by the receiver inside its app directory
pub const RECEIVER_LOG_NAME: &str = "upload.log";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub receiver: ReceiverSettings,
    pub sender: SenderSettings,
}

impl Settings {
    /// Load settings from a TOML file, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings: {}", path.display()))?;
                Self::parse(&content)
                    .with_context(|| format!("Invalid settings file: {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Pi side of the link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    /// Serial device (USB gadget)
    pub port: String,
    pub baud: u32,
    /// Directory holding the archive and the upload log; `~` is expanded
    pub app_dir: String,
    /// Bytes between `PROGRESS` reports
    pub progress_interval: u64,
    /// Largest single payload read
    pub chunk_size: usize,
    pub read_timeout_ms: u64,
    /// Give up on a payload after this long without data
    pub payload_idle_timeout_secs: u64,
    /// Pause after a failed command before reading the next one
    pub error_backoff_ms: u64,
    /// Largest `CONFIG` payload accepted
    pub max_config_size: usize,
    /// Space left free on the app directory's filesystem after an upload
    pub reserved_space: u64,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyGS0".to_string(),
            baud: 115200,
            app_dir: "~/app".to_string(),
            progress_interval: 65536,
            chunk_size: CHUNK_SIZE,
            read_timeout_ms: 500,
            payload_idle_timeout_secs: 30,
            error_backoff_ms: 1000,
            max_config_size: 1 << 20,
            reserved_space: 0,
        }
    }
}

impl ReceiverSettings {
    pub fn app_dir(&self) -> PathBuf {
        expand_home(&self.app_dir)
    }

    /// Last verified upload
    pub fn archive_path(&self) -> PathBuf {
        self.app_dir().join(ARCHIVE_NAME)
    }

    /// Upload in progress; renamed over the archive once verified
    pub fn partial_path(&self) -> PathBuf {
        self.app_dir().join(format!("{}.part", ARCHIVE_NAME))
    }

    pub fn log_path(&self) -> PathBuf {
        self.app_dir().join(RECEIVER_LOG_NAME)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn payload_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.payload_idle_timeout_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

/// Host side of the link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderSettings {
    pub baud: u32,
    pub max_retries: u32,
    /// First retry delay; doubles after every failed attempt
    pub retry_base_delay_ms: u64,
    /// Longest silence tolerated while waiting for a reply
    pub reply_timeout_secs: u64,
    /// How long receiver output is echoed after `RUN`
    pub run_window_secs: u64,
    pub log_file: PathBuf,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            baud: 115200,
            max_retries: 5,
            retry_base_delay_ms: 1000,
            reply_timeout_secs: 10,
            run_window_secs: 10,
            log_file: PathBuf::from("send_log.txt"),
        }
    }
}

impl SenderSettings {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn run_window(&self) -> Duration {
        Duration::from_secs(self.run_window_secs)
    }

    /// Delay after the given failed attempt (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.receiver.port, "/dev/ttyGS0");
        assert_eq!(settings.receiver.baud, 115200);
        assert_eq!(settings.receiver.progress_interval, 65536);
        assert_eq!(settings.sender.max_retries, 5);
        assert!(settings.receiver.archive_path().ends_with("app/__upload__.tar.gz"));
        assert!(settings.receiver.log_path().ends_with("app/upload.log"));
    }

    #[test]
    fn test_partial_file() {
        let settings = Settings::parse(
            r#"
[receiver]
app_dir = "/srv/pi-app"
progress_interval = 1024
max_config_size = 4096
"#,
        )
        .unwrap();

        assert_eq!(settings.receiver.app_dir(), PathBuf::from("/srv/pi-app"));
        assert_eq!(settings.receiver.progress_interval, 1024);
        assert_eq!(settings.receiver.max_config_size, 4096);
        assert_eq!(settings.receiver.reserved_space, 0);
        assert_eq!(settings.receiver.baud, 115200);
        assert_eq!(settings.sender.reply_timeout(), Duration::from_secs(10));
        assert_eq!(
            settings.receiver.partial_path(),
            PathBuf::from("/srv/pi-app/__upload__.tar.gz.part")
        );
    }

    #[test]
    fn test_retry_backoff() {
        let sender = SenderSettings::default();
        assert_eq!(sender.retry_delay(1), Duration::from_secs(1));
        assert_eq!(sender.retry_delay(2), Duration::from_secs(2));
        assert_eq!(sender.retry_delay(5), Duration::from_secs(16));
    }

    #[test]
    fn test_rejects_bad_types() {
        assert!(Settings::parse("[sender]\nmax_retries = \"many\"\n").is_err());
    }

    #[test]
    fn test_load_without_file() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.sender.run_window_secs, 10);
    }
}
