use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryConfig;

const MIB: u64 = 1024 * 1024;

/// Knobs of an object storage instance. Everything has a default so a config
/// file only needs to name what it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    pub transfer: TransferOptions,
    pub parallelism: Parallelism,
    pub restore_size_policy: RestoreSizePolicy,
    pub pace_interval_secs: u64,
    pub dir_retry_attempts: u32,
    pub dir_retry_backoff_secs: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            transfer: TransferOptions::default(),
            parallelism: Parallelism::default(),
            restore_size_policy: RestoreSizePolicy::default(),
            pace_interval_secs: 15,
            dir_retry_attempts: 10,
            dir_retry_backoff_secs: 5,
        }
    }
}

impl StorageOptions {
    pub fn pace_interval(&self) -> Duration {
        Duration::from_secs(self.pace_interval_secs)
    }

    pub fn dir_retry(&self) -> RetryConfig {
        RetryConfig::fixed(
            self.dir_retry_attempts,
            Duration::from_secs(self.dir_retry_backoff_secs),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    pub small_max_bytes: u64,
    pub medium_max_bytes: u64,
    /// Where spooled buffers go; the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            small_max_bytes: 40 * MIB,
            medium_max_bytes: 160 * MIB,
            temp_dir: None,
        }
    }
}

/// Worker counts per batch kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Parallelism {
    pub small: usize,
    pub medium: usize,
    pub large: usize,
    pub restore: usize,
    pub verify: usize,
    pub hashing: usize,
}

impl Default for Parallelism {
    fn default() -> Self {
        Self {
            small: 6,
            medium: 2,
            large: 4,
            restore: 4,
            verify: 6,
            hashing: 4,
        }
    }
}

/// What a restore does when the written file's size differs from the
/// snapshot's recorded size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreSizePolicy {
    /// Log the mismatch and keep the restored file.
    #[default]
    Warn,
    /// Count the job as failed.
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub exclude_dir_suffixes: Vec<String>,
    pub exclude_file_names: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            exclude_dir_suffixes: Vec::new(),
            exclude_file_names: vec!["Thumbs.db".to_string()],
        }
    }
}
