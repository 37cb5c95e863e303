use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use keepvault_core::{Credentials, Error, KdfParams, ScanOptions, StorageOptions};
use serde::Deserialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Layout of `config.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub encryption: EncryptionSection,
    pub kdf: KdfParams,
    pub storage: StorageOptions,
    pub scan: ScanOptions,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct EncryptionSection {
    pub password: Option<String>,
    pub salt: Option<String>,
}

impl std::fmt::Debug for EncryptionSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSection")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("salt", &self.salt.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid configuration file")
    }

    /// Reads the explicit file if one is given (it must exist), otherwise the
    /// per-user `config.toml` when present, otherwise defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.is_file() {
                    return Err(anyhow!("Config file not found: {}", path.display()));
                }
                Some(path.to_path_buf())
            }
            None => default_config_path().filter(|p| p.is_file()),
        };

        match path {
            Some(path) => {
                debug!("Reading configuration from {}", path.display());
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Self::parse(&text)
            }
            None => Ok(Self::default()),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "keepvault").map(|dirs| dirs.config_dir().join("config.toml"))
}

pub struct Settings {
    pub file: FileConfig,
    password: Option<String>,
    salt: Option<String>,
}

impl Settings {
    pub fn load(cli: &crate::Cli) -> Result<Self> {
        Ok(Self {
            file: FileConfig::load(cli.config.as_deref())?,
            password: cli.password.clone(),
            salt: cli.salt.clone(),
        })
    }

    pub fn storage_options(&self) -> StorageOptions {
        self.file.storage.clone()
    }

    /// Password and salt, command line and environment first, then the
    /// config file. A missing password is asked for; a missing salt is fatal.
    pub fn credentials(&self) -> Result<Credentials> {
        resolve_credentials(
            self.password.clone().or_else(|| self.file.encryption.password.clone()),
            self.salt.clone().or_else(|| self.file.encryption.salt.clone()),
            prompt_password,
        )
    }
}

fn resolve_credentials(
    password: Option<String>,
    salt: Option<String>,
    prompt: impl FnOnce() -> Result<String>,
) -> Result<Credentials> {
    let salt = salt
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Configuration("encryption salt not configured".to_string()))?;

    let password = match password.filter(|p| !p.is_empty()) {
        Some(password) => password,
        None => prompt()?,
    };

    let credentials = Credentials::new(password, salt);
    credentials.validate()?;
    Ok(credentials)
}

fn prompt_password() -> Result<String> {
    print!("Enter encryption password: ");
    io::stdout().flush()?;
    rpassword::read_password().context("Failed to read password")
}
