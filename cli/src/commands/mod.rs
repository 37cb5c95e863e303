pub mod backup;
pub mod check;
pub mod gc;
pub mod reports;
pub mod restore;
pub mod snapshots;

use crate::config::Settings;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use keepvault_core::ObjectStorage;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Opens the storage at `dir` with the credentials and options in effect.
pub async fn open_storage(cli: &crate::Cli, dir: &Path) -> Result<(Settings, ObjectStorage)> {
    let settings = Settings::load(cli)?;
    let credentials = settings.credentials()?;

    info!("Opening storage at: {}", dir.display());
    let storage = ObjectStorage::open(dir, &credentials, &settings.file.kdf, settings.storage_options())
        .await
        .with_context(|| format!("Cannot open storage {}", dir.display()))?;
    Ok((settings, storage))
}

pub fn spinner(message: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    Ok(spinner)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
