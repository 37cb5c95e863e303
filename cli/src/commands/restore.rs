use super::{format_bytes, open_storage};
use anyhow::{anyhow, Result};
use clap::Args;
use keepvault_core::Snapshot;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Inventory file to restore")]
    inventory: PathBuf,

    #[arg(help = "Target directory for restore")]
    target: PathBuf,

    #[arg(long, help = "Restore only this folder of the inventory (`/`-separated)")]
    path: Option<String>,

    #[arg(long, help = "Storage directory (defaults to the inventory's directory)")]
    storage: Option<PathBuf>,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let storage_dir = storage_dir(self.storage.as_deref(), &self.inventory)?;
        let (_, storage) = open_storage(cli, &storage_dir).await?;

        info!("Loading inventory: {}", self.inventory.display());
        let snapshot = Snapshot::load(&self.inventory).await?;

        if !fs::try_exists(&self.target).await? {
            fs::create_dir_all(&self.target).await?;
        }

        println!("📸 Restoring inventory: {}", snapshot.file_name());
        println!("📅 Created: {}", snapshot.created.format("%Y-%m-%d %H:%M:%S UTC"));
        if let Some(path) = &self.path {
            println!("📁 Folder: {}", path);
        }
        println!("📂 Target: {}", self.target.display());

        let report = storage.restore(&snapshot, &self.target, self.path.as_deref()).await?;

        println!("✅ Restore completed!");
        println!("📁 Restored: {} ({})", report.restored, format_bytes(report.bytes));
        if report.skipped_existing > 0 {
            println!("⏭️  Already present: {}", report.skipped_existing);
        }

        let problems = report.missing + report.failed;
        if report.missing > 0 {
            println!("❓ Missing from storage: {}", report.missing);
        }
        if report.failed > 0 {
            println!("❌ Failed: {}", report.failed);
        }
        if problems > 0 {
            return Err(anyhow!("{} files could not be restored", problems));
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct RestoreFileCommand {
    #[arg(help = "Inventory file to restore from")]
    inventory: PathBuf,

    #[arg(help = "Path of the file within the inventory (`/`-separated)")]
    path: String,

    #[arg(help = "Directory to restore the file into")]
    target: PathBuf,

    #[arg(long, help = "Storage directory (defaults to the inventory's directory)")]
    storage: Option<PathBuf>,
}

impl RestoreFileCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let storage_dir = storage_dir(self.storage.as_deref(), &self.inventory)?;
        let (_, storage) = open_storage(cli, &storage_dir).await?;
        let snapshot = Snapshot::load(&self.inventory).await?;

        fs::create_dir_all(&self.target).await?;
        let restored = storage.restore_file(&snapshot, &self.path, &self.target).await?;

        println!("✅ Restored: {}", restored.display());
        Ok(())
    }
}

fn storage_dir(explicit: Option<&Path>, inventory: &Path) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    match inventory.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Ok(PathBuf::from(".")),
        Some(parent) => Ok(parent.to_path_buf()),
        None => Err(anyhow!(
            "Cannot tell the storage directory of {}, pass --storage",
            inventory.display()
        )),
    }
}
