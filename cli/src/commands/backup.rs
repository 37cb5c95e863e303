use super::{format_bytes, open_storage, spinner};
use crate::config::Settings;
use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Args;
use keepvault_core::{Scheduler, Snapshot};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Directory to back up")]
    source: PathBuf,

    #[arg(help = "Storage directory")]
    storage: PathBuf,
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (settings, storage) = open_storage(cli, &self.storage).await?;

        let previous = previous_snapshot(storage.dir(), &self.source).await;
        if let Some(previous) = &previous {
            info!("Reusing hashes from the inventory of {}", previous.created);
        }

        let pb = spinner("Scanning files...")?;
        let snapshot = Snapshot::scan(
            &self.source,
            &settings.file.scan,
            previous.as_ref(),
            storage.scheduler(),
            storage.options().parallelism.hashing,
        )
        .await?;
        pb.finish_with_message(format!(
            "Scanned {} files ({})",
            snapshot.file_count(),
            format_bytes(snapshot.total_size())
        ));

        let report = storage.backup(&snapshot, Utc::now()).await?;

        println!("✅ Backup completed!");
        println!("📁 Files: {}", snapshot.file_count());
        println!("📦 New objects: {} ({})", report.stored, format_bytes(report.bytes));
        println!("♻️  Already stored: {}", report.already_stored);
        if report.alternates > 0 {
            println!("🔗 Duplicate paths: {}", report.alternates);
        }
        println!("📸 Inventory: {}", report.snapshot_path.display());

        if report.failed > 0 {
            println!("❌ Failed: {}", report.failed);
            return Err(anyhow!("{} files could not be stored", report.failed));
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct InventoryCommand {
    #[arg(help = "Directory to inventory")]
    source: PathBuf,

    #[arg(help = "Inventory file to write")]
    output: PathBuf,

    #[arg(long, help = "Earlier inventory of the same directory whose hashes may be reused")]
    previous: Option<PathBuf>,
}

impl InventoryCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::load(cli)?;
        let options = settings.storage_options();
        let scheduler = Scheduler::new(options.pace_interval());

        let previous = match &self.previous {
            Some(path) => Some(Snapshot::load(path).await?),
            None => None,
        };

        let pb = spinner("Scanning files...")?;
        let snapshot = Snapshot::scan(
            &self.source,
            &settings.file.scan,
            previous.as_ref(),
            &scheduler,
            options.parallelism.hashing,
        )
        .await?;
        pb.finish_with_message(format!("Scanned {} files", snapshot.file_count()));

        let data = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(&self.output, data).await?;

        println!("📸 Inventory written: {}", self.output.display());
        println!("📁 Files: {}", snapshot.file_count());
        println!("💾 Size: {}", format_bytes(snapshot.total_size()));
        Ok(())
    }
}

/// Newest inventory in the storage taken of the same source directory.
async fn previous_snapshot(storage_dir: &Path, source: &Path) -> Option<Snapshot> {
    let paths = match Snapshot::list(storage_dir).await {
        Ok(paths) => paths,
        Err(e) => {
            warn!("Cannot list inventories: {}", e);
            return None;
        }
    };

    for path in paths {
        match Snapshot::load(&path).await {
            Ok(snapshot) if snapshot.source_root.as_deref() == Some(source) => return Some(snapshot),
            Ok(_) => {}
            Err(e) => debug!("Skipping {}: {}", path.display(), e),
        }
    }
    None
}
