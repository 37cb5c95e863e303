use super::{format_bytes, open_storage};
use anyhow::Result;
use chrono::Utc;
use clap::Args;
use keepvault_core::gc::GARBAGE_SUBDIR;
use std::path::PathBuf;

#[derive(Args)]
pub struct GcCommand {
    #[arg(help = "Storage directory")]
    storage: PathBuf,

    #[arg(long, help = "Collect every object when the storage holds no inventories")]
    force: bool,
}

impl GcCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (_, storage) = open_storage(cli, &self.storage).await?;

        let report = storage.garbage_collect(Utc::now(), self.force).await?;

        println!("🗑️  Garbage collection completed!");
        println!("📸 Inventories kept: {}", report.retained_snapshots);
        println!("📦 Objects in use: {}", report.reachable);
        println!(
            "🧹 Moved to {}: {} ({})",
            storage.dir().join(GARBAGE_SUBDIR).display(),
            report.collected.len(),
            format_bytes(report.bytes)
        );
        if report.removed_dirs > 0 {
            println!("📂 Empty directories removed: {}", report.removed_dirs);
        }
        Ok(())
    }
}
