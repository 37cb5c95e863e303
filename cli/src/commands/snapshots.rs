use super::format_bytes;
use anyhow::Result;
use clap::Args;
use keepvault_core::Snapshot;
use std::path::PathBuf;
use tracing::warn;

#[derive(Args)]
pub struct SnapshotsCommand {
    #[arg(help = "Storage directory")]
    storage: PathBuf,

    #[arg(long, help = "Show latest N inventories")]
    latest: Option<usize>,
}

impl SnapshotsCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let mut paths = Snapshot::list(&self.storage).await?;
        if paths.is_empty() {
            println!("No inventories found");
            return Ok(());
        }
        if let Some(latest) = self.latest {
            paths.truncate(latest);
        }

        println!("{:<20} {:>8} {:>14}  {}", "Date", "Files", "Size", "Source");
        println!("{:-<80}", "");

        for path in &paths {
            let snapshot = match Snapshot::load(path).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Cannot read {}: {}", path.display(), e);
                    continue;
                }
            };
            println!(
                "{:<20} {:>8} {:>14}  {}",
                snapshot.created.format("%Y-%m-%d %H:%M:%S"),
                snapshot.file_count(),
                format_bytes(snapshot.total_size()),
                snapshot
                    .source_root
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
        }

        println!();
        println!("{} inventories", paths.len());
        Ok(())
    }
}
