use super::format_bytes;
use anyhow::{anyhow, Result};
use clap::Args;
use keepvault_core::analysis::{self, LARGE_FILE_THRESHOLD};
use keepvault_core::manifest::MANIFEST_FILENAME;
use keepvault_core::{Manifest, Snapshot};
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct GarbageReportCommand {
    #[arg(help = "Storage directory")]
    storage: PathBuf,
}

impl GarbageReportCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let manifest = open_manifest(&self.storage).await?;
        let snapshots = Snapshot::load_all(&self.storage).await?;
        if snapshots.is_empty() {
            println!("No inventories found");
            return Ok(());
        }

        let impact = analysis::garbage_impact(&snapshots, &manifest.entries().await);

        println!("{:<40} {:>8} {:>8} {:>14} {:>14}", "Inventory", "Files", "Unique", "Source", "Stored");
        println!("{:-<88}", "");
        for row in &impact {
            println!(
                "{:<40} {:>8} {:>8} {:>14} {:>14}",
                row.snapshot,
                row.files,
                row.unique_hashes,
                format_bytes(row.source_bytes),
                format_bytes(row.target_bytes)
            );
        }
        println!();
        println!("Stored bytes are freed by the next gc once an inventory is removed.");
        Ok(())
    }
}

#[derive(Args)]
pub struct LargeFilesCommand {
    #[arg(help = "Storage directory")]
    storage: PathBuf,

    #[arg(long, default_value_t = LARGE_FILE_THRESHOLD / (1024 * 1024), help = "Minimum size in MiB")]
    threshold_mb: u64,
}

impl LargeFilesCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let snapshots = Snapshot::load_all(&self.storage).await?;
        let large = analysis::large_files(&snapshots, self.threshold_mb * 1024 * 1024);

        if large.is_empty() {
            println!("No files of {} MiB or more", self.threshold_mb);
            return Ok(());
        }

        for file in &large {
            println!("📦 {} {}", format_bytes(file.size), file.hash.short_string());
            for occurrence in &file.occurrences {
                println!("    {}  {}", occurrence.snapshot, occurrence.path);
            }
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct DuplicatesCommand {
    #[arg(help = "Inventory file")]
    inventory: PathBuf,
}

impl DuplicatesCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let snapshot = Snapshot::load(&self.inventory).await?;
        let groups = analysis::duplicates(&snapshot);

        if groups.is_empty() {
            println!("No duplicate files");
            return Ok(());
        }

        let wasted: u64 = groups.iter().map(|g| g.wasted()).sum();
        for group in &groups {
            println!(
                "♻️  {} × {} ({} wasted)",
                group.paths.len(),
                format_bytes(group.size),
                format_bytes(group.wasted())
            );
            for path in &group.paths {
                println!("    {}", path);
            }
        }
        println!();
        println!("{} groups, {} wasted", groups.len(), format_bytes(wasted));
        Ok(())
    }
}

#[derive(Args)]
pub struct CompareCommand {
    #[arg(help = "Older inventory file")]
    older: PathBuf,

    #[arg(help = "Newer inventory file")]
    newer: PathBuf,
}

impl CompareCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let older = Snapshot::load(&self.older).await?;
        let newer = Snapshot::load(&self.newer).await?;
        let diff = analysis::compare(&older, &newer);

        if diff.is_empty() {
            println!("✅ Inventories hold the same content at the same paths");
            return Ok(());
        }

        if !diff.vanished.is_empty() {
            println!("🗑️  Vanished content:");
            for change in &diff.vanished {
                print_change(change, "removed");
            }
        }
        if !diff.added.is_empty() {
            println!("🆕 New content:");
            for change in &diff.added {
                print_change(change, "new");
            }
        }
        if !diff.moved.is_empty() {
            println!("🔀 Moved content:");
            for moved in &diff.moved {
                println!("  {} {}", moved.hash.short_string(), format_bytes(moved.size));
                for path in &moved.removed {
                    println!("    REMOVED   {}{}", path.path, overwritten(path));
                }
                for path in &moved.added {
                    println!("    NEW       {}{}", path.path, overwritten(path));
                }
                for path in &moved.unchanged {
                    println!("    UNCHANGED {}", path);
                }
            }
        }

        println!();
        println!(
            "{} vanished, {} new, {} moved",
            diff.vanished.len(),
            diff.added.len(),
            diff.moved.len()
        );
        Ok(())
    }
}

fn print_change(change: &analysis::ContentChange, what: &str) {
    if let [path] = change.paths.as_slice() {
        println!(
            "  {} {} {} {}{}",
            change.hash.short_string(),
            format_bytes(change.size),
            what,
            path.path,
            overwritten(path)
        );
        return;
    }
    println!(
        "  {} {} {} group:",
        change.hash.short_string(),
        format_bytes(change.size),
        what
    );
    for path in &change.paths {
        println!("    {}{}", path.path, overwritten(path));
    }
}

fn overwritten(path: &analysis::PathChange) -> &'static str {
    if path.overwritten { " (overwritten)" } else { "" }
}

/// Opens an existing manifest without creating one.
async fn open_manifest(dir: &Path) -> Result<Manifest> {
    if !tokio::fs::try_exists(dir.join(MANIFEST_FILENAME)).await? {
        return Err(anyhow!("No manifest in {}", dir.display()));
    }
    Ok(Manifest::open(dir).await?)
}
