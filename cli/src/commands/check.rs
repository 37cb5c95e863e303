use super::open_storage;
use anyhow::{anyhow, Result};
use clap::Args;
use keepvault_core::{AuditMode, ConsistencyAnalyzer};
use std::path::PathBuf;

#[derive(Args)]
pub struct CheckCommand {
    #[arg(help = "Storage directory")]
    storage: PathBuf,

    #[arg(long, conflicts_with = "decompress", help = "Skip re-hashing stored objects")]
    fast: bool,

    #[arg(long, help = "Decrypt and decompress every object instead of re-hashing it")]
    decompress: bool,
}

impl CheckCommand {
    fn mode(&self) -> AuditMode {
        if self.fast {
            AuditMode::Fast
        } else if self.decompress {
            AuditMode::Decompress
        } else {
            AuditMode::Standard
        }
    }

    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (_, storage) = open_storage(cli, &self.storage).await?;

        let report = ConsistencyAnalyzer::new(&storage).run(self.mode()).await?;

        println!("🔍 Checked {}", self.storage.display());
        println!("📋 Manifest entries: {}", report.manifest_entries);
        println!("📦 Object files: {}", report.object_files);
        println!("📸 Inventories: {}", report.snapshots);

        if report.is_clean() {
            println!("✅ No problems found");
            return Ok(());
        }

        for finding in &report.findings {
            println!("  ❌ {}", finding);
        }
        Err(anyhow!("{} problems found", report.error_count()))
    }
}
