mod commands;
mod config;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use commands::{
    backup::{BackupCommand, InventoryCommand},
    check::CheckCommand,
    gc::GcCommand,
    reports::{CompareCommand, DuplicatesCommand, GarbageReportCommand, LargeFilesCommand},
    restore::{RestoreCommand, RestoreFileCommand},
    snapshots::SnapshotsCommand,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "keepvault",
    version,
    about = "Deduplicating encrypted backups",
    long_about = "Keepvault stores each distinct file content once, compressed and encrypted, and keeps an inventory of every backed-up tree"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "KEEPVAULT_CONFIG", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "KEEPVAULT_PASSWORD", hide_env_values = true, help = "Encryption password")]
    password: Option<String>,

    #[arg(long, global = true, env = "KEEPVAULT_SALT", hide_env_values = true, help = "Encryption salt")]
    salt: Option<String>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Back up a directory into a storage")]
    Backup(BackupCommand),

    #[command(alias = "createinventory", about = "Write an inventory of a directory without storing it")]
    Inventory(InventoryCommand),

    #[command(about = "Restore an inventory, or one folder of it")]
    Restore(RestoreCommand),

    #[command(about = "Restore a single file from an inventory")]
    RestoreFile(RestoreFileCommand),

    #[command(about = "Check storage consistency")]
    Check(CheckCommand),

    #[command(about = "Move objects no inventory references into the garbage directory")]
    Gc(GcCommand),

    #[command(about = "Show what removing each inventory would free")]
    GarbageReport(GarbageReportCommand),

    #[command(about = "List large files across all inventories")]
    LargeFiles(LargeFilesCommand),

    #[command(about = "List duplicate files within an inventory")]
    Duplicates(DuplicatesCommand),

    #[command(about = "Show content that vanished, appeared or moved between two inventories")]
    Compare(CompareCommand),

    #[command(about = "List the inventories kept in a storage")]
    Snapshots(SnapshotsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;

    debug!("Starting keepvault {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Backup(ref cmd) => cmd.run(&cli).await,
        Commands::Inventory(ref cmd) => cmd.run(&cli).await,
        Commands::Restore(ref cmd) => cmd.run(&cli).await,
        Commands::RestoreFile(ref cmd) => cmd.run(&cli).await,
        Commands::Check(ref cmd) => cmd.run(&cli).await,
        Commands::Gc(ref cmd) => cmd.run(&cli).await,
        Commands::GarbageReport(ref cmd) => cmd.run(&cli).await,
        Commands::LargeFiles(ref cmd) => cmd.run(&cli).await,
        Commands::Duplicates(ref cmd) => cmd.run(&cli).await,
        Commands::Compare(ref cmd) => cmd.run(&cli).await,
        Commands::Snapshots(ref cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("keepvault={level},keepvault_core={level},keepvault_cli={level}")));

    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Setting default subscriber failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_inventory_alias() {
        let cli = Cli::try_parse_from(["keepvault", "createinventory", "/src", "/out.inventory"]).unwrap();
        assert!(matches!(cli.command, Commands::Inventory(_)));
    }

    #[test]
    fn test_compare_takes_two_inventories() {
        let cli = Cli::try_parse_from(["keepvault", "compare", "/a.inventory", "/b.inventory"]).unwrap();
        assert!(matches!(cli.command, Commands::Compare(_)));

        let result = Cli::try_parse_from(["keepvault", "compare", "/a.inventory"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_check_modes_conflict() {
        let result = Cli::try_parse_from(["keepvault", "check", "/store", "--fast", "--decompress"]);
        assert!(result.is_err());
    }
}
