//! Deduplicating, encrypted backup storage.
//!
//! File content is stored once per distinct SHA-256 hash, compressed and then
//! encrypted, in a content-addressed object store. A manifest records every
//! stored object; snapshots record which content each backed-up tree held.
//!
//! ```no_run
//! use keepvault_core::{Credentials, KdfParams, ObjectStorage, ScanOptions, Snapshot, StorageOptions};
//! use std::path::Path;
//!
//! # async fn example() -> keepvault_core::Result<()> {
//! let credentials = Credentials::new("password", "salt");
//! let storage = ObjectStorage::open(
//!     Path::new("/backups/store"),
//!     &credentials,
//!     &KdfParams::default(),
//!     StorageOptions::default(),
//! )
//! .await?;
//!
//! let snapshot = Snapshot::scan(
//!     Path::new("/home/me/documents"),
//!     &ScanOptions::default(),
//!     None,
//!     storage.scheduler(),
//!     4,
//! )
//! .await?;
//! storage.backup(&snapshot, chrono::Utc::now()).await?;
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod analyzer;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gc;
pub mod manifest;
pub mod partition;
pub mod retry;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
pub mod transfer;
pub mod types;

pub use analyzer::{AuditMode, AuditReport, ConsistencyAnalyzer, Finding};
pub use config::{Parallelism, RestoreSizePolicy, ScanOptions, StorageOptions, TransferOptions};
pub use error::{Error, Result};
pub use gc::GcReport;
pub use manifest::{Manifest, ManifestEntry};
pub use scheduler::Scheduler;
pub use snapshot::{FileEntry, FolderNode, Snapshot};
pub use storage::{BackupReport, ObjectStorage, RestoreReport};
pub use types::*;
