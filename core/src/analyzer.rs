//! Read-only consistency audit of a storage directory.
//!
//! The audit cross-checks three views of the storage against each other: the
//! manifest, the object files on disk and the retained snapshots. It never
//! changes anything; every inconsistency becomes a [`Finding`].

use crate::analysis::referenced_hashes;
use crate::crypto::hash_file;
use crate::partition::{classify, StoredFile};
use crate::scheduler::Job;
use crate::snapshot::Snapshot;
use crate::storage::ObjectStorage;
use crate::transfer::recover_content;
use crate::{ContentHash, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use tokio::{fs, task};
use tracing::{error, info, warn};
use walkdir::WalkDir;

/// Which of the expensive object checks a run performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuditMode {
    /// Structural checks plus re-hashing every stored object.
    #[default]
    Standard,
    /// Structural checks only.
    Fast,
    /// Structural checks plus full decryption and decompression of every
    /// object.
    Decompress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    MissingObjectFile { hash: ContentHash, path: PathBuf },
    OrphanObjectFile { hash: ContentHash, path: PathBuf },
    DuplicateObjectFile { hash: ContentHash, path: PathBuf },
    SizeMismatch { hash: ContentHash, expected: u64, actual: u64 },
    IncompleteWrite { path: PathBuf },
    UnknownFile { path: PathBuf },
    MissingFromManifest { hash: ContentHash },
    OrphanInManifest { hash: ContentHash },
    StorageHashMismatch { hash: ContentHash, expected: ContentHash, actual: ContentHash },
    ContentMismatch { hash: ContentHash, actual: ContentHash },
    ContentSizeMismatch { hash: ContentHash, expected: u64, actual: u64 },
    Unreadable { hash: ContentHash, message: String },
    UnreadableSnapshot { path: PathBuf, message: String },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::MissingObjectFile { hash, path } => {
                write!(f, "object for {} missing at {}", hash, path.display())
            }
            Finding::OrphanObjectFile { hash, path } => {
                write!(f, "object {} not in manifest: {}", hash, path.display())
            }
            Finding::DuplicateObjectFile { hash, path } => {
                write!(f, "object {} stored more than once: {}", hash, path.display())
            }
            Finding::SizeMismatch {
                hash,
                expected,
                actual,
            } => write!(
                f,
                "object {} is {} bytes, manifest says {}",
                hash, actual, expected
            ),
            Finding::IncompleteWrite { path } => write!(f, "incomplete write: {}", path.display()),
            Finding::UnknownFile { path } => write!(f, "unknown file: {}", path.display()),
            Finding::MissingFromManifest { hash } => {
                write!(f, "{} referenced by a snapshot but not in manifest", hash)
            }
            Finding::OrphanInManifest { hash } => {
                write!(f, "{} in manifest but not referenced by any snapshot", hash)
            }
            Finding::StorageHashMismatch {
                hash,
                expected,
                actual,
            } => write!(
                f,
                "stored bytes of {} hash to {}, manifest says {}",
                hash, actual, expected
            ),
            Finding::ContentMismatch { hash, actual } => {
                write!(f, "content of {} decodes to {}", hash, actual)
            }
            Finding::ContentSizeMismatch {
                hash,
                expected,
                actual,
            } => write!(
                f,
                "content of {} decodes to {} bytes, manifest says {}",
                hash, actual, expected
            ),
            Finding::Unreadable { hash, message } => write!(f, "cannot read {}: {}", hash, message),
            Finding::UnreadableSnapshot { path, message } => {
                write!(f, "cannot read snapshot {}: {}", path.display(), message)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    pub findings: Vec<Finding>,
    pub manifest_entries: usize,
    pub object_files: usize,
    pub snapshots: usize,
}

impl AuditReport {
    pub fn error_count(&self) -> usize {
        self.findings.len()
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    fn push(&mut self, finding: Finding) {
        error!("{}", finding);
        self.findings.push(finding);
    }
}

pub struct ConsistencyAnalyzer<'a> {
    storage: &'a ObjectStorage,
}

impl<'a> ConsistencyAnalyzer<'a> {
    pub fn new(storage: &'a ObjectStorage) -> Self {
        Self { storage }
    }

    pub async fn run(&self, mode: AuditMode) -> Result<AuditReport> {
        let storage = self.storage;
        let entries = storage.manifest().entries().await;
        let mut report = AuditReport {
            manifest_entries: entries.len(),
            ..AuditReport::default()
        };

        let dirs: Vec<PathBuf> = storage.partitions().all_dirs().map(|d| d.to_path_buf()).collect();
        let on_disk = task::spawn_blocking(move || inventory(&dirs)).await?;
        report.object_files = on_disk.objects.len();

        info!("phase 1: manifest entries have their objects");
        let mut present = Vec::with_capacity(entries.len());
        for entry in &entries {
            let path = match storage.partitions().object_paths(&entry.source_hash, entry.partition) {
                Ok(paths) => paths.object,
                Err(e) => {
                    warn!(hash = %entry.source_hash, "{}", e);
                    report.push(Finding::MissingObjectFile {
                        hash: entry.source_hash,
                        path: PathBuf::new(),
                    });
                    continue;
                }
            };
            match fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => present.push((entry, path, metadata.len())),
                _ => report.push(Finding::MissingObjectFile {
                    hash: entry.source_hash,
                    path,
                }),
            }
        }

        info!("phase 2: object files are listed in the manifest");
        let listed: HashSet<ContentHash> = entries.iter().map(|e| e.source_hash).collect();
        for duplicate in on_disk.duplicates {
            report.push(duplicate);
        }
        for (hash, path) in &on_disk.objects {
            if !listed.contains(hash) {
                report.push(Finding::OrphanObjectFile {
                    hash: *hash,
                    path: path.clone(),
                });
            }
        }

        info!("phase 3: stored sizes match the manifest");
        for (entry, _, actual) in &present {
            if *actual != entry.target_size {
                report.push(Finding::SizeMismatch {
                    hash: entry.source_hash,
                    expected: entry.target_size,
                    actual: *actual,
                });
            }
        }

        info!("phase 4: no pending files");
        for path in on_disk.pending {
            report.push(Finding::IncompleteWrite { path });
        }

        info!("phase 5: no foreign files");
        for path in on_disk.unknown {
            report.push(Finding::UnknownFile { path });
        }

        info!("phase 6: snapshots and manifest reference the same content");
        let mut snapshots = Vec::new();
        for path in Snapshot::list(storage.dir()).await? {
            match Snapshot::load(&path).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => report.push(Finding::UnreadableSnapshot {
                    path,
                    message: e.to_string(),
                }),
            }
        }
        report.snapshots = snapshots.len();
        let referenced = referenced_hashes(&snapshots);
        let mut missing: Vec<_> = referenced.difference(&listed).copied().collect();
        missing.sort();
        for hash in missing {
            report.push(Finding::MissingFromManifest { hash });
        }
        let mut orphans: Vec<_> = listed.difference(&referenced).copied().collect();
        orphans.sort();
        for hash in orphans {
            report.push(Finding::OrphanInManifest { hash });
        }

        match mode {
            AuditMode::Fast => info!("skipping object verification"),
            AuditMode::Standard => {
                info!("phase 7: stored bytes hash to the manifest's target hash");
                let jobs = present
                    .iter()
                    .map(|(entry, path, size)| VerifyJob {
                        hash: entry.source_hash,
                        expected: entry.target_hash,
                        path: path.clone(),
                        size: *size,
                    })
                    .collect();
                let batch = storage
                    .scheduler()
                    .run(jobs, storage.options().parallelism.verify)
                    .await?;
                for finding in batch.outputs.into_iter().flatten() {
                    report.push(finding);
                }
            }
            AuditMode::Decompress => {
                info!("phase 8: objects decode to their source content");
                for (entry, path, _) in &present {
                    let key = storage.key().clone();
                    let (path, hash) = (path.clone(), entry.source_hash);
                    let recovered =
                        task::spawn_blocking(move || recover_content(&key, &path, &hash)).await?;

                    match recovered {
                        Err(e) => report.push(Finding::Unreadable {
                            hash: entry.source_hash,
                            message: e.to_string(),
                        }),
                        Ok((_, size)) if size != entry.source_size => {
                            report.push(Finding::ContentSizeMismatch {
                                hash: entry.source_hash,
                                expected: entry.source_size,
                                actual: size,
                            })
                        }
                        Ok((actual, _)) if actual != entry.source_hash => {
                            report.push(Finding::ContentMismatch {
                                hash: entry.source_hash,
                                actual,
                            })
                        }
                        Ok(_) => {}
                    }
                }
            }
        }

        info!(
            "audit done: {} manifest entries, {} object files, {} snapshots, {} errors",
            report.manifest_entries,
            report.object_files,
            report.snapshots,
            report.error_count()
        );
        Ok(report)
    }
}

#[derive(Debug, Default)]
struct Inventory {
    objects: HashMap<ContentHash, PathBuf>,
    duplicates: Vec<Finding>,
    pending: Vec<PathBuf>,
    unknown: Vec<PathBuf>,
}

fn inventory(dirs: &[PathBuf]) -> Inventory {
    let mut found = Inventory::default();

    for dir in dirs {
        for entry in WalkDir::new(dir).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("cannot list {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            match classify(&entry.file_name().to_string_lossy()) {
                StoredFile::Object(hash) => {
                    if found.objects.contains_key(&hash) {
                        found.duplicates.push(Finding::DuplicateObjectFile {
                            hash,
                            path: entry.into_path(),
                        });
                    } else {
                        found.objects.insert(hash, entry.into_path());
                    }
                }
                StoredFile::Pending => found.pending.push(entry.into_path()),
                StoredFile::Unknown => found.unknown.push(entry.into_path()),
            }
        }
    }

    found
}

struct VerifyJob {
    hash: ContentHash,
    expected: ContentHash,
    path: PathBuf,
    size: u64,
}

#[async_trait]
impl Job for VerifyJob {
    type Output = Option<Finding>;

    fn size(&self) -> u64 {
        self.size
    }

    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn hash(&self) -> String {
        self.hash.to_hex()
    }

    async fn run(self) -> Result<Option<Finding>> {
        let path = self.path.clone();
        let finding = match task::spawn_blocking(move || hash_file(path)).await? {
            Ok((actual, _)) if actual != self.expected => Some(Finding::StorageHashMismatch {
                hash: self.hash,
                expected: self.expected,
                actual,
            }),
            Ok(_) => None,
            Err(e) => Some(Finding::Unreadable {
                hash: self.hash,
                message: e.to_string(),
            }),
        };
        Ok(finding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{resolve, OBJECT_EXTENSION, PENDING_EXTENSION};
    use crate::storage::testing::*;
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        _origin: TempDir,
        store: TempDir,
        storage: ObjectStorage,
    }

    async fn backed_up() -> Fixture {
        let origin = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        write_tree(
            origin.path(),
            &[
                ("a.txt", b"alpha"),
                ("b/b.txt", &[b'b'; 120]),
                ("c/c.bin", &[3u8; 600]),
            ],
        );
        let storage = open_storage(store.path()).await;
        let snapshot = scan(origin.path(), &storage).await;
        storage.backup(&snapshot, Utc::now()).await.unwrap();
        Fixture {
            _origin: origin,
            store,
            storage,
        }
    }

    async fn audit(storage: &ObjectStorage, mode: AuditMode) -> AuditReport {
        ConsistencyAnalyzer::new(storage).run(mode).await.unwrap()
    }

    fn count(report: &AuditReport, predicate: impl Fn(&Finding) -> bool) -> usize {
        report.findings.iter().filter(|f| predicate(f)).count()
    }

    #[tokio::test]
    async fn test_clean_storage_in_every_mode() {
        let f = backed_up().await;
        for mode in [AuditMode::Fast, AuditMode::Standard, AuditMode::Decompress] {
            let report = audit(&f.storage, mode).await;
            assert!(report.is_clean(), "{:?}: {:?}", mode, report.findings);
            assert_eq!(report.manifest_entries, 3);
            assert_eq!(report.object_files, 3);
            assert_eq!(report.snapshots, 1);
        }
    }

    #[tokio::test]
    async fn test_deleted_object_is_one_missing_file() {
        let f = backed_up().await;
        let hash = ContentHash::from_data(b"alpha");
        std::fs::remove_file(f.storage.locate(&hash).await.unwrap()).unwrap();

        let report = audit(&f.storage, AuditMode::Standard).await;
        assert_eq!(report.error_count(), 1);
        assert!(matches!(
            &report.findings[0],
            Finding::MissingObjectFile { hash: h, .. } if *h == hash
        ));
    }

    #[tokio::test]
    async fn test_truncated_object_is_one_size_mismatch() {
        let f = backed_up().await;
        let hash = ContentHash::from_data(&[3u8; 600]);
        let object = f.storage.locate(&hash).await.unwrap();
        let bytes = std::fs::read(&object).unwrap();
        std::fs::write(&object, &bytes[..bytes.len() / 2]).unwrap();

        let fast = audit(&f.storage, AuditMode::Fast).await;
        assert_eq!(fast.error_count(), 1);
        assert!(matches!(fast.findings[0], Finding::SizeMismatch { .. }));

        let standard = audit(&f.storage, AuditMode::Standard).await;
        assert_eq!(count(&standard, |f| matches!(f, Finding::SizeMismatch { .. })), 1);
        assert_eq!(
            count(&standard, |f| matches!(f, Finding::StorageHashMismatch { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_corrupted_object_is_caught_by_verification() {
        let f = backed_up().await;
        let hash = ContentHash::from_data(&[b'b'; 120]);
        let object = f.storage.locate(&hash).await.unwrap();
        let mut bytes = std::fs::read(&object).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xff;
        std::fs::write(&object, &bytes).unwrap();

        assert!(audit(&f.storage, AuditMode::Fast).await.is_clean());

        let standard = audit(&f.storage, AuditMode::Standard).await;
        assert_eq!(standard.error_count(), 1);
        assert!(matches!(standard.findings[0], Finding::StorageHashMismatch { .. }));

        let decompress = audit(&f.storage, AuditMode::Decompress).await;
        assert_eq!(decompress.error_count(), 1);
        assert!(matches!(
            decompress.findings[0],
            Finding::ContentMismatch { .. }
                | Finding::ContentSizeMismatch { .. }
                | Finding::Unreadable { .. }
        ));
    }

    #[tokio::test]
    async fn test_interrupted_write_is_one_incomplete_write() {
        let f = backed_up().await;
        let hash = ContentHash::from_data(b"never finished");
        let paths = resolve(&hash, f.storage.partitions().current_dir());
        std::fs::create_dir_all(paths.pending.parent().unwrap()).unwrap();
        std::fs::write(&paths.pending, b"partial").unwrap();

        let report = audit(&f.storage, AuditMode::Standard).await;
        assert_eq!(report.error_count(), 1);
        assert!(matches!(&report.findings[0], Finding::IncompleteWrite { path } if *path == paths.pending));
        assert!(!paths.object.exists());
    }

    #[tokio::test]
    async fn test_foreign_and_orphan_files() {
        let f = backed_up().await;
        let obj = f.store.path().join("obj");
        std::fs::write(obj.join("notes.txt"), b"hi").unwrap();

        let stray = ContentHash::from_data(b"stray");
        let stray_path = resolve(&stray, &obj).object;
        std::fs::create_dir_all(stray_path.parent().unwrap()).unwrap();
        std::fs::write(&stray_path, b"???").unwrap();

        let report = audit(&f.storage, AuditMode::Fast).await;
        assert_eq!(report.error_count(), 2);
        assert_eq!(count(&report, |f| matches!(f, Finding::UnknownFile { .. })), 1);
        assert_eq!(
            count(&report, |f| matches!(f, Finding::OrphanObjectFile { hash, .. } if *hash == stray)),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_object_across_partitions() {
        let f = backed_up().await;
        let hash = ContentHash::from_data(b"alpha");
        let object = f.storage.locate(&hash).await.unwrap();

        let copy = resolve(&hash, &f.store.path().join("obj_1")).object;
        std::fs::create_dir_all(copy.parent().unwrap()).unwrap();
        std::fs::copy(&object, &copy).unwrap();

        // Reopen so the new partition is discovered.
        let storage = open_storage(f.store.path()).await;
        let report = audit(&storage, AuditMode::Fast).await;
        assert_eq!(report.error_count(), 1);
        assert!(matches!(report.findings[0], Finding::DuplicateObjectFile { .. }));
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_is_a_finding() {
        let f = backed_up().await;
        let broken = f.store.path().join("keepvault-1999-01-01 00-00-00.inventory");
        std::fs::write(&broken, b"not json").unwrap();
        let hash = ContentHash::from_data(b"alpha");
        std::fs::remove_file(f.storage.locate(&hash).await.unwrap()).unwrap();

        let report = audit(&f.storage, AuditMode::Fast).await;
        assert_eq!(report.snapshots, 1);
        assert_eq!(report.error_count(), 2);
        assert_eq!(count(&report, |f| matches!(f, Finding::MissingObjectFile { .. })), 1);
        assert!(report.findings.iter().any(
            |f| matches!(f, Finding::UnreadableSnapshot { path, .. } if *path == broken)
        ));
    }

    #[tokio::test]
    async fn test_snapshot_and_manifest_disagree() {
        let f = backed_up().await;
        let hash = ContentHash::from_data(b"alpha");
        f.storage.manifest().garbage(&hash, Utc::now()).await.unwrap();

        let report = audit(&f.storage, AuditMode::Fast).await;
        assert_eq!(report.error_count(), 2);
        assert_eq!(count(&report, |f| matches!(f, Finding::OrphanObjectFile { .. })), 1);
        assert_eq!(
            count(&report, |f| matches!(f, Finding::MissingFromManifest { hash: h } if *h == hash)),
            1
        );

        for path in Snapshot::list(f.store.path()).await.unwrap() {
            std::fs::remove_file(path).unwrap();
        }
        let report = audit(&f.storage, AuditMode::Fast).await;
        assert_eq!(count(&report, |f| matches!(f, Finding::OrphanInManifest { .. })), 2);
    }

    #[test]
    fn test_inventory_classifies_files() {
        let dir = TempDir::new().unwrap();
        let hash = ContentHash::from_data(b"x");
        let object = dir.path().join(format!("{}{}", hash, OBJECT_EXTENSION));
        std::fs::write(&object, b"o").unwrap();
        std::fs::write(dir.path().join(format!("{}{}", hash, PENDING_EXTENSION)), b"p").unwrap();
        std::fs::write(dir.path().join("desktop.ini"), b"u").unwrap();

        let found = inventory(&[dir.path().to_path_buf()]);
        assert_eq!(found.objects.get(&hash).map(PathBuf::as_path), Some(object.as_path()));
        assert_eq!(found.pending.len(), 1);
        assert_eq!(found.unknown.len(), 1);
        assert!(found.duplicates.is_empty());
    }
}
