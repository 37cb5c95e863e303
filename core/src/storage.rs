use crate::config::StorageOptions;
use crate::crypto::CipherKey;
use crate::manifest::{Manifest, ManifestEntry};
use crate::partition::PartitionManager;
use crate::scheduler::{BatchTotals, Job, Scheduler};
use crate::snapshot::Snapshot;
use crate::transfer::{FileTimestamps, FileTransferJob, SizeClass, TransferContext, TransferOutcome};
use crate::{ContentHash, Credentials, Error, KdfParams, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs, task};
use tracing::{error, info, warn};

/// Counts of one backup run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub stored: usize,
    pub already_stored: usize,
    pub alternates: usize,
    pub failed: usize,
    pub bytes: u64,
    pub snapshot_path: PathBuf,
}

/// Counts of one restore run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped_existing: usize,
    pub missing: usize,
    pub failed: usize,
    pub bytes: u64,
}

/// A storage directory: partitions of encrypted objects, the manifest
/// describing them and the snapshots that reference them.
#[derive(Debug)]
pub struct ObjectStorage {
    dir: PathBuf,
    partitions: PartitionManager,
    manifest: Arc<Manifest>,
    context: Arc<TransferContext>,
    options: StorageOptions,
    scheduler: Scheduler,
}

impl ObjectStorage {
    pub async fn open(
        dir: &Path,
        credentials: &Credentials,
        kdf: &KdfParams,
        options: StorageOptions,
    ) -> Result<Self> {
        match fs::metadata(dir).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => {
                return Err(Error::StorageNotFound {
                    path: dir.display().to_string(),
                });
            }
        }

        let credentials = credentials.clone();
        let kdf = kdf.clone();
        let key = task::spawn_blocking(move || CipherKey::derive(&credentials, &kdf)).await??;

        let partitions = PartitionManager::open(dir).await?;
        let manifest = Manifest::open(dir).await?;
        info!("opened storage at {}", dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            partitions,
            manifest: Arc::new(manifest),
            context: Arc::new(TransferContext::new(key, &options)),
            scheduler: Scheduler::new(options.pace_interval()),
            options,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn partitions(&self) -> &PartitionManager {
        &self.partitions
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn key(&self) -> &CipherKey {
        self.context.key()
    }

    /// Snapshot files kept in this storage, newest first.
    pub async fn snapshots(&self) -> Result<Vec<PathBuf>> {
        Snapshot::list(&self.dir).await
    }

    /// Stores every distinct content of `snapshot` not yet in the manifest,
    /// then saves the snapshot next to the manifest.
    pub async fn backup(&self, snapshot: &Snapshot, timestamp: DateTime<Utc>) -> Result<BackupReport> {
        let source_root = snapshot.source_root.as_deref().ok_or_else(|| {
            Error::Other("snapshot has no source directory to back up from".to_string())
        })?;

        let files = snapshot.all_files();
        let mut representatives = HashMap::with_capacity(files.len());
        let mut alternates = Vec::new();
        let mut order = Vec::new();

        for file in &files {
            let path = source_root.join(file.relative_path());
            if representatives.contains_key(&file.entry.hash) {
                alternates.push((file.entry.hash, path));
            } else {
                representatives.insert(file.entry.hash, (file, path));
                order.push(file.entry.hash);
            }
        }

        let partition = self.partitions.current();
        let mut report = BackupReport {
            alternates: alternates.len(),
            ..BackupReport::default()
        };
        let mut batches: HashMap<SizeClass, Vec<BackupJob>> = HashMap::new();

        for hash in order {
            let Some((file, path)) = representatives.remove(&hash) else {
                continue;
            };
            if self.manifest.contains(&hash).await {
                report.already_stored += 1;
                alternates.push((hash, path));
                continue;
            }

            let paths = self.partitions.object_paths(&hash, partition)?;
            let transfer =
                FileTransferJob::store(self.context.clone(), hash, file.entry.size, path, paths);
            batches
                .entry(transfer.size_class())
                .or_default()
                .push(BackupJob {
                    label: file.path.clone(),
                    transfer,
                    manifest: self.manifest.clone(),
                    partition,
                    timestamp,
                });
        }

        let count_total = batches.values().map(Vec::len).sum::<usize>() as u64;
        let size_total: u64 = batches.values().flatten().map(Job::size).sum();
        info!(
            "backup: {} files, {} distinct, {} already stored, {} to store ({:.2} MB)",
            files.len(),
            files.len() - report.alternates,
            report.already_stored,
            count_total,
            size_total as f64 / (1024.0 * 1024.0)
        );

        let parallelism = &self.options.parallelism;
        let mut totals = BatchTotals {
            count_total,
            count_offset: 0,
            size_total,
            size_offset: 0,
        };

        for (class, degree) in [
            (SizeClass::Small, parallelism.small),
            (SizeClass::Medium, parallelism.medium),
            (SizeClass::Large, parallelism.large),
        ] {
            let Some(mut jobs) = batches.remove(&class) else {
                continue;
            };
            jobs.sort_by_key(|job| std::cmp::Reverse(job.size()));

            info!("storing {} {:?} files", jobs.len(), class);
            let count = jobs.len() as u64;
            let size: u64 = jobs.iter().map(Job::size).sum();

            let batch = self.scheduler.run_with_totals(jobs, degree, totals).await?;
            report.stored += batch.completed;
            report.failed += batch.failed;
            report.bytes += batch.bytes;

            totals.count_offset += count;
            totals.size_offset += size;
        }

        self.manifest.add_alternate_sources(&alternates, timestamp).await?;

        if report.failed > 0 {
            warn!("{} files could not be stored", report.failed);
        }
        report.snapshot_path = snapshot.save(&self.dir).await?;

        info!(
            "backup done: {} stored, {} already stored, {} alternate paths, {} failed",
            report.stored, report.already_stored, report.alternates, report.failed
        );
        Ok(report)
    }

    /// Restores the whole snapshot, or the folder at `subpath`, into `target`.
    /// Files already present at their destination are left alone.
    pub async fn restore(
        &self,
        snapshot: &Snapshot,
        target: &Path,
        subpath: Option<&str>,
    ) -> Result<RestoreReport> {
        let folder = match subpath {
            Some(path) => snapshot.subfolder_by_path(path)?,
            None => &snapshot.root,
        };

        let mut report = RestoreReport::default();
        let mut jobs = Vec::new();

        for file in folder.all_files() {
            let destination = target.join(file.relative_path());
            if fs::try_exists(&destination).await? {
                report.skipped_existing += 1;
                continue;
            }

            let object = match self.locate(&file.entry.hash).await {
                Ok(object) => object,
                Err(e) => {
                    error!(path = %file.path, error = %e, "cannot restore");
                    report.missing += 1;
                    continue;
                }
            };

            jobs.push(RestoreJob {
                label: file.path.clone(),
                transfer: FileTransferJob::retrieve(
                    self.context.clone(),
                    file.entry.hash,
                    file.entry.size,
                    object,
                    destination,
                    FileTimestamps {
                        created: file.entry.created,
                        modified: file.entry.modified,
                    },
                ),
            });
        }

        info!(
            "restore: {} files to restore, {} already present, {} missing",
            jobs.len(),
            report.skipped_existing,
            report.missing
        );

        let batch = self
            .scheduler
            .run(jobs, self.options.parallelism.restore)
            .await?;
        report.restored = batch.completed;
        report.failed = batch.failed;
        report.bytes = batch.bytes;

        Ok(report)
    }

    /// Restores the single file at `path` into the directory `target`, without
    /// going through the scheduler.
    pub async fn restore_file(&self, snapshot: &Snapshot, path: &str, target: &Path) -> Result<PathBuf> {
        let entry = snapshot.file_by_path(path)?;
        let destination = target.join(&entry.name);

        if fs::try_exists(&destination).await? {
            info!("{} already exists, skipping", destination.display());
            return Ok(destination);
        }

        let object = self.locate(&entry.hash).await?;
        FileTransferJob::retrieve(
            self.context.clone(),
            entry.hash,
            entry.size,
            object,
            destination.clone(),
            FileTimestamps {
                created: entry.created,
                modified: entry.modified,
            },
        )
        .execute()
        .await?;

        info!("restored {}", destination.display());
        Ok(destination)
    }

    /// Path of the stored object for `hash`, in the partition the manifest
    /// records for it.
    pub async fn locate(&self, hash: &ContentHash) -> Result<PathBuf> {
        let partition = self
            .manifest
            .partition_of(hash)
            .await
            .ok_or_else(|| Error::NotInManifest { hash: hash.to_hex() })?;
        Ok(self.partitions.object_paths(hash, partition)?.object)
    }
}

struct BackupJob {
    label: String,
    transfer: FileTransferJob,
    manifest: Arc<Manifest>,
    partition: u32,
    timestamp: DateTime<Utc>,
}

#[async_trait]
impl Job for BackupJob {
    type Output = ContentHash;

    fn size(&self) -> u64 {
        self.transfer.size()
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn hash(&self) -> String {
        self.transfer.hash().to_hex()
    }

    async fn run(self) -> Result<ContentHash> {
        let source_hash = *self.transfer.hash();
        let source_size = self.transfer.size();
        let source = self.transfer.from().to_path_buf();

        let TransferOutcome::Stored {
            target_hash,
            target_size,
        } = self.transfer.execute().await?
        else {
            return Err(Error::Other("store transfer did not produce an object".to_string()));
        };

        let entry = ManifestEntry {
            source_hash,
            target_hash,
            source_size,
            target_size,
            partition: self.partition,
        };
        self.manifest.add(entry, &source, self.timestamp).await?;
        Ok(source_hash)
    }
}

struct RestoreJob {
    label: String,
    transfer: FileTransferJob,
}

#[async_trait]
impl Job for RestoreJob {
    type Output = PathBuf;

    fn size(&self) -> u64 {
        self.transfer.size()
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn hash(&self) -> String {
        self.transfer.hash().to_hex()
    }

    async fn run(self) -> Result<PathBuf> {
        let target = self.transfer.target().to_path_buf();
        self.transfer.execute().await?;
        Ok(target)
    }
}
