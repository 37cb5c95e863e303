use crate::analysis::referenced_hashes;
use crate::snapshot::Snapshot;
use crate::storage::ObjectStorage;
use crate::transfer::ensure_dir;
use crate::{ContentHash, Error, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::{fs, task};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const GARBAGE_SUBDIR: &str = "garbage";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub retained_snapshots: usize,
    pub reachable: usize,
    pub collected: Vec<ContentHash>,
    pub bytes: u64,
    pub removed_dirs: usize,
}

impl ObjectStorage {
    /// Moves every object that no retained snapshot references into the
    /// garbage directory and tombstones its manifest entry. Nothing is
    /// deleted except directories left empty afterwards.
    ///
    /// With no snapshots at all every object is garbage; that run only
    /// happens with `force`.
    pub async fn garbage_collect(&self, timestamp: DateTime<Utc>, force: bool) -> Result<GcReport> {
        let snapshots = Snapshot::load_all(self.dir()).await?;
        if snapshots.is_empty() {
            if !force {
                return Err(Error::Other(
                    "no snapshots found in storage, refusing to collect every object".to_string(),
                ));
            }
            warn!("gc: no snapshots in {}, every object is garbage", self.dir().display());
        }

        let reachable = referenced_hashes(&snapshots);

        let garbage: Vec<_> = self
            .manifest()
            .entries()
            .await
            .into_iter()
            .filter(|e| !reachable.contains(&e.source_hash))
            .collect();

        info!(
            "gc: {} snapshots reference {} objects, {} unreferenced",
            snapshots.len(),
            reachable.len(),
            garbage.len()
        );

        let garbage_dir = self.dir().join(GARBAGE_SUBDIR);
        let mut report = GcReport {
            retained_snapshots: snapshots.len(),
            reachable: reachable.len(),
            ..GcReport::default()
        };

        for entry in garbage {
            let object = self
                .partitions()
                .object_paths(&entry.source_hash, entry.partition)?
                .object;

            if !fs::try_exists(&object).await? {
                return Err(Error::ObjectMissing {
                    hash: entry.source_hash.to_hex(),
                    path: object,
                });
            }

            let destination = garbage_path(&garbage_dir, self.dir(), &object);
            if let Some(parent) = destination.parent() {
                ensure_dir(parent, &self.options().dir_retry()).await?;
            }
            fs::rename(&object, &destination).await?;
            self.manifest().garbage(&entry.source_hash, timestamp).await?;

            debug!(hash = %entry.source_hash, "moved to {}", destination.display());
            report.bytes += entry.target_size;
            report.collected.push(entry.source_hash);
        }

        for dir in self.partitions().all_dirs() {
            let dir = dir.to_path_buf();
            report.removed_dirs += task::spawn_blocking(move || remove_empty_dirs(&dir)).await?;
        }

        info!(
            "gc done: {} objects ({:.2} MB) moved to {}, {} empty directories removed",
            report.collected.len(),
            report.bytes as f64 / (1024.0 * 1024.0),
            garbage_dir.display(),
            report.removed_dirs
        );
        Ok(report)
    }
}

/// Keeps the object's path below the storage root so that objects from
/// different partitions never collide.
fn garbage_path(garbage_dir: &Path, storage_dir: &Path, object: &Path) -> PathBuf {
    match object.strip_prefix(storage_dir) {
        Ok(relative) => garbage_dir.join(relative),
        Err(_) => garbage_dir.join(object.file_name().unwrap_or_default()),
    }
}

fn remove_empty_dirs(root: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping during cleanup: {}", e);
                continue;
            }
        };
        if entry.file_type().is_dir() && std::fs::remove_dir(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::*;
    use tempfile::TempDir;

    struct Fixture {
        _origin: TempDir,
        store: TempDir,
        storage: ObjectStorage,
        s1: PathBuf,
    }

    /// S1 = {H1, H2}, S2 = {H2, H3}, both backed up.
    async fn fixture() -> Fixture {
        let origin = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        let storage = open_storage(store.path()).await;

        let first = origin.path().join("first");
        write_tree(&first, &[("h1.txt", b"content one"), ("h2.txt", b"content two")]);
        let s1 = scan(&first, &storage).await;
        let s1_path = storage.backup(&s1, Utc::now()).await.unwrap().snapshot_path;

        let second = origin.path().join("second");
        write_tree(&second, &[("h2.txt", b"content two"), ("h3.txt", b"content three")]);
        let mut s2 = scan(&second, &storage).await;
        s2.created = s1.created + chrono::Duration::seconds(10);
        storage.backup(&s2, Utc::now()).await.unwrap();

        Fixture {
            _origin: origin,
            store,
            storage,
            s1: s1_path,
        }
    }

    #[tokio::test]
    async fn test_nothing_collected_while_all_snapshots_retained() {
        let f = fixture().await;
        let report = f.storage.garbage_collect(Utc::now(), false).await.unwrap();

        assert_eq!(report.retained_snapshots, 2);
        assert_eq!(report.reachable, 3);
        assert!(report.collected.is_empty());
        assert_eq!(f.storage.manifest().len().await, 3);
    }

    #[tokio::test]
    async fn test_collects_object_only_in_dropped_snapshot() {
        let f = fixture().await;
        std::fs::remove_file(&f.s1).unwrap();

        let h1 = ContentHash::from_data(b"content one");
        let h2 = ContentHash::from_data(b"content two");
        let h3 = ContentHash::from_data(b"content three");
        let h1_object = f.storage.locate(&h1).await.unwrap();

        let report = f.storage.garbage_collect(Utc::now(), false).await.unwrap();
        assert_eq!(report.collected, vec![h1]);

        let manifest = f.storage.manifest();
        assert!(!manifest.contains(&h1).await);
        assert!(manifest.contains(&h2).await);
        assert!(manifest.contains(&h3).await);
        assert_eq!(manifest.garbage_entries().await.len(), 1);

        assert!(!h1_object.exists());
        let moved = f
            .store
            .path()
            .join(GARBAGE_SUBDIR)
            .join(h1_object.strip_prefix(f.store.path()).unwrap());
        assert!(moved.exists());

        // The fan-out directories of the moved object are gone unless shared.
        let prefix_dir = h1_object.parent().unwrap();
        let shared = [h2, h3]
            .iter()
            .any(|h| h.upper_prefix(4) == h1.upper_prefix(4));
        assert_eq!(prefix_dir.exists(), shared);

        let again = f.storage.garbage_collect(Utc::now(), false).await.unwrap();
        assert!(again.collected.is_empty());
    }

    #[tokio::test]
    async fn test_missing_garbage_object_is_fatal() {
        let f = fixture().await;
        std::fs::remove_file(&f.s1).unwrap();

        let h1 = ContentHash::from_data(b"content one");
        std::fs::remove_file(f.storage.locate(&h1).await.unwrap()).unwrap();

        let err = f.storage.garbage_collect(Utc::now(), false).await.unwrap_err();
        assert!(matches!(err, Error::ObjectMissing { .. }));
        assert!(err.is_fatal());
        assert!(f.storage.manifest().contains(&h1).await);
    }

    #[tokio::test]
    async fn test_refuses_without_snapshots() {
        let store = TempDir::new().unwrap();
        let storage = open_storage(store.path()).await;
        assert!(storage.garbage_collect(Utc::now(), false).await.is_err());
    }

    #[tokio::test]
    async fn test_forced_run_without_snapshots_collects_everything() {
        let f = fixture().await;
        for path in f.storage.snapshots().await.unwrap() {
            std::fs::remove_file(path).unwrap();
        }

        assert!(f.storage.garbage_collect(Utc::now(), false).await.is_err());
        assert_eq!(f.storage.manifest().len().await, 3);

        let report = f.storage.garbage_collect(Utc::now(), true).await.unwrap();
        assert_eq!(report.retained_snapshots, 0);
        assert_eq!(report.collected.len(), 3);
        assert_eq!(f.storage.manifest().len().await, 0);
        assert_eq!(f.storage.manifest().garbage_entries().await.len(), 3);
    }
}
