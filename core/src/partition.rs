use crate::{ContentHash, Result, Error};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

pub const OBJECTS_SUBDIR: &str = "obj";
pub const PARTITION_PREFIX: &str = "obj_";
pub const OBJECT_EXTENSION: &str = ".gz.chacha.keep";
pub const PENDING_EXTENSION: &str = ".pending";

/// Where one object lives inside a partition directory: the final path and
/// the pending path it is written under first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPaths {
    pub pending: PathBuf,
    pub object: PathBuf,
}

/// `<dir>/<H>/<HHHH>/<hash><ext>`. Pure function of its inputs.
pub fn resolve(hash: &ContentHash, partition_dir: &Path) -> ObjectPaths {
    let hex = hash.to_hex();
    let target_dir = partition_dir
        .join(hash.upper_prefix(1))
        .join(hash.upper_prefix(4));

    ObjectPaths {
        pending: target_dir.join(format!("{}{}", hex, PENDING_EXTENSION)),
        object: target_dir.join(format!("{}{}", hex, OBJECT_EXTENSION)),
    }
}

/// What a file found under a partition directory is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredFile {
    Object(ContentHash),
    Pending,
    Unknown,
}

pub fn classify(file_name: &str) -> StoredFile {
    let lower = file_name.to_ascii_lowercase();
    if let Some(stem) = lower.strip_suffix(OBJECT_EXTENSION) {
        return match stem.parse::<ContentHash>() {
            Ok(hash) => StoredFile::Object(hash),
            Err(_) => StoredFile::Unknown,
        };
    }
    if lower.ends_with(PENDING_EXTENSION) {
        return StoredFile::Pending;
    }
    StoredFile::Unknown
}

/// Maps partition numbers to directories. Partition 0 is `obj/`, partition
/// `n > 0` is `obj_<n>/`. New objects go to the highest partition found.
#[derive(Debug, Clone)]
pub struct PartitionManager {
    main: PathBuf,
    partitions: BTreeMap<u32, PathBuf>,
    current: u32,
}

impl PartitionManager {
    pub async fn open(storage_dir: &Path) -> Result<Self> {
        let main = storage_dir.join(OBJECTS_SUBDIR);
        fs::create_dir_all(&main).await?;

        let mut partitions = BTreeMap::new();
        let mut entries = fs::read_dir(storage_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(number) = name.to_str().and_then(|n| n.strip_prefix(PARTITION_PREFIX)) else {
                continue;
            };
            match number.parse::<u32>() {
                Ok(0) => warn!("partition dir with 0 is not supported and will be ignored"),
                Ok(n) => {
                    partitions.insert(n, entry.path());
                }
                Err(_) => warn!(dir = %entry.path().display(), "ignoring directory with non-numeric partition suffix"),
            }
        }

        let current = partitions.keys().next_back().copied().unwrap_or(0);
        info!("partition for backups: {}", current);

        Ok(Self {
            main,
            partitions,
            current,
        })
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn current_dir(&self) -> &Path {
        if self.current == 0 {
            &self.main
        } else {
            &self.partitions[&self.current]
        }
    }

    pub fn dir_for(&self, partition: u32) -> Result<&Path> {
        if partition == 0 {
            return Ok(&self.main);
        }
        self.partitions
            .get(&partition)
            .map(PathBuf::as_path)
            .ok_or(Error::UnknownPartition(partition))
    }

    pub fn all_dirs(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.main.as_path()).chain(self.partitions.values().map(PathBuf::as_path))
    }

    pub fn object_paths(&self, hash: &ContentHash, partition: u32) -> Result<ObjectPaths> {
        Ok(resolve(hash, self.dir_for(partition)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hash(hex_prefix: &str) -> ContentHash {
        let hex = format!("{:0<64}", hex_prefix);
        hex.parse().unwrap()
    }

    #[test]
    fn test_resolve_layout() {
        let h = hash("abcdef");
        let paths = resolve(&h, Path::new("/store/obj"));
        let expected_dir = Path::new("/store/obj/A/ABCD");
        assert_eq!(paths.object, expected_dir.join(format!("{}{}", h, OBJECT_EXTENSION)));
        assert_eq!(paths.pending, expected_dir.join(format!("{}{}", h, PENDING_EXTENSION)));
    }

    #[test]
    fn test_resolve_is_deterministic_and_shares_prefix_dirs() {
        let a = hash("1234aa");
        let b = hash("1234bb");
        let dir = Path::new("/store/obj_3");

        assert_eq!(resolve(&a, dir), resolve(&a, dir));

        let pa = resolve(&a, dir).object;
        let pb = resolve(&b, dir).object;
        assert_eq!(pa.parent(), pb.parent());
        assert_ne!(pa.file_name(), pb.file_name());
    }

    #[test]
    fn test_classify() {
        let h = hash("ff");
        assert_eq!(classify(&format!("{}{}", h, OBJECT_EXTENSION)), StoredFile::Object(h));
        assert_eq!(classify(&format!("{}{}", h, PENDING_EXTENSION)), StoredFile::Pending);
        assert_eq!(classify("notes.txt"), StoredFile::Unknown);
        assert_eq!(classify(&format!("xyz{}", OBJECT_EXTENSION)), StoredFile::Unknown);
    }

    #[tokio::test]
    async fn test_open_without_partitions() {
        let dir = TempDir::new().unwrap();
        let pm = PartitionManager::open(dir.path()).await.unwrap();

        assert_eq!(pm.current(), 0);
        assert_eq!(pm.current_dir(), dir.path().join(OBJECTS_SUBDIR));
        assert!(dir.path().join(OBJECTS_SUBDIR).is_dir());
        assert_eq!(pm.all_dirs().count(), 1);
    }

    #[tokio::test]
    async fn test_open_picks_highest_partition_and_ignores_zero() {
        let dir = TempDir::new().unwrap();
        for name in ["obj_1", "obj_7", "obj_0", "obj_x", "other"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }

        let pm = PartitionManager::open(dir.path()).await.unwrap();
        assert_eq!(pm.current(), 7);
        assert_eq!(pm.current_dir(), dir.path().join("obj_7"));
        assert_eq!(pm.dir_for(1).unwrap(), dir.path().join("obj_1"));
        assert!(matches!(pm.dir_for(0), Ok(p) if p == dir.path().join("obj")));
        assert!(matches!(pm.dir_for(2), Err(Error::UnknownPartition(2))));
        assert_eq!(pm.all_dirs().count(), 3);
    }
}
