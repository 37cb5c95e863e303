use crate::config::ScanOptions;
use crate::crypto::hash_file;
use crate::scheduler::{Job, Scheduler};
use crate::{ContentHash, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::{fs, task};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const SNAPSHOT_PREFIX: &str = "keepvault-";
pub const SNAPSHOT_EXTENSION: &str = ".inventory";

const NAME_FORMAT: &str = "%Y-%m-%d %H-%M-%S";
const MAX_NAME_SUFFIX: u32 = 999;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub size: u64,
    pub hash: ContentHash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderNode {
    pub name: String,
    #[serde(default)]
    pub folders: Vec<FolderNode>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// A file of a snapshot together with its `/`-joined path relative to the
/// folder it was listed from.
#[derive(Debug, Clone)]
pub struct ListedFile<'a> {
    pub path: String,
    pub entry: &'a FileEntry,
}

impl ListedFile<'_> {
    /// The listed path as a platform path, for joining onto a restore target.
    pub fn relative_path(&self) -> PathBuf {
        self.path.split('/').collect()
    }
}

impl FolderNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folders: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Every file below this folder, paths relative to it.
    pub fn all_files(&self) -> Vec<ListedFile<'_>> {
        let mut files = Vec::new();
        self.collect_files("", &mut files);
        files
    }

    fn collect_files<'a>(&'a self, prefix: &str, out: &mut Vec<ListedFile<'a>>) {
        for file in &self.files {
            out.push(ListedFile {
                path: join(prefix, &file.name),
                entry: file,
            });
        }
        for folder in &self.folders {
            folder.collect_files(&join(prefix, &folder.name), out);
        }
    }

    pub fn folder(&self, name: &str) -> Option<&FolderNode> {
        self.folders.iter().find(|f| f.name == name)
    }

    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Walks to the folder at `components`, creating missing ones.
    pub fn folder_mut(&mut self, components: &[String]) -> &mut FolderNode {
        let mut node = self;
        for name in components {
            let index = match node.folders.iter().position(|f| &f.name == name) {
                Some(index) => index,
                None => {
                    node.folders.push(FolderNode::new(name.clone()));
                    node.folders.len() - 1
                }
            };
            node = &mut node.folders[index];
        }
        node
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// An immutable inventory of a directory tree at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_root: Option<PathBuf>,
    pub root: FolderNode,
}

impl Snapshot {
    pub fn new(root: FolderNode, created: DateTime<Utc>) -> Self {
        Self {
            created,
            source_root: None,
            root,
        }
    }

    pub fn all_files(&self) -> Vec<ListedFile<'_>> {
        self.root.all_files()
    }

    /// Folder at a `/`-delimited path; the empty path is the root. Names are
    /// matched case-sensitively.
    pub fn subfolder_by_path(&self, path: &str) -> Result<&FolderNode> {
        let mut node = &self.root;
        for name in components(path) {
            node = node.folder(name).ok_or_else(|| Error::PathNotFound {
                path: path.to_string(),
            })?;
        }
        Ok(node)
    }

    pub fn file_by_path(&self, path: &str) -> Result<&FileEntry> {
        let not_found = || Error::PathNotFound {
            path: path.to_string(),
        };

        let (folder, name) = match path.trim_matches('/').rsplit_once('/') {
            Some((folder, name)) => (self.subfolder_by_path(folder).map_err(|_| not_found())?, name),
            None => (&self.root, path.trim_matches('/')),
        };
        folder.file(name).ok_or_else(not_found)
    }

    pub fn file_count(&self) -> usize {
        self.all_files().len()
    }

    pub fn total_size(&self) -> u64 {
        self.all_files().iter().map(|f| f.entry.size).sum()
    }

    /// `keepvault-YYYY-MM-DD HH-MM-SS.inventory`
    pub fn file_name(&self) -> String {
        format!(
            "{}{}{}",
            SNAPSHOT_PREFIX,
            self.created.format(NAME_FORMAT),
            SNAPSHOT_EXTENSION
        )
    }

    /// Writes the snapshot into `dir` without replacing an existing one. A
    /// second snapshot from the same second gets a numbered name that still
    /// lists as the newer of the two.
    pub async fn save(&self, dir: &Path) -> Result<PathBuf> {
        let data = serde_json::to_vec_pretty(self)?;

        for attempt in 0..=MAX_NAME_SUFFIX {
            let path = dir.join(self.numbered_file_name(attempt));
            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("{} already exists", path.display());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            file.write_all(&data).await?;
            file.sync_all().await?;

            info!("saved snapshot {}", path.display());
            return Ok(path);
        }

        Err(Error::Other(format!(
            "too many snapshots named {} in {}",
            self.file_name(),
            dir.display()
        )))
    }

    fn numbered_file_name(&self, n: u32) -> String {
        if n == 0 {
            return self.file_name();
        }
        format!(
            "{}{}_{:03}{}",
            SNAPSHOT_PREFIX,
            self.created.format(NAME_FORMAT),
            n,
            SNAPSHOT_EXTENSION
        )
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Snapshot files directly inside `dir`, newest first.
    pub async fn list(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() && is_snapshot_file(&entry.file_name()) {
                found.push(entry.path());
            }
        }
        // The timestamp in the name sorts lexicographically.
        found.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        Ok(found)
    }

    pub async fn load_all(dir: &Path) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        for path in Self::list(dir).await? {
            snapshots.push(Self::load(&path).await?);
        }
        Ok(snapshots)
    }

    /// Inventories the tree under `root`. Files whose path, size and
    /// timestamps match `previous` keep its hash; the rest are hashed.
    pub async fn scan(
        root: &Path,
        options: &ScanOptions,
        previous: Option<&Snapshot>,
        scheduler: &Scheduler,
        parallelism: usize,
    ) -> Result<Snapshot> {
        let metadata = fs::metadata(root).await.map_err(|_| Error::PathNotFound {
            path: root.display().to_string(),
        })?;
        if !metadata.is_dir() {
            return Err(Error::PathNotFound {
                path: root.display().to_string(),
            });
        }

        let created = Utc::now();
        let walk_root = root.to_path_buf();
        let walk_options = options.clone();
        let scanned = task::spawn_blocking(move || walk(&walk_root, &walk_options)).await?;

        let known: HashMap<String, &FileEntry> = previous
            .map(|s| s.all_files().into_iter().map(|f| (f.path, f.entry)).collect())
            .unwrap_or_default();

        let mut tree = FolderNode::new("");
        let mut jobs = Vec::new();
        let mut reused = 0usize;

        for item in scanned {
            match item {
                Scanned::Folder(path) => {
                    tree.folder_mut(&path);
                }
                Scanned::File(file) => {
                    let key = file.components.join("/");
                    match known.get(&key) {
                        Some(entry)
                            if entry.size == file.size
                                && entry.created == file.created
                                && entry.modified == file.modified =>
                        {
                            reused += 1;
                            let size = file.size;
                            file.insert_into(&mut tree, entry.hash, size);
                        }
                        _ => jobs.push(HashJob { file, label: key }),
                    }
                }
            }
        }

        info!(
            "scanned {}: {} hashes reused, {} files to hash",
            root.display(),
            reused,
            jobs.len()
        );

        let report = scheduler.run(jobs, parallelism).await?;
        if report.failed > 0 {
            warn!("{} files could not be hashed and are left out", report.failed);
        }
        for (file, hash, size) in report.outputs {
            file.insert_into(&mut tree, hash, size);
        }

        Ok(Snapshot {
            created,
            source_root: Some(root.to_path_buf()),
            root: tree,
        })
    }
}

pub fn is_snapshot_file(name: &OsStr) -> bool {
    name.to_str()
        .is_some_and(|n| n.starts_with(SNAPSHOT_PREFIX) && n.ends_with(SNAPSHOT_EXTENSION))
}

#[derive(Debug)]
enum Scanned {
    Folder(Vec<String>),
    File(ScannedFile),
}

#[derive(Debug)]
struct ScannedFile {
    path: PathBuf,
    components: Vec<String>,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
    size: u64,
}

impl ScannedFile {
    fn insert_into(self, tree: &mut FolderNode, hash: ContentHash, size: u64) {
        let Some((name, dirs)) = self.components.split_last() else {
            return;
        };
        tree.folder_mut(dirs).files.push(FileEntry {
            name: name.clone(),
            created: self.created,
            modified: self.modified,
            size,
            hash,
        });
    }
}

fn walk(root: &Path, options: &ScanOptions) -> Vec<Scanned> {
    let mut found = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && excluded_dir(e.file_name(), options)));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry: {}", e);
                continue;
            }
        };

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let components: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();

        if entry.file_type().is_dir() {
            found.push(Scanned::Folder(components));
            continue;
        }
        if !entry.file_type().is_file() {
            debug!("skipping non-regular file {}", entry.path().display());
            continue;
        }
        if excluded_file(entry.file_name(), options) {
            debug!("excluded {}", entry.path().display());
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let modified = match metadata.modified() {
            Ok(time) => DateTime::<Utc>::from(time),
            Err(e) => {
                warn!("skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let created = metadata.created().map(DateTime::<Utc>::from).unwrap_or(modified);

        found.push(Scanned::File(ScannedFile {
            path: entry.into_path(),
            components,
            created,
            modified,
            size: metadata.len(),
        }));
    }

    found
}

fn excluded_dir(name: &OsStr, options: &ScanOptions) -> bool {
    let name = name.to_string_lossy();
    options
        .exclude_dir_suffixes
        .iter()
        .any(|suffix| name.ends_with(suffix.as_str()))
}

fn excluded_file(name: &OsStr, options: &ScanOptions) -> bool {
    is_snapshot_file(name)
        || options
            .exclude_file_names
            .iter()
            .any(|excluded| name.to_string_lossy().eq_ignore_ascii_case(excluded))
}

struct HashJob {
    file: ScannedFile,
    label: String,
}

#[async_trait]
impl Job for HashJob {
    type Output = (ScannedFile, ContentHash, u64);

    fn size(&self) -> u64 {
        self.file.size
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn hash(&self) -> String {
        String::new()
    }

    async fn run(self) -> Result<Self::Output> {
        let path = self.file.path.clone();
        let (hash, size) = task::spawn_blocking(move || hash_file(path)).await??;
        if size != self.file.size {
            warn!(
                "{} changed while hashing ({} -> {} bytes)",
                self.label, self.file.size, size
            );
        }
        Ok((self.file, hash, size))
    }
}

#[cfg(test)]
pub(crate) fn entry(name: &str, content: &[u8]) -> FileEntry {
    use chrono::TimeZone;
    let time = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
    FileEntry {
        name: name.to_string(),
        created: time,
        modified: time,
        size: content.len() as u64,
        hash: ContentHash::from_data(content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sample() -> Snapshot {
        let mut root = FolderNode::new("");
        root.files.push(entry("top.txt", b"top"));
        let docs = root.folder_mut(&["docs".to_string()]);
        docs.files.push(entry("a.txt", b"a"));
        let deep = docs.folder_mut(&["deep".to_string()]);
        deep.files.push(entry("b.txt", b"b"));
        root.folder_mut(&["empty".to_string()]);

        Snapshot::new(root, Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap())
    }

    #[test]
    fn test_all_files_paths() {
        let snapshot = sample();
        let mut paths: Vec<String> = snapshot.all_files().into_iter().map(|f| f.path).collect();
        paths.sort();
        assert_eq!(paths, vec!["docs/a.txt", "docs/deep/b.txt", "top.txt"]);
        assert_eq!(snapshot.file_count(), 3);
        assert_eq!(snapshot.total_size(), 5);
    }

    #[test]
    fn test_lookup_by_path() {
        let snapshot = sample();

        let docs = snapshot.subfolder_by_path("docs").unwrap();
        let mut paths: Vec<String> = docs.all_files().into_iter().map(|f| f.path).collect();
        paths.sort();
        assert_eq!(paths, vec!["a.txt", "deep/b.txt"]);

        assert_eq!(snapshot.subfolder_by_path("/docs/deep/").unwrap().name, "deep");
        assert_eq!(snapshot.subfolder_by_path("").unwrap(), &snapshot.root);
        assert!(matches!(
            snapshot.subfolder_by_path("Docs"),
            Err(Error::PathNotFound { .. })
        ));

        assert_eq!(snapshot.file_by_path("docs/deep/b.txt").unwrap().name, "b.txt");
        assert_eq!(snapshot.file_by_path("top.txt").unwrap().size, 3);
        assert!(snapshot.file_by_path("docs/missing.txt").is_err());
        assert!(snapshot.file_by_path("nowhere/b.txt").is_err());
    }

    #[test]
    fn test_relative_path() {
        let snapshot = sample();
        let files = snapshot.all_files();
        let deep = files.iter().find(|f| f.path.ends_with("b.txt")).unwrap();
        assert_eq!(deep.relative_path(), Path::new("docs").join("deep").join("b.txt"));
    }

    #[tokio::test]
    async fn test_save_load_and_list_newest_first() {
        let dir = TempDir::new().unwrap();
        let older = sample();
        let mut newer = sample();
        newer.created = older.created + chrono::Duration::days(1);

        older.save(dir.path()).await.unwrap();
        let newer_path = newer.save(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(older.file_name(), "keepvault-2024-06-01 12-30-00.inventory");

        let listed = Snapshot::list(dir.path()).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], newer_path);

        let loaded = Snapshot::load(&newer_path).await.unwrap();
        assert_eq!(loaded, newer);

        let all = Snapshot::load_all(dir.path()).await.unwrap();
        assert_eq!(all[1], older);
    }

    #[tokio::test]
    async fn test_save_in_same_second_keeps_both() {
        let dir = TempDir::new().unwrap();
        let first = sample();
        let mut second = sample();
        second.root.files.push(entry("extra.txt", b"extra"));

        let first_path = first.save(dir.path()).await.unwrap();
        let second_path = second.save(dir.path()).await.unwrap();
        assert_ne!(first_path, second_path);
        assert_eq!(
            second_path.file_name().unwrap(),
            "keepvault-2024-06-01 12-30-00_001.inventory"
        );

        assert_eq!(Snapshot::load(&first_path).await.unwrap(), first);
        let listed = Snapshot::list(dir.path()).await.unwrap();
        assert_eq!(listed, vec![second_path, first_path]);
    }

    #[tokio::test]
    async fn test_scan_with_excludes() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/nested")).unwrap();
        std::fs::create_dir_all(root.join("build.cache")).unwrap();
        std::fs::write(root.join("src/main.txt"), b"main").unwrap();
        std::fs::write(root.join("src/nested/leaf.txt"), b"leaf").unwrap();
        std::fs::write(root.join("src/Thumbs.db"), b"thumbs").unwrap();
        std::fs::write(root.join("build.cache/junk.bin"), b"junk").unwrap();
        std::fs::write(root.join("keepvault-2020-01-01 00-00-00.inventory"), b"{}").unwrap();

        let options = ScanOptions {
            exclude_dir_suffixes: vec![".cache".to_string()],
            ..ScanOptions::default()
        };
        let scheduler = Scheduler::new(Duration::from_secs(15));
        let snapshot = Snapshot::scan(root, &options, None, &scheduler, 2).await.unwrap();

        let mut paths: Vec<String> = snapshot.all_files().into_iter().map(|f| f.path).collect();
        paths.sort();
        assert_eq!(paths, vec!["src/main.txt", "src/nested/leaf.txt"]);

        let leaf = snapshot.file_by_path("src/nested/leaf.txt").unwrap();
        assert_eq!(leaf.hash, ContentHash::from_data(b"leaf"));
        assert_eq!(leaf.size, 4);
        assert_eq!(snapshot.source_root.as_deref(), Some(root));
    }

    #[tokio::test]
    async fn test_scan_reuses_unchanged_hashes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("same.txt"), b"same").unwrap();
        std::fs::write(dir.path().join("changed.txt"), b"before").unwrap();

        let scheduler = Scheduler::new(Duration::from_secs(15));
        let options = ScanOptions::default();
        let mut previous = Snapshot::scan(dir.path(), &options, None, &scheduler, 2).await.unwrap();

        // A marker hash can only survive through reuse.
        let marker = ContentHash::from_data(b"marker");
        for file in previous.root.files.iter_mut() {
            file.hash = marker;
        }
        std::fs::write(dir.path().join("changed.txt"), b"after, longer").unwrap();

        let next = Snapshot::scan(dir.path(), &options, Some(&previous), &scheduler, 2)
            .await
            .unwrap();

        assert_eq!(next.file_by_path("same.txt").unwrap().hash, marker);
        assert_eq!(
            next.file_by_path("changed.txt").unwrap().hash,
            ContentHash::from_data(b"after, longer")
        );
    }

    #[tokio::test]
    async fn test_scan_missing_root() {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::new(Duration::from_secs(15));
        let result = Snapshot::scan(
            &dir.path().join("absent"),
            &ScanOptions::default(),
            None,
            &scheduler,
            1,
        )
        .await;
        assert!(matches!(result, Err(Error::PathNotFound { .. })));
    }
}
