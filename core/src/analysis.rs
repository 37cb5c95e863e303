use crate::manifest::ManifestEntry;
use crate::snapshot::Snapshot;
use crate::ContentHash;
use std::collections::{BTreeMap, HashMap, HashSet};

pub const LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// What dropping one snapshot would free on the next garbage collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotImpact {
    pub snapshot: String,
    pub files: usize,
    pub unique_hashes: usize,
    pub source_bytes: u64,
    pub target_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub snapshot: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LargeFile {
    pub hash: ContentHash,
    pub size: u64,
    pub occurrences: Vec<Occurrence>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub hash: ContentHash,
    pub size: u64,
    pub paths: Vec<String>,
}

impl DuplicateGroup {
    /// Bytes taken by every copy past the first.
    pub fn wasted(&self) -> u64 {
        self.size * (self.paths.len() as u64).saturating_sub(1)
    }
}

/// For each snapshot, the content no other snapshot references. Hashes the
/// manifest does not know count with their snapshot size and no stored bytes.
pub fn garbage_impact(snapshots: &[Snapshot], entries: &[ManifestEntry]) -> Vec<SnapshotImpact> {
    let stored: HashMap<ContentHash, &ManifestEntry> =
        entries.iter().map(|e| (e.source_hash, e)).collect();

    let per_snapshot: Vec<HashMap<ContentHash, u64>> = snapshots
        .iter()
        .map(|s| {
            s.all_files()
                .into_iter()
                .map(|f| (f.entry.hash, f.entry.size))
                .collect()
        })
        .collect();

    let mut references: HashMap<ContentHash, usize> = HashMap::new();
    for hashes in &per_snapshot {
        for hash in hashes.keys() {
            *references.entry(*hash).or_default() += 1;
        }
    }

    snapshots
        .iter()
        .zip(&per_snapshot)
        .map(|(snapshot, hashes)| {
            let mut impact = SnapshotImpact {
                snapshot: snapshot.file_name(),
                files: snapshot.file_count(),
                unique_hashes: 0,
                source_bytes: 0,
                target_bytes: 0,
            };
            for (hash, size) in hashes {
                if references.get(hash) != Some(&1) {
                    continue;
                }
                impact.unique_hashes += 1;
                match stored.get(hash) {
                    Some(entry) => {
                        impact.source_bytes += entry.source_size;
                        impact.target_bytes += entry.target_size;
                    }
                    None => impact.source_bytes += size,
                }
            }
            impact
        })
        .collect()
}

/// Content of at least `threshold` bytes across all snapshots, largest first,
/// with every place it appears.
pub fn large_files(snapshots: &[Snapshot], threshold: u64) -> Vec<LargeFile> {
    let mut found: BTreeMap<ContentHash, LargeFile> = BTreeMap::new();

    for snapshot in snapshots {
        let name = snapshot.file_name();
        for file in snapshot.all_files() {
            if file.entry.size < threshold {
                continue;
            }
            found
                .entry(file.entry.hash)
                .or_insert_with(|| LargeFile {
                    hash: file.entry.hash,
                    size: file.entry.size,
                    occurrences: Vec::new(),
                })
                .occurrences
                .push(Occurrence {
                    snapshot: name.clone(),
                    path: file.path,
                });
        }
    }

    let mut large: Vec<_> = found.into_values().collect();
    large.sort_by(|a, b| b.size.cmp(&a.size).then(a.hash.cmp(&b.hash)));
    large
}

/// Content stored under more than one path of `snapshot`, most wasteful first.
pub fn duplicates(snapshot: &Snapshot) -> Vec<DuplicateGroup> {
    let mut groups: HashMap<ContentHash, DuplicateGroup> = HashMap::new();
    for file in snapshot.all_files() {
        groups
            .entry(file.entry.hash)
            .or_insert_with(|| DuplicateGroup {
                hash: file.entry.hash,
                size: file.entry.size,
                paths: Vec::new(),
            })
            .paths
            .push(file.path);
    }

    let mut duplicates: Vec<_> = groups
        .into_values()
        .filter(|g| g.paths.len() > 1)
        .map(|mut g| {
            g.paths.sort();
            g
        })
        .collect();
    duplicates.sort_by(|a, b| b.wasted().cmp(&a.wasted()).then(a.hash.cmp(&b.hash)));
    duplicates
}

/// A path in a comparison. `overwritten` is set when the same path holds
/// different content on the other side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub path: String,
    pub overwritten: bool,
}

/// Content found on only one side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    pub hash: ContentHash,
    pub size: u64,
    pub paths: Vec<PathChange>,
}

/// Content present on both sides under a different set of paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedContent {
    pub hash: ContentHash,
    pub size: u64,
    pub removed: Vec<PathChange>,
    pub added: Vec<PathChange>,
    pub unchanged: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Comparison {
    pub vanished: Vec<ContentChange>,
    pub added: Vec<ContentChange>,
    pub moved: Vec<MovedContent>,
}

impl Comparison {
    pub fn is_empty(&self) -> bool {
        self.vanished.is_empty() && self.added.is_empty() && self.moved.is_empty()
    }
}

struct ContentIndex {
    by_hash: BTreeMap<ContentHash, (u64, Vec<String>)>,
    paths: HashSet<String>,
}

impl ContentIndex {
    fn of(snapshot: &Snapshot) -> Self {
        let mut by_hash: BTreeMap<ContentHash, (u64, Vec<String>)> = BTreeMap::new();
        let mut paths = HashSet::new();
        for file in snapshot.all_files() {
            paths.insert(file.path.clone());
            by_hash
                .entry(file.entry.hash)
                .or_insert_with(|| (file.entry.size, Vec::new()))
                .1
                .push(file.path);
        }
        for (_, group) in by_hash.values_mut() {
            group.sort();
        }
        Self { by_hash, paths }
    }

    fn changes(&self, paths: &[String]) -> Vec<PathChange> {
        paths
            .iter()
            .map(|path| PathChange {
                path: path.clone(),
                overwritten: self.paths.contains(path),
            })
            .collect()
    }
}

/// Content-level differences from `older` to `newer`: content that vanished,
/// content that is new, and content that moved between paths. A path that
/// only changed content shows up on both the vanished and the new side.
pub fn compare(older: &Snapshot, newer: &Snapshot) -> Comparison {
    let a = ContentIndex::of(older);
    let b = ContentIndex::of(newer);
    let mut comparison = Comparison::default();

    for (hash, (size, paths)) in &a.by_hash {
        match b.by_hash.get(hash) {
            None => comparison.vanished.push(ContentChange {
                hash: *hash,
                size: *size,
                paths: b.changes(paths),
            }),
            Some((_, new_paths)) if new_paths != paths => {
                let removed: Vec<String> =
                    paths.iter().filter(|p| !new_paths.contains(*p)).cloned().collect();
                let added: Vec<String> =
                    new_paths.iter().filter(|p| !paths.contains(*p)).cloned().collect();
                comparison.moved.push(MovedContent {
                    hash: *hash,
                    size: *size,
                    removed: b.changes(&removed),
                    added: a.changes(&added),
                    unchanged: paths.iter().filter(|p| new_paths.contains(*p)).cloned().collect(),
                });
            }
            Some(_) => {}
        }
    }

    for (hash, (size, paths)) in &b.by_hash {
        if !a.by_hash.contains_key(hash) {
            comparison.added.push(ContentChange {
                hash: *hash,
                size: *size,
                paths: a.changes(paths),
            });
        }
    }

    comparison
}

/// Distinct content hashes referenced by any of `snapshots`.
pub fn referenced_hashes(snapshots: &[Snapshot]) -> HashSet<ContentHash> {
    snapshots
        .iter()
        .flat_map(|s| s.all_files().into_iter().map(|f| f.entry.hash))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{entry, FolderNode};
    use chrono::{TimeZone, Utc};

    fn snapshot(day: u32, files: &[(&str, &[u8])]) -> Snapshot {
        let mut root = FolderNode::new("");
        for (path, content) in files {
            let parts: Vec<String> = path.split('/').map(str::to_string).collect();
            let (name, dirs) = parts.split_last().unwrap();
            root.folder_mut(dirs).files.push(entry(name, content));
        }
        Snapshot::new(root, Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap())
    }

    fn manifest_entry(content: &[u8], target_size: u64) -> ManifestEntry {
        ManifestEntry {
            source_hash: ContentHash::from_data(content),
            target_hash: ContentHash::from_data(b"whatever"),
            source_size: content.len() as u64,
            target_size,
            partition: 0,
        }
    }

    #[test]
    fn test_garbage_impact() {
        let s1 = snapshot(1, &[("h1", b"one"), ("h2", b"two!")]);
        let s2 = snapshot(2, &[("h2", b"two!"), ("x/h3", b"three")]);
        let entries = vec![manifest_entry(b"one", 10), manifest_entry(b"two!", 20)];

        let impact = garbage_impact(&[s1, s2], &entries);
        assert_eq!(impact.len(), 2);

        assert_eq!(impact[0].unique_hashes, 1);
        assert_eq!(impact[0].source_bytes, 3);
        assert_eq!(impact[0].target_bytes, 10);

        // h3 is not in the manifest: counted by its snapshot size only.
        assert_eq!(impact[1].unique_hashes, 1);
        assert_eq!(impact[1].source_bytes, 5);
        assert_eq!(impact[1].target_bytes, 0);
    }

    #[test]
    fn test_large_files() {
        let big = vec![1u8; 64];
        let bigger = vec![2u8; 128];
        let s1 = snapshot(1, &[("a/big", big.as_slice()), ("small", b"s")]);
        let s2 = snapshot(2, &[("b/big-copy", big.as_slice()), ("bigger", bigger.as_slice())]);

        let large = large_files(&[s1, s2], 64);
        assert_eq!(large.len(), 2);
        assert_eq!(large[0].size, 128);
        assert_eq!(large[1].occurrences.len(), 2);
        assert_eq!(large[1].occurrences[0].path, "a/big");
        assert_eq!(large[1].occurrences[1].path, "b/big-copy");
    }

    #[test]
    fn test_duplicates_within_snapshot() {
        let s = snapshot(
            1,
            &[
                ("a/readme", b"same text"),
                ("b/readme", b"same text"),
                ("c/readme", b"same text"),
                ("d/pair", b"xy"),
                ("e/pair", b"xy"),
                ("unique", b"only once"),
            ],
        );

        let groups = duplicates(&s);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].paths, vec!["a/readme", "b/readme", "c/readme"]);
        assert_eq!(groups[0].wasted(), 18);
        assert_eq!(groups[1].wasted(), 2);
    }

    #[test]
    fn test_compare_snapshots() {
        let older = snapshot(
            1,
            &[
                ("gone", b"deleted content"),
                ("edited", b"first draft"),
                ("docs/a", b"shared"),
                ("docs/b", b"shared"),
                ("docs/c", b"shared"),
                ("stable", b"untouched"),
                ("replaced", b"old body"),
            ],
        );
        let newer = snapshot(
            2,
            &[
                ("edited", b"second draft"),
                ("docs/a", b"shared"),
                ("docs/c", b"new body"),
                ("archive/b", b"shared"),
                ("stable", b"untouched"),
                ("fresh", b"brand new"),
                ("replaced", b"shared"),
            ],
        );

        let diff = compare(&older, &newer);
        assert!(!diff.is_empty());

        let vanished: Vec<_> = diff.vanished.iter().flat_map(|c| &c.paths).collect();
        assert_eq!(vanished.len(), 3);
        let gone = vanished.iter().find(|p| p.path == "gone").unwrap();
        assert!(!gone.overwritten);
        assert!(vanished.iter().find(|p| p.path == "edited").unwrap().overwritten);
        assert!(vanished.iter().find(|p| p.path == "replaced").unwrap().overwritten);

        let added: Vec<_> = diff.added.iter().flat_map(|c| &c.paths).collect();
        assert_eq!(added.len(), 3);
        assert!(!added.iter().find(|p| p.path == "fresh").unwrap().overwritten);
        assert!(added.iter().find(|p| p.path == "edited").unwrap().overwritten);
        assert!(added.iter().find(|p| p.path == "docs/c").unwrap().overwritten);
        let fresh = diff.added.iter().find(|c| c.paths[0].path == "fresh").unwrap();
        assert_eq!(fresh.hash, ContentHash::from_data(b"brand new"));
        assert_eq!(fresh.size, 9);

        assert_eq!(diff.moved.len(), 1);
        let moved = &diff.moved[0];
        assert_eq!(moved.hash, ContentHash::from_data(b"shared"));
        assert_eq!(
            moved.removed,
            vec![
                PathChange { path: "docs/b".to_string(), overwritten: false },
                PathChange { path: "docs/c".to_string(), overwritten: true },
            ]
        );
        assert_eq!(
            moved.added,
            vec![
                PathChange { path: "archive/b".to_string(), overwritten: false },
                PathChange { path: "replaced".to_string(), overwritten: true },
            ]
        );
        assert_eq!(moved.unchanged, vec!["docs/a"]);

        assert!(compare(&older, &older).is_empty());
    }

    #[test]
    fn test_referenced_hashes() {
        let s1 = snapshot(1, &[("a", b"a"), ("b", b"b")]);
        let s2 = snapshot(2, &[("b", b"b")]);
        assert_eq!(referenced_hashes(&[s1, s2]).len(), 2);
    }
}
