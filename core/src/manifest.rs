use crate::{ContentHash, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const MANIFEST_FILENAME: &str = "keepvault-objectstore.manifest";
pub const SOURCES_FILENAME: &str = "keepvault-objectstore.sources";

const MB: f64 = 1024.0 * 1024.0;

/// One stored object: which plaintext it holds, what the stored bytes hash
/// to, and which partition it was written into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "sha256source")]
    pub source_hash: ContentHash,
    #[serde(rename = "sha256target")]
    pub target_hash: ContentHash,
    #[serde(rename = "sizeSource")]
    pub source_size: u64,
    #[serde(rename = "sizeTarget")]
    pub target_size: u64,
    #[serde(default, skip_serializing_if = "is_main_partition")]
    pub partition: u32,
}

fn is_main_partition(partition: &u32) -> bool {
    *partition == 0
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    #[serde(default)]
    garbage: Vec<ManifestEntry>,
    #[serde(default)]
    objects: Vec<ManifestEntry>,
}

#[derive(Debug)]
struct State {
    ledger: Ledger,
    index: HashMap<ContentHash, u32>,
}

/// The ledger of everything stored in one storage directory.
///
/// Mutations are serialized by one lock and each rewrites the whole ledger
/// file (write to a temp file, then rename) before returning. A plain-text
/// sources log next to it records where each object's content came from.
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    sources_path: PathBuf,
    state: Mutex<State>,
}

impl Manifest {
    pub async fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILENAME);
        let sources_path = dir.join(SOURCES_FILENAME);

        let ledger = if fs::try_exists(&path).await? {
            let data = fs::read(&path).await?;
            serde_json::from_slice::<Ledger>(&data)?
        } else {
            info!("creating new manifest at {}", path.display());
            let ledger = Ledger::default();
            persist(&path, &ledger).await?;
            ledger
        };

        let mut index = HashMap::with_capacity(ledger.objects.len());
        for entry in &ledger.objects {
            if index.insert(entry.source_hash, entry.partition).is_some() {
                return Err(Error::Integrity {
                    hash: entry.source_hash.to_hex(),
                    message: "listed twice in manifest".to_string(),
                });
            }
        }

        log_summary(&ledger.objects);

        Ok(Self {
            path,
            sources_path,
            state: Mutex::new(State { ledger, index }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a freshly stored object. The ledger is durable when this returns.
    pub async fn add(&self, entry: ManifestEntry, source: &Path, timestamp: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.index.contains_key(&entry.source_hash) {
            return Err(Error::Integrity {
                hash: entry.source_hash.to_hex(),
                message: "already present in manifest".to_string(),
            });
        }

        state.ledger.objects.push(entry.clone());
        if let Err(e) = persist(&self.path, &state.ledger).await {
            state.ledger.objects.pop();
            return Err(e);
        }
        state.index.insert(entry.source_hash, entry.partition);

        self.append_sources(&format!(
            "NEW {} {} \"{}\" p{}\n",
            timestamp.to_rfc3339(),
            entry.source_hash,
            source.display(),
            entry.partition
        ))
        .await?;

        debug!(hash = %entry.source_hash, partition = entry.partition, "manifest entry added");
        Ok(())
    }

    /// Logs paths whose content is already stored under another path.
    pub async fn add_alternate_sources(
        &self,
        sources: &[(ContentHash, PathBuf)],
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }

        let _state = self.state.lock().await;
        let time = timestamp.to_rfc3339();
        let mut lines = String::new();
        for (hash, path) in sources {
            lines.push_str(&format!("LOC {} {} \"{}\"\n", time, hash, path.display()));
        }
        self.append_sources(&lines).await
    }

    pub async fn contains(&self, hash: &ContentHash) -> bool {
        self.state.lock().await.index.contains_key(hash)
    }

    pub async fn partition_of(&self, hash: &ContentHash) -> Option<u32> {
        self.state.lock().await.index.get(hash).copied()
    }

    /// Moves the entry for `hash` into the tombstone group.
    pub async fn garbage(&self, hash: &ContentHash, timestamp: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;

        let position = state
            .ledger
            .objects
            .iter()
            .position(|e| e.source_hash == *hash)
            .ok_or_else(|| Error::NotInManifest { hash: hash.to_hex() })?;

        let entry = state.ledger.objects.remove(position);
        state.ledger.garbage.push(entry);

        if let Err(e) = persist(&self.path, &state.ledger).await {
            if let Some(entry) = state.ledger.garbage.pop() {
                state.ledger.objects.insert(position, entry);
            }
            return Err(e);
        }
        state.index.remove(hash);

        self.append_sources(&format!("GAR {} {}\n", timestamp.to_rfc3339(), hash))
            .await
    }

    /// Snapshot of all active entries, in no particular order.
    pub async fn entries(&self) -> Vec<ManifestEntry> {
        self.state.lock().await.ledger.objects.clone()
    }

    pub async fn garbage_entries(&self) -> Vec<ManifestEntry> {
        self.state.lock().await.ledger.garbage.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.index.len()
    }

    async fn append_sources(&self, lines: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.sources_path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

async fn persist(path: &Path, ledger: &Ledger) -> Result<()> {
    let data = serde_json::to_vec_pretty(ledger)?;
    let tmp = path.with_extension("manifest.tmp");

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    Ok(())
}

fn log_summary(objects: &[ManifestEntry]) {
    let source: u64 = objects.iter().map(|e| e.source_size).sum();
    let target: u64 = objects.iter().map(|e| e.target_size).sum();
    let ratio = if source > 0 {
        target as f64 / source as f64 * 100.0
    } else {
        0.0
    };

    info!(
        "manifest: {} objects, {:.2} MB ({:.2} MB compressed) -> {:.2}% ratio",
        objects.len(),
        source as f64 / MB,
        target as f64 / MB,
        ratio
    );
}
