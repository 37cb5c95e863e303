use crate::compress::{compress, decompress};
use crate::config::{RestoreSizePolicy, StorageOptions, TransferOptions};
use crate::crypto::{hash_file, CipherKey, DecryptReader, EncryptWriter, HashingWriter};
use crate::partition::{ObjectPaths, PENDING_EXTENSION};
use crate::retry::{retry, RetryConfig};
use crate::{ContentHash, Error, Result};
use chrono::{DateTime, Utc};
use std::fs::{File, FileTimes, OpenOptions};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::{fs, task};
use tracing::{debug, error};

const COPY_BUFFER: usize = 1024 * 1024;

/// Buffering strategy of a transfer, picked from the plaintext size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    /// Compressed and encrypted bytes stay in memory.
    Small,
    /// Compressed bytes go to a temp file, encrypted bytes stay in memory.
    Medium,
    /// Both stages go through disk.
    Large,
}

impl SizeClass {
    pub fn of(size: u64, options: &TransferOptions) -> Self {
        if size <= options.small_max_bytes {
            SizeClass::Small
        } else if size <= options.medium_max_bytes {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }

    fn spools_compressed(self) -> bool {
        self != SizeClass::Small
    }

    fn spools_encrypted(self) -> bool {
        self == SizeClass::Large
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Store,
    Retrieve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimestamps {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Stored { target_hash: ContentHash, target_size: u64 },
    Retrieved { size: u64 },
}

/// Everything transfers of one storage share: key material and options.
#[derive(Debug)]
pub struct TransferContext {
    key: CipherKey,
    options: TransferOptions,
    dir_retry: RetryConfig,
    size_policy: RestoreSizePolicy,
}

impl TransferContext {
    pub fn new(key: CipherKey, options: &StorageOptions) -> Self {
        Self {
            key,
            options: options.transfer.clone(),
            dir_retry: options.dir_retry(),
            size_policy: options.restore_size_policy,
        }
    }

    pub fn key(&self) -> &CipherKey {
        &self.key
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn dir_retry(&self) -> &RetryConfig {
        &self.dir_retry
    }
}

/// Moves one file's content into the object store or back out of it.
///
/// Only the pending path is ever written partially. The final path appears
/// through a single rename once the content is complete.
#[derive(Debug)]
pub struct FileTransferJob {
    context: Arc<TransferContext>,
    direction: Direction,
    hash: ContentHash,
    size: u64,
    class: SizeClass,
    from: PathBuf,
    pending: PathBuf,
    target: PathBuf,
    timestamps: Option<FileTimestamps>,
}

impl FileTransferJob {
    /// Job storing the plaintext file `source` (content `hash`, `size` bytes)
    /// as the object at `paths`.
    pub fn store(
        context: Arc<TransferContext>,
        hash: ContentHash,
        size: u64,
        source: PathBuf,
        paths: ObjectPaths,
    ) -> Self {
        let class = SizeClass::of(size, &context.options);
        Self {
            context,
            direction: Direction::Store,
            hash,
            size,
            class,
            from: source,
            pending: paths.pending,
            target: paths.object,
            timestamps: None,
        }
    }

    /// Job restoring the object holding `hash` into the plaintext file `target`.
    pub fn retrieve(
        context: Arc<TransferContext>,
        hash: ContentHash,
        size: u64,
        object: PathBuf,
        target: PathBuf,
        timestamps: FileTimestamps,
    ) -> Self {
        let class = SizeClass::of(size, &context.options);
        let pending = pending_path_for(&target);
        Self {
            context,
            direction: Direction::Retrieve,
            hash,
            size,
            class,
            from: object,
            pending,
            target,
            timestamps: Some(timestamps),
        }
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn size_class(&self) -> SizeClass {
        self.class
    }

    pub fn from(&self) -> &Path {
        &self.from
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub async fn execute(self) -> Result<TransferOutcome> {
        ensure_dir(parent_of(&self.pending)?, &self.context.dir_retry).await?;

        debug!(
            hash = %self.hash,
            class = ?self.class,
            direction = ?self.direction,
            "transferring {}",
            self.from.display()
        );

        let result = match self.direction {
            Direction::Store => self.run_store().await,
            Direction::Retrieve => self.run_retrieve().await,
        };

        if result.is_err() {
            // Best effort; the pending file may never have been created.
            let _ = fs::remove_file(&self.pending).await;
        }
        result
    }

    async fn run_store(&self) -> Result<TransferOutcome> {
        let context = self.context.clone();
        let from = self.from.clone();
        let pending = self.pending.clone();
        let (hash, size, class) = (self.hash, self.size, self.class);

        let (target_hash, target_size) =
            task::spawn_blocking(move || store_object(&context, &from, &pending, &hash, size, class))
                .await??;

        self.publish().await?;
        Ok(TransferOutcome::Stored {
            target_hash,
            target_size,
        })
    }

    async fn run_retrieve(&self) -> Result<TransferOutcome> {
        let context = self.context.clone();
        let from = self.from.clone();
        let pending = self.pending.clone();
        let (hash, class) = (self.hash, self.class);

        let written =
            task::spawn_blocking(move || retrieve_object(&context, &from, &pending, &hash, class))
                .await??;

        // A rejected file must never reach its final path.
        if written != self.size {
            match self.context.size_policy {
                RestoreSizePolicy::Warn => error!(
                    expected = self.size,
                    actual = written,
                    "restored size does not match snapshot for {}",
                    self.target.display()
                ),
                RestoreSizePolicy::Fail => {
                    return Err(Error::Integrity {
                        hash: self.hash.to_hex(),
                        message: format!(
                            "restored {} bytes, snapshot records {}",
                            written, self.size
                        ),
                    });
                }
            }
        }

        self.publish().await?;

        if let Some(timestamps) = self.timestamps {
            let target = self.target.clone();
            task::spawn_blocking(move || apply_timestamps(&target, timestamps)).await??;
        }

        Ok(TransferOutcome::Retrieved { size: written })
    }

    async fn publish(&self) -> Result<()> {
        ensure_dir(parent_of(&self.target)?, &self.context.dir_retry).await?;
        fs::rename(&self.pending, &self.target).await?;
        Ok(())
    }
}

/// Creates `dir` and its parents, retrying transient failures. Exhausting the
/// retries is fatal.
pub async fn ensure_dir(dir: &Path, config: &RetryConfig) -> Result<()> {
    retry(config, "create directory", || fs::create_dir_all(dir))
        .await
        .map_err(|(_, attempts)| Error::DirectoryCreation {
            path: dir.to_path_buf(),
            attempts,
        })
}

/// Decrypts and decompresses the object at `object` without writing anything,
/// returning the hash and length of the recovered plaintext.
pub fn recover_content(key: &CipherKey, object: &Path, hash: &ContentHash) -> Result<(ContentHash, u64)> {
    let source = BufReader::with_capacity(COPY_BUFFER, File::open(object)?);
    let reader = DecryptReader::new(source, key.object_stream(hash));
    let mut sink = HashingWriter::new();
    decompress(reader, &mut sink)?;
    Ok(sink.finish())
}

fn store_object(
    context: &TransferContext,
    from: &Path,
    pending: &Path,
    hash: &ContentHash,
    size: u64,
    class: SizeClass,
) -> Result<(ContentHash, u64)> {
    let source = BufReader::with_capacity(COPY_BUFFER, File::open(from)?);
    let spool = Spool::new(class.spools_compressed(), context.options.temp_dir.as_deref())?;
    let mut compressed = compress(source, size, spool)?;
    compressed.rewind()?;

    let stream = context.key.object_stream(hash);

    if class.spools_encrypted() {
        let output = BufWriter::with_capacity(COPY_BUFFER, File::create(pending)?);
        let mut writer = EncryptWriter::new(output, stream);
        io::copy(&mut compressed, &mut writer)?;
        let file = writer.finish()?.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(compressed);

        Ok(hash_file(pending)?)
    } else {
        let mut writer = EncryptWriter::new(Vec::new(), stream);
        io::copy(&mut compressed, &mut writer)?;
        let encrypted = writer.finish()?;
        drop(compressed);

        let target = (ContentHash::from_data(&encrypted), encrypted.len() as u64);
        let mut file = File::create(pending)?;
        file.write_all(&encrypted)?;
        file.sync_all()?;
        Ok(target)
    }
}

fn retrieve_object(
    context: &TransferContext,
    from: &Path,
    pending: &Path,
    hash: &ContentHash,
    class: SizeClass,
) -> Result<u64> {
    let source = BufReader::with_capacity(COPY_BUFFER, File::open(from)?);
    let mut reader = DecryptReader::new(source, context.key.object_stream(hash));

    let mut decrypted = Spool::new(class.spools_encrypted(), context.options.temp_dir.as_deref())?;
    io::copy(&mut reader, &mut decrypted)?;
    decrypted.rewind()?;

    let mut output = BufWriter::with_capacity(COPY_BUFFER, File::create(pending)?);
    let written = decompress(&mut decrypted, &mut output)?;
    let file = output.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(written)
}

fn apply_timestamps(path: &Path, timestamps: FileTimestamps) -> io::Result<()> {
    let modified = SystemTime::from(timestamps.modified);

    #[allow(unused_mut)]
    let mut times = FileTimes::new().set_accessed(modified).set_modified(modified);

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileTimesExt;
        times = times.set_created(SystemTime::from(timestamps.created));
    }

    OpenOptions::new().write(true).open(path)?.set_times(times)
}

fn pending_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(PENDING_EXTENSION);
    PathBuf::from(name)
}

fn parent_of(path: &Path) -> Result<&Path> {
    path.parent()
        .ok_or_else(|| Error::Other(format!("{} has no parent directory", path.display())))
}

/// Intermediate buffer of a transfer, in memory or in an anonymous temp file
/// that disappears when dropped.
enum Spool {
    Memory(Cursor<Vec<u8>>),
    File(File),
}

impl Spool {
    fn new(on_disk: bool, temp_dir: Option<&Path>) -> io::Result<Self> {
        if !on_disk {
            return Ok(Spool::Memory(Cursor::new(Vec::new())));
        }
        let file = match temp_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Spool::File(file))
    }
}

impl Read for Spool {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Spool::Memory(cursor) => cursor.read(buf),
            Spool::File(file) => file.read(buf),
        }
    }
}

impl Write for Spool {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Spool::Memory(cursor) => cursor.write(buf),
            Spool::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Spool::Memory(cursor) => cursor.flush(),
            Spool::File(file) => file.flush(),
        }
    }
}

impl Seek for Spool {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Spool::Memory(cursor) => cursor.seek(pos),
            Spool::File(file) => file.seek(pos),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_context(options: &StorageOptions) -> Arc<TransferContext> {
    Arc::new(TransferContext::new(crate::crypto::test_key(), options))
}

/// Options with tiny size-class thresholds so every buffering path runs on
/// small inputs.
#[cfg(test)]
pub(crate) fn test_options() -> StorageOptions {
    let mut options = StorageOptions::default();
    options.transfer.small_max_bytes = 64;
    options.transfer.medium_max_bytes = 256;
    options.dir_retry_attempts = 2;
    options.dir_retry_backoff_secs = 0;
    options.pace_interval_secs = 0;
    options
}
