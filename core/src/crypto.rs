use crate::{ContentHash, Credentials, Error, KdfParams, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const COPY_BUFFER: usize = 64 * 1024;

/// Key material derived from `(password, salt)`. The same inputs always give
/// the same key and IV, so no per-object key is ever stored.
#[derive(Clone)]
pub struct CipherKey {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl CipherKey {
    pub fn derive(credentials: &Credentials, params: &KdfParams) -> Result<Self> {
        credentials.validate()?;

        let argon2 = Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            Params::new(
                params.memory_kib,
                params.iterations,
                params.parallelism,
                Some(KEY_LEN + IV_LEN),
            )
            .map_err(|e| Error::Encryption(e.to_string()))?,
        );

        // Argon2 wants at least 8 salt bytes; the configured salt is free text.
        let salt = Sha256::digest(credentials.salt.as_bytes());

        let mut output = [0u8; KEY_LEN + IV_LEN];
        argon2
            .hash_password_into(credentials.password.as_bytes(), &salt, &mut output)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        key.copy_from_slice(&output[..KEY_LEN]);
        iv.copy_from_slice(&output[KEY_LEN..]);
        Ok(Self { key, iv })
    }

    /// Keystream for one stored object. The nonce mixes the object's source
    /// hash into the derived IV so two objects never share a keystream.
    pub fn object_stream(&self, object: &ContentHash) -> ObjectStream {
        ObjectStream::new(self.key, self.object_nonce(object), SEGMENT_LEN)
    }

    #[cfg(test)]
    fn object_stream_with_segments(&self, object: &ContentHash, segment_len: u64) -> ObjectStream {
        ObjectStream::new(self.key, self.object_nonce(object), segment_len)
    }

    fn object_nonce(&self, object: &ContentHash) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        for (n, h) in nonce.iter_mut().zip(object.as_bytes()) {
            *n ^= h;
        }
        nonce
    }
}

/// Bytes of keystream taken from one ChaCha20 instance. Its 32-bit block
/// counter is exhausted at 256 GiB.
const SEGMENT_LEN: u64 = 1 << 36;

/// ChaCha20 keystream for objects of any length. The stream is cut into
/// segments; the first uses the object nonce directly and segment `k` uses
/// the first 12 bytes of `SHA-256(nonce || k)`.
pub struct ObjectStream {
    key: [u8; KEY_LEN],
    nonce: [u8; IV_LEN],
    segment: u64,
    segment_len: u64,
    used: u64,
    cipher: ChaCha20,
}

impl ObjectStream {
    fn new(key: [u8; KEY_LEN], nonce: [u8; IV_LEN], segment_len: u64) -> Self {
        let cipher = ChaCha20::new(Key::from_slice(&key), Nonce::from_slice(&nonce));
        Self {
            key,
            nonce,
            segment: 0,
            segment_len,
            used: 0,
            cipher,
        }
    }

    pub fn apply_keystream(&mut self, mut data: &mut [u8]) {
        while !data.is_empty() {
            if self.used == self.segment_len {
                self.next_segment();
            }
            let room = (self.segment_len - self.used).min(data.len() as u64) as usize;
            let (head, tail) = std::mem::take(&mut data).split_at_mut(room);
            self.cipher.apply_keystream(head);
            self.used += room as u64;
            data = tail;
        }
    }

    fn next_segment(&mut self) {
        self.segment += 1;
        self.used = 0;
        let digest = Sha256::new()
            .chain_update(self.nonce)
            .chain_update(self.segment.to_le_bytes())
            .finalize();
        self.cipher = ChaCha20::new(
            Key::from_slice(&self.key),
            Nonce::from_slice(&digest[..IV_LEN]),
        );
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

/// Encrypts everything written through it into `inner`.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: ObjectStream,
    scratch: Vec<u8>,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(inner: W, cipher: ObjectStream) -> Self {
        Self {
            inner,
            cipher,
            scratch: Vec::with_capacity(COPY_BUFFER),
        }
    }

    /// Flushes the last bytes and hands back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.cipher.apply_keystream(&mut self.scratch);
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypts everything read from `inner`.
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: ObjectStream,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(inner: R, cipher: ObjectStream) -> Self {
        Self { inner, cipher }
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}

/// Sink that only hashes and counts what passes through.
pub struct HashingWriter {
    hasher: Sha256,
    len: u64,
}

impl HashingWriter {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            len: 0,
        }
    }

    pub fn finish(self) -> (ContentHash, u64) {
        (ContentHash::new(self.hasher.finalize().into()), self.len)
    }
}

impl Default for HashingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        self.len += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<(ContentHash, u64)> {
    let mut sink = HashingWriter::new();
    io::copy(reader, &mut sink)?;
    Ok(sink.finish())
}

pub fn hash_file<P: AsRef<Path>>(path: P) -> io::Result<(ContentHash, u64)> {
    let mut reader = BufReader::with_capacity(COPY_BUFFER, File::open(path)?);
    hash_reader(&mut reader)
}

#[cfg(test)]
pub(crate) fn test_key() -> CipherKey {
    let params = KdfParams {
        memory_kib: 8,
        iterations: 1,
        parallelism: 1,
    };
    CipherKey::derive(&Credentials::new("correct horse", "battery staple"), &params).unwrap()
}
