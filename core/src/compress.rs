//! Lossless stream codec for object payloads.
//!
//! Frame layout: `u64 LE plaintext length` followed by a zlib stream (which
//! carries its own header). The length lets the reader verify it recovered
//! exactly what was written.

use crate::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

const HEADER_LEN: usize = 8;
const COPY_BUFFER: usize = 64 * 1024;

/// Compresses `len` bytes from `input` into `output`. Fails if the input does
/// not yield exactly `len` bytes, which happens when a source file changes
/// while it is being stored.
pub fn compress<R: Read, W: Write>(mut input: R, len: u64, mut output: W) -> Result<W> {
    output.write_all(&len.to_le_bytes())?;

    let mut encoder = ZlibEncoder::new(output, Compression::default());
    let copied = io::copy(&mut input, &mut encoder)?;
    let mut output = encoder.finish()?;
    output.flush()?;

    if copied != len {
        return Err(Error::Other(format!(
            "source length changed during compression: expected {} bytes, read {}",
            len, copied
        )));
    }
    Ok(output)
}

/// Decompresses one frame from `input` into `output` and returns the number
/// of plaintext bytes written.
pub fn decompress<R: Read, W: Write>(mut input: R, mut output: W) -> Result<u64> {
    let mut header = [0u8; HEADER_LEN];
    input.read_exact(&mut header).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Format("truncated frame header".to_string()),
        _ => Error::Io(e),
    })?;
    let expected = u64::from_le_bytes(header);

    let mut decoder = ZlibDecoder::new(input);
    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut written = 0u64;

    loop {
        let n = match decoder.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Format(format!("corrupt compressed payload: {}", e))),
        };
        output.write_all(&buffer[..n])?;
        written += n as u64;
    }
    output.flush()?;

    if written != expected {
        return Err(Error::Format(format!(
            "frame announced {} bytes but decoded {}",
            expected, written
        )));
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let compressed = compress(Cursor::new(data), data.len() as u64, Vec::new()).unwrap();
        let mut restored = Vec::new();
        let n = decompress(Cursor::new(compressed), &mut restored).unwrap();
        assert_eq!(n, data.len() as u64);
        restored
    }

    #[test]
    fn test_roundtrip() {
        assert_eq!(roundtrip(b""), b"");
        assert_eq!(roundtrip(b"x"), b"x");

        let text = b"the quick brown fox jumps over the lazy dog ".repeat(500);
        assert_eq!(roundtrip(&text), text);
    }

    #[test]
    fn test_header_carries_length() {
        let data = vec![7u8; 1234];
        let compressed = compress(Cursor::new(&data), data.len() as u64, Vec::new()).unwrap();
        assert_eq!(u64::from_le_bytes(compressed[..8].try_into().unwrap()), 1234);
        assert!(compressed.len() < data.len());
    }

    #[test]
    fn test_truncated_header_is_format_error() {
        let result = decompress(Cursor::new(vec![1u8, 2, 3]), Vec::new());
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn test_corrupt_payload_is_format_error() {
        let mut frame = 10u64.to_le_bytes().to_vec();
        frame.extend_from_slice(b"definitely not zlib");
        let result = decompress(Cursor::new(frame), Vec::new());
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn test_short_source_is_rejected() {
        let result = compress(Cursor::new(vec![0u8; 10]), 20, Vec::new());
        assert!(result.is_err());
    }
}
