//! Streaming gzip compression for entry payloads.

use crate::error::{Error, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, ErrorKind, Read, Write};

/// Size of the buffer payloads are streamed through.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Default gzip level.
pub const DEFAULT_LEVEL: u32 = 6;

/// Byte counts from one compressed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressStats {
    /// Uncompressed bytes read from the source.
    pub bytes_in: u64,
    /// Compressed bytes written to the destination.
    pub bytes_out: u64,
}

/// Compress `reader` into `writer` as a single gzip member.
pub fn compress<R: Read, W: Write>(reader: R, writer: W, level: u32) -> Result<CompressStats> {
    let counter = CountingWriter::new(writer);
    let mut encoder = GzEncoder::new(counter, Compression::new(level.min(9)));

    let bytes_in = copy_chunked(reader, &mut encoder)
        .map_err(|e| Error::compression(format!("gzip compression failed: {}", e)))?;

    let counter = encoder
        .finish()
        .map_err(|e| Error::compression(format!("gzip compression failed: {}", e)))?;

    Ok(CompressStats {
        bytes_in,
        bytes_out: counter.count,
    })
}

/// Decompress a gzip stream from `reader` into `writer`.
///
/// Returns the number of decompressed bytes written.
pub fn decompress<R: Read, W: Write>(reader: R, writer: W) -> Result<u64> {
    let decoder = GzDecoder::new(reader);
    copy_chunked(decoder, writer).map_err(|e| match e.kind() {
        ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
            Error::compression(format!("gzip decompression failed: {}", e))
        }
        _ => Error::Io { source: e },
    })
}

/// Copy through a fixed-size buffer, never holding more than one chunk.
pub fn copy_chunked<R: Read, W: Write>(mut reader: R, mut writer: W) -> io::Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }

    writer.flush()?;
    Ok(total)
}

/// Writer adapter counting the bytes that pass through it.
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
