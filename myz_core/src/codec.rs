//! Archive encoding and decoding.
//!
//! An archive is laid out as header, data section, metadata section:
//!
//! ```text
//! +--------+----------------------------+--------------------------+
//! | header | file payloads, in catalog  | node records, in catalog |
//! |        | order (some gzip members)  | order                    |
//! +--------+----------------------------+--------------------------+
//! 0        12                           metadata_offset            EOF
//! ```
//!
//! Metadata follows the data so each payload's stored length is known by the
//! time its record is written, in a single pass over the sources.

use crate::catalog::Catalog;
use crate::compress;
use crate::error::{Error, Result};
use crate::header::{HEADER_SIZE, Header};
use crate::node::{Node, NodeKind};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::debug;

/// Options for writing archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveOptions {
    /// Compress newly added payloads with gzip.
    pub compress: bool,
    /// gzip level, 0 (store) to 9 (best).
    pub level: u32,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compress: false,
            level: compress::DEFAULT_LEVEL,
        }
    }
}

impl ArchiveOptions {
    /// Enable or disable compression of new payloads.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the gzip level, clamped to 0..=9.
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }
}

/// Bytes to store for one File node.
pub enum Payload<'a> {
    /// Raw source bytes, compressed on the way in when enabled.
    Source(Box<dyn Read + 'a>),
    /// Bytes already in stored form, copied verbatim.
    Stored(Box<dyn Read + 'a>),
}

/// Supplies the payload of each File node during encoding.
pub trait PayloadProvider {
    /// Open the payload for `node`.
    fn payload(&mut self, node: &Node) -> Result<Payload<'_>>;
}

/// Payloads from fresh source files and, optionally, a previous archive.
///
/// Nodes with a registered source path are read from the filesystem; all
/// other File nodes are copied out of `previous` using their current data
/// range.
#[derive(Debug, Default)]
pub struct Sources {
    paths: HashMap<u64, PathBuf>,
    previous: Option<File>,
}

impl Sources {
    /// Create a provider with no sources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider that copies unregistered payloads from `archive`.
    pub fn with_previous(archive: File) -> Self {
        Self {
            paths: HashMap::new(),
            previous: Some(archive),
        }
    }

    /// Register the source paths of freshly walked nodes.
    pub fn extend(&mut self, sources: impl IntoIterator<Item = (u64, PathBuf)>) {
        self.paths.extend(sources);
    }
}

impl PayloadProvider for Sources {
    fn payload(&mut self, node: &Node) -> Result<Payload<'_>> {
        if let Some(path) = self.paths.get(&node.id) {
            let file = File::open(path).map_err(|e| Error::path_io(path, e))?;
            return Ok(Payload::Source(Box::new(file)));
        }

        let Some(archive) = self.previous.as_mut() else {
            return Err(Error::invalid_node(format!(
                "No payload source for node {} ({})",
                node.id, node.name
            )));
        };

        archive.seek(SeekFrom::Start(node.data_offset))?;
        Ok(Payload::Stored(Box::new(archive.take(node.data_length))))
    }
}

/// Encode a catalog and its payloads into `out`.
///
/// Every File node's `data_offset` and `data_length` are rewritten to
/// describe the new image; freshly sourced nodes also get `size` and
/// `compressed` updated from what was actually stored.
pub fn encode<W, P>(
    catalog: &mut Catalog,
    payloads: &mut P,
    mut out: W,
    options: &ArchiveOptions,
) -> Result<Header>
where
    W: Write + Seek,
    P: PayloadProvider + ?Sized,
{
    out.seek(SeekFrom::Start(0))?;
    out.write_all(&Header::placeholder().encode())?;

    let mut offset = Header::data_start();
    for node in catalog.iter_mut() {
        if node.kind != NodeKind::File {
            node.data_offset = 0;
            node.data_length = 0;
            node.compressed = false;
            continue;
        }

        let (size, length, compressed) = match payloads.payload(node)? {
            Payload::Source(reader) if options.compress => {
                let stats = compress::compress(reader, &mut out, options.level)?;
                (stats.bytes_in, stats.bytes_out, true)
            }
            Payload::Source(reader) => {
                let n = compress::copy_chunked(reader, &mut out)?;
                (n, n, false)
            }
            Payload::Stored(reader) => {
                let n = compress::copy_chunked(reader, &mut out)?;
                if n != node.data_length {
                    return Err(Error::format(format!(
                        "Stored payload of {} is {} bytes, expected {}",
                        node.name, n, node.data_length
                    )));
                }
                (node.size, n, node.compressed)
            }
        };

        debug!(
            id = node.id,
            name = %node.name,
            offset,
            length,
            compressed,
            "wrote payload"
        );

        node.size = size;
        node.data_offset = offset;
        node.data_length = length;
        node.compressed = compressed;
        offset += length;
    }

    let header = Header::new(offset);
    for node in catalog.iter() {
        out.write_all(&node.encode()?)?;
    }

    out.seek(SeekFrom::Start(0))?;
    out.write_all(&header.encode())?;
    out.flush()?;

    Ok(header)
}

/// Decode the catalog of an archive.
///
/// Payloads are not read; use each node's data range to fetch them.
pub fn decode<R: Read + Seek>(mut reader: R) -> Result<Catalog> {
    let archive_len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::format(format!(
            "Truncated header: archive is {} bytes",
            archive_len
        )),
        _ => Error::Io { source: e },
    })?;

    let header = Header::decode(&buf)?;
    header.validate(archive_len)?;

    reader.seek(SeekFrom::Start(header.metadata_offset))?;
    let mut records = BufReader::new(reader);

    let mut catalog = Catalog::new();
    while let Some(node) = Node::decode(&mut records)? {
        check_data_range(&node, &header)?;
        catalog.push_decoded(node)?;
    }

    check_no_overlap(&catalog)?;

    debug!(
        nodes = catalog.len(),
        metadata_offset = header.metadata_offset,
        "decoded archive"
    );
    Ok(catalog)
}

fn check_data_range(node: &Node, header: &Header) -> Result<()> {
    if node.kind != NodeKind::File {
        return Ok(());
    }

    let end = node.data_offset.checked_add(node.data_length);
    if node.data_offset < Header::data_start() || end.is_none_or(|e| e > header.metadata_offset)
    {
        return Err(Error::format(format!(
            "Data range of node {} ({}+{}) outside data section [{}, {})",
            node.id,
            node.data_offset,
            node.data_length,
            Header::data_start(),
            header.metadata_offset
        )));
    }
    Ok(())
}

fn check_no_overlap(catalog: &Catalog) -> Result<()> {
    let mut ranges: Vec<(u64, u64, u64)> = catalog
        .iter()
        .filter(|n| n.kind == NodeKind::File && n.data_length > 0)
        .map(|n| (n.data_offset, n.data_offset + n.data_length, n.id))
        .collect();
    ranges.sort_unstable();

    for pair in ranges.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(Error::format(format!(
                "Data ranges of nodes {} and {} overlap",
                pair[0].2, pair[1].2
            )));
        }
    }
    Ok(())
}
