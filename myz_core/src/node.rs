//! Node records: one archived filesystem entry and its on-disk encoding.

use crate::error::{Error, Result};
use serde::Serialize;
use std::io::{ErrorKind, Read};

/// Size of the fixed part of a node record in bytes.
pub const RECORD_FIXED_SIZE: usize = 93;

/// Upper bound on an encoded name.
pub const MAX_NAME_LEN: usize = 4096;

/// Upper bound on an encoded symlink target.
pub const MAX_LINK_TARGET_LEN: usize = 64 * 1024;

/// Bit in the kind byte marking a gzip-compressed payload.
const COMPRESSED_FLAG: u8 = 0x80;

/// Bits in the kind byte holding the node kind.
const KIND_MASK: u8 = 0x0f;

/// Kind of filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A regular file with a payload in the data section.
    File = 1,
    /// A directory.
    Directory = 2,
    /// A symbolic link.
    Symlink = 3,
    /// A payload-less entry sharing the data of another File.
    Hardlink = 4,
}

impl NodeKind {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(NodeKind::File),
            2 => Ok(NodeKind::Directory),
            3 => Ok(NodeKind::Symlink),
            4 => Ok(NodeKind::Hardlink),
            _ => Err(Error::format(format!("Invalid node kind: {}", value))),
        }
    }

    /// Get the string name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Directory => "directory",
            NodeKind::Symlink => "symlink",
            NodeKind::Hardlink => "hardlink",
        }
    }
}

/// Metadata gathered for an entry before the catalog assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDraft {
    pub name: String,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub size: u64,
    pub link_target: Option<String>,
    pub inode: u64,
    /// Id of the File whose data a Hardlink shares, once known.
    pub link_id: u64,
}

impl NodeDraft {
    /// Create a draft with zeroed metadata.
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            mode: 0,
            uid: 0,
            gid: 0,
            mtime: 0,
            atime: 0,
            ctime: 0,
            size: 0,
            link_target: None,
            inode: 0,
            link_id: 0,
        }
    }
}

/// One archived filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Identifier, unique within one catalog.
    pub id: u64,
    /// Id of the enclosing directory, 0 for a root entry.
    pub parent_id: u64,
    /// Final path component.
    pub name: String,
    pub kind: NodeKind,
    /// POSIX mode bits, including the file type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    /// Logical (uncompressed) size in bytes.
    pub size: u64,
    /// Start of the stored bytes within the archive.
    pub data_offset: u64,
    /// Number of stored bytes (compressed length when compressed).
    pub data_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// Source inode, kept as metadata.
    pub inode: u64,
    /// Id of the File whose data a Hardlink shares (0 for none).
    ///
    /// Stored in the record's `data_offset` slot, which a Hardlink does not
    /// otherwise use.
    pub link_id: u64,
    /// Whether the stored bytes are gzip-compressed.
    pub compressed: bool,
}

impl Node {
    /// Build a node from a draft once its position in the catalog is known.
    pub fn from_draft(id: u64, parent_id: u64, draft: NodeDraft) -> Self {
        let size = match draft.kind {
            NodeKind::Directory | NodeKind::Symlink => 0,
            NodeKind::File | NodeKind::Hardlink => draft.size,
        };
        let link_target = match draft.kind {
            NodeKind::Symlink => draft.link_target,
            _ => None,
        };
        let link_id = match draft.kind {
            NodeKind::Hardlink => draft.link_id,
            _ => 0,
        };

        Self {
            id,
            parent_id,
            name: draft.name,
            kind: draft.kind,
            mode: draft.mode,
            uid: draft.uid,
            gid: draft.gid,
            mtime: draft.mtime,
            atime: draft.atime,
            ctime: draft.ctime,
            size,
            data_offset: 0,
            data_length: 0,
            link_target,
            inode: draft.inode,
            link_id,
            compressed: false,
        }
    }

    /// Whether this node is a root (no enclosing directory in the catalog).
    pub fn is_root(&self) -> bool {
        self.parent_id == 0 || self.parent_id == self.id
    }

    /// Whether this node owns a range of the data section.
    pub fn has_payload(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// Check that the node's fields can be encoded and safely restored.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        match (self.kind, &self.link_target) {
            (NodeKind::Symlink, None) => Err(Error::invalid_node(format!(
                "Symlink {} has no target",
                self.name
            ))),
            (NodeKind::Symlink, Some(target)) if target.len() > MAX_LINK_TARGET_LEN => {
                Err(Error::invalid_node(format!(
                    "Link target too long: {} bytes (max {})",
                    target.len(),
                    MAX_LINK_TARGET_LEN
                )))
            }
            (NodeKind::Symlink, Some(target)) if target.is_empty() => Err(Error::invalid_node(
                format!("Symlink {} has an empty target", self.name),
            )),
            _ => Ok(()),
        }
    }

    /// Encode the node to bytes.
    ///
    /// Format (all integers little-endian):
    /// - 8 bytes: id
    /// - 8 bytes: parent_id
    /// - 1 byte: kind (low nibble) | compressed flag (0x80)
    /// - 4 bytes each: mode, uid, gid
    /// - 8 bytes each: mtime, atime, ctime (signed)
    /// - 8 bytes each: size, data_offset, data_length, inode
    ///   (a Hardlink stores its `link_id` in the data_offset slot)
    /// - 4 bytes: name_len
    /// - 4 bytes: link_target_len
    /// - name_len bytes: name (UTF-8)
    /// - link_target_len bytes: link target (symlinks only)
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let link_target = match self.kind {
            NodeKind::Symlink => self.link_target.as_deref().unwrap_or_default(),
            _ => "",
        };

        let mut buf =
            Vec::with_capacity(RECORD_FIXED_SIZE + self.name.len() + link_target.len());

        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.parent_id.to_le_bytes());

        let mut kind = self.kind.to_u8();
        if self.compressed {
            kind |= COMPRESSED_FLAG;
        }
        buf.push(kind);

        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.gid.to_le_bytes());
        buf.extend_from_slice(&self.mtime.to_le_bytes());
        buf.extend_from_slice(&self.atime.to_le_bytes());
        buf.extend_from_slice(&self.ctime.to_le_bytes());
        let offset_slot = match self.kind {
            NodeKind::Hardlink => self.link_id,
            _ => self.data_offset,
        };
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&offset_slot.to_le_bytes());
        buf.extend_from_slice(&self.data_length.to_le_bytes());
        buf.extend_from_slice(&self.inode.to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(link_target.len() as u32).to_le_bytes());

        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(link_target.as_bytes());

        Ok(buf)
    }

    /// Decode the next node from a reader.
    ///
    /// Returns `Ok(None)` when the reader is exhausted exactly at a record
    /// boundary. A partial record is a format error.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut fixed = [0u8; RECORD_FIXED_SIZE];
        if !read_record_start(reader, &mut fixed)? {
            return Ok(None);
        }

        let mut fields = Fields::new(&fixed);
        let id = fields.u64();
        let parent_id = fields.u64();

        let kind_byte = fields.u8();
        if kind_byte & !(KIND_MASK | COMPRESSED_FLAG) != 0 {
            return Err(Error::format(format!(
                "Invalid kind byte: {:#04x}",
                kind_byte
            )));
        }
        let kind = NodeKind::from_u8(kind_byte & KIND_MASK)?;
        let compressed = kind_byte & COMPRESSED_FLAG != 0;

        let mode = fields.u32();
        let uid = fields.u32();
        let gid = fields.u32();
        let mtime = fields.i64();
        let atime = fields.i64();
        let ctime = fields.i64();
        let size = fields.u64();
        let offset_slot = fields.u64();
        let data_length = fields.u64();
        let inode = fields.u64();
        let name_len = fields.u32() as usize;
        let link_target_len = fields.u32() as usize;

        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(Error::format(format!(
                "Invalid name length {} in node {}",
                name_len, id
            )));
        }

        let name = read_string(reader, name_len, "name")?;

        let link_target = match kind {
            NodeKind::Symlink => {
                if link_target_len == 0 || link_target_len > MAX_LINK_TARGET_LEN {
                    return Err(Error::format(format!(
                        "Invalid link target length {} in node {}",
                        link_target_len, id
                    )));
                }
                Some(read_string(reader, link_target_len, "link target")?)
            }
            _ if link_target_len != 0 => {
                return Err(Error::format(format!(
                    "Link target on non-symlink node {}",
                    id
                )));
            }
            _ => None,
        };

        let (data_offset, link_id) = match kind {
            NodeKind::Hardlink => (0, offset_slot),
            _ => (offset_slot, 0),
        };

        let node = Self {
            id,
            parent_id,
            name,
            kind,
            mode,
            uid,
            gid,
            mtime,
            atime,
            ctime,
            size,
            data_offset,
            data_length,
            link_target,
            inode,
            link_id,
            compressed,
        };

        node.validate()
            .map_err(|e| Error::format(format!("Node {}: {}", id, e)))?;

        Ok(Some(node))
    }
}

/// Check an entry name: one non-empty path component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_node("Name cannot be empty"));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_node(format!(
            "Name too long: {} bytes (max {})",
            name.len(),
            MAX_NAME_LEN
        )));
    }

    if name.contains('\0') {
        return Err(Error::invalid_node("Name cannot contain null bytes"));
    }

    if name.contains('/') || name == "." || name == ".." {
        return Err(Error::invalid_node(format!(
            "Name must be a single path component: {:?}",
            name
        )));
    }

    Ok(())
}

/// Fill `buf` with the fixed part of a record.
///
/// Returns false on a clean end of stream before the first byte.
fn read_record_start<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if filled == 0 {
        return Ok(false);
    }

    if filled < buf.len() {
        return Err(Error::format(format!(
            "Truncated node record: {} of {} bytes",
            filled,
            buf.len()
        )));
    }

    Ok(true)
}

fn read_string<R: Read>(reader: &mut R, len: usize, what: &str) -> Result<String> {
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::format(format!("Truncated {}", what)),
        _ => Error::Io { source: e },
    })?;

    String::from_utf8(bytes)
        .map_err(|e| Error::format(format!("Invalid UTF-8 in {}: {}", what, e)))
}

/// Sequential little-endian field reader over the fixed part of a record.
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_node(name: &str) -> Node {
        let mut draft = NodeDraft::new(name, NodeKind::File);
        draft.mode = 0o100644;
        draft.size = 5;
        draft.mtime = 1_700_000_000;
        let mut node = Node::from_draft(2, 1, draft);
        node.data_offset = 12;
        node.data_length = 5;
        node
    }

    #[test]
    fn test_kind_conversions() {
        assert_eq!(NodeKind::File.to_u8(), 1);
        assert_eq!(NodeKind::Hardlink.to_u8(), 4);
        assert_eq!(NodeKind::from_u8(2).unwrap(), NodeKind::Directory);
        assert!(NodeKind::from_u8(0).is_err());
        assert!(NodeKind::from_u8(5).is_err());
    }

    #[test]
    fn test_fixed_record_size() {
        let node = file_node("a.txt");
        let encoded = node.encode().unwrap();
        assert_eq!(encoded.len(), RECORD_FIXED_SIZE + "a.txt".len());
        assert_eq!(&encoded[RECORD_FIXED_SIZE..], b"a.txt");
    }

    #[test]
    fn test_compressed_flag_in_kind_byte() {
        let mut node = file_node("a.txt");
        node.compressed = true;
        let encoded = node.encode().unwrap();
        assert_eq!(encoded[16], 0x81);

        let decoded = Node::decode(&mut encoded.as_slice()).unwrap().unwrap();
        assert!(decoded.compressed);
        assert_eq!(decoded.kind, NodeKind::File);
    }

    #[test]
    fn test_symlink_target_follows_name() {
        let mut draft = NodeDraft::new("link", NodeKind::Symlink);
        draft.link_target = Some("../a.txt".to_string());
        let node = Node::from_draft(3, 1, draft);

        let encoded = node.encode().unwrap();
        assert_eq!(&encoded[RECORD_FIXED_SIZE..], b"link../a.txt");

        let decoded = Node::decode(&mut encoded.as_slice()).unwrap().unwrap();
        assert_eq!(decoded.link_target.as_deref(), Some("../a.txt"));
    }

    #[test]
    fn test_link_target_dropped_for_other_kinds() {
        let mut draft = NodeDraft::new("dir", NodeKind::Directory);
        draft.link_target = Some("ignored".to_string());
        draft.size = 4096;
        let node = Node::from_draft(1, 0, draft);

        assert_eq!(node.link_target, None);
        assert_eq!(node.size, 0);
    }

    #[test]
    fn test_hardlink_owner_in_offset_slot() {
        let mut draft = NodeDraft::new("alias", NodeKind::Hardlink);
        draft.link_id = 7;
        let node = Node::from_draft(9, 1, draft);

        let encoded = node.encode().unwrap();
        let slot = 8 + 8 + 1 + 4 * 3 + 8 * 3 + 8;
        assert_eq!(&encoded[slot..slot + 8], &7u64.to_le_bytes());

        let decoded = Node::decode(&mut encoded.as_slice()).unwrap().unwrap();
        assert_eq!(decoded.link_id, 7);
        assert_eq!(decoded.data_offset, 0);
    }

    #[test]
    fn test_link_id_dropped_for_other_kinds() {
        let mut draft = NodeDraft::new("a.txt", NodeKind::File);
        draft.link_id = 7;
        assert_eq!(Node::from_draft(2, 1, draft).link_id, 0);
    }

    #[test]
    fn test_decode_empty_stream() {
        let mut empty: &[u8] = &[];
        assert!(Node::decode(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_decode_truncated_fixed_part() {
        let encoded = file_node("a.txt").encode().unwrap();
        let mut short = &encoded[..40];
        assert!(matches!(
            Node::decode(&mut short).unwrap_err(),
            Error::Format { .. }
        ));
    }

    #[test]
    fn test_decode_truncated_name() {
        let encoded = file_node("a.txt").encode().unwrap();
        let mut short = &encoded[..encoded.len() - 2];
        assert!(matches!(
            Node::decode(&mut short).unwrap_err(),
            Error::Format { .. }
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_kind_bits() {
        let mut encoded = file_node("a.txt").encode().unwrap();
        encoded[16] = 0x41;
        assert!(Node::decode(&mut encoded.as_slice()).is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("a.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\0b").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        // Long names are stored in full
        assert!(validate_name(&"x".repeat(1000)).is_ok());
    }

    #[test]
    fn test_encode_rejects_traversal_name() {
        let node = file_node("..");
        assert!(node.encode().is_err());
    }

    // Property-based tests
    use proptest::prelude::*;

    fn arb_name() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 ._-]{1,300}".prop_filter("single component", |s| s != "." && s != "..")
    }

    fn arb_node() -> impl Strategy<Value = Node> {
        (
            (any::<u64>(), any::<u64>(), arb_name()),
            prop::sample::select(vec![
                NodeKind::File,
                NodeKind::Directory,
                NodeKind::Symlink,
                NodeKind::Hardlink,
            ]),
            (any::<u32>(), any::<u32>(), any::<u32>()),
            (any::<i64>(), any::<i64>(), any::<i64>()),
            (any::<u64>(), any::<u64>(), any::<u64>(), any::<u64>()),
            "[a-zA-Z0-9/._-]{1,200}",
            any::<bool>(),
        )
            .prop_map(
                |(
                    (id, parent_id, name),
                    kind,
                    (mode, uid, gid),
                    (mtime, atime, ctime),
                    (size, data_offset, data_length, inode),
                    target,
                    compressed,
                )| Node {
                    id,
                    parent_id,
                    name,
                    kind,
                    mode,
                    uid,
                    gid,
                    mtime,
                    atime,
                    ctime,
                    size,
                    data_offset: if kind == NodeKind::Hardlink { 0 } else { data_offset },
                    data_length,
                    link_target: (kind == NodeKind::Symlink).then_some(target),
                    inode,
                    link_id: if kind == NodeKind::Hardlink { data_offset } else { 0 },
                    compressed,
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// Every field survives encoding, including names longer than 255 bytes
        #[test]
        fn prop_node_record_preserves_fields(node in arb_node()) {
            let encoded = node.encode()?;
            let mut reader = encoded.as_slice();
            let decoded = Node::decode(&mut reader)?;
            prop_assert_eq!(decoded, Some(node));
            prop_assert!(reader.is_empty());
        }

        /// Any strict prefix of a record is rejected, never misread
        #[test]
        fn prop_truncated_record_rejected(node in arb_node(), cut in 1usize..64) {
            let encoded = node.encode()?;
            let keep = encoded.len().saturating_sub(cut).max(1);
            let mut reader = &encoded[..keep];
            prop_assert!(Node::decode(&mut reader).is_err());
        }
    }
}
