//! Archive header.
//!
//! Every archive starts with a 12-byte header:
//!
//! ```text
//! 0x00  4   "MYZ\0" magic
//! 0x04  8   metadata_offset (u64 LE)
//! 0x0c  ... data section
//! ```
//!
//! The data section runs from the end of the header up to `metadata_offset`,
//! where the node records begin and continue to the end of the file.

use crate::error::{Error, Result};

/// Magic bytes at the start of every archive.
pub const MAGIC: &[u8; 4] = b"MYZ\0";

/// Size of the archive header in bytes.
pub const HEADER_SIZE: usize = 12;

/// The archive header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Offset where the data section ends and the metadata section begins.
    pub metadata_offset: u64,
}

impl Header {
    /// Create a new header.
    pub fn new(metadata_offset: u64) -> Self {
        Self { metadata_offset }
    }

    /// Header written before the data section, rewritten once the true
    /// metadata offset is known.
    pub fn placeholder() -> Self {
        Self::new(0)
    }

    /// Offset of the first data byte.
    pub fn data_start() -> u64 {
        HEADER_SIZE as u64
    }

    /// Encode the header to a 12-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..12].copy_from_slice(&self.metadata_offset.to_le_bytes());
        buf
    }

    /// Decode a header from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::format(format!(
                "Header too short: {} bytes (expected {})",
                buf.len(),
                HEADER_SIZE
            )));
        }

        if &buf[0..4] != MAGIC {
            return Err(Error::format(format!(
                "Invalid magic: expected {:?}, got {:?}",
                MAGIC,
                &buf[0..4]
            )));
        }

        let mut offset_bytes = [0u8; 8];
        offset_bytes.copy_from_slice(&buf[4..12]);

        Ok(Self {
            metadata_offset: u64::from_le_bytes(offset_bytes),
        })
    }

    /// Validate the header against the archive length.
    pub fn validate(&self, archive_len: u64) -> Result<()> {
        if self.metadata_offset < Self::data_start() || self.metadata_offset > archive_len {
            return Err(Error::format(format!(
                "Metadata offset {} outside archive bounds [{}, {}]",
                self.metadata_offset,
                Self::data_start(),
                archive_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let encoded = Header::new(0x0102_0304_0506_0708).encode();

        assert_eq!(&encoded[0..4], b"MYZ\0");
        assert_eq!(
            &encoded[4..12],
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_header_decode() {
        let header = Header::new(4096);
        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_decode_invalid_magic() {
        let mut buf = Header::new(12).encode();
        buf[0..4].copy_from_slice(b"ZIP\0");

        let err = Header::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn test_header_too_short() {
        let buf = [b'M', b'Y', b'Z', 0, 1, 2];
        assert!(matches!(
            Header::decode(&buf).unwrap_err(),
            Error::Format { .. }
        ));
    }

    #[test]
    fn test_header_validate_bounds() {
        assert!(Header::new(12).validate(12).is_ok());
        assert!(Header::new(20).validate(40).is_ok());

        // Inside the header itself
        assert!(Header::new(4).validate(40).is_err());
        // Past the end of the file
        assert!(Header::new(41).validate(40).is_err());
    }
}
