//! # Myz Core
//!
//! A single-file archive container.
//!
//! An archive packs files, directories and symlinks into one file: a small
//! header, a data section with every file's bytes (optionally gzip
//! compressed per entry), and a metadata section with one record per entry.
//! Entries reference their enclosing directory by id, so the tree can be
//! listed, extracted, appended to or pruned without any child counts.
//!
//! ## Features
//!
//! - Create, append, delete, extract, query, list and inspect
//! - Per-entry gzip compression; one archive may mix compressed and stored entries
//! - Hard links stored once and restored as links
//! - Mutations rewrite the whole archive through a temporary file, so a
//!   failed operation never leaves a truncated archive behind
//!
//! ## Example
//!
//! ```no_run
//! use myz_core::{Archive, ArchiveOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let archive = Archive::new("backup.myz")
//!     .with_options(ArchiveOptions::default().with_compression(true));
//!
//! // Pack a directory
//! let report = archive.create(&["./my-data"])?;
//! println!("Archived {} entries", report.entries);
//!
//! // Add another file next to it
//! archive.append(&["./notes.md"])?;
//!
//! // Drop a subtree and check it is gone
//! archive.delete(&["my-data/tmp"])?;
//! assert!(!archive.query("my-data/tmp")?);
//!
//! // Print the tree, then restore everything
//! archive.list_hierarchy::<&str, _>(&[], std::io::stdout())?;
//! archive.extract::<&str, _>(&[], "./restored")?;
//! # Ok(())
//! # }
//! ```

mod archive;
mod catalog;
mod codec;
mod compress;
mod error;
mod extract;
mod header;
mod inspect;
mod node;
mod walk;

pub use archive::{Archive, Report};
pub use catalog::{Catalog, is_within, normalize_path};
pub use codec::{ArchiveOptions, Payload, PayloadProvider, Sources, decode, encode};
pub use compress::{CHUNK_SIZE, CompressStats, DEFAULT_LEVEL, compress, decompress};
pub use error::{Error, Result};
pub use header::{HEADER_SIZE, Header, MAGIC};
pub use inspect::Entry;
pub use node::{Node, NodeDraft, NodeKind, RECORD_FIXED_SIZE};
pub use walk::{Walk, WalkEntry, Walker, walk};
