//! Durable storage for engine state, split into independent sections.
//!
//! Each section is saved and loaded on its own, so a failed write of one
//! section can be retried without touching the others. A missing section
//! loads as empty.

mod dir;
mod memory;
mod redb;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub use dir::DirStore;
pub use memory::MemoryStore;
pub use self::redb::RedbStore;

/// Independently persisted part of the engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Entities,
    Names,
    Constraints,
    Orphans,
    Scanned,
}

impl Section {
    pub const ALL: [Section; 5] = [
        Section::Entities,
        Section::Names,
        Section::Constraints,
        Section::Orphans,
        Section::Scanned,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Section::Entities => "entities",
            Section::Names => "names",
            Section::Constraints => "constraints",
            Section::Orphans => "orphans",
            Section::Scanned => "scanned",
        }
    }

    /// File name used by [`DirStore`].
    pub fn file_name(&self) -> &'static str {
        match self {
            Section::Entities => "entities.bin",
            Section::Names => "cluster_names.json",
            Section::Constraints => "constraints.json",
            Section::Orphans => "orphans.bin",
            Section::Scanned => "scanned_sources.bin",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors from section stores and section codecs.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store: io error: {0}")]
    Io(String),

    #[error("store: encode {section}: {message}")]
    Encode { section: Section, message: String },

    #[error("store: decode {section}: {message}")]
    Decode { section: Section, message: String },

    #[error("store: {section}: unsupported layout version {found}")]
    UnsupportedVersion { section: Section, found: u32 },
}

/// Persists raw section bytes.
///
/// Implementations must be safe for concurrent use.
pub trait SectionStore: Send + Sync {
    /// Returns the stored bytes, or `None` if the section was never saved.
    fn load(&self, section: Section) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replaces the section's bytes.
    fn save(&self, section: Section, data: &[u8]) -> Result<(), StoreError>;

    /// Deletes the section. No error if it does not exist.
    fn remove(&self, section: Section) -> Result<(), StoreError>;
}

impl fmt::Debug for dyn SectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectionStore {{ ... }}")
    }
}
