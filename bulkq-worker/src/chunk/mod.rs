//! Chunk file model and classification
//!
//! A bulk operation's payload is split into numbered chunk files persisted to
//! blob storage. Each chunk records where it came from (file name, index,
//! byte offset of its first record) and which payload section it belongs to.

mod helper;

pub use helper::ProcessingHelper;

use serde::{Deserialize, Serialize};

/// Section name for primary entity data
pub const PRIMARY_DATA_SECTION: &str = "data";
/// Section name for included (related) entity data
pub const INCLUDED_DATA_SECTION: &str = "included";

/// One slice of a bulk-operation payload, stored as its own file.
///
/// Immutable once created; identified by `file_index` within one operation.
/// Serialized to the chunk index as the tuple
/// `[fileName, fileIndex, firstRecordOffset, sectionName]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ChunkFileRecord", into = "ChunkFileRecord")]
pub struct ChunkFile {
    pub file_name: String,
    pub file_index: u32,
    pub first_record_offset: u64,
    pub section_name: Option<String>,
}

/// Wire shape of one chunk index entry
type ChunkFileRecord = (String, u32, u64, Option<String>);

impl From<ChunkFileRecord> for ChunkFile {
    fn from(r: ChunkFileRecord) -> Self {
        Self {
            file_name: r.0,
            file_index: r.1,
            first_record_offset: r.2,
            section_name: r.3,
        }
    }
}

impl From<ChunkFile> for ChunkFileRecord {
    fn from(f: ChunkFile) -> Self {
        (f.file_name, f.file_index, f.first_record_offset, f.section_name)
    }
}

impl ChunkFile {
    pub fn new(
        file_name: impl Into<String>,
        file_index: u32,
        first_record_offset: u64,
        section_name: Option<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            file_index,
            first_record_offset,
            section_name,
        }
    }
}

/// Whether a chunk carries primary entity data
pub fn is_primary_data(file: &ChunkFile) -> bool {
    file.section_name.as_deref() == Some(PRIMARY_DATA_SECTION)
}

/// Whether a chunk carries included (related) entity data
pub fn is_included_data(file: &ChunkFile) -> bool {
    file.section_name.as_deref() == Some(INCLUDED_DATA_SECTION)
}

/// Fill a single-`{}` template with a value.
///
/// Used both for chunk job names (filled with the one-based job number) and
/// for chunk file name prefixes (filled with the empty string when globbing
/// for deletion). A template without a placeholder is returned unchanged.
pub fn fill_template(template: &str, value: impl ToString) -> String {
    template.replacen("{}", &value.to_string(), 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_file_serializes_as_tuple() {
        let file = ChunkFile::new("chunk_0", 0, 0, Some("data".to_string()));
        let json = serde_json::to_string(&file).unwrap();
        assert_eq!(json, r#"["chunk_0",0,0,"data"]"#);

        let back: ChunkFile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, file);
    }

    #[test]
    fn test_classifier_primary() {
        let file = ChunkFile::new("c", 0, 0, Some("data".to_string()));
        assert!(is_primary_data(&file));
        assert!(!is_included_data(&file));
    }

    #[test]
    fn test_classifier_included() {
        let file = ChunkFile::new("c", 0, 0, Some("included".to_string()));
        assert!(!is_primary_data(&file));
        assert!(is_included_data(&file));
    }

    #[test]
    fn test_classifier_malformed_section() {
        let none = ChunkFile::new("c", 0, 0, None);
        let other = ChunkFile::new("c", 0, 0, Some("Data ".to_string()));
        for file in [none, other] {
            assert!(!is_primary_data(&file));
            assert!(!is_included_data(&file));
        }
    }

    #[test]
    fn test_fill_template() {
        assert_eq!(fill_template("bulk:123:chunk:{}", 5), "bulk:123:chunk:5");
        assert_eq!(fill_template("chunks_123_{}", ""), "chunks_123_");
        assert_eq!(fill_template("no_placeholder", 1), "no_placeholder");
    }
}
