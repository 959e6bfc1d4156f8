//! The serialised per-meta-directory record
//!
//! One of these is persisted (as CBOR) inside every meta-directory. It is
//! the only durable state of a scan: labels, metadata, digests and the
//! edges to child meta-directories.

use crate::hashes::ContentHashes;
use compact_str::CompactString;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Version tag of the persisted info record. Readers reject anything else.
pub const INFO_VERSION: u32 = 1;

/// File name of the persisted info record inside a meta-directory.
pub const INFO_FILE_NAME: &str = "info.cbor";

/// Unordered set of tags applied to a scanned file (`gzip`, `archive`,
/// `text`, `padding`, ...).
pub type LabelSet = BTreeSet<CompactString>;

/// Free-form format specific metadata produced by a successful parser.
pub type Metadata = BTreeMap<CompactString, serde_cbor::Value>;

/// A carved byte range inside a parent file.
///
/// Serialises as the fixed width hex string that also names the carved
/// file on disk (`<offset>-<size>`, 12 hex digits each), which keeps the
/// persisted maps usable as plain string keyed maps in every encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtractedSpan {
    pub offset: u64,
    pub size: u64,
}

impl ExtractedSpan {
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// End of the span (exclusive).
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// The file name used for this span under `extracted/`.
    pub fn file_name(&self) -> CompactString {
        compact_str::format_compact!("{:012x}-{:012x}", self.offset, self.size)
    }

    /// Parse a span back from its `file_name` form.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (offset, size) = name.split_once('-')?;
        Some(Self {
            offset: u64::from_str_radix(offset, 16).ok()?,
            size: u64::from_str_radix(size, 16).ok()?,
        })
    }
}

impl std::fmt::Display for ExtractedSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

impl serde::Serialize for ExtractedSpan {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.file_name())
    }
}

impl<'de> serde::Deserialize<'de> for ExtractedSpan {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::Deserialize;
        let s = CompactString::deserialize(deserializer)?;
        Self::from_file_name(&s)
            .ok_or_else(|| serde::de::Error::custom("invalid extracted span"))
    }
}

/// Everything we know about one scanned byte sequence.
///
/// Logical child paths are stored as strings relative to the file they
/// were unpacked from (or absolute, for the absolute map); values are the
/// names of the child meta-directories under the unpack root.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub struct MetaDirInfo {
    pub version: u32,
    /// Set once the carving pipeline has run (or was intentionally
    /// skipped); labels and metadata are final from then on.
    pub scanned: bool,
    pub size: Option<u64>,
    pub hashes: Option<ContentHashes>,
    pub labels: LabelSet,
    pub metadata: Metadata,
    /// Children with a relative logical path.
    pub unpacked_relative_files: BTreeMap<CompactString, CompactString>,
    /// Children with an absolute logical path, re-rooted under `abs/`.
    pub unpacked_absolute_files: BTreeMap<CompactString, CompactString>,
    /// Carved spans, keyed by `(offset, size)`.
    pub extracted_files: BTreeMap<ExtractedSpan, CompactString>,
    /// Directory entries produced by container formats. Structural only,
    /// no child meta-directory is allocated for these.
    pub unpacked_directories: BTreeSet<CompactString>,
    /// Symlink entries: logical path to recorded (never followed) target.
    pub unpacked_symlinks: BTreeMap<CompactString, CompactString>,
    /// Hard link entries: logical path to link target.
    pub unpacked_hardlinks: BTreeMap<CompactString, CompactString>,
    /// Context handed down from the producing parser (e.g. a preferred
    /// output name), read by parsers scanning this file.
    pub propagated: BTreeMap<CompactString, CompactString>,
}

impl Default for MetaDirInfo {
    fn default() -> Self {
        Self {
            version: INFO_VERSION,
            scanned: false,
            size: None,
            hashes: None,
            labels: LabelSet::new(),
            metadata: Metadata::new(),
            unpacked_relative_files: BTreeMap::new(),
            unpacked_absolute_files: BTreeMap::new(),
            extracted_files: BTreeMap::new(),
            unpacked_directories: BTreeSet::new(),
            unpacked_symlinks: BTreeMap::new(),
            unpacked_hardlinks: BTreeMap::new(),
            propagated: BTreeMap::new(),
        }
    }
}

impl MetaDirInfo {
    /// True if `label` is present.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Insert a label.
    pub fn add_label(&mut self, label: impl Into<CompactString>) {
        self.labels.insert(label.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_span_file_name() {
        let span = ExtractedSpan::new(0x14, 0x2a);
        assert_eq!(span.file_name(), "000000000014-00000000002a");
        assert_eq!(ExtractedSpan::from_file_name("000000000014-00000000002a"), Some(span));
        assert_eq!(ExtractedSpan::from_file_name("zz-11"), None);
    }

    #[test]
    fn test_info_round_trip() {
        let mut info = MetaDirInfo::default();
        info.add_label("gzip");
        info.add_label("archive");
        info.size = Some(42);
        info.extracted_files
            .insert(ExtractedSpan::new(0, 42), "abc123".into());
        info.unpacked_relative_files
            .insert("hello".into(), "def456".into());
        info.metadata.insert(
            "name".into(),
            serde_cbor::Value::Text("hello".to_owned()),
        );

        let encoded = serde_cbor::to_vec(&info).expect("encode");
        let decoded: MetaDirInfo = serde_cbor::from_slice(&encoded).expect("decode");
        assert_eq!(info, decoded);
        assert_eq!(decoded.version, INFO_VERSION);
    }
}
