//! The contract every format parser implements
//!
//! A parser is offered a window into a file at some offset and either
//! rejects it or returns a [`Parsed`] result that knows the exact number
//! of bytes the format occupies, the labels and metadata to attach, and
//! how to materialise contained entries as child files.
//!
//! Rules of the contract:
//!
//! * `parse` must establish the final unpacked size; a successful parse
//!   means `0 < unpacked_size <= window.size()`.
//! * `parse` may not mutate the meta-directory tree and may only write
//!   inside the configured temporary directory (scratch state is cleaned
//!   up when the result is dropped).
//! * Bad input is a [`ParseRejection`], never a panic and never a fatal
//!   error. Only real I/O failures surface as [`ParseError::Io`].
//! * Concatenation: a parse at offset 0 of a file holding two instances
//!   of the format consumes only the first; the pipeline re-invokes the
//!   parser at the second offset.

use crate::config::ScanEnvironment;
use crate::meta_directory::MetaDirectory;
use filkarv_types::Metadata;
use filkarv_types::ParseRejection;
use filkarv_types::Signature;
use compact_str::CompactString;
use smallvec::SmallVec;
use std::fs::File;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;

/// Why a parse attempt did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The bytes do not match the format; the pipeline moves on.
    #[error(transparent)]
    Rejected(#[from] ParseRejection),
    /// A real I/O failure; fatal for the current job.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Read/decode errors that merely mean "these bytes are not the
    /// format" are folded into rejections so parsers can use
    /// `read_exact` and decoder crates freely.
    pub fn normalise(self) -> Self {
        match self {
            Self::Io(err) => match err.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    Self::Rejected(ParseRejection::truncated("unexpected end of input"))
                }
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput => {
                    Self::Rejected(ParseRejection::invalid(err.to_string()))
                }
                _ => Self::Io(err),
            },
            rejected => rejected,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Reject unless `condition` holds.
pub fn ensure_format(condition: bool, reason: &'static str) -> ParseResult<()> {
    if condition {
        Ok(())
    } else {
        Err(ParseRejection::invalid(reason).into())
    }
}

/// Shared context handed to a parser.
pub struct ParseContext<'a> {
    pub env: &'a ScanEnvironment,
    /// Absolute offset of the window within the file being scanned
    pub offset: u64,
}

/// A read-only view of a file starting at a fixed offset.
///
/// Reads and seeks are relative to the window start; the window ends at
/// the end of the underlying file (how much of it the format actually
/// occupies is for the parser to decide).
#[derive(Debug)]
pub struct FileWindow {
    file: File,
    base: u64,
    len: u64,
    pos: u64,
}

impl FileWindow {
    pub fn open(path: &Path, offset: u64) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let total = file.metadata()?.len();
        Ok(Self {
            file,
            base: offset,
            len: total.saturating_sub(offset),
            pos: 0,
        })
    }

    /// Bytes from the window start to the end of the file.
    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn rewind_window(&mut self) -> std::io::Result<()> {
        self.pos = 0;
        Ok(())
    }

    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for FileWindow {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        self.file.seek(SeekFrom::Start(self.base + self.pos))?;
        let n = self.file.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FileWindow {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.len) + i128::from(delta),
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before window start",
            ));
        }
        self.pos = u64::try_from(target).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek overflow")
        })?;
        Ok(self.pos)
    }
}

/// Callback receiving every child meta-directory a parser produces.
/// The scheduler persists and enqueues them.
pub type ChildSink<'a> = &'a mut dyn FnMut(MetaDirectory) -> eyre::Result<()>;

/// Labels produced by one parse.
pub type Labels = SmallVec<[CompactString; 4]>;

/// A format parser. Implementations are stateless; all per-file state
/// lives in the [`Parsed`] value returned by [`Self::parse`].
pub trait FormatParser: Send + Sync {
    /// Stable identifier, used in logs and for grounding labels
    fn pretty_name(&self) -> &'static str;

    /// Filename extension hints (lowercase, with leading dot)
    fn extensions(&self) -> &'static [&'static str] {
        &[]
    }

    /// Magic byte declarations
    fn signatures(&self) -> &'static [Signature] {
        &[]
    }

    /// Also try this parser on files with no signature hit and no
    /// matching extension (formats without reliable magic)
    fn scan_if_featureless(&self) -> bool {
        false
    }

    /// Validate the format starting at the window and measure it.
    fn parse(
        &self,
        window: &mut FileWindow,
        ctx: &ParseContext<'_>,
    ) -> ParseResult<Box<dyn Parsed>>;
}

/// The outcome of one successful parse.
pub trait Parsed {
    /// Bytes the format occupies from the parse offset. Fixed by
    /// `parse`; never recomputed.
    fn unpacked_size(&self) -> u64;

    /// Labels to apply to the parsed file's meta-directory.
    fn labels(&self) -> Labels;

    /// Format specific metadata.
    fn metadata(&self) -> Metadata {
        Metadata::new()
    }

    /// Materialise contained entries into `md`, handing each produced
    /// child meta-directory to `sink`. Non-container formats keep the
    /// default.
    fn unpack(
        &self,
        window: &mut FileWindow,
        ctx: &ParseContext<'_>,
        md: &mut MetaDirectory,
        sink: ChildSink<'_>,
    ) -> eyre::Result<()> {
        let _ = (window, ctx, md, sink);
        Ok(())
    }
}

/// Convenience for parsers whose output name depends on the name of the
/// file they sit in: strips `stripped` from the end of `path`'s file
/// name, or returns None if it does not apply.
pub(crate) fn stem_with_suffix(path: &Path, stripped: &str, appended: &str) -> Option<CompactString> {
    let name = path.file_name()?.to_str()?;
    let lower = name.to_ascii_lowercase();
    if !lower.ends_with(stripped) {
        return None;
    }
    let stem = &name[..name.len() - stripped.len()];
    if stem.is_empty() {
        return None;
    }
    Some(compact_str::format_compact!("{stem}{appended}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_window_is_offset_and_clamped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data");
        let mut f = File::create(&path).expect("create");
        f.write_all(b"0123456789").expect("write");
        drop(f);

        let mut window = FileWindow::open(&path, 4).expect("open");
        assert_eq!(window.size(), 6);
        let mut buf = Vec::new();
        window.read_to_end(&mut buf).expect("read");
        assert_eq!(buf, b"456789");

        window.seek(SeekFrom::Start(2)).expect("seek");
        let mut two = [0u8; 2];
        window.read_exact(&mut two).expect("read");
        assert_eq!(&two, b"67");

        window.seek(SeekFrom::End(-1)).expect("seek");
        assert_eq!(window.position(), 5);

        // Beyond EOF: reads return nothing
        let mut window = FileWindow::open(&path, 100).expect("open");
        assert_eq!(window.size(), 0);
        assert_eq!(window.read(&mut two).expect("read"), 0);
    }

    #[test]
    fn test_normalise_maps_eof_to_truncated() {
        let err = ParseError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        ));
        match err.normalise() {
            ParseError::Rejected(rejection) => {
                assert_eq!(rejection.kind, filkarv_types::RejectKind::Truncated);
            }
            ParseError::Io(_) => panic!("should have been folded into a rejection"),
        }
    }

    #[test]
    fn test_stem_with_suffix() {
        assert_eq!(
            stem_with_suffix(Path::new("a/b/archive.tgz"), ".tgz", ".tar"),
            Some("archive.tar".into())
        );
        assert_eq!(
            stem_with_suffix(Path::new("hello.gz"), ".gz", ""),
            Some("hello".into())
        );
        assert_eq!(stem_with_suffix(Path::new("hello"), ".gz", ""), None);
        assert_eq!(stem_with_suffix(Path::new(".gz"), ".gz", ""), None);
    }
}
