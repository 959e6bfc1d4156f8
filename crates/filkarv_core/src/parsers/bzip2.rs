//! Bzip2
//!
//! The stream header is checked by hand, then the whole stream is
//! decoded once; the decoder's input counter gives the exact compressed
//! length including the final CRC.

use crate::meta_directory::MetaDirectory;
use crate::parser::ChildSink;
use crate::parser::FileWindow;
use crate::parser::FormatParser;
use crate::parser::Labels;
use crate::parser::ParseContext;
use crate::parser::ParseResult;
use crate::parser::Parsed;
use crate::parser::ensure_format;
use crate::parser::stem_with_suffix;
use filkarv_types::ParseRejection;
use filkarv_types::Signature;
use std::io::BufWriter;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;

/// First bytes of the initial compressed block (digits of pi)
const BLOCK_MAGIC: [u8; 6] = [0x31, 0x41, 0x59, 0x26, 0x53, 0x59];
/// Stream footer magic for a stream with no blocks (sqrt of pi)
const EOS_MAGIC: [u8; 6] = [0x17, 0x72, 0x45, 0x38, 0x50, 0x90];

pub(crate) struct Bzip2Parser;

impl FormatParser for Bzip2Parser {
    fn pretty_name(&self) -> &'static str {
        "bzip2"
    }

    fn signatures(&self) -> &'static [Signature] {
        const SIGNATURES: &[Signature] = &[Signature::new(0, b"BZh")];
        SIGNATURES
    }

    fn parse(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
    ) -> ParseResult<Box<dyn Parsed>> {
        let mut header = [0u8; 10];
        window.read_exact(&mut header)?;
        ensure_format(&header[..3] == b"BZh", "not a bzip2 stream")?;
        ensure_format(
            header[3].is_ascii_digit() && header[3] != b'0',
            "invalid block size level",
        )?;
        ensure_format(
            header[4..10] == BLOCK_MAGIC || header[4..10] == EOS_MAGIC,
            "invalid block magic",
        )?;

        window.rewind_window()?;
        let mut decoder = bzip2::read::BzDecoder::new(&mut *window);
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            match decoder.read(&mut buffer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ParseRejection::invalid(e.to_string()).into());
                }
            }
        }
        let consumed = decoder.total_in();
        ensure_format(consumed > 0, "empty stream")?;
        Ok(Box::new(ParsedBzip2 { size: consumed }))
    }
}

struct ParsedBzip2 {
    size: u64,
}

impl Parsed for ParsedBzip2 {
    fn unpacked_size(&self) -> u64 {
        self.size
    }

    fn labels(&self) -> Labels {
        ["bzip2".into(), "compressed".into()].into_iter().collect()
    }

    fn unpack(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
        md: &mut MetaDirectory,
        sink: ChildSink<'_>,
    ) -> eyre::Result<()> {
        let scanned = md.file_path().to_path_buf();
        let output = [(".tbz2", ".tar"), (".tbz", ".tar"), (".bz2", "")]
            .into_iter()
            .find_map(|(stripped, appended)| stem_with_suffix(&scanned, stripped, appended))
            .map_or_else(
                || PathBuf::from("unpacked_from_bzip2"),
                |stem| PathBuf::from(stem.as_str()),
            );
        let (child, file) = md.unpack_regular_file(&output)?;
        let mut writer = BufWriter::new(file);
        let mut decoder = bzip2::read::BzDecoder::new(&mut *window);
        std::io::copy(&mut decoder, &mut writer)?;
        writer.flush()?;
        sink(child)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanEnvironment;
    use pretty_assertions::assert_eq;

    fn bzip2_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(data).expect("compress");
        encoder.finish().expect("finish")
    }

    fn parse_len(data: &[u8]) -> ParseResult<u64> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("input");
        std::fs::write(&path, data).expect("write");
        let env = ScanEnvironment::builder()
            .unpack_directory(dir.path().join("unpack"))
            .temporary_directory(dir.path().join("tmp"))
            .build()
            .expect("env");
        let mut window = FileWindow::open(&path, 0).expect("window");
        let ctx = ParseContext { env: &env, offset: 0 };
        Ok(Bzip2Parser.parse(&mut window, &ctx)?.unpacked_size())
    }

    #[test]
    fn test_measures_stream_with_trailing_garbage() {
        let mut data = bzip2_bytes(b"hello bzip2\n");
        let stream = data.len() as u64;
        data.extend_from_slice(b"TRAILING GARBAGE");
        assert_eq!(parse_len(&data).expect("parse"), stream);
    }

    #[test]
    fn test_bad_level_rejects() {
        let mut data = bzip2_bytes(b"hello\n");
        data[3] = b'0';
        assert!(parse_len(&data).is_err());
    }
}
