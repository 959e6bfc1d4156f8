//! Zstandard
//!
//! The frame is measured without decompressing by walking the block
//! headers (RFC 8878), then validated with one decode pass over exactly
//! that many bytes.

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
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::PathBuf;

pub(crate) struct ZstdParser;

impl FormatParser for ZstdParser {
    fn pretty_name(&self) -> &'static str {
        "zstd"
    }

    fn signatures(&self) -> &'static [Signature] {
        const SIGNATURES: &[Signature] = &[Signature::new(0, b"\x28\xb5\x2f\xfd")];
        SIGNATURES
    }

    fn parse(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
    ) -> ParseResult<Box<dyn Parsed>> {
        let mut magic = [0u8; 4];
        window.read_exact(&mut magic)?;
        ensure_format(magic == [0x28, 0xb5, 0x2f, 0xfd], "not a zstd frame")?;

        let mut descriptor = [0u8; 1];
        window.read_exact(&mut descriptor)?;
        let descriptor = descriptor[0];
        ensure_format(descriptor & 0x08 == 0, "reserved frame header bit set")?;
        let single_segment = descriptor & 0x20 != 0;
        let has_checksum = descriptor & 0x04 != 0;
        let dict_id_len = match descriptor & 0x03 {
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 4,
        };
        let content_size_len = match descriptor >> 6 {
            0 => u64::from(single_segment),
            1 => 2,
            2 => 4,
            _ => 8,
        };
        let skip = u64::from(!single_segment) + dict_id_len + content_size_len;
        window.seek(SeekFrom::Current(i64::try_from(skip).expect("small header")))?;

        loop {
            let mut raw = [0u8; 3];
            window.read_exact(&mut raw)?;
            let header = u32::from_le_bytes([raw[0], raw[1], raw[2], 0]);
            let last_block = header & 1 != 0;
            let block_type = (header >> 1) & 0x03;
            let block_size = u64::from(header >> 3);
            ensure_format(block_type != 3, "reserved block type")?;
            // RLE blocks carry a single byte regardless of declared size
            let data_len = if block_type == 1 { 1 } else { block_size };
            let next = window
                .position()
                .checked_add(data_len)
                .ok_or_else(|| ParseRejection::invalid("block size overflow"))?;
            if next > window.size() {
                return Err(ParseRejection::truncated("block extends past end of input").into());
            }
            window.seek(SeekFrom::Start(next))?;
            if last_block {
                break;
            }
        }
        if has_checksum {
            window.seek(SeekFrom::Current(4))?;
        }
        let size = window.position();
        if size > window.size() {
            return Err(ParseRejection::truncated("frame extends past end of input").into());
        }

        // One decode pass over exactly the measured frame validates the
        // entropy streams and the content checksum
        window.rewind_window()?;
        let limited = (&mut *window).take(size);
        zstd::stream::copy_decode(limited, std::io::sink())
            .map_err(|e| ParseRejection::invalid(e.to_string()))?;

        Ok(Box::new(ParsedZstd { size }))
    }
}

struct ParsedZstd {
    size: u64,
}

impl Parsed for ParsedZstd {
    fn unpacked_size(&self) -> u64 {
        self.size
    }

    fn labels(&self) -> Labels {
        ["zstd".into(), "compressed".into()].into_iter().collect()
    }

    fn unpack(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
        md: &mut MetaDirectory,
        sink: ChildSink<'_>,
    ) -> eyre::Result<()> {
        let scanned = md.file_path().to_path_buf();
        let output = [(".tzst", ".tar"), (".zst", "")]
            .into_iter()
            .find_map(|(stripped, appended)| stem_with_suffix(&scanned, stripped, appended))
            .map_or_else(
                || PathBuf::from("unpacked_from_zstd"),
                |stem| PathBuf::from(stem.as_str()),
            );
        let (child, file) = md.unpack_regular_file(&output)?;
        let mut writer = BufWriter::new(file);
        let limited = (&mut *window).take(self.size);
        zstd::stream::copy_decode(limited, &mut writer)?;
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

    fn zstd_bytes(data: &[u8]) -> Vec<u8> {
        zstd::stream::encode_all(data, 3).expect("compress")
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
        Ok(ZstdParser.parse(&mut window, &ctx)?.unpacked_size())
    }

    #[test]
    fn test_measures_frame_with_trailing_garbage() {
        let mut data = zstd_bytes(b"hello zstd, hello zstd, hello zstd\n");
        let frame = data.len() as u64;
        data.extend_from_slice(b"NOT PART OF THE FRAME");
        assert_eq!(parse_len(&data).expect("parse"), frame);
    }

    #[test]
    fn test_truncated_frame_rejects() {
        let data = zstd_bytes(b"hello zstd, hello zstd, hello zstd\n");
        assert!(parse_len(&data[..data.len() - 4]).is_err());
    }
}
