//! Gzip (RFC 1952)
//!
//! The member is measured exactly: header fields are walked manually,
//! the raw deflate stream is decoded to find its compressed length, and
//! the CRC32/ISIZE trailer is validated. Concatenated members are left
//! for the pipeline to find at the next offset.

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
use compact_str::CompactString;
use filkarv_types::Metadata;
use filkarv_types::ParseRejection;
use filkarv_types::Signature;
use std::io::BufWriter;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;

pub(crate) struct GzipParser;

impl FormatParser for GzipParser {
    fn pretty_name(&self) -> &'static str {
        "gzip"
    }

    fn signatures(&self) -> &'static [Signature] {
        // RFC 1952 says 0x08 (deflate) is the only compression method
        const SIGNATURES: &[Signature] = &[Signature::new(0, b"\x1f\x8b\x08")];
        SIGNATURES
    }

    fn parse(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
    ) -> ParseResult<Box<dyn Parsed>> {
        let mut header = [0u8; 10];
        window.read_exact(&mut header)?;
        ensure_format(header[..3] == [0x1f, 0x8b, 0x08], "not a gzip member")?;
        let flags = header[3];
        ensure_format(flags & 0xe0 == 0, "reserved flag bits set")?;
        let mtime = u32::from_le_bytes(header[4..8].try_into().expect("slice of 4"));
        let os = header[9];

        if flags & FEXTRA != 0 {
            let mut raw = [0u8; 2];
            window.read_exact(&mut raw)?;
            let extra_len = u16::from_le_bytes(raw);
            window.seek(SeekFrom::Current(i64::from(extra_len)))?;
        }
        let name = if flags & FNAME != 0 {
            read_latin1_cstring(window)?
        } else {
            None
        };
        let comment = if flags & FCOMMENT != 0 {
            read_latin1_cstring(window)?
        } else {
            None
        };
        if flags & FHCRC != 0 {
            window.seek(SeekFrom::Current(2))?;
        }
        let header_len = window.position();

        // What follows is raw deflate; decode it to learn both the
        // compressed length and the CRC of the uncompressed data
        let mut crc = flate2::Crc::new();
        let mut total_out = 0u64;
        let mut decoder = flate2::read::DeflateDecoder::new(&mut *window);
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            match decoder.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    crc.update(&buffer[..n]);
                    total_out += n as u64;
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let deflate_len = decoder.total_in();
        drop(decoder);

        window.seek(SeekFrom::Start(header_len + deflate_len))?;
        let mut trailer = [0u8; 8];
        window.read_exact(&mut trailer)?;
        let expected_crc = u32::from_le_bytes(trailer[..4].try_into().expect("slice of 4"));
        let expected_isize = u32::from_le_bytes(trailer[4..].try_into().expect("slice of 4"));
        if crc.sum() != expected_crc {
            return Err(ParseRejection::checksum_mismatch("wrong CRC").into());
        }
        // ISIZE is the uncompressed size modulo 2^32 (RFC 1952, 2.3.1)
        if total_out as u32 != expected_isize {
            return Err(ParseRejection::checksum_mismatch("wrong value for ISIZE").into());
        }

        let renamed = fname_output(name.as_ref()).is_some();
        Ok(Box::new(ParsedGzip {
            size: header_len + deflate_len + 8,
            header_len,
            name,
            renamed,
            comment,
            mtime,
            os,
        }))
    }
}

/// The output path the FNAME header field dictates, if it dictates one:
/// relative-ised when absolute, dropped when empty.
fn fname_output(name: Option<&CompactString>) -> Option<PathBuf> {
    let path = Path::new(name?.as_str());
    let relative = path.strip_prefix("/").unwrap_or(path);
    if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative.to_path_buf())
    }
}

struct ParsedGzip {
    size: u64,
    header_len: u64,
    name: Option<CompactString>,
    /// True when the FNAME header field names the output
    renamed: bool,
    comment: Option<CompactString>,
    mtime: u32,
    os: u8,
}

impl ParsedGzip {
    /// Pick the output name: the FNAME header field wins, then a name
    /// propagated by whatever produced this file, then the scanned
    /// file's own name with its suffix rewritten.
    fn output_path(&self, md: &MetaDirectory) -> PathBuf {
        if let Some(path) = fname_output(self.name.as_ref()) {
            return path;
        }
        if let Some(name) = md.info().propagated.get("name") {
            if !name.is_empty() {
                return PathBuf::from(name.as_str());
            }
        }
        let scanned = md.file_path().to_path_buf();
        for (stripped, appended) in [
            (".tgz", ".tar"),
            (".targz", ".tar"),
            (".tgzip", ".tar"),
            (".targzip", ".tar"),
            (".svgz", ".svg"),
            (".gz", ""),
        ] {
            if let Some(stem) = stem_with_suffix(&scanned, stripped, appended) {
                return PathBuf::from(stem.as_str());
            }
        }
        PathBuf::from("unpacked_from_gzip")
    }
}

impl Parsed for ParsedGzip {
    fn unpacked_size(&self) -> u64 {
        self.size
    }

    fn labels(&self) -> Labels {
        let mut labels: Labels = ["gzip".into(), "archive".into()].into_iter().collect();
        if self.renamed {
            labels.push("renamed".into());
        }
        labels
    }

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        if let Some(name) = &self.name {
            metadata.insert("name".into(), serde_cbor::Value::Text(name.to_string()));
        }
        if let Some(comment) = &self.comment {
            metadata.insert(
                "comment".into(),
                serde_cbor::Value::Text(comment.to_string()),
            );
        }
        if self.mtime != 0 {
            metadata.insert(
                "mtime".into(),
                serde_cbor::Value::Integer(i128::from(self.mtime)),
            );
        }
        metadata.insert("os".into(), serde_cbor::Value::Integer(i128::from(self.os)));
        metadata
    }

    fn unpack(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
        md: &mut MetaDirectory,
        sink: ChildSink<'_>,
    ) -> eyre::Result<()> {
        let output = self.output_path(md);
        let (child, file) = md.unpack_regular_file(&output)?;
        let mut writer = BufWriter::new(file);
        window.seek(SeekFrom::Start(self.header_len))?;
        let mut decoder = flate2::read::DeflateDecoder::new(&mut *window);
        std::io::copy(&mut decoder, &mut writer)?;
        writer.flush()?;
        sink(child)?;
        Ok(())
    }
}

/// Read a NUL terminated, ISO 8859-1 encoded header field.
fn read_latin1_cstring(window: &mut FileWindow) -> ParseResult<Option<CompactString>> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        window.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        raw.push(byte[0]);
        if raw.len() > 4096 {
            return Err(ParseRejection::invalid("unterminated header field").into());
        }
    }
    // Latin-1 maps bytes straight to code points
    Ok(Some(raw.iter().map(|&b| char::from(b)).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanEnvironment;
    use pretty_assertions::assert_eq;

    fn gzip_bytes(data: &[u8], name: Option<&str>) -> Vec<u8> {
        let mut builder = flate2::GzBuilder::new();
        if let Some(name) = name {
            builder = builder.filename(name);
        }
        let mut encoder = builder.write(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).expect("compress");
        encoder.finish().expect("finish")
    }

    fn parse_at(data: &[u8], offset: u64) -> ParseResult<(u64, Option<CompactString>)> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("input");
        std::fs::write(&path, data).expect("write");
        let env = ScanEnvironment::builder()
            .unpack_directory(dir.path().join("unpack"))
            .temporary_directory(dir.path().join("tmp"))
            .build()
            .expect("env");
        let mut window = FileWindow::open(&path, offset).expect("window");
        let ctx = ParseContext { env: &env, offset };
        let parsed = GzipParser.parse(&mut window, &ctx)?;
        assert!(!parsed.labels().is_empty());
        let size = parsed.unpacked_size();
        let name = parsed.metadata().get("name").and_then(|v| match v {
            serde_cbor::Value::Text(s) => Some(CompactString::from(s.as_str())),
            _ => None,
        });
        Ok((size, name))
    }

    #[test]
    fn test_parse_measures_exactly() {
        let member = gzip_bytes(b"hello\n", None);
        let (size, name) = parse_at(&member, 0).expect("parse");
        assert_eq!(size, member.len() as u64);
        assert_eq!(name, None);
    }

    #[test]
    fn test_parse_stops_at_member_end() {
        let mut data = gzip_bytes(b"hello\n", Some("hello"));
        let first = data.len() as u64;
        data.extend_from_slice(&gzip_bytes(b"world\n", None));
        let (size, name) = parse_at(&data, 0).expect("parse");
        assert_eq!(size, first);
        assert_eq!(name, Some("hello".into()));
        // And the second member parses at its own offset
        let (size, _) = parse_at(&data, first).expect("parse");
        assert_eq!(size, data.len() as u64 - first);
    }

    #[test]
    fn test_fname_adds_renamed_label() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = ScanEnvironment::builder()
            .unpack_directory(dir.path().join("unpack"))
            .temporary_directory(dir.path().join("tmp"))
            .build()
            .expect("env");
        let labels_of = |data: &[u8]| {
            let path = dir.path().join("input");
            std::fs::write(&path, data).expect("write");
            let mut window = FileWindow::open(&path, 0).expect("window");
            let ctx = ParseContext { env: &env, offset: 0 };
            GzipParser.parse(&mut window, &ctx).expect("parse").labels()
        };

        let renamed = labels_of(&gzip_bytes(b"hello\n", Some("orig")));
        assert!(renamed.contains(&"renamed".into()));

        let plain = labels_of(&gzip_bytes(b"hello\n", None));
        assert!(plain.contains(&"gzip".into()));
        assert!(!plain.contains(&"renamed".into()));
    }

    #[test]
    fn test_propagated_name_is_used_when_header_has_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let unpack = dir.path().join("unpack");
        std::fs::create_dir(&unpack).expect("mkdir");
        let input = dir.path().join("blob");
        std::fs::write(&input, gzip_bytes(b"payload", None)).expect("write");
        let env = ScanEnvironment::builder()
            .unpack_directory(unpack.clone())
            .temporary_directory(dir.path().join("tmp"))
            .build()
            .expect("env");

        let mut md = crate::meta_directory::MetaDirectory::create_root(&unpack, &input)
            .expect("root");
        md.info_mut()
            .propagated
            .insert("name".into(), "suggested.bin".into());

        let mut window = FileWindow::open(&input, 0).expect("window");
        let ctx = ParseContext { env: &env, offset: 0 };
        let parsed = GzipParser.parse(&mut window, &ctx).expect("parse");
        window.rewind_window().expect("rewind");
        let mut children = Vec::new();
        let mut sink = |child: crate::meta_directory::MetaDirectory| -> eyre::Result<()> {
            children.push(child);
            Ok(())
        };
        parsed
            .unpack(&mut window, &ctx, &mut md, &mut sink)
            .expect("unpack");
        assert!(md.info().unpacked_relative_files.contains_key("suggested.bin"));
        assert_eq!(children.len(), 1);
    }

    #[test]
    fn test_truncated_member_rejects() {
        let member = gzip_bytes(b"some reasonable amount of data", None);
        let result = parse_at(&member[..member.len() / 2], 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_corrupt_crc_rejects() {
        let mut member = gzip_bytes(b"hello\n", None);
        let crc_at = member.len() - 8;
        member[crc_at] ^= 0xff;
        let result = parse_at(&member, 0);
        assert!(result.is_err());
    }
}
