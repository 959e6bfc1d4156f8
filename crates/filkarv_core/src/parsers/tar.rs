//! POSIX/GNU tar
//!
//! Size is computed from the member headers themselves: the last
//! member's data end rounded up to a block, plus any 512 aligned zero
//! blocks some implementations pad with. Structural errors anywhere in
//! the member chain reject the whole candidate.

use crate::meta_directory::MetaDirectory;
use crate::parser::ChildSink;
use crate::parser::FileWindow;
use crate::parser::FormatParser;
use crate::parser::Labels;
use crate::parser::ParseContext;
use crate::parser::ParseResult;
use crate::parser::Parsed;
use crate::parser::ensure_format;
use eyre::WrapErr;
use filkarv_types::ParseRejection;
use filkarv_types::Signature;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

const BLOCK: u64 = 512;

pub(crate) struct TarParser;

impl FormatParser for TarParser {
    fn pretty_name(&self) -> &'static str {
        "tar"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".tar"]
    }

    fn signatures(&self) -> &'static [Signature] {
        const SIGNATURES: &[Signature] = &[
            Signature::new(0x101, b"ustar\x00"),
            Signature::new(0x101, b"ustar\x20\x20\x00"),
        ];
        SIGNATURES
    }

    fn parse(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
    ) -> ParseResult<Box<dyn Parsed>> {
        let mut members = 0usize;
        let mut end = 0u64;
        {
            let mut archive = tar::Archive::new(&mut *window);
            let entries = archive
                .entries()
                .map_err(|e| ParseRejection::invalid(e.to_string()))?;
            for entry in entries {
                // Anything wrong in the member chain (bad checksum,
                // short header) means this is not a tar we accept
                let entry = entry.map_err(|e| ParseRejection::invalid(e.to_string()))?;
                members += 1;
                end = entry.raw_file_position() + entry.size().div_ceil(BLOCK) * BLOCK;
            }
        }
        ensure_format(members > 0, "no members")?;

        // Some tar writers align the archive on larger blocks with zero
        // padding that the member walk does not see
        if end % BLOCK == 0 {
            window.seek(SeekFrom::Start(end))?;
            let mut block = [0u8; BLOCK as usize];
            loop {
                match window.read_exact(&mut block) {
                    Ok(()) if block.iter().all(|&b| b == 0) => end += BLOCK,
                    _ => break,
                }
            }
        }

        Ok(Box::new(ParsedTar { size: end }))
    }
}

struct ParsedTar {
    size: u64,
}

impl Parsed for ParsedTar {
    fn unpacked_size(&self) -> u64 {
        self.size
    }

    fn labels(&self) -> Labels {
        ["tar".into(), "archive".into()].into_iter().collect()
    }

    fn unpack(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
        md: &mut MetaDirectory,
        sink: ChildSink<'_>,
    ) -> eyre::Result<()> {
        let mut archive = tar::Archive::new(&mut *window);
        for entry in archive.entries().wrap_err("Re-reading validated archive")? {
            let mut entry = entry.wrap_err("Re-reading validated member")?;
            let path = PathBuf::from(std::ffi::OsStr::from_bytes(&entry.path_bytes()));
            if skip_name(&path) {
                continue;
            }
            let kind = entry.header().entry_type();
            if kind.is_file() {
                let (child, file) = md.unpack_regular_file(&path)?;
                let mut writer = BufWriter::new(file);
                std::io::copy(&mut entry, &mut writer)?;
                writer.flush()?;
                sink(child)?;
            } else if kind.is_dir() {
                md.unpack_directory(&path)?;
            } else if kind.is_symlink() {
                if let Some(target) = entry.link_name()? {
                    md.unpack_symlink(&path, &target)?;
                }
            } else if kind.is_hard_link() {
                if let Some(target) = entry.link_name()? {
                    md.unpack_hardlink(&path, &target)?;
                }
            } else {
                // Device nodes, fifos, sockets: containment only, no bytes
                tracing::debug!("Skipping special tar member {path:?}");
            }
        }
        Ok(())
    }
}

fn skip_name(path: &Path) -> bool {
    let raw = path.as_os_str();
    raw.is_empty() || raw == "." || raw == ".." || raw == "/"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanEnvironment;
    use pretty_assertions::assert_eq;

    fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_ustar();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).expect("append");
        }
        builder.into_inner().expect("finish")
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
        Ok(TarParser.parse(&mut window, &ctx)?.unpacked_size())
    }

    #[test]
    fn test_measures_whole_archive() {
        let data = tar_bytes(&[("a.txt", b"aaa"), ("b/c.txt", b"ccc")]);
        // The builder emits the trailing zero blocks; the parser must
        // claim every one of them
        assert_eq!(parse_len(&data).expect("parse"), data.len() as u64);
    }

    #[test]
    fn test_stops_before_trailing_non_zero_data() {
        let mut data = tar_bytes(&[("a.txt", b"aaa")]);
        let archive = data.len() as u64;
        data.extend_from_slice(b"something else entirely");
        assert_eq!(parse_len(&data).expect("parse"), archive);
    }

    #[test]
    fn test_corrupt_checksum_rejects() {
        let mut data = tar_bytes(&[("a.txt", b"aaa")]);
        // Break the header checksum field
        data[148] = b'9';
        data[149] = b'9';
        assert!(parse_len(&data).is_err());
    }
}
