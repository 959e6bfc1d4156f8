//! 7z
//!
//! The signature header alone fixes the archive length (32 byte header
//! plus the next header's offset and size), so carving never depends on
//! the external tool. Both header CRCs are validated. Encrypted
//! archives are recognised by the AES coder id in the next header and
//! accepted without children; everything else is extracted with the
//! `7z` program during parse, so a tool failure is still an ordinary
//! rejection.

use crate::meta_directory::MetaDirectory;
use crate::parser::ChildSink;
use crate::parser::FileWindow;
use crate::parser::FormatParser;
use crate::parser::Labels;
use crate::parser::ParseContext;
use crate::parser::ParseResult;
use crate::parser::Parsed;
use crate::parser::ensure_format;
use crate::tool::ExternalTool;
use eyre::WrapErr;
use filkarv_types::ParseRejection;
use filkarv_types::Signature;
use std::ffi::OsString;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

static SEVENZIP_TOOL: ExternalTool = ExternalTool::new("7z");

/// Coder id of AES-256 + SHA-256, the encryption 7z uses
const AES_CODER_ID: [u8; 4] = [0x06, 0xf1, 0x07, 0x01];

pub(crate) struct SevenzipParser;

impl FormatParser for SevenzipParser {
    fn pretty_name(&self) -> &'static str {
        "7z"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".7z"]
    }

    fn signatures(&self) -> &'static [Signature] {
        const SIGNATURES: &[Signature] = &[Signature::new(0, b"7z\xbc\xaf\x27\x1c")];
        SIGNATURES
    }

    fn parse(
        &self,
        window: &mut FileWindow,
        ctx: &ParseContext<'_>,
    ) -> ParseResult<Box<dyn Parsed>> {
        let mut signature_header = [0u8; 32];
        window.read_exact(&mut signature_header)?;
        ensure_format(
            signature_header[..6] == *b"7z\xbc\xaf\x27\x1c",
            "not a 7z archive",
        )?;
        let start_header = &signature_header[12..32];
        let start_header_crc =
            u32::from_le_bytes(signature_header[8..12].try_into().expect("slice of 4"));
        if crc32(start_header) != start_header_crc {
            return Err(ParseRejection::checksum_mismatch("invalid start header CRC").into());
        }
        let next_header_offset =
            u64::from_le_bytes(start_header[0..8].try_into().expect("slice of 8"));
        let next_header_size =
            u64::from_le_bytes(start_header[8..16].try_into().expect("slice of 8"));
        let next_header_crc =
            u32::from_le_bytes(start_header[16..20].try_into().expect("slice of 4"));

        ensure_format(next_header_size > 0, "empty archive header")?;
        if next_header_size > ctx.env.max_bytes {
            return Err(ParseRejection::invalid("unreasonably large archive header").into());
        }
        let size = 32u64
            .checked_add(next_header_offset)
            .and_then(|v| v.checked_add(next_header_size))
            .ok_or_else(|| ParseRejection::invalid("archive length overflow"))?;
        if size > window.size() {
            return Err(ParseRejection::truncated("archive extends past end of input").into());
        }

        window.seek(SeekFrom::Start(32 + next_header_offset))?;
        let mut next_header = vec![0u8; usize::try_from(next_header_size).expect("checked above")];
        window.read_exact(&mut next_header)?;
        if crc32(&next_header) != next_header_crc {
            return Err(ParseRejection::checksum_mismatch("invalid next header CRC").into());
        }

        let encrypted = next_header
            .windows(AES_CODER_ID.len())
            .any(|chunk| chunk == AES_CODER_ID);

        // Non-encrypted content is test-extracted right here; any tool
        // problem must reject the candidate, not kill the scan
        let extracted = if encrypted {
            None
        } else {
            SEVENZIP_TOOL.require()?;
            Some(extract_to_scratch(window, ctx, size)?)
        };

        Ok(Box::new(ParsedSevenzip {
            size,
            encrypted,
            extracted,
        }))
    }
}

/// Run `7z x` into a scratch directory. The archive is copied out of the
/// scanned file first whenever it is not the whole file, because 7z
/// insists on looking at all data it is given.
fn extract_to_scratch(
    window: &mut FileWindow,
    ctx: &ParseContext<'_>,
    size: u64,
) -> ParseResult<tempfile::TempDir> {
    let scratch = tempfile::Builder::new()
        .prefix("sevenzip-")
        .tempdir_in(&ctx.env.temporary_directory)?;

    let archive_path = scratch.path().join("archive.7z");
    window.rewind_window()?;
    let mut archive_file = std::fs::File::create(&archive_path)?;
    std::io::copy(&mut window.take(size), &mut archive_file)?;
    archive_file.flush()?;
    drop(archive_file);

    let output_dir = scratch.path().join("contents");
    std::fs::create_dir(&output_dir)?;
    let mut out_flag = OsString::from("-o");
    out_flag.push(&output_dir);
    SEVENZIP_TOOL.run(
        [
            OsString::from("x"),
            OsString::from("-y"),
            OsString::from("-p"),
            out_flag,
            archive_path.into_os_string(),
        ],
        scratch.path(),
    )?;
    Ok(scratch)
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(data);
    crc.sum()
}

struct ParsedSevenzip {
    size: u64,
    encrypted: bool,
    /// Scratch directory holding the test extraction; cleaned up on drop
    extracted: Option<tempfile::TempDir>,
}

impl Parsed for ParsedSevenzip {
    fn unpacked_size(&self) -> u64 {
        self.size
    }

    fn labels(&self) -> Labels {
        let mut labels: Labels = ["7z".into(), "archive".into(), "compressed".into()]
            .into_iter()
            .collect();
        if self.encrypted {
            labels.push("encrypted".into());
        }
        labels
    }

    fn unpack(
        &self,
        _window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
        md: &mut MetaDirectory,
        sink: ChildSink<'_>,
    ) -> eyre::Result<()> {
        let Some(scratch) = &self.extracted else {
            return Ok(());
        };
        let contents = scratch.path().join("contents");
        move_tree(&contents, Path::new(""), md, sink)
    }
}

/// Walk the tool's output tree and register every entry with the meta
/// directory store. Symlinks are recorded, never followed.
fn move_tree(
    root: &Path,
    relative: &Path,
    md: &mut MetaDirectory,
    sink: ChildSink<'_>,
) -> eyre::Result<()> {
    let current = root.join(relative);
    for entry in std::fs::read_dir(&current)
        .wrap_err_with(|| format!("Failed to list tool output {current:?}"))?
    {
        let entry = entry?;
        let logical = relative.join(entry.file_name());
        let meta = std::fs::symlink_metadata(entry.path())?;
        if meta.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            md.unpack_symlink(&logical, &target)?;
        } else if meta.is_dir() {
            md.unpack_directory(&logical)?;
            move_tree(root, &logical, md, sink)?;
        } else if meta.is_file() {
            let (child, destination) = md.unpack_regular_file_no_open(&logical)?;
            std::fs::copy(entry.path(), &destination).wrap_err_with(|| {
                format!("Failed to place unpacked file {destination:?}")
            })?;
            sink(child)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanEnvironment;
    use pretty_assertions::assert_eq;

    /// Build a structurally valid 7z whose next header advertises the
    /// AES coder (the layout of an encrypted-header archive).
    fn encrypted_sevenzip() -> Vec<u8> {
        // kEncodedHeader followed by stream info carrying the AES coder id
        let next_header: Vec<u8> = [
            0x17, 0x06, 0x01, 0x00, 0x01, 0x0b, 0x01, 0x00, 0x07, 0x06, 0xf1, 0x07, 0x01, 0x01,
            0x00, 0x0c, 0x00,
        ]
        .to_vec();
        let payload = [0x55u8; 12];

        let mut start_header = Vec::new();
        start_header.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        start_header.extend_from_slice(&(next_header.len() as u64).to_le_bytes());
        start_header.extend_from_slice(&crc32(&next_header).to_le_bytes());

        let mut data = Vec::new();
        data.extend_from_slice(b"7z\xbc\xaf\x27\x1c");
        data.extend_from_slice(&[0x00, 0x04]);
        data.extend_from_slice(&crc32(&start_header).to_le_bytes());
        data.extend_from_slice(&start_header);
        data.extend_from_slice(&payload);
        data.extend_from_slice(&next_header);
        data
    }

    fn parse(data: &[u8]) -> ParseResult<(u64, bool)> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("input.7z");
        std::fs::write(&path, data).expect("write");
        let env = ScanEnvironment::builder()
            .unpack_directory(dir.path().join("unpack"))
            .temporary_directory(dir.path().join("tmp"))
            .build()
            .expect("env");
        std::fs::create_dir_all(&env.temporary_directory).expect("tmp");
        let mut window = FileWindow::open(&path, 0).expect("window");
        let ctx = ParseContext { env: &env, offset: 0 };
        let parsed = SevenzipParser.parse(&mut window, &ctx)?;
        let encrypted = parsed.labels().contains(&"encrypted".into());
        Ok((parsed.unpacked_size(), encrypted))
    }

    #[test]
    fn test_encrypted_archive_is_accepted_without_tool() {
        let data = encrypted_sevenzip();
        let (size, encrypted) = parse(&data).expect("parse");
        assert_eq!(size, data.len() as u64);
        assert!(encrypted);
    }

    #[test]
    fn test_bad_start_header_crc_rejects() {
        let mut data = encrypted_sevenzip();
        data[8] ^= 0xff;
        assert!(parse(&data).is_err());
    }

    #[test]
    fn test_truncated_archive_rejects() {
        let data = encrypted_sevenzip();
        assert!(parse(&data[..data.len() - 2]).is_err());
    }
}
