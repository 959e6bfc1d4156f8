//! Unix ar archives (also the outer container of .deb packages)
//!
//! The entry headers are walked by hand to measure the archive; the ar
//! crate does the actual extraction (it resolves GNU long names from
//! the `//` table for us).

use crate::meta_directory::MetaDirectory;
use crate::parser::ChildSink;
use crate::parser::FileWindow;
use crate::parser::FormatParser;
use crate::parser::Labels;
use crate::parser::ParseContext;
use crate::parser::ParseResult;
use crate::parser::Parsed;
use crate::parser::ensure_format;
use filkarv_types::Metadata;
use filkarv_types::Signature;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::PathBuf;

const GLOBAL_HEADER: &[u8; 8] = b"!<arch>\n";
const ENTRY_HEADER_LEN: u64 = 60;

pub(crate) struct ArParser;

impl FormatParser for ArParser {
    fn pretty_name(&self) -> &'static str {
        "ar"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".a", ".deb"]
    }

    fn signatures(&self) -> &'static [Signature] {
        const SIGNATURES: &[Signature] = &[Signature::new(0, b"!<arch>")];
        SIGNATURES
    }

    fn parse(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
    ) -> ParseResult<Box<dyn Parsed>> {
        let mut magic = [0u8; 8];
        window.read_exact(&mut magic)?;
        ensure_format(&magic == GLOBAL_HEADER, "not an ar archive")?;

        let mut position = GLOBAL_HEADER.len() as u64;
        let mut entries = 0usize;
        loop {
            if position == window.size() {
                break;
            }
            window.seek(SeekFrom::Start(position))?;
            let mut header = [0u8; ENTRY_HEADER_LEN as usize];
            if window.read_exact(&mut header).is_err() {
                // Trailing partial data is not part of the archive
                break;
            }
            if &header[58..60] != b"`\n" {
                break;
            }
            let Some(size) = parse_decimal(&header[48..58]) else {
                break;
            };
            let data_end = position + ENTRY_HEADER_LEN + size;
            if data_end > window.size() {
                break;
            }
            // Entries are padded to even offsets
            position = data_end + (size & 1);
            entries += 1;
        }
        ensure_format(entries > 0, "no entries")?;
        let size = position.min(window.size());
        Ok(Box::new(ParsedAr { size, entries }))
    }
}

fn parse_decimal(field: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(field).ok()?.trim_end();
    text.parse().ok()
}

struct ParsedAr {
    size: u64,
    entries: usize,
}

impl Parsed for ParsedAr {
    fn unpacked_size(&self) -> u64 {
        self.size
    }

    fn labels(&self) -> Labels {
        ["ar".into(), "archive".into()].into_iter().collect()
    }

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(
            "entries".into(),
            serde_cbor::Value::Integer(self.entries as i128),
        );
        metadata
    }

    fn unpack(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
        md: &mut MetaDirectory,
        sink: ChildSink<'_>,
    ) -> eyre::Result<()> {
        let mut archive = ar::Archive::new((&mut *window).take(self.size));
        while let Some(entry) = archive.next_entry() {
            let mut entry = entry?;
            let name = String::from_utf8_lossy(entry.header().identifier()).into_owned();
            if name.is_empty() || name == "/" || name == "//" {
                continue;
            }
            let (child, file) = md.unpack_regular_file(&PathBuf::from(&name))?;
            let mut writer = BufWriter::new(file);
            std::io::copy(&mut entry, &mut writer)?;
            writer.flush()?;
            drop(entry);
            sink(child)?;
        }
        Ok(())
    }
}
