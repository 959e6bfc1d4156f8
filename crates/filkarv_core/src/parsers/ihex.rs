//! Intel HEX
//!
//! No reliable magic, so this runs on extension hints and in the
//! featureless pass. Records are validated line by line (including the
//! per-record checksum) up to the end-of-file record; the data records
//! are reassembled into one child.

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
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_MAX: u8 = 0x05;

pub(crate) struct IhexParser;

impl FormatParser for IhexParser {
    fn pretty_name(&self) -> &'static str {
        "ihex"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".hex", ".ihex"]
    }

    fn scan_if_featureless(&self) -> bool {
        true
    }

    fn parse(
        &self,
        window: &mut FileWindow,
        ctx: &ParseContext<'_>,
    ) -> ParseResult<Box<dyn Parsed>> {
        if window.size() > ctx.env.max_bytes {
            return Err(ParseRejection::invalid("too large for a hex dump").into());
        }
        let mut text = Vec::new();
        window.read_to_end(&mut text)?;

        let mut data = Vec::new();
        let mut offset = 0usize;
        let mut saw_eof = false;
        let mut records = 0usize;
        while offset < text.len() {
            let line_end = text[offset..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(text.len(), |p| offset + p + 1);
            let line = &text[offset..line_end];
            let trimmed = trim_line(line);
            if trimmed.is_empty() {
                offset = line_end;
                continue;
            }
            let record = parse_record(trimmed)?;
            records += 1;
            match record.kind {
                RECORD_DATA => data.extend_from_slice(&record.data),
                RECORD_EOF => {
                    saw_eof = true;
                    offset = line_end;
                    break;
                }
                // Segment/linear address records only move the load
                // address; the reassembled image stays in record order
                _ => {}
            }
            offset = line_end;
        }
        ensure_format(saw_eof, "no end-of-file record")?;
        ensure_format(records > 1, "no data records")?;
        Ok(Box::new(ParsedIhex {
            size: offset as u64,
            data,
        }))
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut line = line;
    while let Some((&last, rest)) = line.split_last() {
        if last == b'\n' || last == b'\r' || last == b' ' {
            line = rest;
        } else {
            break;
        }
    }
    line
}

struct Record {
    kind: u8,
    data: Vec<u8>,
}

fn parse_record(line: &[u8]) -> ParseResult<Record> {
    if line.first() != Some(&b':') || line.len() < 11 || line.len() % 2 == 0 {
        return Err(ParseRejection::invalid("malformed record").into());
    }
    let mut raw = vec![0u8; (line.len() - 1) / 2];
    faster_hex::hex_decode(&line[1..], &mut raw)
        .map_err(|_| ParseRejection::invalid("record is not hex"))?;

    let length = usize::from(raw[0]);
    if raw.len() != length + 5 {
        return Err(ParseRejection::invalid("record length mismatch").into());
    }
    let kind = raw[3];
    if kind > RECORD_MAX {
        return Err(ParseRejection::invalid("unknown record type").into());
    }
    let sum = raw.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        return Err(ParseRejection::checksum_mismatch("record checksum").into());
    }
    Ok(Record {
        kind,
        data: raw[4..4 + length].to_vec(),
    })
}

struct ParsedIhex {
    size: u64,
    data: Vec<u8>,
}

impl Parsed for ParsedIhex {
    fn unpacked_size(&self) -> u64 {
        self.size
    }

    fn labels(&self) -> Labels {
        ["ihex".into(), "text".into()].into_iter().collect()
    }

    fn unpack(
        &self,
        _window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
        md: &mut MetaDirectory,
        sink: ChildSink<'_>,
    ) -> eyre::Result<()> {
        let scanned = md.file_path().to_path_buf();
        let output = [(".ihex", ""), (".hex", "")]
            .into_iter()
            .find_map(|(stripped, appended)| stem_with_suffix(&scanned, stripped, appended))
            .map_or_else(
                || PathBuf::from("unpacked_from_ihex"),
                |stem| PathBuf::from(stem.as_str()),
            );
        let (child, mut file) = md.unpack_regular_file(&output)?;
        file.write_all(&self.data)?;
        drop(file);
        sink(child)?;
        Ok(())
    }
}
