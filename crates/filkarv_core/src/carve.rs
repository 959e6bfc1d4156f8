//! The carving pipeline
//!
//! For one meta-directory: find every parseable region, carve it,
//! produce children for the regions and for the gaps between them.
//!
//! Order of business (sequential per file; files run in parallel at the
//! scheduler level):
//!
//! 1. extension-directed attempt at offset 0
//! 2. signature sweep (chunked, overlapping by one less than the longest
//!    pattern so no match straddles a boundary)
//! 3. parser tries in stream order; ties at one offset resolve in
//!    registration order; accepted ranges never overlap (the earlier
//!    start wins)
//! 4. featureless pass when the file had no signature hit and no
//!    extension match
//! 5. gap labelling: unclaimed bytes coalesce into `padding` (repeated
//!    0x00/0xff) or `synthesized` children; gaps are never re-parsed

use crate::config::ScanEnvironment;
use crate::meta_directory::MetaDirectory;
use crate::parser::ChildSink;
use crate::parser::FileWindow;
use crate::parser::FormatParser;
use crate::parser::ParseContext;
use crate::parser::ParseError;
use crate::parser::Parsed;
use crate::registry::ParserRegistry;
use crate::registry::SignatureHit;
use eyre::WrapErr;
use eyre::bail;
use eyre::eyre;
use filkarv_types::ExtractedSpan;
use std::fs::File;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;

/// Run the pipeline over `md`. Children (carved regions, unpacked files,
/// gaps) are handed to `sink` as they are produced.
pub(crate) fn carve_file(
    env: &ScanEnvironment,
    registry: &ParserRegistry,
    md: &mut MetaDirectory,
    sink: ChildSink<'_>,
) -> eyre::Result<()> {
    let file_size = md
        .info()
        .size
        .ok_or_else(|| eyre!("File size not computed before carving"))?;
    let path = md.abs_file_path();

    let mut consumed: Vec<ExtractedSpan> = Vec::new();
    let mut watermark = 0u64;

    // Extension-directed attempt
    let file_name = md
        .file_path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext_parsers = registry.parsers_for_extension(&file_name);
    for &parser in &ext_parsers {
        if let Some(size) = try_parser(env, registry, parser, md, &path, 0, file_size, sink)? {
            consumed.push(ExtractedSpan::new(0, size));
            watermark = size;
            break;
        }
    }

    // Signature sweep
    let mut had_hits = false;
    if watermark < file_size {
        let candidates = sweep_signatures(env, registry, &path)
            .wrap_err_with(|| format!("Signature sweep failed for {path:?}"))?;
        had_hits = !candidates.is_empty();
        for hit in candidates {
            if hit.offset < watermark {
                // Inside an already consumed range
                continue;
            }
            if let Some(size) =
                try_parser(env, registry, hit.parser, md, &path, hit.offset, file_size, sink)?
            {
                consumed.push(ExtractedSpan::new(hit.offset, size));
                watermark = hit.offset + size;
                if watermark >= file_size {
                    break;
                }
            }
        }
    }

    // Featureless pass: formats with no reliable magic
    if consumed.is_empty() && !had_hits && ext_parsers.is_empty() {
        for &parser in registry.featureless_parsers() {
            if let Some(size) = try_parser(env, registry, parser, md, &path, 0, file_size, sink)? {
                consumed.push(ExtractedSpan::new(0, size));
                break;
            }
        }
    }

    // Gap labelling. A fully unidentified file is left to its content
    // labels; a gap child identical to its parent would recurse forever.
    if !consumed.is_empty() {
        let mut file = File::open(&path)?;
        let mut gap_start = 0u64;
        let mut gaps = Vec::new();
        for span in &consumed {
            if span.offset > gap_start {
                gaps.push(ExtractedSpan::new(gap_start, span.offset - gap_start));
            }
            gap_start = span.end();
        }
        if gap_start < file_size {
            gaps.push(ExtractedSpan::new(gap_start, file_size - gap_start));
        }
        for gap in gaps {
            let label = classify_gap(&mut file, gap, env.read_size)?;
            file.seek(SeekFrom::Start(gap.offset))?;
            let mut child = md.extract_region(&mut file, gap)?;
            child.info_mut().add_label(label);
            child.info_mut().scanned = true;
            sink(child)?;
        }
    }

    md.info_mut().scanned = true;
    Ok(())
}

/// Try one parser at one offset. `Ok(Some(size))` means the parse was
/// accepted and fully applied (labels, metadata, carve, unpack);
/// `Ok(None)` means rejection. Real I/O errors and parser contract
/// violations are fatal for the job.
#[allow(clippy::too_many_arguments)]
fn try_parser(
    env: &ScanEnvironment,
    registry: &ParserRegistry,
    parser_index: usize,
    md: &mut MetaDirectory,
    path: &Path,
    offset: u64,
    file_size: u64,
    sink: ChildSink<'_>,
) -> eyre::Result<Option<u64>> {
    let parser = registry.parser(parser_index);
    let mut window = FileWindow::open(path, offset)
        .wrap_err_with(|| format!("Failed to open {path:?} at {offset:#x}"))?;
    let ctx = ParseContext { env, offset };

    let parsed = match parser.parse(&mut window, &ctx).map_err(ParseError::normalise) {
        Ok(parsed) => parsed,
        Err(ParseError::Rejected(rejection)) => {
            tracing::debug!(
                parser = parser.pretty_name(),
                offset,
                "Rejected {:?}: {rejection}",
                md.file_path()
            );
            return Ok(None);
        }
        Err(ParseError::Io(err)) => {
            return Err(err).wrap_err_with(|| {
                format!(
                    "I/O error while {} parsed {:?} at {offset:#x}",
                    parser.pretty_name(),
                    md.file_path()
                )
            });
        }
    };

    let size = parsed.unpacked_size();
    if size == 0 || size > window.size() {
        bail!(
            "Parser {} violated its contract on {:?}: unpacked size {size} for a window of {}",
            parser.pretty_name(),
            md.file_path(),
            window.size()
        );
    }
    tracing::debug!(
        parser = parser.pretty_name(),
        offset,
        size,
        "Parsed {:?}",
        md.file_path()
    );

    window.rewind_window()?;
    if offset == 0 && size == file_size {
        // The whole file is this format; the current meta-directory is
        // itself labelled and no separate carved child is created.
        apply_parse(parsed.as_ref(), md);
        parsed.unpack(&mut window, &ctx, md, sink)?;
    } else {
        let mut source = File::open(path)?;
        source.seek(SeekFrom::Start(offset))?;
        let span = ExtractedSpan::new(offset, size);
        let mut child = md.extract_region(&mut source, span)?;
        apply_parse(parsed.as_ref(), &mut child);
        parsed.unpack(&mut window, &ctx, &mut child, sink)?;
        child.info_mut().scanned = true;
        sink(child)?;
    }
    Ok(Some(size))
}

/// Record labels and metadata from a successful parse.
fn apply_parse(parsed: &dyn Parsed, md: &mut MetaDirectory) {
    let info = md.info_mut();
    for label in parsed.labels() {
        info.labels.insert(label);
    }
    let metadata = parsed.metadata();
    if !metadata.is_empty() {
        info.metadata.extend(metadata);
    }
}

/// Stream the file through the signature automaton and return all
/// candidates sorted by (offset, registration order).
fn sweep_signatures(
    env: &ScanEnvironment,
    registry: &ParserRegistry,
    path: &Path,
) -> eyre::Result<Vec<SignatureHit>> {
    let longest = registry.longest_signature_length();
    if longest == 0 {
        return Ok(Vec::new());
    }
    let overlap = longest - 1;
    let chunk_size = env.signature_chunk_size.max(longest);

    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; overlap + chunk_size];
    let mut candidates = Vec::new();
    let mut base = 0u64;
    let mut carry = 0usize;
    loop {
        let fresh = read_fill(&mut file, &mut buffer[carry..])?;
        if fresh == 0 {
            break;
        }
        let valid = carry + fresh;
        candidates.extend(registry.match_signatures(&buffer[..valid], base, carry));
        if valid < buffer.len() {
            break;
        }
        base += (valid - overlap) as u64;
        buffer.copy_within(valid - overlap..valid, 0);
        carry = overlap;
    }
    candidates.sort();
    candidates.dedup();
    Ok(candidates)
}

/// Decide whether a gap is classic fill padding or arbitrary
/// unidentified bytes.
fn classify_gap(file: &mut File, gap: ExtractedSpan, read_size: usize) -> eyre::Result<&'static str> {
    file.seek(SeekFrom::Start(gap.offset))?;
    let mut buffer = vec![0u8; read_size.min(64 * 1024).max(4096)];
    let mut remaining = gap.size;
    let mut fill: Option<u8> = None;
    while remaining > 0 {
        let want = buffer.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = match file.read(&mut buffer[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => Err(e)?,
        };
        for &byte in &buffer[..n] {
            match fill {
                None => fill = Some(byte),
                Some(first) if first != byte => return Ok("synthesized"),
                Some(_) => {}
            }
        }
        remaining -= n as u64;
    }
    Ok(match fill {
        Some(0x00 | 0xff) => "padding",
        _ => "synthesized",
    })
}

fn read_fill(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
