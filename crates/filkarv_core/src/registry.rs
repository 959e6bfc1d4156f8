//! Parser registry and signature index
//!
//! All parsers are registered once at startup; the registry builds an
//! extension index, the featureless list and one multi-pattern automaton
//! over every declared signature. A pattern hit at absolute position `p`
//! for a signature declared at in-format offset `d` means the format
//! would start at `p - d`; hits that would start before the file does
//! are dropped.

use crate::parser::FormatParser;
use ahash::AHashMap;
use compact_str::CompactString;
use eyre::WrapErr;
use smallvec::SmallVec;

/// A candidate produced by the signature sweep: `parser` might apply at
/// `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SignatureHit {
    /// Offset the format would start at
    pub offset: u64,
    /// Index into the registry (which is also registration order, the
    /// tie break order for candidates at equal offsets)
    pub parser: usize,
}

pub struct ParserRegistry {
    parsers: Vec<Box<dyn FormatParser>>,
    extension_index: AHashMap<CompactString, SmallVec<[usize; 2]>>,
    featureless: Vec<usize>,
    automaton: aho_corasick::AhoCorasick,
    /// Per automaton pattern: owning parser index
    pattern_parser: Vec<usize>,
    /// Per automaton pattern: declared offset within the format
    pattern_shift: Vec<u64>,
    longest_signature: usize,
}

impl ParserRegistry {
    pub fn new(parsers: Vec<Box<dyn FormatParser>>) -> eyre::Result<Self> {
        let mut extension_index: AHashMap<CompactString, SmallVec<[usize; 2]>> =
            AHashMap::new();
        let mut featureless = Vec::new();
        let mut patterns: Vec<&'static [u8]> = Vec::new();
        let mut pattern_parser = Vec::new();
        let mut pattern_shift = Vec::new();
        let mut longest_signature = 0;

        for (index, parser) in parsers.iter().enumerate() {
            for ext in parser.extensions() {
                debug_assert!(ext.starts_with('.') && *ext == ext.to_ascii_lowercase());
                extension_index
                    .entry(CompactString::from(*ext))
                    .or_default()
                    .push(index);
            }
            for signature in parser.signatures() {
                patterns.push(signature.pattern);
                pattern_parser.push(index);
                pattern_shift.push(signature.offset);
                longest_signature = longest_signature.max(signature.pattern.len());
            }
            if parser.scan_if_featureless() {
                featureless.push(index);
            }
        }

        let automaton = aho_corasick::AhoCorasick::new(&patterns)
            .wrap_err("Failed to build signature automaton")?;

        Ok(Self {
            parsers,
            extension_index,
            featureless,
            automaton,
            pattern_parser,
            pattern_shift,
            longest_signature,
        })
    }

    pub fn parser(&self, index: usize) -> &dyn FormatParser {
        self.parsers[index].as_ref()
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    /// Length of the longest declared pattern; the sweep overlaps its
    /// chunks by one less than this so no match straddles a boundary.
    pub fn longest_signature_length(&self) -> usize {
        self.longest_signature
    }

    /// Parsers registered for any extension `file_name` carries
    /// (case-insensitive, longest extension first, registration order
    /// within one extension).
    pub fn parsers_for_extension(&self, file_name: &str) -> SmallVec<[usize; 4]> {
        let lower = file_name.to_ascii_lowercase();
        let mut result = SmallVec::new();
        for (pos, _) in lower.match_indices('.') {
            if let Some(parsers) = self.extension_index.get(&lower[pos..]) {
                for &parser in parsers {
                    if !result.contains(&parser) {
                        result.push(parser);
                    }
                }
            }
        }
        result
    }

    /// Parsers to try on files with no signature and no extension match.
    pub fn featureless_parsers(&self) -> &[usize] {
        &self.featureless
    }

    /// Find all signature candidates in `buffer`, which starts at
    /// absolute file offset `buffer_base`. Matches ending at or before
    /// `min_end` (bytes already scanned in the previous chunk's overlap)
    /// are skipped, as are candidates that would start before the file.
    pub fn match_signatures(
        &self,
        buffer: &[u8],
        buffer_base: u64,
        min_end: usize,
    ) -> Vec<SignatureHit> {
        let mut hits = Vec::new();
        for m in self.automaton.find_overlapping_iter(buffer) {
            if m.end() <= min_end {
                continue;
            }
            let pattern = m.pattern().as_usize();
            let start = buffer_base + m.start() as u64;
            let shift = self.pattern_shift[pattern];
            if start < shift {
                // Signature shifted before the start of the file
                continue;
            }
            hits.push(SignatureHit {
                offset: start - shift,
                parser: self.pattern_parser[pattern],
            });
        }
        hits
    }
}
