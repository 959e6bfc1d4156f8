//! Content level labelling
//!
//! Applied to every scanned file from the single digest pass, after any
//! parser has run. These labels augment (never replace) what a parser
//! set.

use compact_str::CompactString;
use filkarv_types::LabelSet;
use filkarv_utils::digest::DigestSummary;

/// Byte values that may appear in a text file: ASCII printable plus
/// whitespace.
fn is_printable(byte: u8) -> bool {
    matches!(byte, 0x20..=0x7e | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

/// Line breaks are the only bytes allowed to interleave base64 content.
fn is_line_break(byte: u8) -> bool {
    matches!(byte, b'\n' | b'\r')
}

fn is_base64_standard(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'=')
}

fn is_base64_urlsafe(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'=')
}

/// Well known interpreters get a friendlier label than their basename.
static INTERPRETERS: phf::Map<&'static str, &'static str> = phf::phf_map! {
    "sh" => "shell",
    "bash" => "shell",
    "dash" => "shell",
    "ash" => "shell",
    "zsh" => "shell",
    "ksh" => "shell",
    "python" => "python",
    "python2" => "python",
    "python3" => "python",
    "perl" => "perl",
};

/// Compute the content labels for one digested file.
pub fn content_labels(summary: &DigestSummary) -> LabelSet {
    let mut labels = LabelSet::new();
    if summary.size == 0 {
        labels.insert("empty".into());
        return labels;
    }

    let text = summary
        .histogram
        .iter()
        .enumerate()
        .all(|(byte, &count)| count == 0 || is_printable(byte as u8));
    labels.insert(if text { "text" } else { "binary" }.into());

    // Padding: a repeated single byte, and only the classic fill values
    if summary.size >= 2 && summary.distinct_bytes() == 1 {
        let byte = summary
            .histogram
            .iter()
            .position(|&count| count > 0)
            .expect("one distinct byte");
        if byte == 0x00 || byte == 0xff {
            labels.insert("padding".into());
        }
    }

    if text {
        let alphabet_matches = |f: fn(u8) -> bool| {
            let mut any = false;
            let ok = summary.histogram.iter().enumerate().all(|(byte, &count)| {
                let byte = byte as u8;
                if count == 0 || is_line_break(byte) {
                    return true;
                }
                any = true;
                f(byte)
            });
            ok && any
        };
        let standard = alphabet_matches(is_base64_standard);
        let urlsafe = alphabet_matches(is_base64_urlsafe);
        if standard || urlsafe {
            labels.insert("base64".into());
        }
        if urlsafe {
            labels.insert("urlsafe".into());
        }

        if let Some(interpreter) = shebang_interpreter(&summary.head) {
            labels.insert("script".into());
            labels.insert(interpreter);
        }
    }

    labels
}

/// Resolve `#!` lines to an interpreter label.
fn shebang_interpreter(head: &[u8]) -> Option<CompactString> {
    let rest = head.strip_prefix(b"#!")?;
    let line = rest.split(|&b| b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?.trim();
    let mut words = line.split_ascii_whitespace();
    let mut program = words.next()?.rsplit('/').next()?;
    if program == "env" {
        program = words.next()?.rsplit('/').next()?;
    }
    if program.is_empty() {
        return None;
    }
    Some(
        INTERPRETERS
            .get(program)
            .map_or_else(|| CompactString::from(program), |&known| known.into()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use filkarv_utils::digest::digest_reader;
    use pretty_assertions::assert_eq;

    fn labels_for(data: &[u8]) -> LabelSet {
        let summary = digest_reader(&mut &data[..], 4096, false).expect("digest");
        content_labels(&summary)
    }

    fn set(labels: &[&str]) -> LabelSet {
        labels.iter().map(|&l| l.into()).collect()
    }

    #[test]
    fn test_empty() {
        assert_eq!(labels_for(b""), set(&["empty"]));
    }

    #[test]
    fn test_padding_zero_bytes() {
        assert_eq!(labels_for(&[0u8; 20]), set(&["binary", "padding"]));
        assert_eq!(labels_for(&[0xffu8; 20]), set(&["binary", "padding"]));
        // A repeated byte that is not a fill value is not padding
        assert_eq!(labels_for(&[0xaau8; 20]), set(&["binary"]));
        // A single byte is not padding
        assert_eq!(labels_for(&[0u8]), set(&["binary"]));
    }

    #[test]
    fn test_text_vs_binary() {
        assert_eq!(labels_for(b"hello world\n"), set(&["text"]));
        assert_eq!(labels_for(b"hello\x00world"), set(&["binary"]));
    }

    #[test]
    fn test_base64_alphabets() {
        assert_eq!(
            labels_for(b"aGVsbG8gd29ybGQ=\n"),
            set(&["text", "base64", "urlsafe"])
        );
        // '-' rules out the standard alphabet but not the urlsafe one
        assert_eq!(
            labels_for(b"r7808-ef686b7292\n"),
            set(&["text", "base64", "urlsafe"])
        );
        // '+' rules out urlsafe
        assert_eq!(labels_for(b"ab+cd\n"), set(&["text", "base64"]));
        assert_eq!(labels_for(b"hello world\n"), set(&["text"]));
    }

    #[test]
    fn test_scripts() {
        assert_eq!(
            labels_for(b"#!/bin/sh\necho hi\n"),
            set(&["text", "script", "shell"])
        );
        assert_eq!(
            labels_for(b"#!/usr/bin/env python3\nprint()\n"),
            set(&["text", "script", "python"])
        );
        assert_eq!(
            labels_for(b"#!/usr/local/bin/lua\nprint()\n"),
            set(&["text", "script", "lua"])
        );
    }
}
