//! The typed rejection a parser returns when offered bytes it cannot parse

use compact_str::CompactString;

/// Why a parser rejected its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum RejectKind {
    /// Wrong magic semantics, out-of-range field, structurally broken
    #[strum(to_string = "invalid structure")]
    Invalid,
    /// The format claims more data than the file holds
    #[strum(to_string = "truncated input")]
    Truncated,
    /// A CRC or digest specified by the format did not match
    #[strum(to_string = "checksum mismatch")]
    ChecksumMismatch,
    /// An external tool required by the parser is not installed
    #[strum(to_string = "external tool missing")]
    ToolMissing,
    /// The external tool exited nonzero or produced invalid output
    #[strum(to_string = "external tool failed")]
    ToolFailure,
}

/// A parser inspected the bytes and decided they do not match its format.
///
/// This is the only error a parser may surface for bad input; the carving
/// pipeline recovers from it locally and moves to the next candidate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct ParseRejection {
    pub kind: RejectKind,
    pub reason: CompactString,
}

impl ParseRejection {
    pub fn new(kind: RejectKind, reason: impl Into<CompactString>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<CompactString>) -> Self {
        Self::new(RejectKind::Invalid, reason)
    }

    pub fn truncated(reason: impl Into<CompactString>) -> Self {
        Self::new(RejectKind::Truncated, reason)
    }

    pub fn checksum_mismatch(reason: impl Into<CompactString>) -> Self {
        Self::new(RejectKind::ChecksumMismatch, reason)
    }

    pub fn tool_missing(tool: &str) -> Self {
        Self::new(
            RejectKind::ToolMissing,
            compact_str::format_compact!("{tool} program not found"),
        )
    }

    pub fn tool_failure(reason: impl Into<CompactString>) -> Self {
        Self::new(RejectKind::ToolFailure, reason)
    }
}
