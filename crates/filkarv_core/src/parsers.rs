//! The built-in format parsers
//!
//! A closed set, registered explicitly in [`default_parsers`]. Every
//! parser computes its unpacked size from the format itself, even when
//! extraction is delegated to an external tool, so carving never depends
//! on what a tool reports.

pub(crate) mod ar;
pub(crate) mod bzip2;
pub(crate) mod elf;
pub(crate) mod gzip;
pub(crate) mod ihex;
pub(crate) mod sevenzip;
pub(crate) mod tar;
pub(crate) mod xz;
pub(crate) mod zstd;

use crate::parser::FormatParser;

/// All built-in parsers in registration order (which is also the tie
/// break order for signature candidates at equal offsets).
pub fn default_parsers() -> Vec<Box<dyn FormatParser>> {
    vec![
        Box::new(self::gzip::GzipParser),
        Box::new(self::bzip2::Bzip2Parser),
        Box::new(self::xz::XzParser),
        Box::new(self::zstd::ZstdParser),
        Box::new(self::tar::TarParser),
        Box::new(self::ar::ArParser),
        Box::new(self::sevenzip::SevenzipParser),
        Box::new(self::elf::ElfParser),
        Box::new(self::ihex::IhexParser),
    ]
}
