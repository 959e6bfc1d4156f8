//! XZ
//!
//! Header magic by hand, then one decode pass; the decoder's input
//! counter covers everything up to and including the stream footer.

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
use filkarv_types::Signature;
use std::io::BufWriter;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;

pub(crate) struct XzParser;

impl FormatParser for XzParser {
    fn pretty_name(&self) -> &'static str {
        "xz"
    }

    fn signatures(&self) -> &'static [Signature] {
        const SIGNATURES: &[Signature] = &[Signature::new(0, b"\xfd\x37\x7a\x58\x5a\x00")];
        SIGNATURES
    }

    fn parse(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
    ) -> ParseResult<Box<dyn Parsed>> {
        let mut magic = [0u8; 6];
        window.read_exact(&mut magic)?;
        ensure_format(magic == *b"\xfd\x37\x7a\x58\x5a\x00", "not an xz stream")?;

        window.rewind_window()?;
        let mut decoder = xz2::read::XzDecoder::new(&mut *window);
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            match decoder.read(&mut buffer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ParseRejection::invalid(e.to_string()).into());
                }
            }
        }
        let consumed = decoder.total_in();
        ensure_format(consumed > 0, "empty stream")?;
        Ok(Box::new(ParsedXz { size: consumed }))
    }
}

struct ParsedXz {
    size: u64,
}

impl Parsed for ParsedXz {
    fn unpacked_size(&self) -> u64 {
        self.size
    }

    fn labels(&self) -> Labels {
        ["xz".into(), "compressed".into()].into_iter().collect()
    }

    fn unpack(
        &self,
        window: &mut FileWindow,
        _ctx: &ParseContext<'_>,
        md: &mut MetaDirectory,
        sink: ChildSink<'_>,
    ) -> eyre::Result<()> {
        let scanned = md.file_path().to_path_buf();
        let output = [(".txz", ".tar"), (".xz", "")]
            .into_iter()
            .find_map(|(stripped, appended)| stem_with_suffix(&scanned, stripped, appended))
            .map_or_else(
                || PathBuf::from("unpacked_from_xz"),
                |stem| PathBuf::from(stem.as_str()),
            );
        let (child, file) = md.unpack_regular_file(&output)?;
        let mut writer = BufWriter::new(file);
        let mut decoder = xz2::read::XzDecoder::new(&mut *window);
        std::io::copy(&mut decoder, &mut writer)?;
        writer.flush()?;
        sink(child)?;
        Ok(())
    }
}
