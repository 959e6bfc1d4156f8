//! ELF executables and objects
//!
//! Measures the file as the furthest extent referenced by the header:
//! program segment data, section data and the two header tables. Both
//! classes and both byte orders are handled by hand; section names are
//! resolved from the section name string table when it is sane.

use crate::parser::FileWindow;
use crate::parser::FormatParser;
use crate::parser::Labels;
use crate::parser::ParseContext;
use crate::parser::ParseResult;
use crate::parser::Parsed;
use crate::parser::ensure_format;
use filkarv_types::Metadata;
use filkarv_types::ParseRejection;
use filkarv_types::Signature;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;

const SHT_NOBITS: u32 = 8;

pub(crate) struct ElfParser;

impl FormatParser for ElfParser {
    fn pretty_name(&self) -> &'static str {
        "elf"
    }

    fn signatures(&self) -> &'static [Signature] {
        const SIGNATURES: &[Signature] = &[Signature::new(0, b"\x7fELF")];
        SIGNATURES
    }

    fn parse(
        &self,
        window: &mut FileWindow,
        ctx: &ParseContext<'_>,
    ) -> ParseResult<Box<dyn Parsed>> {
        let mut ident = [0u8; 16];
        window.read_exact(&mut ident)?;
        ensure_format(ident[..4] == *b"\x7fELF", "not an ELF file")?;
        let class64 = match ident[4] {
            1 => false,
            2 => true,
            _ => return Err(ParseRejection::invalid("invalid ELF class").into()),
        };
        let big_endian = match ident[5] {
            1 => false,
            2 => true,
            _ => return Err(ParseRejection::invalid("invalid ELF data encoding").into()),
        };
        ensure_format(ident[6] == 1, "unknown ELF version")?;

        let ehsize_expected: usize = if class64 { 64 } else { 52 };
        let mut rest = vec![0u8; ehsize_expected - 16];
        window.read_exact(&mut rest)?;
        let reader = FieldReader { big_endian };
        let e_type = reader.u16(&rest[0..2]);
        let e_machine = reader.u16(&rest[2..4]);
        ensure_format(reader.u32(&rest[4..8]) == 1, "unknown ELF file version")?;
        let (phoff, shoff, phentsize, phnum, shentsize, shnum, shstrndx) = if class64 {
            (
                reader.u64(&rest[16..24]),
                reader.u64(&rest[24..32]),
                reader.u16(&rest[38..40]),
                reader.u16(&rest[40..42]),
                reader.u16(&rest[42..44]),
                reader.u16(&rest[44..46]),
                reader.u16(&rest[46..48]),
            )
        } else {
            (
                u64::from(reader.u32(&rest[12..16])),
                u64::from(reader.u32(&rest[16..20])),
                reader.u16(&rest[26..28]),
                reader.u16(&rest[28..30]),
                reader.u16(&rest[30..32]),
                reader.u16(&rest[32..34]),
                reader.u16(&rest[34..36]),
            )
        };

        let min_phentsize: u16 = if class64 { 56 } else { 32 };
        let min_shentsize: u16 = if class64 { 64 } else { 40 };
        ensure_format(phnum == 0 || phentsize >= min_phentsize, "bad phentsize")?;
        ensure_format(shnum == 0 || shentsize >= min_shentsize, "bad shentsize")?;

        let window_size = window.size();
        let mut end = ehsize_expected as u64;
        let mut extend = |offset: u64, size: u64| -> ParseResult<()> {
            let new_end = offset
                .checked_add(size)
                .ok_or_else(|| ParseRejection::invalid("offset overflow"))?;
            if new_end > window_size {
                return Err(
                    ParseRejection::truncated("referenced data past end of input").into(),
                );
            }
            end = end.max(new_end);
            Ok(())
        };

        // Program segments
        let mut header = vec![0u8; usize::from(phentsize)];
        for index in 0..phnum {
            window.seek(SeekFrom::Start(
                phoff + u64::from(index) * u64::from(phentsize),
            ))?;
            window.read_exact(&mut header)?;
            let (p_offset, p_filesz) = if class64 {
                (reader.u64(&header[8..16]), reader.u64(&header[32..40]))
            } else {
                (
                    u64::from(reader.u32(&header[4..8])),
                    u64::from(reader.u32(&header[16..20])),
                )
            };
            extend(p_offset, p_filesz)?;
        }
        if phnum > 0 {
            extend(phoff, u64::from(phnum) * u64::from(phentsize))?;
        }

        // Sections
        let mut sections = Vec::with_capacity(usize::from(shnum));
        let mut header = vec![0u8; usize::from(shentsize)];
        for index in 0..shnum {
            window.seek(SeekFrom::Start(
                shoff + u64::from(index) * u64::from(shentsize),
            ))?;
            window.read_exact(&mut header)?;
            let sh_name = reader.u32(&header[0..4]);
            let sh_type = reader.u32(&header[4..8]);
            let (sh_offset, sh_size) = if class64 {
                (reader.u64(&header[24..32]), reader.u64(&header[32..40]))
            } else {
                (
                    u64::from(reader.u32(&header[16..20])),
                    u64::from(reader.u32(&header[20..24])),
                )
            };
            // NOBITS sections occupy no file space
            if sh_type != SHT_NOBITS {
                extend(sh_offset, sh_size)?;
            }
            sections.push(RawSection {
                name_offset: sh_name,
                offset: sh_offset,
                size: sh_size,
                kind: sh_type,
            });
        }
        if shnum > 0 {
            extend(shoff, u64::from(shnum) * u64::from(shentsize))?;
        }

        let section_names = resolve_section_names(window, &sections, shstrndx, ctx.env.max_bytes)?;

        Ok(Box::new(ParsedElf {
            size: end,
            class64,
            big_endian,
            e_type,
            e_machine,
            section_names,
        }))
    }
}

struct RawSection {
    name_offset: u32,
    offset: u64,
    size: u64,
    kind: u32,
}

/// Look up each section's name in the section name string table.
fn resolve_section_names(
    window: &mut FileWindow,
    sections: &[RawSection],
    shstrndx: u16,
    max_bytes: u64,
) -> ParseResult<Vec<String>> {
    let Some(strtab) = sections.get(usize::from(shstrndx)) else {
        return Ok(Vec::new());
    };
    if strtab.kind == SHT_NOBITS || strtab.size == 0 || strtab.size > max_bytes {
        return Ok(Vec::new());
    }
    window.seek(SeekFrom::Start(strtab.offset))?;
    let mut table = vec![0u8; usize::try_from(strtab.size).expect("bounded by max_bytes")];
    window.read_exact(&mut table)?;
    let names = sections
        .iter()
        .map(|section| {
            let start = usize::try_from(section.name_offset).unwrap_or(usize::MAX);
            table
                .get(start..)
                .and_then(|tail| tail.split(|&b| b == 0).next())
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .unwrap_or_default()
        })
        .collect();
    Ok(names)
}

struct ParsedElf {
    size: u64,
    class64: bool,
    big_endian: bool,
    e_type: u16,
    e_machine: u16,
    section_names: Vec<String>,
}

impl Parsed for ParsedElf {
    fn unpacked_size(&self) -> u64 {
        self.size
    }

    fn labels(&self) -> Labels {
        ["elf".into()].into_iter().collect()
    }

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(
            "bits".into(),
            serde_cbor::Value::Integer(if self.class64 { 64 } else { 32 }),
        );
        metadata.insert(
            "endian".into(),
            serde_cbor::Value::Text(
                if self.big_endian { "big" } else { "little" }.to_owned(),
            ),
        );
        metadata.insert(
            "type".into(),
            serde_cbor::Value::Text(type_name(self.e_type).to_owned()),
        );
        let machine = machine_name(self.e_machine).map_or_else(
            || format!("unknown ({})", self.e_machine),
            ToOwned::to_owned,
        );
        metadata.insert("machine".into(), serde_cbor::Value::Text(machine));
        if !self.section_names.is_empty() {
            metadata.insert(
                "section_names".into(),
                serde_cbor::Value::Array(
                    self.section_names
                        .iter()
                        .map(|name| serde_cbor::Value::Text(name.clone()))
                        .collect(),
                ),
            );
        }
        metadata
    }
}

struct FieldReader {
    big_endian: bool,
}

impl FieldReader {
    fn u16(&self, raw: &[u8]) -> u16 {
        let raw = raw.try_into().expect("slice of 2");
        if self.big_endian {
            u16::from_be_bytes(raw)
        } else {
            u16::from_le_bytes(raw)
        }
    }

    fn u32(&self, raw: &[u8]) -> u32 {
        let raw = raw.try_into().expect("slice of 4");
        if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        }
    }

    fn u64(&self, raw: &[u8]) -> u64 {
        let raw = raw.try_into().expect("slice of 8");
        if self.big_endian {
            u64::from_be_bytes(raw)
        } else {
            u64::from_le_bytes(raw)
        }
    }
}

fn type_name(e_type: u16) -> &'static str {
    match e_type {
        1 => "relocatable",
        2 => "executable",
        3 => "shared object",
        4 => "core",
        _ => "unknown",
    }
}

fn machine_name(e_machine: u16) -> Option<&'static str> {
    Some(match e_machine {
        3 => "x86",
        8 => "mips",
        20 => "powerpc",
        21 => "powerpc64",
        40 => "arm",
        62 => "x86-64",
        183 => "aarch64",
        243 => "riscv",
        _ => return None,
    })
}
