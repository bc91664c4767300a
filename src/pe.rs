//! Read-only views over the input PE image.
//!
//! Everything here borrows from the memory-mapped file. Headers are exposed
//! through the raw `object::pe` structures; the debug payloads (`.stab`,
//! `.stabstr`, the COFF symbol region and its trailing string table) are
//! located through the section table and file header.

use std::mem;

use anyhow::{bail, Context, Result};
use object::pe::{
    self, ImageDataDirectory, ImageDosHeader, ImageFileHeader, ImageOptionalHeader32,
    ImageOptionalHeader64, ImageSectionHeader, ImageSymbol,
};
use object::pod;
use object::LittleEndian as LE;

/// The two optional-header formats. Field accessors hide the width
/// differences; the fields the pipeline needs sit at identical offsets in
/// both except for `ImageBase` and the data-directory array.
pub enum OptionalHeader<'data> {
    Pe32(&'data ImageOptionalHeader32),
    Pe32Plus(&'data ImageOptionalHeader64),
}

impl OptionalHeader<'_> {
    pub fn image_base(&self) -> u64 {
        match self {
            OptionalHeader::Pe32(h) => h.image_base.get(LE) as u64,
            OptionalHeader::Pe32Plus(h) => h.image_base.get(LE),
        }
    }

    pub fn section_alignment(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.section_alignment.get(LE),
            OptionalHeader::Pe32Plus(h) => h.section_alignment.get(LE),
        }
    }

    pub fn file_alignment(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.file_alignment.get(LE),
            OptionalHeader::Pe32Plus(h) => h.file_alignment.get(LE),
        }
    }

    pub fn size_of_image(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.size_of_image.get(LE),
            OptionalHeader::Pe32Plus(h) => h.size_of_image.get(LE),
        }
    }

    pub fn number_of_rva_and_sizes(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.number_of_rva_and_sizes.get(LE),
            OptionalHeader::Pe32Plus(h) => h.number_of_rva_and_sizes.get(LE),
        }
    }

    /// Size of the fixed part, up to the data directories.
    pub fn fixed_size(&self) -> usize {
        match self {
            OptionalHeader::Pe32(_) => mem::size_of::<ImageOptionalHeader32>(),
            OptionalHeader::Pe32Plus(_) => mem::size_of::<ImageOptionalHeader64>(),
        }
    }
}

/// The `.stab`/`.stabstr` payloads, located by their raw header names.
pub struct StabSections<'data> {
    pub stab: &'data [u8],
    pub stabstr: &'data [u8],
}

/// Parsed view of the input image.
pub struct PeImage<'data> {
    data: &'data [u8],
    nt_offset: usize,
    file_header: &'data ImageFileHeader,
    optional: OptionalHeader<'data>,
    directories: &'data [ImageDataDirectory],
    sections: &'data [ImageSectionHeader],
}

impl<'data> PeImage<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let (dos, _) = pod::from_bytes::<ImageDosHeader>(data)
            .ok()
            .context("input file too small for a DOS header")?;
        if dos.e_magic.get(LE) != pe::IMAGE_DOS_SIGNATURE {
            bail!("input file is not a PE image");
        }
        let nt_offset = dos.e_lfanew.get(LE) as usize;
        if nt_offset == 0 {
            bail!("input file is not a PE image");
        }
        let signature = data
            .get(nt_offset..nt_offset + 4)
            .context("e_lfanew points past the end of the file")?;
        if u32::from_le_bytes(signature.try_into().unwrap()) != pe::IMAGE_NT_SIGNATURE {
            bail!("input file is not a PE image");
        }

        let (file_header, _) = pod::from_bytes::<ImageFileHeader>(&data[nt_offset + 4..])
            .ok()
            .context("truncated PE file header")?;

        let opt_offset = nt_offset + 4 + mem::size_of::<ImageFileHeader>();
        let opt_size = file_header.size_of_optional_header.get(LE) as usize;
        let opt_data = data
            .get(opt_offset..opt_offset + opt_size)
            .context("truncated optional header")?;
        if opt_data.len() < 2 {
            bail!("truncated optional header");
        }
        let magic = u16::from_le_bytes(opt_data[..2].try_into().unwrap());
        let optional = match magic {
            pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC => OptionalHeader::Pe32(
                pod::from_bytes::<ImageOptionalHeader32>(opt_data)
                    .ok()
                    .context("truncated PE32 optional header")?
                    .0,
            ),
            pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC => OptionalHeader::Pe32Plus(
                pod::from_bytes::<ImageOptionalHeader64>(opt_data)
                    .ok()
                    .context("truncated PE32+ optional header")?
                    .0,
            ),
            other => bail!("unsupported optional header magic {other:#x}"),
        };

        let dir_offset = optional.fixed_size();
        let dir_count = (optional.number_of_rva_and_sizes() as usize)
            .min(opt_size.saturating_sub(dir_offset) / mem::size_of::<ImageDataDirectory>());
        let (directories, _) =
            pod::slice_from_bytes::<ImageDataDirectory>(&opt_data[dir_offset..], dir_count)
                .ok()
                .context("truncated data directories")?;

        let section_offset = opt_offset + opt_size;
        let (sections, _) = pod::slice_from_bytes::<ImageSectionHeader>(
            data.get(section_offset..)
                .context("truncated section table")?,
            file_header.number_of_sections.get(LE) as usize,
        )
        .ok()
        .context("truncated section table")?;

        Ok(PeImage {
            data,
            nt_offset,
            file_header,
            optional,
            directories,
            sections,
        })
    }

    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// Offset of the `PE\0\0` signature (`e_lfanew`).
    pub fn nt_offset(&self) -> usize {
        self.nt_offset
    }

    pub fn file_header(&self) -> &'data ImageFileHeader {
        self.file_header
    }

    pub fn optional(&self) -> &OptionalHeader<'data> {
        &self.optional
    }

    pub fn sections(&self) -> &'data [ImageSectionHeader] {
        self.sections
    }

    pub fn data_directory(&self, index: usize) -> Option<&'data ImageDataDirectory> {
        self.directories.get(index)
    }

    /// The section whose virtual range contains `rva`.
    pub fn section_for_rva(&self, rva: u32) -> Option<&'data ImageSectionHeader> {
        self.sections.iter().find(|s| {
            let va = s.virtual_address.get(LE) as u64;
            va <= rva as u64 && (rva as u64) < va + s.virtual_size.get(LE) as u64
        })
    }

    /// Raw file bytes backing a section.
    pub fn section_data(&self, section: &ImageSectionHeader) -> Result<&'data [u8]> {
        let start = section.pointer_to_raw_data.get(LE) as usize;
        let len = section.size_of_raw_data.get(LE) as usize;
        self.data.get(start..start + len).with_context(|| {
            format!(
                "section {} data out of bounds",
                String::from_utf8_lossy(short_name(&section.name))
            )
        })
    }

    /// The section name with the `/<n>` long-name indirection applied.
    /// Falls back to the raw short name when the string table is missing.
    pub fn resolved_name(&self, section: &'data ImageSectionHeader) -> &'data [u8] {
        if section.name[0] == b'/' {
            if let Some(name) = self.long_name(&section.name) {
                return name;
            }
        }
        short_name(&section.name)
    }

    fn long_name(&self, raw: &[u8; 8]) -> Option<&'data [u8]> {
        let offset = parse_decimal(&raw[1..])? as usize;
        let table = self.coff_string_table()?;
        let rest = table.get(offset..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        Some(&rest[..end])
    }

    /// Length of the smallest string-table prefix covering every `/<n>`
    /// section name, or 0 when no section uses one.
    pub fn long_name_table_len(&self) -> u32 {
        let mut len = 0u32;
        for section in self.sections {
            if section.name[0] != b'/' {
                continue;
            }
            if let (Some(offset), Some(name)) =
                (parse_decimal(&section.name[1..]), self.long_name(&section.name))
            {
                // Valid offsets start past the table's 4-byte length word.
                if offset >= 4 {
                    len = len.max(offset + name.len() as u32 + 1);
                }
            }
        }
        len
    }

    /// The COFF string table, including its leading 4-byte length word.
    /// A zero symbol count still leaves the table reachable; images that
    /// only carry long section names are laid out that way.
    pub fn coff_string_table(&self) -> Option<&'data [u8]> {
        let ptr = self.file_header.pointer_to_symbol_table.get(LE) as usize;
        let count = self.file_header.number_of_symbols.get(LE) as usize;
        if ptr == 0 {
            return None;
        }
        let base = ptr + count * mem::size_of::<ImageSymbol>();
        let word = self.data.get(base..base + 4)?;
        let len = u32::from_le_bytes(word.try_into().unwrap()) as usize;
        let len = len.clamp(4, self.data.len() - base);
        Some(&self.data[base..base + len])
    }

    /// The COFF symbol records and their string table, when present.
    pub fn coff_symbols(&self) -> Result<Option<(&'data [ImageSymbol], &'data [u8])>> {
        let ptr = self.file_header.pointer_to_symbol_table.get(LE) as usize;
        let count = self.file_header.number_of_symbols.get(LE) as usize;
        if ptr == 0 || count == 0 {
            return Ok(None);
        }
        let bytes = self
            .data
            .get(ptr..)
            .context("COFF symbol table offset out of bounds")?;
        let (symbols, _) = pod::slice_from_bytes::<ImageSymbol>(bytes, count)
            .ok()
            .context("truncated COFF symbol table")?;
        Ok(Some((symbols, self.coff_string_table().unwrap_or(&[]))))
    }

    /// The stabs payloads. `.stab` is matched on its exact raw header name;
    /// a missing `.stabstr` yields an empty string blob.
    pub fn stab_sections(&self) -> Result<Option<StabSections<'data>>> {
        let mut stab = None;
        let mut stabstr = None;
        for section in self.sections {
            if section.name.starts_with(b".stab\0") {
                stab = Some(self.section_data(section)?);
            } else if section.name == *b".stabstr" {
                stabstr = Some(self.section_data(section)?);
            }
        }
        Ok(stab.map(|stab| StabSections {
            stab,
            stabstr: stabstr.unwrap_or(&[]),
        }))
    }
}

/// Sections stripped from the output: stabs and DWARF.
pub fn is_debug_section_name(name: &[u8]) -> bool {
    name.starts_with(b".stab") || name.starts_with(b".debug_")
}

fn short_name(raw: &[u8; 8]) -> &[u8] {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    &raw[..end]
}

fn parse_decimal(bytes: &[u8]) -> Option<u32> {
    let mut value = 0u32;
    let mut digits = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as u32)?;
        digits += 1;
    }
    (digits > 0).then_some(value)
}
