//! PE file writer.
//!
//! Rebuilds the image around the surviving sections: headers are copied from
//! the input and patched, `.stab*`/`.debug_*` sections disappear, the
//! relocation section takes the deduplicated data, `.rossym` is appended,
//! and the COFF long-name string table is carried over in truncated form.
//! The PE checksum is recomputed over the finished buffer.

use std::mem;
use std::path::Path;

use anyhow::{bail, Context, Result};
use object::pe::{self, ImageFileHeader, ImageSectionHeader};
use object::pod::bytes_of;
use object::{LittleEndian as LE, U16, U32};

use crate::pe::{is_debug_section_name, PeImage};
use crate::relocs::Relocations;
use crate::utils::align_up;

// Reserved in winnt.h and absent from object's constant tables.
const IMAGE_SCN_TYPE_NOLOAD: u32 = 0x0000_0002;

/// Offsets shared by the PE32 and PE32+ optional headers.
const OPT_SIZE_OF_IMAGE: usize = 56;
const OPT_CHECKSUM: usize = 64;

enum SectionSource {
    Input,
    Relocations,
    RosSym,
}

struct OutputSection {
    header: ImageSectionHeader,
    source: SectionSource,
}

/// Assembles the output image and writes it to `path`.
pub fn write_image(
    path: &Path,
    image: &PeImage,
    relocations: Option<Relocations>,
    rossym: Option<&[u8]>,
) -> Result<()> {
    let out = build_image(image, relocations, rossym)?;
    std::fs::write(path, &out).with_context(|| format!("failed to write {}", path.display()))
}

/// Assembles the output image in memory.
pub fn build_image(
    image: &PeImage,
    relocations: Option<Relocations>,
    rossym: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let data = image.data();
    let nt_offset = image.nt_offset();
    let file_alignment = image.optional().file_alignment();
    let section_alignment = image.optional().section_alignment();

    // Everything before the first kept section body is header space.
    let mut start_of_raw_data = 0u32;
    for section in image.sections() {
        let ptr = section.pointer_to_raw_data.get(LE);
        if ptr != 0
            && !is_debug_section_name(image.resolved_name(section))
            && (start_of_raw_data == 0 || ptr < start_of_raw_data)
        {
            start_of_raw_data = ptr;
        }
    }
    if start_of_raw_data == 0 {
        bail!("image has no section data to keep");
    }

    // Plan the output section table.
    let mut out_sections: Vec<OutputSection> = Vec::new();
    let mut size_of_image = 0u32;
    let mut rossym_offset = 0u32;
    let mut reloc_out_index: Option<usize> = None;
    for (index, section) in image.sections().iter().enumerate() {
        if is_debug_section_name(image.resolved_name(section)) {
            continue;
        }
        let mut header = *section;
        header.pointer_to_linenumbers = U32::new(LE, 0);
        header.number_of_linenumbers = U16::new(LE, 0);

        let va_end = header
            .virtual_address
            .get(LE)
            .wrapping_add(header.virtual_size.get(LE));
        if size_of_image < va_end {
            size_of_image = align_up(va_end, section_alignment);
        }
        let raw_end = header
            .pointer_to_raw_data
            .get(LE)
            .wrapping_add(header.size_of_raw_data.get(LE));
        if rossym_offset < raw_end {
            rossym_offset = raw_end;
        }
        if relocations.as_ref().map(|r| r.section_index) == Some(index) {
            reloc_out_index = Some(out_sections.len());
        }
        out_sections.push(OutputSection {
            header,
            source: SectionSource::Input,
        });
    }

    // Swap in the deduplicated relocation data. Its sizes shrink only when
    // the section sits at the end of the image, where nothing depends on
    // the old extent.
    let mut reloc_directory_size = None;
    if let (Some(relocs), Some(out_index)) = (&relocations, reloc_out_index) {
        let len = relocs.data.len() as u32;
        reloc_directory_size = Some(len);
        if out_index + 1 == out_sections.len() {
            let header = &mut out_sections[out_index].header;
            let va = header.virtual_address.get(LE);
            let ptr = header.pointer_to_raw_data.get(LE);
            let old_virtual_size = header.virtual_size.get(LE);
            let old_raw_size = header.size_of_raw_data.get(LE);

            if size_of_image == va + align_up(old_virtual_size, section_alignment) {
                size_of_image = va + align_up(len, section_alignment);
            }
            header.virtual_size = U32::new(LE, len);
            if rossym_offset == ptr + old_raw_size {
                rossym_offset = ptr + align_up(len, file_alignment);
            }
            header.size_of_raw_data = U32::new(LE, align_up(len, file_alignment));
        }
        out_sections[out_index].source = SectionSource::Relocations;
    }

    // Append the symbol section.
    if let Some(payload) = rossym {
        let len = payload.len() as u32;
        let header = ImageSectionHeader {
            name: *b".rossym\0",
            virtual_size: U32::new(LE, len),
            virtual_address: U32::new(LE, size_of_image),
            size_of_raw_data: U32::new(LE, align_up(len, file_alignment)),
            pointer_to_raw_data: U32::new(LE, rossym_offset),
            pointer_to_relocations: U32::new(LE, 0),
            pointer_to_linenumbers: U32::new(LE, 0),
            number_of_relocations: U16::new(LE, 0),
            number_of_linenumbers: U16::new(LE, 0),
            characteristics: U32::new(
                LE,
                pe::IMAGE_SCN_MEM_READ
                    | pe::IMAGE_SCN_MEM_DISCARDABLE
                    | pe::IMAGE_SCN_LNK_REMOVE
                    | IMAGE_SCN_TYPE_NOLOAD,
            ),
        };
        size_of_image = align_up(size_of_image.wrapping_add(len), section_alignment);
        out_sections.push(OutputSection {
            header,
            source: SectionSource::RosSym,
        });
    }

    // The truncated long-name string table goes after the last raw byte.
    let string_table_len = image.long_name_table_len();
    let mut string_table_location = 0u32;
    let mut string_table_tail: Vec<u8> = Vec::new();
    if string_table_len != 0 {
        if let Some(input_table) = image.coff_string_table() {
            string_table_location = out_sections
                .iter()
                .map(|s| {
                    s.header.pointer_to_raw_data.get(LE) + s.header.size_of_raw_data.get(LE)
                })
                .max()
                .unwrap_or(start_of_raw_data);
            string_table_tail.extend_from_slice(&string_table_len.to_le_bytes());
            string_table_tail.extend_from_slice(&input_table[4..string_table_len as usize]);
            let end = string_table_location + string_table_len;
            string_table_tail.resize(
                (align_up(end, file_alignment) - string_table_location) as usize,
                0,
            );
        }
    }

    // Header buffer: DOS header, stub, and PE signature come straight from
    // the input.
    if nt_offset + 4 > start_of_raw_data as usize {
        bail!("section data overlaps the PE headers");
    }
    let mut out = vec![0u8; start_of_raw_data as usize];
    out[..nt_offset + 4].copy_from_slice(&data[..nt_offset + 4]);

    let mut file_header = *image.file_header();
    file_header.number_of_sections = U16::new(LE, out_sections.len() as u16);
    file_header.pointer_to_symbol_table = U32::new(LE, string_table_location);
    file_header.number_of_symbols = U32::new(LE, 0);
    let characteristics = file_header.characteristics.get(LE)
        & !(pe::IMAGE_FILE_LINE_NUMS_STRIPPED
            | pe::IMAGE_FILE_LOCAL_SYMS_STRIPPED
            | pe::IMAGE_FILE_DEBUG_STRIPPED);
    file_header.characteristics = U16::new(LE, characteristics);

    let opt_offset = nt_offset + 4 + mem::size_of::<ImageFileHeader>();
    let opt_size = file_header.size_of_optional_header.get(LE) as usize;
    let table_offset = opt_offset + opt_size;
    let table_end = table_offset + out_sections.len() * mem::size_of::<ImageSectionHeader>();
    if table_end > start_of_raw_data as usize {
        bail!("no room in the headers for the output section table");
    }

    out[nt_offset + 4..opt_offset].copy_from_slice(bytes_of(&file_header));
    out[opt_offset..table_offset].copy_from_slice(&data[opt_offset..table_offset]);

    // SizeOfImage and CheckSum sit at the same offsets in both optional
    // header formats; the checksum stays zero until the fold below.
    out[opt_offset + OPT_SIZE_OF_IMAGE..opt_offset + OPT_SIZE_OF_IMAGE + 4]
        .copy_from_slice(&size_of_image.to_le_bytes());
    out[opt_offset + OPT_CHECKSUM..opt_offset + OPT_CHECKSUM + 4].fill(0);
    if let Some(size) = reloc_directory_size {
        let entry = opt_offset
            + image.optional().fixed_size()
            + pe::IMAGE_DIRECTORY_ENTRY_BASERELOC * 8;
        if entry + 8 <= table_offset {
            out[entry + 4..entry + 8].copy_from_slice(&size.to_le_bytes());
        }
    }

    for (i, section) in out_sections.iter().enumerate() {
        let offset = table_offset + i * mem::size_of::<ImageSectionHeader>();
        out[offset..offset + mem::size_of::<ImageSectionHeader>()]
            .copy_from_slice(bytes_of(&section.header));
    }

    // Section bodies at their declared raw offsets; short data is padded
    // with zeros out to SizeOfRawData.
    let empty: &[u8] = &[];
    for section in &out_sections {
        let ptr = section.header.pointer_to_raw_data.get(LE) as usize;
        let raw_size = section.header.size_of_raw_data.get(LE) as usize;
        if ptr == 0 || raw_size == 0 {
            continue;
        }
        let body = match section.source {
            SectionSource::Input => data.get(ptr..ptr + raw_size).with_context(|| {
                format!("input section data at {ptr:#x}+{raw_size:#x} is out of bounds")
            })?,
            SectionSource::Relocations => {
                relocations.as_ref().map_or(empty, |r| r.data.as_slice())
            }
            SectionSource::RosSym => rossym.map_or(empty, |p| p),
        };
        write_at(&mut out, ptr, body);
        if out.len() < ptr + raw_size {
            out.resize(ptr + raw_size, 0);
        }
    }

    if string_table_location != 0 {
        write_at(&mut out, string_table_location as usize, &string_table_tail);
    }

    // Fold the checksum over the header, every section body, and the
    // string-table tail, then add the file length.
    let mut sum = checksum_fold(0, &out[..start_of_raw_data as usize]);
    for section in &out_sections {
        let ptr = section.header.pointer_to_raw_data.get(LE) as usize;
        let raw_size = section.header.size_of_raw_data.get(LE) as usize;
        if ptr == 0 || raw_size == 0 {
            continue;
        }
        sum = checksum_fold(sum, &out[ptr..ptr + raw_size]);
    }
    if string_table_location != 0 {
        let start = string_table_location as usize;
        sum = checksum_fold(sum, &out[start..start + string_table_tail.len()]);
    }
    let checksum = sum.wrapping_add(out.len() as u32);
    out[opt_offset + OPT_CHECKSUM..opt_offset + OPT_CHECKSUM + 4]
        .copy_from_slice(&checksum.to_le_bytes());

    Ok(out)
}

fn write_at(out: &mut Vec<u8>, offset: usize, data: &[u8]) {
    if out.len() < offset + data.len() {
        out.resize(offset + data.len(), 0);
    }
    out[offset..offset + data.len()].copy_from_slice(data);
}

/// 16-bit one's-complement-style accumulation with end-around carry.
pub fn checksum_fold(mut sum: u32, data: &[u8]) -> u32 {
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_le_bytes([word[0], word[1]]) as u32;
        sum = 0xffff & (sum + (sum >> 16));
    }
    if let [byte] = words.remainder() {
        sum += *byte as u32;
        sum = 0xffff & (sum + (sum >> 16));
    }
    sum
}
