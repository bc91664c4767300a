//! Base-relocation rewriting.
//!
//! The linker occasionally emits the same relocation block twice, and blocks
//! may target sections this tool removes. The rewriter walks the original
//! directory once, keeping each surviving block's bytes exactly and dropping
//! the rest.

use anyhow::{bail, Context, Result};
use object::pe;
use object::LittleEndian as LE;

use crate::pe::{is_debug_section_name, PeImage};

/// The deduplicated relocation data and the input section it replaces.
pub struct Relocations {
    pub section_index: usize,
    pub data: Vec<u8>,
}

/// Rebuilds the base-relocation directory. `None` when the image has no
/// relocations at all.
pub fn rewrite(image: &PeImage) -> Result<Option<Relocations>> {
    let Some(directory) = image.data_directory(pe::IMAGE_DIRECTORY_ENTRY_BASERELOC) else {
        return Ok(None);
    };
    let directory_rva = directory.virtual_address.get(LE);
    let directory_size = directory.size.get(LE) as usize;
    if directory_rva == 0 {
        return Ok(None);
    }

    let section_index = image
        .sections()
        .iter()
        .position(|s| {
            let va = s.virtual_address.get(LE) as u64;
            va <= directory_rva as u64
                && (directory_rva as u64) < va + s.virtual_size.get(LE) as u64
        })
        .context("cannot find section header for relocation data")?;
    let section = &image.sections()[section_index];
    let raw = image.section_data(section)?;
    let start = (directory_rva - section.virtual_address.get(LE)) as usize;
    let blocks = raw
        .get(start..start + directory_size)
        .context("relocation directory out of bounds")?;

    let mut accepted: Vec<u8> = Vec::with_capacity(blocks.len());
    let mut offset = 0usize;
    while offset + 8 <= blocks.len() {
        let target_rva = u32::from_le_bytes(blocks[offset..offset + 4].try_into().unwrap());
        let size = u32::from_le_bytes(blocks[offset + 4..offset + 8].try_into().unwrap()) as usize;
        if size == 0 {
            break;
        }
        if size < 8 || offset + size > blocks.len() {
            bail!("malformed relocation block at offset {offset:#x}");
        }
        let block = &blocks[offset..offset + size];
        offset += size;

        // Blocks aimed at sections absent from the output are dropped.
        let Some(target) = image.section_for_rva(target_rva) else {
            continue;
        };
        if is_debug_section_name(image.resolved_name(target)) {
            continue;
        }

        if !contains_block(&accepted, block) {
            accepted.extend_from_slice(block);
        }
    }

    Ok(Some(Relocations {
        section_index,
        data: accepted,
    }))
}

/// Whether `accepted` already holds a byte-identical block.
fn contains_block(accepted: &[u8], block: &[u8]) -> bool {
    let mut pos = 0usize;
    while pos + 8 <= accepted.len() {
        let size = u32::from_le_bytes(accepted[pos + 4..pos + 8].try_into().unwrap()) as usize;
        if accepted[pos..pos + size] == *block {
            return true;
        }
        pos += size;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(rva: u32, entries: &[u16]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&rva.to_le_bytes());
        out.extend_from_slice(&((8 + entries.len() * 2) as u32).to_le_bytes());
        for &e in entries {
            out.extend_from_slice(&e.to_le_bytes());
        }
        out
    }

    #[test]
    fn detects_byte_identical_blocks() {
        let a = block(0x1000, &[0x3004, 0x3008]);
        let b = block(0x2000, &[0x3004, 0x3008]);
        let mut accepted = Vec::new();
        accepted.extend_from_slice(&a);
        assert!(contains_block(&accepted, &a));
        assert!(!contains_block(&accepted, &b));
        accepted.extend_from_slice(&b);
        assert!(contains_block(&accepted, &b));
    }
}
