//! Stabs decoder.
//!
//! A stabs blob is an array of fixed 12-byte records; strings live in the
//! parallel `.stabstr` blob. Function records carry absolute virtual
//! addresses, but line records inside a function encode offsets relative to
//! the function start, so the walk keeps a rolling function base address and
//! must not be reduced to plain `n_value - image_base` arithmetic.

use anyhow::{bail, Context, Result};

use crate::strings::StringPool;
use crate::symbols::{compare, SymEntry};

pub const STAB_ENTRY_SIZE: usize = 12;

/// Names of 256 bytes or more are rejected.
pub const MAX_NAME_LEN: usize = 256;

const N_FUN: u8 = 0x24;
const N_SLINE: u8 = 0x44;
const N_SO: u8 = 0x64;
const N_BINCL: u8 = 0x82;
const N_SOL: u8 = 0x84;

/// Decodes the stabs blob into symbol records, sorted for the merge.
pub fn convert_stabs(
    stab: &[u8],
    stabstr: &[u8],
    image_base: u32,
    pool: &mut StringPool,
) -> Result<Vec<SymEntry>> {
    let mut entries: Vec<SymEntry> = Vec::with_capacity(stab.len() / STAB_ENTRY_SIZE);
    let mut last_function_address = 0u32;

    for record in stab.chunks_exact(STAB_ENTRY_SIZE) {
        let n_strx = u32::from_le_bytes(record[0..4].try_into().unwrap());
        let n_type = record[4];
        let n_desc = u16::from_le_bytes(record[6..8].try_into().unwrap());
        let n_value = u32::from_le_bytes(record[8..12].try_into().unwrap());

        let address = if last_function_address == 0 {
            n_value.wrapping_sub(image_base)
        } else {
            last_function_address.wrapping_add(n_value)
        };

        match n_type {
            N_SO | N_SOL | N_BINCL => {
                let Some(name) = cstr_at(stabstr, n_strx) else {
                    continue;
                };
                // Directory-only entries (trailing separator) carry no file.
                if name.is_empty()
                    || name.ends_with(&[b'/'])
                    || name.ends_with(&[b'\\'])
                    || n_value < image_base
                {
                    continue;
                }
                let name =
                    std::str::from_utf8(name).context("stabs source file name is not UTF-8")?;
                if entries.last().map(|e| e.address) != Some(address) {
                    let function_offset = entries.last().map_or(0, |e| e.function_offset);
                    entries.push(SymEntry {
                        address,
                        function_offset,
                        ..Default::default()
                    });
                }
                let current = entries.last_mut().unwrap();
                current.file_offset = pool.intern(name);
            }
            N_FUN => {
                // Line number 0 marks the end of a function.
                if n_desc == 0 || n_value < image_base {
                    last_function_address = 0;
                    continue;
                }
                if entries.last().map(|e| e.address) != Some(address) {
                    let file_offset = entries.last().map_or(0, |e| e.file_offset);
                    entries.push(SymEntry {
                        address,
                        file_offset,
                        ..Default::default()
                    });
                }
                let name = cstr_at(stabstr, n_strx)
                    .context("stabs function name offset out of range")?;
                // The name ends at the first ':'; a type descriptor follows.
                let name = &name[..name.iter().position(|&b| b == b':').unwrap_or(name.len())];
                if name.len() >= MAX_NAME_LEN {
                    bail!("function name too long");
                }
                let name =
                    std::str::from_utf8(name).context("stabs function name is not UTF-8")?;
                let current = entries.last_mut().unwrap();
                current.function_offset = pool.intern(name);
                current.source_line = 0;
                last_function_address = address;
            }
            N_SLINE => {
                if entries.last().map(|e| e.address) != Some(address) {
                    let (file_offset, function_offset) = entries
                        .last()
                        .map_or((0, 0), |e| (e.file_offset, e.function_offset));
                    entries.push(SymEntry {
                        address,
                        file_offset,
                        function_offset,
                        source_line: 0,
                    });
                }
                entries.last_mut().unwrap().source_line = n_desc as u32;
            }
            _ => {}
        }
    }

    entries.sort_by(compare);
    Ok(entries)
}

fn cstr_at(strings: &[u8], offset: u32) -> Option<&[u8]> {
    let rest = strings.get(offset as usize..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    Some(&rest[..end])
}
