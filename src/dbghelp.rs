//! Line-enumerator adapter.
//!
//! Images without stabs (typically assembly-only modules built with full
//! debug records) are symbolized through an external dbghelp-style engine:
//! something that can enumerate `(address, file, line)` tuples and resolve an
//! address to the function containing it. The engine sits behind
//! [`SymbolEngine`] so the pipeline never depends on a platform library;
//! hosts without one use [`NullEngine`] and fall back to the COFF table.
//!
//! Strings are collected in a transient bucketed table first, because the
//! enumeration order is arbitrary; once no further strings can arrive they
//! are copied into the shared pool and the packed ids are translated into
//! final pool offsets.

use std::fs::File;
use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::strings::{djb_hash, StringPool};
use crate::symbols::{compare, SymEntry};

const BUCKETS: usize = 1024;

/// Session options handed to the engine before enumeration.
pub struct SessionOptions {
    pub auto_publics: bool,
    pub favor_compressed: bool,
    pub load_anything: bool,
    pub load_lines: bool,
}

impl SessionOptions {
    /// The options the pipeline always loads with.
    pub fn loader_defaults() -> Self {
        SessionOptions {
            auto_publics: true,
            favor_compressed: true,
            load_anything: true,
            load_lines: true,
        }
    }
}

/// One source line hit reported by the engine.
pub struct LineRecord {
    pub address: u64,
    pub module_base: u64,
    pub file: String,
    pub line: u32,
}

/// The external line enumerator and symbol resolver.
pub trait SymbolEngine {
    fn configure(&mut self, options: &SessionOptions) -> Result<()>;

    /// Yields every line record of the module, in any order.
    fn each_line(&mut self, sink: &mut dyn FnMut(LineRecord)) -> Result<()>;

    /// Name of the function containing `address`, when the engine knows one.
    fn function_at(&self, address: u64) -> Option<String>;
}

/// Engine for hosts with no line enumerator linked in: enumerates nothing.
pub struct NullEngine;

impl SymbolEngine for NullEngine {
    fn configure(&mut self, _options: &SessionOptions) -> Result<()> {
        Ok(())
    }

    fn each_line(&mut self, _sink: &mut dyn FnMut(LineRecord)) -> Result<()> {
        Ok(())
    }

    fn function_at(&self, _address: u64) -> Option<String> {
        None
    }
}

/// Packed transient string id: bucket in the high bits, index within the
/// bucket in the low 10.
fn pack(bucket: usize, index: usize) -> u32 {
    debug_assert!(index < 1 << 10);
    ((bucket as u32) << 10) | index as u32
}

struct TransientStrings {
    buckets: Vec<Vec<String>>,
}

impl TransientStrings {
    fn new() -> Self {
        TransientStrings {
            buckets: vec![Vec::new(); BUCKETS],
        }
    }

    fn add(&mut self, s: &str) -> u32 {
        let bucket = djb_hash(s) as usize % BUCKETS;
        let entries = &mut self.buckets[bucket];
        if let Some(index) = entries.iter().position(|e| e == s) {
            return pack(bucket, index);
        }
        entries.push(s.to_string());
        pack(bucket, entries.len() - 1)
    }
}

struct LineEntry {
    vma: u32,
    file_id: u32,
    function_id: u32,
    line: u32,
}

/// Collects line records from `engine`, resolves their functions, shortens
/// file names against `source_path`, and emits sorted symbol records whose
/// strings live in `pool`.
pub fn collect_symbols(
    engine: &mut dyn SymbolEngine,
    source_path: &Path,
    pool: &mut StringPool,
) -> Result<Vec<SymEntry>> {
    engine.configure(&SessionOptions::loader_defaults())?;

    let mut records: Vec<LineRecord> = Vec::new();
    engine.each_line(&mut |record| records.push(record))?;

    let mut strings = TransientStrings::new();
    let mut entries: Vec<LineEntry> = Vec::with_capacity(records.len());
    let mut chop: Option<String> = None;

    for record in &records {
        if chop.is_none() && record.file.contains(['/', '\\']) {
            chop = Some(compute_path_chop(&record.file, source_path));
        }
        let file = match &chop {
            Some(prefix) => shorten(prefix, &record.file),
            None => &record.file,
        };
        let file_id = strings.add(file);

        let Some(function) = engine.function_at(record.address) else {
            continue;
        };
        let function_id = strings.add(&function);

        if record.address == 0 {
            warn!("address is 0");
        }

        entries.push(LineEntry {
            vma: record.address.wrapping_sub(record.module_base) as u32,
            file_id,
            function_id,
            line: record.line,
        });
    }

    // Second pass: the table is final, move the strings into the shared
    // pool and translate packed ids into pool offsets.
    let offsets: Vec<Vec<u32>> = strings
        .buckets
        .iter()
        .map(|bucket| bucket.iter().map(|s| pool.intern(s)).collect())
        .collect();
    let resolve = |id: u32| offsets[(id >> 10) as usize][(id & 0x3ff) as usize];

    let mut symbols: Vec<SymEntry> = entries
        .iter()
        .map(|entry| SymEntry {
            address: entry.vma,
            file_offset: resolve(entry.file_id),
            function_offset: resolve(entry.function_id),
            source_line: entry.line,
        })
        .collect();
    symbols.sort_by(compare);
    Ok(symbols)
}

/// Picks the prefix to strip from recorded file names.
///
/// Walking the separators right to left (shortest suffix first, skipping the
/// bare file name), the first suffix that opens under `source_path` fixes
/// the chop as everything before it. When nothing opens, the chop runs
/// through the first separator.
fn compute_path_chop(file: &str, source_path: &Path) -> String {
    let separators: Vec<usize> = file
        .bytes()
        .enumerate()
        .filter(|&(_, b)| b == b'/' || b == b'\\')
        .map(|(i, _)| i)
        .collect();

    for &pos in separators.iter().rev().skip(1) {
        let suffix = &file[pos + 1..];
        if File::open(source_path.join(suffix)).is_ok() {
            return file[..pos + 1].to_string();
        }
    }
    file[..separators[0] + 1].to_string()
}

fn shorten<'a>(prefix: &str, file: &'a str) -> &'a str {
    file.strip_prefix(prefix).unwrap_or(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeEngine {
        lines: Vec<(u64, &'static str, u32)>,
        functions: Vec<(u64, u64, &'static str)>,
        module_base: u64,
        configured: bool,
    }

    impl SymbolEngine for FakeEngine {
        fn configure(&mut self, options: &SessionOptions) -> Result<()> {
            assert!(options.auto_publics);
            assert!(options.favor_compressed);
            assert!(options.load_anything);
            assert!(options.load_lines);
            self.configured = true;
            Ok(())
        }

        fn each_line(&mut self, sink: &mut dyn FnMut(LineRecord)) -> Result<()> {
            assert!(self.configured);
            for &(address, file, line) in &self.lines {
                sink(LineRecord {
                    address,
                    module_base: self.module_base,
                    file: file.to_string(),
                    line,
                });
            }
            Ok(())
        }

        fn function_at(&self, address: u64) -> Option<String> {
            self.functions
                .iter()
                .find(|&&(start, end, _)| start <= address && address < end)
                .map(|&(_, _, name)| name.to_string())
        }
    }

    #[test]
    fn lines_become_sorted_records() {
        let mut engine = FakeEngine {
            lines: vec![
                (0x40_1010, "c:/src/mod/a.c", 12),
                (0x40_1000, "c:/src/mod/a.c", 10),
            ],
            functions: vec![(0x40_1000, 0x40_1100, "frob")],
            module_base: 0x40_0000,
            configured: false,
        };
        let mut pool = StringPool::new();
        let dir = tempfile::tempdir().unwrap();
        let symbols = collect_symbols(&mut engine, dir.path(), &mut pool).unwrap();

        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].address, 0x1000);
        assert_eq!(symbols[0].source_line, 10);
        assert_eq!(symbols[1].address, 0x1010);
        assert_eq!(symbols[1].source_line, 12);
        // Both records share one interned file and one function name.
        assert_eq!(symbols[0].file_offset, symbols[1].file_offset);
        assert_eq!(symbols[0].function_offset, symbols[1].function_offset);
        assert_eq!(pool.get(symbols[0].function_offset), Some("frob"));
    }

    #[test]
    fn unresolvable_addresses_are_discarded() {
        let mut engine = FakeEngine {
            lines: vec![(0x40_1000, "a/b.c", 1), (0x40_9000, "a/b.c", 2)],
            functions: vec![(0x40_1000, 0x40_2000, "known")],
            module_base: 0x40_0000,
            configured: false,
        };
        let mut pool = StringPool::new();
        let dir = tempfile::tempdir().unwrap();
        let symbols = collect_symbols(&mut engine, dir.path(), &mut pool).unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].address, 0x1000);
    }

    #[test]
    fn path_chop_probes_the_source_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib/rtl")).unwrap();
        std::fs::write(dir.path().join("lib/rtl/heap.c"), b"").unwrap();

        let chop = compute_path_chop("c:/build/ros/lib/rtl/heap.c", dir.path());
        assert_eq!(chop, "c:/build/ros/");
        assert_eq!(shorten(&chop, "c:/build/ros/lib/rtl/heap.c"), "lib/rtl/heap.c");
        // Other files from the same tree reuse the prefix unchanged.
        assert_eq!(shorten(&chop, "c:/build/ros/ntoskrnl/main.c"), "ntoskrnl/main.c");
    }

    #[test]
    fn failed_probe_chops_through_the_first_separator() {
        let dir = tempfile::tempdir().unwrap();
        let chop = compute_path_chop("obj/gen/out.c", dir.path());
        assert_eq!(chop, "obj/");
    }

    #[test]
    fn null_engine_yields_nothing() {
        let mut pool = StringPool::new();
        let symbols =
            collect_symbols(&mut NullEngine, Path::new(""), &mut pool).unwrap();
        assert!(symbols.is_empty());
        assert_eq!(pool.len(), 1);
    }
}
