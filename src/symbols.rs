//! Symbol records and the stabs/COFF merge.
//!
//! Every debug source is reduced to the same four-field record. The merger
//! then fuses the two sources: stabs carry files and line numbers but miss
//! functions written in assembly, while the COFF table names those functions
//! without any line information.

use std::cmp::Ordering;

/// One entry of the final symbol table.
///
/// `address` is an RVA. `file_offset` and `function_offset` index the string
/// pool; 0 means unknown. `source_line` is 1-based; 0 means none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymEntry {
    pub address: u32,
    pub file_offset: u32,
    pub function_offset: u32,
    pub source_line: u32,
}

/// Table order: address ascending; on a tie, the record without a source
/// line comes first. All other ties are equal.
pub fn compare(a: &SymEntry, b: &SymEntry) -> Ordering {
    a.address
        .cmp(&b.address)
        .then_with(|| (a.source_line != 0).cmp(&(b.source_line != 0)))
}

/// Fuses the primary (stabs or line-enumerator) records with the COFF
/// records.
///
/// Runs of primary records at one address collapse into a single record,
/// later members of the run filling fields the first left at zero. A COFF
/// function whose address falls strictly inside the current stabs function
/// body donates its name to records the primary source left unnamed; each
/// COFF record donates at most once. COFF records never consumed are
/// appended whole, provided they carry both an address and a name.
pub fn merge(primary: &[SymEntry], coff: &[SymEntry]) -> Vec<SymEntry> {
    let mut merged = Vec::with_capacity(primary.len() + coff.len());
    let mut consumed = vec![false; coff.len()];

    let mut coff_idx = 0usize;
    let mut fn_start_address = 0u32;
    let mut fn_string_offset = 0u32;

    let mut i = 0usize;
    while i < primary.len() {
        let mut current = primary[i];
        let mut j = i + 1;
        while j < primary.len() && primary[j].address == current.address {
            if primary[j].file_offset != 0 && current.file_offset == 0 {
                current.file_offset = primary[j].file_offset;
            }
            if primary[j].function_offset != 0 && current.function_offset == 0 {
                current.function_offset = primary[j].function_offset;
            }
            if primary[j].source_line != 0 && current.source_line == 0 {
                current.source_line = primary[j].source_line;
            }
            j += 1;
        }
        i = j;

        // Last COFF record at or before the current address.
        while coff_idx + 1 < coff.len() && coff[coff_idx + 1].address <= current.address {
            coff_idx += 1;
        }
        let new_fn_string_offset = current.function_offset;
        if let Some(candidate) = coff.get(coff_idx) {
            if candidate.address < current.address
                && fn_start_address < candidate.address
                && candidate.function_offset != 0
                && !consumed[coff_idx]
            {
                current.function_offset = candidate.function_offset;
                consumed[coff_idx] = true;
            }
        }
        if fn_string_offset != new_fn_string_offset {
            fn_start_address = current.address;
        }
        fn_string_offset = new_fn_string_offset;

        merged.push(current);
    }

    // Functions with no analog in the primary source.
    for (k, entry) in coff.iter().enumerate() {
        if !consumed[k] && entry.address != 0 && entry.function_offset != 0 {
            merged.push(*entry);
        }
    }

    merged.sort_by(compare);
    merged.dedup();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: u32, file: u32, function: u32, line: u32) -> SymEntry {
        SymEntry {
            address,
            file_offset: file,
            function_offset: function,
            source_line: line,
        }
    }

    #[test]
    fn compare_orders_by_address_then_line_presence() {
        let a = entry(0x1000, 1, 2, 0);
        let b = entry(0x1000, 1, 2, 42);
        let c = entry(0x1010, 1, 2, 0);
        assert_eq!(compare(&a, &b), Ordering::Less);
        assert_eq!(compare(&b, &a), Ordering::Greater);
        assert_eq!(compare(&b, &c), Ordering::Less);
        assert_eq!(compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn collapses_runs_at_one_address() {
        let primary = [
            entry(0x1000, 5, 0, 0),
            entry(0x1000, 0, 9, 0),
            entry(0x1000, 0, 0, 7),
        ];
        let merged = merge(&primary, &[]);
        assert_eq!(merged, vec![entry(0x1000, 5, 9, 7)]);
    }

    #[test]
    fn coff_names_a_function_the_stabs_left_anonymous() {
        // Line record at 0x2004 falls inside the function the COFF table
        // places at 0x2000; the record inherits the COFF name.
        let primary = [entry(0x2004, 3, 0, 42)];
        let coff = [entry(0x2000, 0, 11, 0)];
        let merged = merge(&primary, &coff);
        assert_eq!(merged, vec![entry(0x2004, 3, 11, 42)]);
    }

    #[test]
    fn consumed_coff_names_are_not_appended_again() {
        let primary = [entry(0x2004, 3, 0, 42), entry(0x2008, 3, 0, 43)];
        let coff = [entry(0x2000, 0, 11, 0)];
        let merged = merge(&primary, &coff);
        // The donated name lands on one record; the COFF entry is spent.
        assert_eq!(
            merged,
            vec![entry(0x2004, 3, 11, 42), entry(0x2008, 3, 0, 43)]
        );
    }

    #[test]
    fn coff_past_the_record_address_stays_an_orphan() {
        let primary = [entry(0x2000, 3, 0, 0)];
        let coff = [entry(0x2004, 0, 11, 0)];
        let merged = merge(&primary, &coff);
        assert_eq!(
            merged,
            vec![entry(0x2000, 3, 0, 0), entry(0x2004, 0, 11, 0)]
        );
    }

    #[test]
    fn coff_inside_a_named_function_is_left_alone() {
        // The stabs already name the function starting at 0x3000; a COFF
        // symbol at the same spot must not clobber later line records.
        let primary = [entry(0x3000, 3, 8, 0), entry(0x3010, 3, 8, 12)];
        let coff = [entry(0x3000, 0, 11, 0)];
        let merged = merge(&primary, &coff);
        assert_eq!(
            merged,
            vec![
                entry(0x3000, 3, 8, 0),
                entry(0x3000, 0, 11, 0),
                entry(0x3010, 3, 8, 12),
            ]
        );
    }

    #[test]
    fn orphans_survive_an_empty_primary_array() {
        let coff = [entry(0x1040, 0, 6, 0), entry(0, 0, 9, 0), entry(0x50, 0, 0, 0)];
        let merged = merge(&[], &coff);
        // Zero addresses and nameless records are dropped.
        assert_eq!(merged, vec![entry(0x1040, 0, 6, 0)]);
    }

    #[test]
    fn output_is_sorted_and_deduplicated() {
        let primary = [entry(0x5000, 2, 4, 9)];
        let coff = [entry(0x1000, 0, 3, 0), entry(0x6000, 0, 5, 0)];
        let merged = merge(&primary, &coff);
        let mut sorted = merged.clone();
        sorted.sort_by(compare);
        assert_eq!(merged, sorted);
        for pair in merged.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }
}
