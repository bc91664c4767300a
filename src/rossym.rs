//! `.rossym` payload serialization.
//!
//! The payload is a 16-byte header, the packed record array, and the string
//! pool, all little-endian. The consumer binary-searches the records by
//! address and resolves names with plain offset arithmetic into the pool.

use crate::strings::StringPool;
use crate::symbols::SymEntry;

pub const HEADER_SIZE: u32 = 16;
pub const ENTRY_SIZE: u32 = 16;

pub fn build_payload(symbols: &[SymEntry], pool: &StringPool) -> Vec<u8> {
    let symbols_length = symbols.len() as u32 * ENTRY_SIZE;
    let strings = pool.as_bytes();

    let mut out =
        Vec::with_capacity((HEADER_SIZE + symbols_length) as usize + strings.len());
    out.extend_from_slice(&HEADER_SIZE.to_le_bytes());
    out.extend_from_slice(&symbols_length.to_le_bytes());
    out.extend_from_slice(&(HEADER_SIZE + symbols_length).to_le_bytes());
    out.extend_from_slice(&(strings.len() as u32).to_le_bytes());

    for symbol in symbols {
        out.extend_from_slice(&symbol.address.to_le_bytes());
        out.extend_from_slice(&symbol.file_offset.to_le_bytes());
        out.extend_from_slice(&symbol.function_offset.to_le_bytes());
        out.extend_from_slice(&symbol.source_line.to_le_bytes());
    }
    out.extend_from_slice(strings);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_layout() {
        let mut pool = StringPool::new();
        let file = pool.intern("foo.c");
        let function = pool.intern("bar");
        let symbols = [
            SymEntry {
                address: 0x1000,
                file_offset: file,
                function_offset: function,
                source_line: 0,
            },
            SymEntry {
                address: 0x1010,
                file_offset: file,
                function_offset: function,
                source_line: 42,
            },
        ];
        let payload = build_payload(&symbols, &pool);

        let word = |i: usize| u32::from_le_bytes(payload[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(0), 16);
        assert_eq!(word(1), 32);
        assert_eq!(word(2), 48);
        assert_eq!(word(3), pool.len());
        assert_eq!(payload.len(), 48 + pool.len() as usize);

        // First record.
        assert_eq!(word(4), 0x1000);
        assert_eq!(word(5), file);
        assert_eq!(word(6), function);
        assert_eq!(word(7), 0);
        // The pool starts with its empty string.
        assert_eq!(payload[48], 0);
        assert_eq!(
            &payload[48 + file as usize..48 + file as usize + 6],
            b"foo.c\0"
        );
    }
}
