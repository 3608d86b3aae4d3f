//! Decoding of packed relocation streams.
//!
//! The packed format is the Android "APS2" encoding: after a four-byte
//! magic, a signed-LEB128 stream carries the entry count and a starting
//! offset, then groups of entries. Each group declares its size and a
//! flag word saying which fields are shared by the whole group and which
//! are spelled per entry.

use super::RelocEntry;
use crate::{Error, Result, relocate_error};

const PACKED_MAGIC: &[u8; 4] = b"APS2";

/// All entries in the group share `r_info`.
const GROUPED_BY_INFO: usize = 1;
/// All entries in the group advance the offset by one shared delta.
const GROUPED_BY_OFFSET_DELTA: usize = 2;
/// All entries in the group share one addend delta.
const GROUPED_BY_ADDEND: usize = 4;
/// Entries in the group carry addends at all.
const GROUP_HAS_ADDEND: usize = 8;

/// Signed-LEB128 decoder over a byte stream.
///
/// Values decode as signed and are returned as the machine word, which is
/// how offset and info deltas wrap correctly.
pub struct Sleb128Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Sleb128Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Sleb128Decoder { data, pos: 0 }
    }

    /// Decodes the next value. A stream that ends mid-value, or a value
    /// that runs past 64 bits, is malformed.
    pub fn pop_front(&mut self) -> Result<usize> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let Some(&byte) = self.data.get(self.pos) else {
                return Err(truncated_error());
            };
            self.pos += 1;
            if shift >= u64::BITS {
                return Err(overlong_error());
            }
            value |= u64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    value |= !0u64 << shift;
                }
                return Ok(value as usize);
            }
        }
    }
}

#[cold]
#[inline(never)]
fn truncated_error() -> Error {
    relocate_error("packed relocation stream ends mid-value")
}

#[cold]
#[inline(never)]
fn overlong_error() -> Error {
    relocate_error("packed relocation stream value exceeds 64 bits")
}

#[cold]
#[inline(never)]
fn magic_error() -> Error {
    relocate_error("packed relocation stream has no APS2 signature")
}

/// Iterator over a packed relocation stream.
///
/// Yields entries in table order; the resolution engine must not reorder
/// them because offsets and infos are deltas off the previous entry.
pub struct PackedRelocIterator<'a> {
    decoder: Sleb128Decoder<'a>,
    relocation_count: usize,
    relocation_index: usize,
    group_size: usize,
    group_index: usize,
    group_flags: usize,
    group_offset_delta: usize,
    offset: usize,
    info: u64,
    addend: i64,
}

impl<'a> PackedRelocIterator<'a> {
    pub fn new(stream: &'a [u8]) -> Result<Self> {
        let Some((magic, rest)) = stream.split_first_chunk::<4>() else {
            return Err(magic_error());
        };
        if magic != PACKED_MAGIC {
            return Err(magic_error());
        }
        let mut decoder = Sleb128Decoder::new(rest);
        let relocation_count = decoder.pop_front()?;
        let offset = decoder.pop_front()?;
        Ok(PackedRelocIterator {
            decoder,
            relocation_count,
            relocation_index: 0,
            group_size: 0,
            group_index: 0,
            group_flags: 0,
            group_offset_delta: 0,
            offset,
            info: 0,
            addend: 0,
        })
    }

    fn read_group_fields(&mut self) -> Result<()> {
        self.group_size = self.decoder.pop_front()?;
        self.group_flags = self.decoder.pop_front()?;
        self.group_index = 0;

        if self.group_flags & GROUPED_BY_OFFSET_DELTA != 0 {
            self.group_offset_delta = self.decoder.pop_front()?;
        }
        if self.group_flags & GROUPED_BY_INFO != 0 {
            self.info = self.decoder.pop_front()? as u64;
        }
        let addend_flags = GROUP_HAS_ADDEND | GROUPED_BY_ADDEND;
        if self.group_flags & addend_flags == addend_flags {
            self.addend = self.addend.wrapping_add(self.decoder.pop_front()? as i64);
        } else if self.group_flags & GROUP_HAS_ADDEND == 0 {
            self.addend = 0;
        }
        Ok(())
    }

    /// Decodes the next entry, or `None` at the end of the table.
    pub fn next_entry(&mut self) -> Result<Option<RelocEntry>> {
        if self.relocation_index >= self.relocation_count {
            return Ok(None);
        }
        if self.group_index == self.group_size {
            self.read_group_fields()?;
        }

        if self.group_flags & GROUPED_BY_OFFSET_DELTA != 0 {
            self.offset = self.offset.wrapping_add(self.group_offset_delta);
        } else {
            self.offset = self.offset.wrapping_add(self.decoder.pop_front()?);
        }
        if self.group_flags & GROUPED_BY_INFO == 0 {
            self.info = self.decoder.pop_front()? as u64;
        }
        if self.group_flags & (GROUP_HAS_ADDEND | GROUPED_BY_ADDEND) == GROUP_HAS_ADDEND {
            self.addend = self.addend.wrapping_add(self.decoder.pop_front()? as i64);
        }

        self.relocation_index += 1;
        self.group_index += 1;
        Ok(Some(RelocEntry::from_info(self.offset, self.info, self.addend)))
    }
}

#[cfg(test)]
mod tests {
    use super::Sleb128Decoder;

    #[test]
    fn sleb128_smoke() {
        let encoding: &[u8] = &[
            0xE5, 0x8E, 0x26, // 624485
            0x00, // 0
            0x01, // 1
            0x3F, // 63
            0xC0, 0x00, // 64
            0x7F, // -1
            0x9B, 0xF1, 0x59, // -624485
            0xFF, 0xFF, 0xFF, 0xFF, 0x07, // 2147483647
            0x80, 0x80, 0x80, 0x80, 0x78, // -2147483648
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, // i64::MAX
            0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7F, // i64::MIN
        ];
        let mut decoder = Sleb128Decoder::new(encoding);
        let expected: &[usize] = &[
            624485,
            0,
            1,
            63,
            64,
            -1i64 as usize,
            -624485i64 as usize,
            2147483647,
            -2147483648i64 as usize,
            i64::MAX as usize,
            i64::MIN as usize,
        ];
        for &want in expected {
            assert_eq!(decoder.pop_front().unwrap(), want);
        }
    }

    #[test]
    fn sleb128_truncated() {
        let mut decoder = Sleb128Decoder::new(&[0xE5, 0x8E]);
        assert!(decoder.pop_front().is_err());
    }

    #[test]
    fn sleb128_overlong() {
        // Ten continuation bytes already cover 64 bits; an eleventh byte
        // can only be garbage.
        let mut decoder = Sleb128Decoder::new(&[0x80; 11]);
        assert!(decoder.pop_front().is_err());
    }
}
