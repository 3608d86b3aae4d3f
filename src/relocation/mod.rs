//! Relocation streams and the resolution engine.

mod engine;
mod iter;

pub use engine::RelocationEngine;
pub use iter::{PackedRelocIterator, Sleb128Decoder};

use crate::arch;

/// One relocation entry in canonical form.
///
/// Compound 64-bit entries pack up to two extra types into `r_info`;
/// plain and packed streams always decode with `kind2`/`kind3` zero, and
/// the engine rejects any chain the architecture does not define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    /// Byte offset of the target cell within the image.
    pub offset: usize,
    /// Symbol table index; zero means no symbol.
    pub sym: u32,
    /// Primary relocation kind.
    pub kind: u32,
    /// Second type of a compound entry, zero otherwise.
    pub kind2: u32,
    /// Third type of a compound entry, zero otherwise.
    pub kind3: u32,
    /// Explicit addend.
    pub addend: i64,
}

impl RelocEntry {
    /// A plain entry with no compound chain.
    pub fn new(offset: usize, sym: u32, kind: u32, addend: i64) -> Self {
        RelocEntry {
            offset,
            sym,
            kind,
            kind2: arch::REL_NONE,
            kind3: arch::REL_NONE,
            addend,
        }
    }

    /// Splits a 64-bit `r_info` into symbol index and primary kind.
    #[inline]
    pub(crate) fn from_info(offset: usize, info: u64, addend: i64) -> Self {
        Self::new(offset, (info >> 32) as u32, info as u32, addend)
    }
}

/// A foreign object's relocation table in the form it was mapped with.
pub enum RelocStream {
    /// Fixed-stride entries, already decoded.
    Plain(Vec<RelocEntry>),
    /// Delta/group compressed stream, decoded during the pass.
    Packed(Vec<u8>),
}

impl RelocStream {
    pub fn empty() -> Self {
        RelocStream::Plain(Vec::new())
    }
}
