//! The post-mapping view of a foreign object.
//!
//! Mapping segments into memory belongs to the embedding loader; what
//! arrives here is the writable image, its load bias, its parsed symbol
//! table and its relocation streams. A [`PendingImage`] is exclusively
//! owned while the resolution engine writes into it; [`publish`] turns it
//! into an immutable [`LoadedImage`] that may enter lookup scopes. The
//! type split is what enforces publish-after-relocate.
//!
//! [`publish`]: PendingImage::publish

use crate::relocation::RelocStream;
use crate::symbol::SymbolTable;
use crate::{Result, relocate_error};

pub(crate) const WORD_SIZE: usize = size_of::<usize>();

/// Geometry of a split global offset table.
///
/// The first `local_count` entries take load-bias fixups; the rest pair
/// one-to-one with the symbol table tail starting at `first_global_sym`.
#[derive(Debug, Clone, Copy)]
pub struct GotInfo {
    /// Byte offset of the table within the image.
    pub offset: usize,
    /// Number of leading local entries.
    pub local_count: usize,
    /// Symbol index paired with the first global entry.
    pub first_global_sym: usize,
}

impl GotInfo {
    /// Byte offset of the global entry paired with symbol `sym_idx`.
    #[inline]
    pub(crate) fn global_entry(&self, sym_idx: usize) -> usize {
        self.offset + (self.local_count + (sym_idx - self.first_global_sym)) * WORD_SIZE
    }
}

/// A mapped foreign object whose relocations are not yet bound.
pub struct PendingImage {
    name: Box<str>,
    machine: u16,
    base: usize,
    bytes: Vec<u8>,
    symbols: SymbolTable,
    relocs: RelocStream,
    got: Option<GotInfo>,
}

impl PendingImage {
    pub fn new(
        name: &str,
        machine: u16,
        base: usize,
        bytes: Vec<u8>,
        symbols: SymbolTable,
    ) -> Self {
        PendingImage {
            name: name.into(),
            machine,
            base,
            bytes,
            symbols,
            relocs: RelocStream::empty(),
            got: None,
        }
    }

    pub fn set_relocations(&mut self, relocs: RelocStream) {
        self.relocs = relocs;
    }

    pub fn set_got(&mut self, got: GotInfo) {
        self.got = Some(got);
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn machine(&self) -> u16 {
        self.machine
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    #[inline]
    pub fn got(&self) -> Option<GotInfo> {
        self.got
    }

    #[inline]
    pub(crate) fn relocs(&self) -> &RelocStream {
        &self.relocs
    }

    /// Reads the word-sized cell at byte offset `offset`.
    pub fn read_word(&self, offset: usize) -> Result<usize> {
        let bytes = offset
            .checked_add(WORD_SIZE)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or_else(|| bounds_error(&self.name, offset))?;
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(bytes);
        Ok(usize::from_ne_bytes(word))
    }

    /// Writes the word-sized cell at byte offset `offset`.
    pub fn write_word(&mut self, offset: usize, value: usize) -> Result<()> {
        let end = offset
            .checked_add(WORD_SIZE)
            .ok_or_else(|| bounds_error(&self.name, offset))?;
        let bytes = self
            .bytes
            .get_mut(offset..end)
            .ok_or_else(|| bounds_error(&self.name, offset))?;
        bytes.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    /// Publishes the image. Only a published image may enter a
    /// [`LookupScope`](crate::symbol::LookupScope), so an image is never
    /// searched while its own relocations are still being written.
    pub fn publish(self) -> LoadedImage {
        LoadedImage {
            name: self.name,
            base: self.base,
            bytes: self.bytes,
            symbols: self.symbols,
        }
    }
}

/// A published, immutable image.
pub struct LoadedImage {
    name: Box<str>,
    base: usize,
    bytes: Vec<u8>,
    symbols: SymbolTable,
}

impl LoadedImage {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Reads the word-sized cell at byte offset `offset`.
    pub fn read_word(&self, offset: usize) -> Result<usize> {
        let bytes = offset
            .checked_add(WORD_SIZE)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or_else(|| bounds_error(&self.name, offset))?;
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(bytes);
        Ok(usize::from_ne_bytes(word))
    }
}

#[cold]
#[inline(never)]
fn bounds_error(name: &str, offset: usize) -> crate::Error {
    relocate_error(format!("[{name}] write outside image at offset {offset:#x}"))
}
