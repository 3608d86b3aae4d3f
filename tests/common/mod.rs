// Not every test binary uses every fixture.
#![allow(dead_code)]

use abi_bridge::arch;
use abi_bridge::image::{LoadedImage, PendingImage};
use abi_bridge::relocation::{RelocEntry, RelocStream};
use abi_bridge::symbol::{Symbol, SymbolTable};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A pending image over zeroed bytes. Index 0 gets the customary null
/// symbol so relocation entries can use real symbol indices.
pub fn pending_image(
    name: &str,
    base: usize,
    size: usize,
    mut symbols: Vec<Symbol>,
    relocs: Vec<RelocEntry>,
) -> PendingImage {
    symbols.insert(0, Symbol::undefined("", 0));
    let mut image = PendingImage::new(name, arch::EM_ARCH, base, vec![0u8; size], SymbolTable::new(symbols));
    image.set_relocations(RelocStream::Plain(relocs));
    image
}

/// A published image exporting the given symbols.
pub fn provider(name: &str, base: usize, symbols: Vec<Symbol>) -> LoadedImage {
    PendingImage::new(name, arch::EM_ARCH, base, Vec::new(), SymbolTable::new(symbols)).publish()
}

pub fn sleb128(mut value: i64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Encodes entries as one packed group carrying explicit offsets, infos
/// and addends.
pub fn pack_relocs(entries: &[RelocEntry]) -> Vec<u8> {
    const GROUP_HAS_ADDEND: i64 = 8;
    let mut out = b"APS2".to_vec();
    sleb128(entries.len() as i64, &mut out);
    sleb128(0, &mut out); // starting offset
    sleb128(entries.len() as i64, &mut out); // group size
    sleb128(GROUP_HAS_ADDEND, &mut out);
    let mut offset = 0i64;
    let mut addend = 0i64;
    for entry in entries {
        sleb128(entry.offset as i64 - offset, &mut out);
        offset = entry.offset as i64;
        let info = ((entry.sym as u64) << 32) | u64::from(entry.kind);
        sleb128(info as i64, &mut out);
        sleb128(entry.addend - addend, &mut out);
        addend = entry.addend;
    }
    out
}
