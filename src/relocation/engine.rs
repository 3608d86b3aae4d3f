//! The resolution engine: binds one pending image against a lookup scope.

use super::{PackedRelocIterator, RelocEntry, RelocStream};
use crate::hooks::HookTable;
use crate::image::{PendingImage, WORD_SIZE};
use crate::symbol::{LookupScope, Symbol, SymbolRef};
use crate::{Error, Result, arch, relocate_error};
use elf::abi::{STV_DEFAULT, STV_PROTECTED};

/// Walks a pending image's relocation table in order and writes the bound
/// addresses into it.
///
/// Every named lookup consults the interposition table first, then the
/// scope (global group, then local group), then the image's own defined
/// symbols. Weak references that resolve nowhere bind to zero; anything
/// else unresolved fails the load. The pass is deterministic: the same
/// image, scope and table always produce the same bound addresses.
pub struct RelocationEngine<'hooks> {
    hooks: Option<&'hooks HookTable>,
}

impl<'hooks> RelocationEngine<'hooks> {
    pub fn new() -> Self {
        RelocationEngine { hooks: None }
    }

    /// An engine that redirects interposed names to the given table.
    pub fn with_hooks(hooks: &'hooks HookTable) -> Self {
        RelocationEngine { hooks: Some(hooks) }
    }

    /// Processes the image's relocation stream in table order.
    pub fn relocate(&self, image: &mut PendingImage, scope: &LookupScope) -> Result<()> {
        if image.machine() != arch::EM_ARCH {
            return Err(machine_error(image.name(), image.machine()));
        }
        // Decode first: packed offsets and infos are deltas, and applying
        // must not disturb decoding of later entries.
        let entries = match image.relocs() {
            RelocStream::Plain(entries) => entries.clone(),
            RelocStream::Packed(bytes) => {
                let mut iter = PackedRelocIterator::new(bytes)?;
                let mut entries = Vec::new();
                while let Some(entry) = iter.next_entry()? {
                    entries.push(entry);
                }
                entries
            }
        };
        for entry in &entries {
            self.apply(image, scope, entry)?;
        }
        log::debug!(
            "[{}] bound {} relocation entries at base {:#x}",
            image.name(),
            entries.len(),
            image.base()
        );
        Ok(())
    }

    fn apply(&self, image: &mut PendingImage, scope: &LookupScope, entry: &RelocEntry) -> Result<()> {
        if entry.kind2 != arch::REL_NONE || entry.kind3 != arch::REL_NONE {
            match arch::COMPOUND_PAIR {
                Some(pair) if pair == (entry.kind2, entry.kind3) => {}
                _ => return Err(compound_error(image.name(), entry)),
            }
        }

        let base = image.base();
        let addend = entry.addend as usize;
        match entry.kind {
            arch::REL_NONE => Ok(()),
            arch::REL_RELATIVE => image.write_word(entry.offset, base.wrapping_add(addend)),
            arch::REL_SYMBOLIC | arch::REL_GOT | arch::REL_JUMP_SLOT | arch::REL_PC => {
                let value = if entry.sym == 0 {
                    Some(base)
                } else {
                    let sym = symbol_at(image, entry.sym as usize)?;
                    self.resolve(image, scope, &sym)?
                };
                let Some(s) = value else {
                    // Weak and nowhere defined.
                    return image.write_word(entry.offset, 0);
                };
                let computed = if entry.kind == arch::REL_PC {
                    s.wrapping_add(addend).wrapping_sub(base.wrapping_add(entry.offset))
                } else {
                    s.wrapping_add(addend)
                };
                image.write_word(entry.offset, computed)
            }
            kind => Err(kind_error(image.name(), kind)),
        }
    }

    /// Populates a split local/global offset table.
    ///
    /// Local entries are load-bias fixups over whatever the object's
    /// static linker left in them. Global entries pair with the symbol
    /// table tail: default visibility does a full lookup, protected
    /// visibility binds to the object's own definition without a search,
    /// and any other visibility is invalid.
    pub fn relocate_got(&self, image: &mut PendingImage, scope: &LookupScope) -> Result<()> {
        let Some(got) = image.got() else {
            return Ok(());
        };
        let base = image.base();
        for i in 0..got.local_count {
            let off = got.offset + i * WORD_SIZE;
            let current = image.read_word(off)?;
            image.write_word(off, current.wrapping_add(base))?;
        }
        for idx in got.first_global_sym..image.symbols().count_syms() {
            let sym = symbol_at(image, idx)?;
            let slot = got.global_entry(idx);
            match sym.visibility {
                STV_DEFAULT => {
                    let value = self.resolve(image, scope, &sym)?.unwrap_or(0);
                    image.write_word(slot, value)?;
                }
                STV_PROTECTED => {
                    if !sym.defined {
                        return Err(protected_error(image.name(), &sym.name));
                    }
                    image.write_word(slot, base.wrapping_add(sym.value))?;
                }
                other => return Err(visibility_error(image.name(), &sym.name, other)),
            }
        }
        Ok(())
    }

    /// Resolves one named reference: interposition table, then scope, then
    /// the image's own definition. `Ok(None)` is a weak reference with no
    /// definition anywhere.
    fn resolve(
        &self,
        image: &PendingImage,
        scope: &LookupScope,
        sym: &Symbol,
    ) -> Result<Option<usize>> {
        if let Some(hooks) = self.hooks
            && let Some(addr) = hooks.lookup(&sym.name)
        {
            return Ok(Some(addr));
        }
        let reference = SymbolRef::new(&sym.name, sym.version.as_deref());
        if let Some(found) = scope.find(&reference) {
            return Ok(Some(found.address()));
        }
        if sym.defined {
            return Ok(Some(image.base().wrapping_add(sym.value)));
        }
        if sym.is_weak() {
            return Ok(None);
        }
        Err(unresolved_error(image.name(), &sym.name))
    }
}

impl Default for RelocationEngine<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn symbol_at(image: &PendingImage, idx: usize) -> Result<Symbol> {
    image
        .symbols()
        .symbol_idx(idx)
        .cloned()
        .ok_or_else(|| sym_index_error(image.name(), idx))
}

#[cold]
#[inline(never)]
fn unresolved_error(object: &str, name: &str) -> Error {
    relocate_error(format!("[{object}] unresolved symbol \"{name}\""))
}

#[cold]
#[inline(never)]
fn kind_error(object: &str, kind: u32) -> Error {
    relocate_error(format!(
        "[{object}] unsupported relocation kind {} ({kind})",
        arch::rel_type_to_str(kind)
    ))
}

#[cold]
#[inline(never)]
fn compound_error(object: &str, entry: &RelocEntry) -> Error {
    relocate_error(format!(
        "[{object}] invalid compound relocation chain ({}, {}, {})",
        arch::rel_type_to_str(entry.kind),
        arch::rel_type_to_str(entry.kind2),
        arch::rel_type_to_str(entry.kind3)
    ))
}

#[cold]
#[inline(never)]
fn protected_error(object: &str, name: &str) -> Error {
    relocate_error(format!(
        "[{object}] invalid symbol \"{name}\" (protected and undefined)"
    ))
}

#[cold]
#[inline(never)]
fn visibility_error(object: &str, name: &str, visibility: u8) -> Error {
    relocate_error(format!(
        "[{object}] invalid symbol \"{name}\" visibility {visibility:#x}"
    ))
}

#[cold]
#[inline(never)]
fn sym_index_error(object: &str, idx: usize) -> Error {
    relocate_error(format!("[{object}] relocation names symbol index {idx} out of range"))
}

#[cold]
#[inline(never)]
fn machine_error(object: &str, machine: u16) -> Error {
    relocate_error(format!(
        "[{object}] image built for machine {machine:#x}, host is {:#x}",
        arch::EM_ARCH
    ))
}
