//! Symbol tables and lookup scopes.
//!
//! A foreign object's dynamic symbols are parsed once into owned records;
//! the resolution engine then searches them through a [`LookupScope`],
//! which fixes the order a symbol reference is resolved in: the global
//! group first, then the object's own local group. Scopes borrow published
//! images immutably, so concurrent lookups against them are safe.

use crate::image::LoadedImage;
use core::hash::BuildHasher;
use elf::abi::{STB_GLOBAL, STB_WEAK, STV_DEFAULT, STV_PROTECTED};
use foldhash::fast::FixedState;
use hashbrown::HashTable;

/// Names are hashed once per lookup and reused across every table in the
/// scope, so all tables must agree on the hasher seed.
const NAME_SEED: u64 = 0x62726964;

#[inline]
pub(crate) fn hash_name(name: &str) -> u64 {
    FixedState::with_seed(NAME_SEED).hash_one(name)
}

/// One dynamic symbol, owned.
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Symbol name.
    pub name: Box<str>,
    /// Value relative to the object's load base.
    pub value: usize,
    /// Size in bytes.
    pub size: usize,
    /// Binding (`STB_*`).
    pub bind: u8,
    /// Visibility (`STV_*`).
    pub visibility: u8,
    /// Whether the symbol is defined in this object.
    pub defined: bool,
    /// Version the definition carries, if any.
    pub version: Option<Box<str>>,
}

impl Symbol {
    /// A plain defined global, the common case in fixtures and tests.
    pub fn global(name: &str, value: usize) -> Self {
        Symbol {
            name: name.into(),
            value,
            size: 0,
            bind: STB_GLOBAL,
            visibility: STV_DEFAULT,
            defined: true,
            version: None,
        }
    }

    /// An undefined reference with the given binding.
    pub fn undefined(name: &str, bind: u8) -> Self {
        Symbol {
            name: name.into(),
            value: 0,
            size: 0,
            bind,
            visibility: STV_DEFAULT,
            defined: false,
            version: None,
        }
    }

    #[inline]
    pub fn is_weak(&self) -> bool {
        self.bind == STB_WEAK
    }

    #[inline]
    pub fn is_protected(&self) -> bool {
        self.visibility == STV_PROTECTED
    }

    /// Whether a definition of this symbol may satisfy a reference from
    /// another object.
    #[inline]
    fn binds_globally(&self) -> bool {
        self.defined && (self.bind == STB_GLOBAL || self.bind == STB_WEAK)
    }

    /// Whether this definition satisfies a reference carrying `version`.
    /// Unversioned definitions satisfy any reference.
    #[inline]
    fn matches_version(&self, version: Option<&str>) -> bool {
        match (version, self.version.as_deref()) {
            (Some(want), Some(have)) => want == have,
            _ => true,
        }
    }
}

/// A symbol reference as it appears at a relocation site.
#[derive(Debug, Clone, Copy)]
pub struct SymbolRef<'a> {
    pub name: &'a str,
    pub version: Option<&'a str>,
}

impl<'a> SymbolRef<'a> {
    pub fn new(name: &'a str, version: Option<&'a str>) -> Self {
        SymbolRef { name, version }
    }
}

/// Symbol table of one foreign object.
pub struct SymbolTable {
    syms: Vec<Symbol>,
    index: HashTable<u32>,
}

impl SymbolTable {
    pub fn new(syms: Vec<Symbol>) -> Self {
        let mut index = HashTable::with_capacity(syms.len());
        for (i, sym) in syms.iter().enumerate() {
            index.insert_unique(hash_name(&sym.name), i as u32, |&j| {
                hash_name(&syms[j as usize].name)
            });
        }
        SymbolTable { syms, index }
    }

    /// Symbol by table index, as named by a relocation entry.
    #[inline]
    pub fn symbol_idx(&self, idx: usize) -> Option<&Symbol> {
        self.syms.get(idx)
    }

    #[inline]
    pub fn count_syms(&self) -> usize {
        self.syms.len()
    }

    /// Looks up `symbol` and keeps only definitions a relocation may bind
    /// to: defined, global or weak binding, acceptable version. A table
    /// may carry several same-name definitions under different versions,
    /// so every hash match is considered.
    pub(crate) fn lookup_filter(&self, symbol: &SymbolRef, hash: u64) -> Option<&Symbol> {
        self.index
            .iter_hash(hash)
            .map(|&i| &self.syms[i as usize])
            .find(|sym| {
                &*sym.name == symbol.name
                    && sym.binds_globally()
                    && sym.matches_version(symbol.version)
            })
    }
}

/// A definition found in some image of a scope.
#[derive(Clone, Copy)]
pub struct ResolvedSymbol<'scope> {
    pub image: &'scope LoadedImage,
    pub symbol: &'scope Symbol,
}

impl ResolvedSymbol<'_> {
    /// Absolute address of the definition.
    #[inline]
    pub fn address(&self) -> usize {
        self.image.base().wrapping_add(self.symbol.value)
    }
}

/// Ordered search scope for one object's relocation pass.
///
/// Images must only enter a scope after their own relocation has finished;
/// the engine never publishes an image it is still writing to.
pub struct LookupScope<'scope> {
    global: &'scope [&'scope LoadedImage],
    local: &'scope [&'scope LoadedImage],
}

impl<'scope> LookupScope<'scope> {
    pub fn new(global: &'scope [&'scope LoadedImage], local: &'scope [&'scope LoadedImage]) -> Self {
        LookupScope { global, local }
    }

    /// Searches the global group, then the local group; the first image
    /// with an eligible definition wins.
    pub fn find(&self, symbol: &SymbolRef) -> Option<ResolvedSymbol<'scope>> {
        let hash = hash_name(symbol.name);
        self.global
            .iter()
            .chain(self.local.iter())
            .copied()
            .find_map(|image| {
                image
                    .symbols()
                    .lookup_filter(symbol, hash)
                    .map(|sym| ResolvedSymbol { image, symbol: sym })
            })
    }
}
